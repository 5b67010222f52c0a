//! JSON remote procedure calls.
//!
//! Procedures are reached at `POST /rpc/<Method>` with a JSON object body:
//!
//! | method                | arguments                         |
//! |-----------------------|-----------------------------------|
//! | `RequestUpdate`       | `{url, size, name}`               |
//! | `RequestFileDownload` | `{url, name}`                     |
//! | `Commit`              | none                              |
//! | `Revert`              | none                              |
//! | `GetStatus`           | none                              |
//!
//! Request procedures always answer `{"result": "..."}`; a rejected request
//! is still an acknowledgement. Failures of the other procedures answer a
//! structured error body.

pub mod server;

pub use server::RpcServer;

use ota_common::{Error, ErrorCategory, StructuredError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::mpsc::Sender;
use thiserror::Error as ThisError;
use tracing::{info, warn};

use crate::logging::{event_names, Stage};
use crate::update::Updater;

/// Registered procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    RequestUpdate,
    RequestFileDownload,
    Commit,
    Revert,
    GetStatus,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 5] = [
        RpcMethod::RequestUpdate,
        RpcMethod::RequestFileDownload,
        RpcMethod::Commit,
        RpcMethod::Revert,
        RpcMethod::GetStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::RequestUpdate => "RequestUpdate",
            RpcMethod::RequestFileDownload => "RequestFileDownload",
            RpcMethod::Commit => "Commit",
            RpcMethod::Revert => "Revert",
            RpcMethod::GetStatus => "GetStatus",
        }
    }
}

impl FromStr for RpcMethod {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RpcMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| RpcError::UnknownMethod(s.to_string()))
    }
}

/// Request decoding errors.
#[derive(Debug, ThisError)]
pub enum RpcError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid arguments for {method}: {source}")]
    InvalidArguments {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::UnknownMethod(method) => Error::UnknownMethod { method },
            other => Error::InvalidArguments(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RequestUpdateArgs {
    url: String,
    #[serde(default)]
    size: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RequestFileDownloadArgs {
    url: String,
    name: String,
}

/// A call waiting to be dispatched on the loop thread.
#[derive(Debug)]
pub struct RpcCall {
    pub method: String,
    pub body: Vec<u8>,
    pub reply: Sender<RpcResponse>,
}

/// HTTP status plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub status: u16,
    pub body: Value,
}

impl RpcResponse {
    pub fn ok(body: Value) -> Self {
        RpcResponse { status: 200, body }
    }

    pub fn from_error(err: &Error) -> Self {
        let status = match err {
            Error::UnknownMethod { .. } => 404,
            Error::RestartPending => 503,
            _ => match err.category() {
                ErrorCategory::Rpc | ErrorCategory::Config => 400,
                ErrorCategory::Update => 409,
                _ => 500,
            },
        };
        let body = serde_json::to_value(StructuredError::from(err))
            .unwrap_or_else(|_| json!({ "code": err.code() }));
        RpcResponse { status, body }
    }
}

/// Decode and run one call against the updater.
pub fn dispatch(updater: &Updater<'_>, method: &str, body: &[u8]) -> RpcResponse {
    info!(
        target: event_names::RPC_RECEIVED,
        stage = %Stage::Rpc,
        method = %method,
        bytes = body.len() as u64,
        "rpc call"
    );
    match call(updater, method, body) {
        Ok(value) => RpcResponse::ok(value),
        Err(err) => {
            warn!(
                target: event_names::RPC_FAILED,
                stage = %Stage::Rpc,
                method = %method,
                code = err.code(),
                error = %err,
                "rpc call failed"
            );
            RpcResponse::from_error(&err)
        }
    }
}

fn call(updater: &Updater<'_>, method: &str, body: &[u8]) -> Result<Value, Error> {
    let method: RpcMethod = method.parse()?;
    let value = match method {
        RpcMethod::RequestUpdate => {
            let args: RequestUpdateArgs = parse_args(method, body)?;
            serde_json::to_value(updater.request_update(&args.url, args.size, &args.name))?
        }
        RpcMethod::RequestFileDownload => {
            let args: RequestFileDownloadArgs = parse_args(method, body)?;
            serde_json::to_value(updater.request_file_download(&args.url, &args.name))?
        }
        RpcMethod::Commit => {
            updater.commit()?;
            json!({ "result": "Committed" })
        }
        RpcMethod::Revert => {
            let outcome = updater.revert()?;
            json!({ "result": "Reverted", "revert": outcome })
        }
        RpcMethod::GetStatus => serde_json::to_value(updater.status()?)?,
    };
    Ok(value)
}

fn parse_args<T: DeserializeOwned>(method: RpcMethod, body: &[u8]) -> Result<T, RpcError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        &b"{}"[..]
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|source| RpcError::InvalidArguments {
        method: method.as_str(),
        source,
    })
}
