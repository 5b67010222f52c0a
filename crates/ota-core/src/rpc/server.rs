//! HTTP listener for remote procedure calls.
//!
//! Runs `tiny_http` on a background thread. Each request is forwarded to the
//! event loop as a [`LoopEvent::Rpc`] and answered with whatever the loop
//! sends back; the server thread never touches update state.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ota_common::Error;
use ota_config::RpcSettings;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{RpcCall, RpcResponse};
use crate::logging::{event_names, Stage};
use crate::runtime::{LoopEvent, LoopSender};

/// Path prefix of procedure URLs.
pub const RPC_PREFIX: &str = "/rpc/";

/// Largest accepted request body.
const MAX_BODY_BYTES: u64 = 64 * 1024;

/// How long a request waits for the loop to answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Background RPC listener.
pub struct RpcServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl RpcServer {
    /// Bind and start serving on a background thread.
    pub fn start(settings: &RpcSettings, events: LoopSender) -> Result<Self, Error> {
        let requested: SocketAddr = format!("{}:{}", settings.bind, settings.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid rpc bind address: {}", e)))?;

        let server = tiny_http::Server::http(requested)
            .map_err(|e| Error::Config(format!("failed to listen on {}: {}", requested, e)))?;
        let addr = server.server_addr().to_ip().unwrap_or(requested);

        info!(
            target: event_names::RPC_LISTENING,
            stage = %Stage::Rpc,
            addr = %addr,
            "rpc server listening"
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let thread = thread::Builder::new()
            .name("ota-rpc".to_string())
            .spawn(move || serve_loop(server, &events, &shutdown_flag))
            .map_err(Error::Io)?;

        Ok(RpcServer {
            shutdown,
            thread: Some(thread),
            addr,
        })
    }

    /// The bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests and join the server thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!(target: event_names::RPC_LISTENING, "rpc server stopped");
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(server: tiny_http::Server, events: &LoopSender, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        let request = match server.recv_timeout(Duration::from_millis(250)) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                warn!(target: event_names::RPC_FAILED, error = %e, "rpc accept failed");
                continue;
            }
        };
        let (request, rpc) = handle(request_parts(request), events);
        respond(request, rpc);
    }
}

struct Incoming {
    method: tiny_http::Method,
    path: String,
    body: Result<Vec<u8>, Error>,
}

fn request_parts(mut request: tiny_http::Request) -> (tiny_http::Request, Incoming) {
    let method = request.method().clone();
    let path = request.url().split('?').next().unwrap_or_default().to_string();
    let mut body = Vec::new();
    let read = request
        .as_reader()
        .take(MAX_BODY_BYTES + 1)
        .read_to_end(&mut body);
    let body = match read {
        Err(e) => Err(Error::Io(e)),
        Ok(_) if body.len() as u64 > MAX_BODY_BYTES => Err(Error::InvalidArguments(format!(
            "request body exceeds {} bytes",
            MAX_BODY_BYTES
        ))),
        Ok(_) => Ok(body),
    };
    (request, Incoming { method, path, body })
}

fn handle(
    (request, incoming): (tiny_http::Request, Incoming),
    events: &LoopSender,
) -> (tiny_http::Request, RpcResponse) {
    let Some(name) = incoming.path.strip_prefix(RPC_PREFIX) else {
        return (
            request,
            RpcResponse {
                status: 404,
                body: json!({ "error": "not found" }),
            },
        );
    };
    if incoming.method != tiny_http::Method::Post {
        return (
            request,
            RpcResponse {
                status: 405,
                body: json!({ "error": "use POST" }),
            },
        );
    }
    let body = match incoming.body {
        Ok(body) => body,
        Err(err) => return (request, RpcResponse::from_error(&err)),
    };

    let (reply_tx, reply_rx) = mpsc::channel();
    let call = RpcCall {
        method: name.to_string(),
        body,
        reply: reply_tx,
    };
    if events.send(LoopEvent::Rpc(call)).is_err() {
        return (request, RpcResponse::from_error(&Error::RestartPending));
    }
    let response = reply_rx
        .recv_timeout(REPLY_TIMEOUT)
        .unwrap_or_else(|_| RpcResponse::from_error(&Error::RestartPending));
    (request, response)
}

fn respond(request: tiny_http::Request, rpc: RpcResponse) {
    let body = serde_json::to_string(&rpc.body).unwrap_or_else(|_| "{}".to_string());
    let mut response = tiny_http::Response::from_string(body).with_status_code(rpc.status);
    if let Ok(header) = "Content-Type: application/json".parse::<tiny_http::Header>() {
        response = response.with_header(header);
    }
    if let Err(e) = request.respond(response) {
        debug!(target: event_names::RPC_FAILED, error = %e, "failed to send rpc response");
    }
}
