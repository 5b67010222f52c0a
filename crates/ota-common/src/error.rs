//! Error types for the OTA updater.
//!
//! Errors carry:
//! - Stable error codes for machine parsing
//! - Category classification for error grouping
//! - Recoverability hints for automation
//! - A short headline for humans
//!
//! # Operator-Facing Output
//!
//! Errors serialize to structured JSON for RPC error bodies and CLI output:
//! ```json
//! {
//!   "code": 41,
//!   "category": "update",
//!   "message": "an update is already pending confirmation",
//!   "recoverable": true
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for updater operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration file errors.
    Config,
    /// Update record / durable store errors.
    Storage,
    /// Image swap and rollback errors.
    Swap,
    /// Update and download flow errors.
    Update,
    /// Remote procedure call errors.
    Rpc,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Swap => write!(f, "swap"),
            ErrorCategory::Update => write!(f, "update"),
            ErrorCategory::Rpc => write!(f, "rpc"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Unified error type for the OTA updater.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid slot name: {name:?}")]
    InvalidName { name: String },

    // Storage errors (20-29)
    #[error("stored record {key} is corrupt: {reason}")]
    StorageCorrupt { key: String, reason: String },

    #[error("storage operation failed: {0}")]
    Storage(String),

    // Swap errors (30-39)
    #[error("swap of {original} left the slot inconsistent: {reason}")]
    SwapPartialFailure { original: String, reason: String },

    #[error("swap failed: {0}")]
    SwapFailed(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    // Update errors (40-49)
    #[error("fetch of {url} failed: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("an update is already pending confirmation")]
    UpdatePending,

    #[error("an update download is already in progress")]
    UpdateInProgress,

    #[error("update was not confirmed within {seconds}s")]
    UnconfirmedUpdate { seconds: u64 },

    #[error("no pending update to revert")]
    NothingToRevert,

    #[error("a restart is pending")]
    RestartPending,

    // RPC errors (50-59)
    #[error("unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Configuration errors
    /// - 20-29: Storage errors
    /// - 30-39: Swap errors
    /// - 40-49: Update errors
    /// - 50-59: RPC errors
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidName { .. } => 11,
            Error::StorageCorrupt { .. } => 20,
            Error::Storage(_) => 21,
            Error::SwapPartialFailure { .. } => 30,
            Error::SwapFailed(_) => 31,
            Error::RollbackFailed(_) => 32,
            Error::FetchFailed { .. } => 40,
            Error::UpdatePending => 41,
            Error::UpdateInProgress => 42,
            Error::UnconfirmedUpdate { .. } => 43,
            Error::NothingToRevert => 44,
            Error::RestartPending => 45,
            Error::UnknownMethod { .. } => 50,
            Error::InvalidArguments(_) => 51,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidName { .. } => ErrorCategory::Config,

            Error::StorageCorrupt { .. } | Error::Storage(_) => ErrorCategory::Storage,

            Error::SwapPartialFailure { .. } | Error::SwapFailed(_) | Error::RollbackFailed(_) => {
                ErrorCategory::Swap
            }

            Error::FetchFailed { .. }
            | Error::UpdatePending
            | Error::UpdateInProgress
            | Error::UnconfirmedUpdate { .. }
            | Error::NothingToRevert
            | Error::RestartPending => ErrorCategory::Update,

            Error::UnknownMethod { .. } | Error::InvalidArguments(_) => ErrorCategory::Rpc,

            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Returns whether this error is potentially recoverable by retrying later
    /// or fixing the request.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::InvalidName { .. } => true,

            // Corrupt records self-heal to committed
            Error::StorageCorrupt { .. } => true,
            Error::Storage(_) => true,

            // Slot state needs the next boot to resolve
            Error::SwapPartialFailure { .. } => false,
            Error::SwapFailed(_) => false,
            Error::RollbackFailed(_) => false,

            Error::FetchFailed { .. } => true,
            Error::UpdatePending => true, // commit or wait for the watchdog
            Error::UpdateInProgress => true,
            Error::UnconfirmedUpdate { .. } => false,
            Error::NothingToRevert => false,
            Error::RestartPending => true,

            Error::UnknownMethod { .. } => false,
            Error::InvalidArguments(_) => true,

            Error::Io(_) => true,
            Error::Json(_) => true,
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::InvalidName { .. } => "Invalid Slot Name",
            Error::StorageCorrupt { .. } => "Corrupt Update Record",
            Error::Storage(_) => "Storage Error",
            Error::SwapPartialFailure { .. } => "Partial Swap",
            Error::SwapFailed(_) => "Swap Failed",
            Error::RollbackFailed(_) => "Rollback Failed",
            Error::FetchFailed { .. } => "Fetch Failed",
            Error::UpdatePending => "Update Pending",
            Error::UpdateInProgress => "Update In Progress",
            Error::UnconfirmedUpdate { .. } => "Unconfirmed Update",
            Error::NothingToRevert => "Nothing To Revert",
            Error::RestartPending => "Restart Pending",
            Error::UnknownMethod { .. } => "Unknown Method",
            Error::InvalidArguments(_) => "Invalid Arguments",
            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Error",
        }
    }
}

/// Structured error response for JSON output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error is potentially recoverable.
    pub recoverable: bool,

    /// Additional structured context (e.g., url, file name).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::InvalidName { name } => {
                context.insert("name".to_string(), serde_json::json!(name));
            }
            Error::StorageCorrupt { key, .. } => {
                context.insert("key".to_string(), serde_json::json!(key));
            }
            Error::SwapPartialFailure { original, .. } => {
                context.insert("file".to_string(), serde_json::json!(original));
            }
            Error::FetchFailed { url, .. } => {
                context.insert("url".to_string(), serde_json::json!(url));
            }
            Error::UnconfirmedUpdate { seconds } => {
                context.insert("watchdog_secs".to_string(), serde_json::json!(seconds));
            }
            Error::UnknownMethod { method } => {
                context.insert("method".to_string(), serde_json::json!(method));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            context,
        }
    }
}

impl StructuredError {
    /// Add additional context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}

/// Format an error for human-readable stderr output.
///
/// ```text
/// ✗ [Headline]
///   Reason: [Error message]
/// ```
pub fn format_error_human(err: &Error, use_color: bool) -> String {
    let (red, reset) = if use_color {
        ("\x1b[31m", "\x1b[0m")
    } else {
        ("", "")
    };

    format!(
        "{red}✗{reset} {headline}\n  Reason: {message}",
        red = red,
        reset = reset,
        headline = err.headline(),
        message = err,
    )
}
