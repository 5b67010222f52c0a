//! Exit codes for the ota-core CLI.
//!
//! Exit code ranges:
//! - 0-3: Operational outcomes (parse outcome from code, not output)
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors (bugs, should be reported)

use ota_common::{Error, ErrorCategory};

/// Exit codes for ota-core operations.
///
/// These codes are a stable contract for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // ========================================================================
    // Operational Outcomes (0-3)
    // ========================================================================
    /// Success: committed, nothing outstanding
    Clean = 0,

    /// An update is pending confirmation
    UpdatePending = 1,

    /// The operation finished and the daemon must restart to apply it
    RestartRequired = 2,

    /// Revert requested but no update was pending
    NothingToRevert = 3,

    // ========================================================================
    // User / Environment Errors (10-19)
    // ========================================================================
    /// Invalid arguments
    ArgsError = 10,

    /// Configuration could not be loaded or is invalid
    ConfigError = 11,

    /// Slot directory or update record unusable
    StorageError = 12,

    /// Swap or rollback left the slots needing the next boot
    SwapError = 13,

    /// RPC request malformed or refused
    RpcError = 14,

    /// Update flow refused (pending, in flight, restart pending)
    UpdateError = 15,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Error code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::UpdatePending => "OK_PENDING",
            ExitCode::RestartRequired => "OK_RESTART",
            ExitCode::NothingToRevert => "OK_NOTHING_TO_REVERT",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::StorageError => "ERR_STORAGE",
            ExitCode::SwapError => "ERR_SWAP",
            ExitCode::RpcError => "ERR_RPC",
            ExitCode::UpdateError => "ERR_UPDATE",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl From<&Error> for ExitCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::NothingToRevert => ExitCode::NothingToRevert,
            Error::UnknownMethod { .. } | Error::InvalidArguments(_) => ExitCode::ArgsError,
            _ => match err.category() {
                ErrorCategory::Config => ExitCode::ConfigError,
                ErrorCategory::Storage => ExitCode::StorageError,
                ErrorCategory::Swap => ExitCode::SwapError,
                ErrorCategory::Update => ExitCode::UpdateError,
                ErrorCategory::Rpc => ExitCode::RpcError,
                ErrorCategory::Io => ExitCode::IoError,
            },
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}
