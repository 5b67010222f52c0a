//! Structured event vocabulary.
//!
//! Every updater event is emitted with one of the [`event_names`] as its
//! tracing target and a `stage` field, so JSONL consumers can filter on stable
//! strings instead of message text.

use serde::{Deserialize, Serialize};

/// Log levels for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Phases of the updater lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup and configuration.
    Init,
    /// Boot-time reconciliation of the record against the slots.
    Boot,
    /// Staged image activation.
    Swap,
    /// Confirmation window after a swap.
    Watchdog,
    /// Update fetch and staging.
    Update,
    /// Plain file download.
    Download,
    /// Operator confirmation.
    Commit,
    /// Restoration of backed-up images.
    Rollback,
    /// Remote procedure calls.
    Rpc,
    /// Event loop and restart handling.
    Runtime,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Boot => "boot",
            Stage::Swap => "swap",
            Stage::Watchdog => "watchdog",
            Stage::Update => "update",
            Stage::Download => "download",
            Stage::Commit => "commit",
            Stage::Rollback => "rollback",
            Stage::Rpc => "rpc",
            Stage::Runtime => "runtime",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Startup
    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const DAEMON_STARTED: &str = "daemon.started";
    pub const DAEMON_STOPPED: &str = "daemon.stopped";

    // Record store
    pub const RECORD_WRITTEN: &str = "record.written";
    pub const RECORD_DEFAULTED: &str = "record.defaulted";
    pub const RECORD_CORRUPT: &str = "record.corrupt";
    pub const RECORD_WRITE_FAILED: &str = "record.write_failed";

    // Boot reconciliation
    pub const BOOT_STARTED: &str = "boot.started";
    pub const BOOT_COMMITTED: &str = "boot.committed";
    pub const BOOT_ACTIVATING: &str = "boot.activating";
    pub const BOOT_UNRECOGNIZED_STATUS: &str = "boot.unrecognized_status";
    pub const BOOT_EMPTY_PENDING: &str = "boot.empty_pending";
    pub const BOOT_TRIAL_INTERRUPTED: &str = "boot.trial_interrupted";
    pub const BOOT_INCONSISTENT_SLOTS: &str = "boot.inconsistent_slots";
    pub const IMAGE_LOADED: &str = "boot.image_loaded";
    pub const IMAGE_LOAD_FAILED: &str = "boot.image_load_failed";

    // Swap
    pub const SWAP_MARKER_FOUND: &str = "swap.marker_found";
    pub const SWAP_PAIR_UNDONE: &str = "swap.pair_undone";
    pub const SWAP_PAIR_BROKEN: &str = "swap.pair_broken";
    pub const SWAP_UNDO_FAILED: &str = "swap.undo_failed";
    pub const SWAP_ACTIVATED: &str = "swap.activated";
    pub const SWAP_PARTIAL_FAILURE: &str = "swap.partial_failure";
    pub const SWAP_ABANDONED: &str = "swap.abandoned";

    // Watchdog
    pub const WATCHDOG_ARMED: &str = "watchdog.armed";
    pub const WATCHDOG_CONFIRMED: &str = "watchdog.confirmed";
    pub const WATCHDOG_EXPIRED: &str = "watchdog.expired";

    // Rollback
    pub const ROLLBACK_STARTED: &str = "rollback.started";
    pub const ROLLBACK_PAIR_RESTORED: &str = "rollback.pair_restored";
    pub const ROLLBACK_PAIR_SKIPPED: &str = "rollback.pair_skipped";
    pub const ROLLBACK_FINISHED: &str = "rollback.finished";
    pub const ROLLBACK_FAILED: &str = "rollback.failed";

    // Update and download
    pub const UPDATE_REQUESTED: &str = "update.requested";
    pub const UPDATE_REJECTED: &str = "update.rejected";
    pub const UPDATE_STAGED: &str = "update.staged";
    pub const UPDATE_FETCH_FAILED: &str = "update.fetch_failed";
    pub const UPDATE_RECORD_FAILED: &str = "update.record_failed";
    pub const DOWNLOAD_REQUESTED: &str = "download.requested";
    pub const DOWNLOAD_FINISHED: &str = "download.finished";
    pub const DOWNLOAD_FAILED: &str = "download.failed";

    // Operator actions
    pub const COMMIT_RECORDED: &str = "commit.recorded";
    pub const REVERT_REQUESTED: &str = "revert.requested";
    pub const REVERT_DISCARDED: &str = "revert.discarded";

    // Runtime
    pub const REBOOT_REQUESTED: &str = "runtime.reboot_requested";
    pub const REBOOT_DUE: &str = "runtime.reboot_due";
    pub const TIMER_FIRED: &str = "runtime.timer_fired";
    pub const FETCH_DROPPED: &str = "runtime.fetch_dropped";
    pub const RPC_RECEIVED: &str = "rpc.received";
    pub const RPC_FAILED: &str = "rpc.failed";
    pub const RPC_LISTENING: &str = "rpc.listening";

    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Correlation IDs attached to every event of one daemon process.
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Unique ID for this process start.
    pub run_id: String,
    pub host_id: String,
}

impl LogContext {
    pub fn new(run_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        LogContext {
            run_id: run_id.into(),
            host_id: host_id.into(),
        }
    }

    /// Root span carrying the correlation IDs; events inside inherit them.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("ota", run_id = %self.run_id, host_id = %self.host_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display_matches_serde() {
        for stage in [Stage::Boot, Stage::Watchdog, Stage::Rollback, Stage::Rpc] {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage));
        }
    }

    #[test]
    fn test_event_names_are_dotted() {
        for name in [
            event_names::BOOT_STARTED,
            event_names::WATCHDOG_EXPIRED,
            event_names::SWAP_PARTIAL_FAILURE,
            event_names::REBOOT_REQUESTED,
        ] {
            assert!(name.contains('.'), "{}", name);
        }
    }

    #[test]
    fn test_failure_events_are_distinct_from_success_events() {
        assert_ne!(event_names::RECORD_WRITE_FAILED, event_names::RECORD_WRITTEN);
        assert_ne!(event_names::SWAP_UNDO_FAILED, event_names::SWAP_PAIR_BROKEN);
        assert_ne!(event_names::REVERT_DISCARDED, event_names::REVERT_REQUESTED);
        assert!(event_names::RECORD_WRITE_FAILED.ends_with("_failed"));
        assert!(event_names::SWAP_UNDO_FAILED.ends_with("_failed"));
    }

    #[test]
    fn test_level_from_tracing() {
        assert_eq!(Level::from(tracing::Level::INFO), Level::Info);
        assert_eq!(Level::from(tracing::Level::ERROR), Level::Error);
    }
}
