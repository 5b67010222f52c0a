//! Structured logging for the updater.
//!
//! Provides dual-mode logging:
//! - Human-readable console output for interactive use
//! - Machine-parseable JSONL for supervised daemons
//!
//! # Usage
//!
//! ```ignore
//! use ota_core::logging::{init_logging, event_names, LogConfig, LogContext, Stage};
//!
//! init_logging(&LogConfig::from_env(None, None));
//! let ctx = LogContext::new(generate_run_id(), get_host_id());
//! let _guard = ctx.span().entered();
//! tracing::info!(target: event_names::BOOT_STARTED, stage = %Stage::Boot, "reconciling");
//! ```
//!
//! stdout is reserved for command payloads; all log output goes to stderr.

pub mod config;
pub mod events;
pub mod layer;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use events::{event_names, Level, LogContext, Stage};
pub use layer::{scrub_userinfo, JsonlLayer};

use sha2::{Digest, Sha256};
use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging subsystem.
///
/// Must be called once at startup before any logging occurs. `RUST_LOG`, when
/// set to a valid filter, replaces the level from `config`. Event targets are
/// dotted event names, so filters select on level or on those names.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(use_ansi);

            let registry = tracing_subscriber::registry().with(filter);
            let result = if config.timestamps {
                registry.with(fmt_layer).try_init()
            } else {
                registry.with(fmt_layer.without_time()).try_init()
            };
            if result.is_err() {
                eprintln!("logging already initialized");
            }
        }
        LogFormat::Jsonl => {
            if tracing_subscriber::registry()
                .with(filter)
                .with(JsonlLayer::stderr())
                .try_init()
                .is_err()
            {
                eprintln!("logging already initialized");
            }
        }
    }
}

/// Generate a unique ID for this process start.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("boot-{}", &uuid[..12])
}

/// Get the host ID for logging.
///
/// Uses machine-id when available, otherwise a digest of the hostname.
pub fn get_host_id() -> String {
    if let Ok(id) = std::fs::read_to_string("/etc/machine-id") {
        let id = id.trim();
        if id.len() >= 8 && id.is_ascii() {
            return format!("host-{}", &id[..8]);
        }
    }

    if let Ok(hostname) = std::env::var("HOSTNAME") {
        return format!("host-{}", short_digest(&hostname));
    }

    format!("host-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

fn short_digest(s: &str) -> String {
    let digest = hex::encode(Sha256::digest(s.as_bytes()));
    digest[..8].to_string()
}

/// Emit a daemon lifecycle event carrying the run's correlation IDs.
///
/// ```ignore
/// log_event!(ctx, INFO, event_names::DAEMON_STARTED, Stage::Init, "daemon started",
///     rpc_port = 8910u64);
/// ```
#[macro_export]
macro_rules! log_event {
    ($ctx:expr, INFO, $event:expr, $stage:expr, $msg:expr $(, $key:ident = $val:expr)*) => {
        tracing::info!(
            target: $event,
            run_id = %$ctx.run_id,
            host_id = %$ctx.host_id,
            stage = %$stage,
            message = $msg,
            $($key = $val,)*
        )
    };
    ($ctx:expr, WARN, $event:expr, $stage:expr, $msg:expr $(, $key:ident = $val:expr)*) => {
        tracing::warn!(
            target: $event,
            run_id = %$ctx.run_id,
            host_id = %$ctx.host_id,
            stage = %$stage,
            message = $msg,
            $($key = $val,)*
        )
    };
    ($ctx:expr, ERROR, $event:expr, $stage:expr, $msg:expr $(, $key:ident = $val:expr)*) => {
        tracing::error!(
            target: $event,
            run_id = %$ctx.run_id,
            host_id = %$ctx.host_id,
            stage = %$stage,
            message = $msg,
            $($key = $val,)*
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_run_id() {
        let id1 = generate_run_id();
        let id2 = generate_run_id();
        assert!(id1.starts_with("boot-"));
        assert_eq!(id1.len(), 17);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_get_host_id() {
        let host_id = get_host_id();
        assert!(host_id.starts_with("host-"));
        assert_eq!(host_id.len(), 13);
    }

    #[test]
    fn test_short_digest_is_stable() {
        assert_eq!(short_digest("device-01"), short_digest("device-01"));
        assert_ne!(short_digest("device-01"), short_digest("device-02"));
        assert_eq!(short_digest("x").len(), 8);
    }
}
