//! OTA Update Core Library
//!
//! This library provides the update state machine and the host it runs on:
//! - Boot reconciliation, image swap, confirmation watchdog and rollback
//! - The single-threaded event loop and restart latch
//! - Host adapters (slot directory, HTTP fetch, image launcher)
//! - The RPC surface
//! - Configuration loading, logging and exit codes
//!
//! The binary entry point is in `main.rs`.

pub mod config;
pub mod exit_codes;
pub mod host;
pub mod logging;
pub mod rpc;
pub mod runtime;
pub mod update;

// Re-export test utilities for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use update::{Updater, UpdaterSettings};
