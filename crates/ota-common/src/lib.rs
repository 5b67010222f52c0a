//! OTA updater common types and errors.
//!
//! This crate provides foundational types shared across the updater crates:
//! - The persisted update record, file pairs and swap marker
//! - Slot naming rules (active, backup and staged names)
//! - Common error types with stable codes
//! - Output format specifications

pub mod error;
pub mod output;
pub mod record;

pub use error::{Error, ErrorCategory, Result, StructuredError};
pub use output::OutputFormat;
pub use record::{FilePair, SwapMarker, UpdateRecord, UpdateStatus, MARKER_KEY, RECORD_KEY};

/// Schema version for JSON documents emitted by the CLI and RPC surface.
pub const SCHEMA_VERSION: &str = "1.0.0";
