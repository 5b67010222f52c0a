//! OTA updater configuration loading and validation.
//!
//! This crate provides:
//! - Typed Rust structs for `ota.json`
//! - Config resolution (CLI → env → XDG → /etc → defaults)
//! - Semantic validation

pub mod resolve;
pub mod settings;
pub mod validate;

pub use resolve::{resolve_config, ConfigPath, ConfigSource};
pub use settings::{CommitDetection, FetchSettings, LauncherSettings, OtaConfig, RpcSettings};
pub use validate::{validate_config, ValidationError, ValidationResult};

/// Schema version for configuration files.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";
