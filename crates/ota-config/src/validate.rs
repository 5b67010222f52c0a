//! Configuration validation errors and semantic validation.

use ota_common::record::is_valid_slot_name;
use thiserror::Error;

use crate::settings::OtaConfig;

/// Validation result type.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Semantic validation failed: {0}")]
    SemanticError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
}

impl ValidationError {
    /// Error code for structured error reporting.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::SemanticError(_) => 63,
            ValidationError::InvalidValue { .. } => 65,
            ValidationError::VersionMismatch { .. } => 66,
        }
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate the updater configuration semantically.
pub fn validate_config(config: &OtaConfig) -> ValidationResult<()> {
    if config.schema_version != crate::CONFIG_SCHEMA_VERSION {
        return Err(ValidationError::VersionMismatch {
            expected: crate::CONFIG_SCHEMA_VERSION.to_string(),
            actual: config.schema_version.clone(),
        });
    }

    for (field, name) in [
        ("record_key", &config.record_key),
        ("marker_key", &config.marker_key),
        ("active_image", &config.active_image),
    ] {
        if !is_valid_slot_name(name) {
            return Err(invalid(field, format!("{:?} is not a plain file name", name)));
        }
    }

    if config.record_key == config.marker_key {
        return Err(ValidationError::SemanticError(
            "record_key and marker_key must differ".to_string(),
        ));
    }
    if config.active_image == config.record_key || config.active_image == config.marker_key {
        return Err(ValidationError::SemanticError(
            "active_image must not collide with the record or marker key".to_string(),
        ));
    }

    // A zero window would roll back before the new image had any chance to run.
    if config.watchdog_delay_secs == 0 {
        return Err(invalid("watchdog_delay_secs", "must be greater than 0"));
    }

    if config.rpc.enabled && config.rpc.port == 0 {
        return Err(invalid("rpc.port", "must be greater than 0"));
    }

    if config.fetch.timeout_secs == 0 {
        return Err(invalid("fetch.timeout_secs", "must be greater than 0"));
    }

    if let Some(program) = &config.launcher.program {
        if program.trim().is_empty() {
            return Err(invalid("launcher.program", "must not be blank"));
        }
    }

    Ok(())
}
