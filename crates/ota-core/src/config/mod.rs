//! Configuration loading for the updater daemon and CLI.
//!
//! This module handles:
//! - Locating `ota.json` (CLI > env > XDG > /etc > defaults)
//! - Parsing (shape/type checking via serde)
//! - Semantic validation
//! - Provenance (source, path, content hash) for `config show`

pub use ota_config::{
    resolve_config, validate_config, CommitDetection, ConfigSource, OtaConfig, ValidationError,
    CONFIG_SCHEMA_VERSION,
};

use schemars::JsonSchema;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid JSON in config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Semantic validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for ota_common::Error {
    fn from(err: ConfigError) -> Self {
        ota_common::Error::Config(err.to_string())
    }
}

/// Resolved configuration with provenance information.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: OtaConfig,
    /// File the config came from (None if using defaults).
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
    /// SHA-256 of the file content (None if using defaults).
    pub hash: Option<String>,
}

impl ResolvedConfig {
    /// Provenance summary for `config show`.
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            source: self.source.to_string(),
            path: self.path.clone(),
            hash: self.hash.clone(),
            schema_version: self.config.schema_version.clone(),
            config: self.config.clone(),
        }
    }
}

/// Serializable view of a resolved configuration.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ConfigSnapshot {
    pub source: String,
    pub path: Option<PathBuf>,
    pub hash: Option<String>,
    pub schema_version: String,
    pub config: OtaConfig,
}

/// Configuration resolution options.
#[derive(Debug, Default)]
pub struct ConfigOptions {
    /// Explicit config file (highest priority).
    pub config_path: Option<PathBuf>,
    /// Overrides `slot_dir` from the file.
    pub slot_dir: Option<PathBuf>,
}

/// Load configuration with the standard resolution order, then validate it.
pub fn load_config(options: &ConfigOptions) -> Result<ResolvedConfig, ConfigError> {
    let located = resolve_config(options.config_path.as_deref());

    let (mut config, hash) = match &located.path {
        Some(path) => {
            let (config, hash) = load_from_file(path)?;
            (config, Some(hash))
        }
        None => (OtaConfig::default(), None),
    };

    if let Some(dir) = &options.slot_dir {
        config.slot_dir = dir.clone();
    }

    validate_config(&config)?;

    Ok(ResolvedConfig {
        config,
        path: located.path,
        source: located.source,
        hash,
    })
}

fn load_from_file(path: &Path) -> Result<(OtaConfig, String), ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::IoError {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;

    let hash = compute_hash(&content);

    let config: OtaConfig = serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok((config, hash))
}

/// SHA-256 of content, lowercase hex.
fn compute_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("ota.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_explicit_file_loads_with_provenance() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"watchdog_delay_secs": 20}"#);

        let resolved = load_config(&ConfigOptions {
            config_path: Some(path.clone()),
            slot_dir: None,
        })
        .unwrap();

        assert_eq!(resolved.config.watchdog_delay_secs, 20);
        assert_eq!(resolved.path, Some(path));
        assert_eq!(resolved.source, ConfigSource::CliArgument);
        assert_eq!(resolved.hash.as_deref().map(str::len), Some(64));
    }

    #[test]
    fn test_slot_dir_override() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"slot_dir": "/nowhere"}"#);

        let resolved = load_config(&ConfigOptions {
            config_path: Some(path),
            slot_dir: Some(dir.path().join("slots")),
        })
        .unwrap();
        assert_eq!(resolved.config.slot_dir, dir.path().join("slots"));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = TempDir::new().unwrap();
        let err = load_config(&ConfigOptions {
            config_path: Some(dir.path().join("absent.json")),
            slot_dir: None,
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{not json");
        let err = load_config(&ConfigOptions {
            config_path: Some(path),
            slot_dir: None,
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_semantic_error_surfaces() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"watchdog_delay_secs": 0}"#);
        let err = load_config(&ConfigOptions {
            config_path: Some(path),
            slot_dir: None,
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));

        let common: ota_common::Error = err.into();
        assert_eq!(common.code(), 10);
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(compute_hash("abc"), compute_hash("abc"));
        assert_ne!(compute_hash("abc"), compute_hash("abd"));
    }
}
