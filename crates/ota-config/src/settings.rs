//! Updater settings types.
//!
//! These types match the `ota.json` configuration file. Every field has a
//! default, so an empty object (or no file at all) is a valid configuration.

use ota_common::record::{MARKER_KEY, RECORD_KEY};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application name used for directory discovery.
pub const APP_NAME: &str = "ota-updater";

/// How the confirmation watchdog decides whether an update was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommitDetection {
    /// A `COMMITTED` record at expiry means the update was confirmed.
    #[default]
    RecordStatus,
    /// Confirmation is never detected: every expiry rolls back.
    ///
    /// Matches devices whose watchdog compared against a misspelled success
    /// literal, for fleets that depend on that behavior.
    Never,
}

impl std::fmt::Display for CommitDetection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitDetection::RecordStatus => write!(f, "record_status"),
            CommitDetection::Never => write!(f, "never"),
        }
    }
}

/// Complete updater configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OtaConfig {
    pub schema_version: String,

    /// Directory backing the key/value store (images, record, marker).
    pub slot_dir: PathBuf,

    /// Key of the update record within the slot directory.
    pub record_key: String,

    /// Key of the swap-in-progress marker within the slot directory.
    pub marker_key: String,

    /// Name of the image loaded at boot.
    pub active_image: String,

    /// Time the new image has to commit before it is rolled back.
    pub watchdog_delay_secs: u64,

    /// Delay between a restart request and the restart itself.
    pub reboot_grace_secs: u64,

    pub commit_detection: CommitDetection,

    pub rpc: RpcSettings,

    pub fetch: FetchSettings,

    pub launcher: LauncherSettings,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            schema_version: crate::CONFIG_SCHEMA_VERSION.to_string(),
            slot_dir: default_slot_dir(),
            record_key: RECORD_KEY.to_string(),
            marker_key: MARKER_KEY.to_string(),
            active_image: "app".to_string(),
            watchdog_delay_secs: 10,
            reboot_grace_secs: 5,
            commit_detection: CommitDetection::default(),
            rpc: RpcSettings::default(),
            fetch: FetchSettings::default(),
            launcher: LauncherSettings::default(),
        }
    }
}

impl OtaConfig {
    pub fn watchdog_delay(&self) -> Duration {
        Duration::from_secs(self.watchdog_delay_secs)
    }

    pub fn reboot_grace(&self) -> Duration {
        Duration::from_secs(self.reboot_grace_secs)
    }
}

/// Remote procedure call listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RpcSettings {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 8910,
        }
    }
}

/// HTTP fetch behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FetchSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            user_agent: format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")),
        }
    }
}

/// How the active image is started.
///
/// With no `program`, the image itself is executed. Otherwise `program` is run
/// with `args` followed by the image path (e.g. an interpreter for scripts).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LauncherSettings {
    pub program: Option<String>,
    pub args: Vec<String>,
}

/// Default slot directory under the platform data dir.
pub fn default_slot_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(APP_NAME)
        .join("slots")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_timings() {
        let config = OtaConfig::default();
        assert_eq!(config.watchdog_delay(), Duration::from_secs(10));
        assert_eq!(config.reboot_grace(), Duration::from_secs(5));
        assert_eq!(config.record_key, "updater_data.json");
        assert_eq!(config.commit_detection, CommitDetection::RecordStatus);
    }

    #[test]
    fn test_empty_object_is_default() {
        let config: OtaConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, OtaConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config: OtaConfig = serde_json::from_str(
            r#"{"watchdog_delay_secs": 30, "commit_detection": "never", "rpc": {"port": 9000}}"#,
        )
        .unwrap();
        assert_eq!(config.watchdog_delay_secs, 30);
        assert_eq!(config.commit_detection, CommitDetection::Never);
        assert_eq!(config.rpc.port, 9000);
        assert_eq!(config.rpc.bind, "127.0.0.1");
        assert_eq!(config.reboot_grace_secs, 5);
    }

    #[test]
    fn test_schema_mentions_fields() {
        let schema = schemars::schema_for!(OtaConfig);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("watchdog_delay_secs"));
        assert!(json.contains("commit_detection"));
    }
}
