//! Configuration resolution and path discovery.
//!
//! Resolution order: CLI argument → environment variables → XDG path →
//! system path → defaults.

use std::path::{Path, PathBuf};

use crate::settings::APP_NAME;

/// Discovered configuration file path.
#[derive(Debug, Clone, Default)]
pub struct ConfigPath {
    /// Path to ota.json (or None if not found).
    pub path: Option<PathBuf>,

    /// Where the path came from (for diagnostics).
    pub source: ConfigSource,
}

/// Where a configuration file was found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Explicitly provided via CLI argument.
    CliArgument,

    /// Set via environment variable.
    Environment,

    /// Found in XDG config directory.
    XdgConfig,

    /// Found in /etc/ota-updater/.
    SystemConfig,

    /// Using built-in defaults.
    #[default]
    BuiltinDefault,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument => write!(f, "CLI argument"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::XdgConfig => write!(f, "XDG config"),
            ConfigSource::SystemConfig => write!(f, "system config"),
            ConfigSource::BuiltinDefault => write!(f, "builtin default"),
        }
    }
}

/// Environment variable names.
pub const ENV_CONFIG_PATH: &str = "OTA_CONFIG";
pub const ENV_CONFIG_DIR: &str = "OTA_CONFIG_DIR";

/// Standard config file name.
pub const CONFIG_FILENAME: &str = "ota.json";

/// Resolve the configuration file path.
///
/// Resolution order:
/// 1. Explicit CLI path (if provided; returned even when missing so the load
///    reports it)
/// 2. `OTA_CONFIG` environment variable
/// 3. `OTA_CONFIG_DIR` environment variable + filename
/// 4. XDG config directory (~/.config/ota-updater/)
/// 5. System config (/etc/ota-updater/)
/// 6. Built-in defaults (None)
pub fn resolve_config(cli_path: Option<&Path>) -> ConfigPath {
    if let Some(path) = cli_path {
        return ConfigPath {
            path: Some(path.to_path_buf()),
            source: ConfigSource::CliArgument,
        };
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return found(path, ConfigSource::Environment);
        }
    }

    if let Ok(config_dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = PathBuf::from(config_dir).join(CONFIG_FILENAME);
        if path.exists() {
            return found(path, ConfigSource::Environment);
        }
    }

    if let Some(xdg_config) = dirs::config_dir() {
        let path = xdg_config.join(APP_NAME).join(CONFIG_FILENAME);
        if path.exists() {
            return found(path, ConfigSource::XdgConfig);
        }
    }

    let system_path = PathBuf::from("/etc").join(APP_NAME).join(CONFIG_FILENAME);
    if system_path.exists() {
        return found(system_path, ConfigSource::SystemConfig);
    }

    ConfigPath::default()
}

fn found(path: PathBuf, source: ConfigSource) -> ConfigPath {
    ConfigPath {
        path: Some(path),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_path_wins() {
        let explicit = Path::new("/nonexistent/ota.json");
        let resolved = resolve_config(Some(explicit));
        assert_eq!(resolved.path.as_deref(), Some(explicit));
        assert_eq!(resolved.source, ConfigSource::CliArgument);
    }

    #[test]
    fn test_source_display() {
        assert_eq!(ConfigSource::BuiltinDefault.to_string(), "builtin default");
        assert_eq!(ConfigSource::Environment.to_string(), "environment variable");
    }
}
