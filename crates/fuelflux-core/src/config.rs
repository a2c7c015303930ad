//! Device configuration.

use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default portal base URL.
pub const DEFAULT_BACKEND_URL: &str = "http://ttft.uxp.ru";
/// Default controller UID, overridable via `FUELFLUX_CONTROLLER_ID`.
pub const DEFAULT_CONTROLLER_UID: &str = "232390330480218";
/// Default path for the storage database (queues + allowance cache).
pub const DEFAULT_STORAGE_DB_PATH: &str = "fuelflux/db/fuelflux_storage.db";
/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Main controller configuration.
///
/// Loaded from a JSON file when one exists, then overridden from the
/// environment. Values the deployment does not set fall back to the
/// defaults above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Portal base URL.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    /// This device's controller UID.
    #[serde(default = "default_controller_uid")]
    pub controller_uid: String,
    /// Path of the storage database file.
    #[serde(default = "default_storage_db_path")]
    pub storage_db_path: String,
    /// Seconds without flow before a running pump is cancelled.
    #[serde(default = "default_no_flow_timeout_secs")]
    pub no_flow_timeout_secs: u64,
    /// Seconds between backlog drain passes.
    #[serde(default = "default_backlog_interval_secs")]
    pub backlog_interval_secs: u64,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

fn default_controller_uid() -> String {
    DEFAULT_CONTROLLER_UID.to_string()
}

fn default_storage_db_path() -> String {
    DEFAULT_STORAGE_DB_PATH.to_string()
}

fn default_no_flow_timeout_secs() -> u64 {
    30
}

fn default_backlog_interval_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            backend_url: default_backend_url(),
            controller_uid: default_controller_uid(),
            storage_db_path: default_storage_db_path(),
            no_flow_timeout_secs: default_no_flow_timeout_secs(),
            backlog_interval_secs: default_backlog_interval_secs(),
        }
    }
}

impl Config {
    /// Create a config with defaults, then apply environment overrides.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from a file, falling back to defaults when the
    /// file is missing. Environment overrides are applied last.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) {
        if let Ok(uid) = std::env::var("FUELFLUX_CONTROLLER_ID") {
            if !uid.trim().is_empty() {
                self.controller_uid = uid.trim().to_string();
            }
        }
        if let Ok(url) = std::env::var("FUELFLUX_BACKEND_URL") {
            if !url.trim().is_empty() {
                self.backend_url = url.trim().to_string();
            }
        }
        if let Ok(level) = std::env::var("FUELFLUX_LOG_LEVEL") {
            if !level.trim().is_empty() {
                self.log_level = level.trim().to_string();
            }
        }
    }

    fn validate(&self) -> CoreResult<()> {
        if self.controller_uid.is_empty() {
            return Err(CoreError::InvalidConfig(
                "controller_uid must not be empty".to_string(),
            ));
        }
        if !self.backend_url.starts_with("http://") && !self.backend_url.starts_with("https://") {
            return Err(CoreError::InvalidConfig(format!(
                "backend_url must be an http(s) URL, got {}",
                self.backend_url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(config.controller_uid, DEFAULT_CONTROLLER_UID);
        assert_eq!(config.no_flow_timeout_secs, 30);
        assert_eq!(config.backlog_interval_secs, 30);
    }

    #[test]
    fn load_from_file_with_partial_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"controller_uid": "555", "backlog_interval_secs": 5}"#,
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.controller_uid, "555");
        assert_eq!(config.backlog_interval_secs, 5);
        // Untouched fields keep defaults
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
    }

    #[test]
    fn save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");

        let mut config = Config::default();
        config.controller_uid = "42".to_string();
        config.no_flow_timeout_secs = 7;
        config.save(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.controller_uid, "42");
        assert_eq!(loaded.no_flow_timeout_secs, 7);
    }

    #[test]
    fn validate_rejects_bad_url() {
        let mut config = Config::default();
        config.backend_url = "ftp://example".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_uid() {
        let mut config = Config::default();
        config.controller_uid = String::new();
        assert!(config.validate().is_err());
    }
}
