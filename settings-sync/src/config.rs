//! Configuration management for settings sync.
//!
//! Loads configuration from a TOML file with environment variable overrides.

use crate::utils::errors::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Object store base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Folder-like prefix every backup lives under
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Bearer token sent with every request
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Delay before a finished progress bar is reset
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Consume download bodies chunk by chunk (false: single buffered read)
    #[serde(default = "default_stream_downloads")]
    pub stream_downloads: bool,

    /// Upload body chunk size in bytes (default: 64KB)
    #[serde(default = "default_upload_chunk_size")]
    pub upload_chunk_size: usize,

    /// Request timeout; unset means the transport default
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// JSON file holding the local application settings
    #[serde(default = "default_settings_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_base_url() -> String {
    "http://localhost:8787".to_string()
}

fn default_namespace() -> String {
    "settings".to_string()
}

fn default_settle_delay_ms() -> u64 {
    600
}

fn default_stream_downloads() -> bool {
    true
}

fn default_upload_chunk_size() -> usize {
    64 * 1024
}

fn default_settings_path() -> PathBuf {
    PathBuf::from("settings.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            namespace: default_namespace(),
            token: String::new(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            stream_downloads: default_stream_downloads(),
            upload_chunk_size: default_upload_chunk_size(),
            timeout_secs: None,
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: default_settings_path(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TransferConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Load the file (if any), then apply `.env` and environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in practice).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SETTINGS_SYNC_URL") {
            self.store.base_url = url;
        }
        if let Some(namespace) = lookup("SETTINGS_SYNC_NAMESPACE") {
            self.store.namespace = namespace;
        }
        if let Some(token) = lookup("SETTINGS_SYNC_TOKEN") {
            self.store.token = token;
        }
        if let Some(path) = lookup("SETTINGS_SYNC_SETTINGS") {
            self.settings.path = PathBuf::from(path);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log.level = level;
        }
    }

    /// Check the store section before talking to the network.
    pub fn validate_store(&self) -> Result<()> {
        if self.store.token.trim().is_empty() {
            return Err(SyncError::Config(
                "store.token must be set (or SETTINGS_SYNC_TOKEN)".to_string(),
            ));
        }
        if self.store.namespace.trim_matches('/').is_empty() {
            return Err(SyncError::Config("store.namespace must not be empty".to_string()));
        }
        reqwest::Url::parse(&self.store.base_url)
            .map_err(|e| SyncError::Config(format!("store.base_url: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = Config::from_toml("[store]\ntoken = \"abc\"\n").unwrap();
        assert_eq!(config.store.token, "abc");
        assert_eq!(config.store.namespace, "settings");
        assert_eq!(config.transfer.settle_delay_ms, 600);
        assert!(config.transfer.stream_downloads);
        assert!(config.transfer.timeout().is_none());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_env_overrides_win() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("SETTINGS_SYNC_URL", "https://store.example.com"),
            ("SETTINGS_SYNC_TOKEN", "secret"),
            ("LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.store.base_url, "https://store.example.com");
        assert_eq!(config.store.token, "secret");
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.store.namespace, "settings");
    }

    #[test]
    fn test_validate_requires_token() {
        let mut config = Config::default();
        assert!(matches!(config.validate_store(), Err(SyncError::Config(_))));

        config.store.token = "t".to_string();
        assert!(config.validate_store().is_ok());

        config.store.base_url = "not a url".to_string();
        assert!(config.validate_store().is_err());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = Config::from_toml("[transfer]\nsettle_delay_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
