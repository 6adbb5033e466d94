//! Configuration for product-registry

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::RegistryError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("product-registry")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Storage directory for the metadata cache and this file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Ledger JSON-RPC endpoint
    #[serde(default = "default_ledger_rpc_url")]
    pub ledger_rpc_url: String,

    /// Ledger notification WebSocket; role notifications are disabled if unset
    #[serde(default)]
    pub ledger_events_url: Option<String>,

    /// Upper bound on any single ledger call
    #[serde(default = "default_ledger_timeout_secs")]
    pub ledger_timeout_secs: u64,

    /// Delay before reconnecting a dropped notification stream
    #[serde(default = "default_reconnect_delay_secs")]
    pub events_reconnect_secs: u64,

    /// Run against an in-process ledger instead of `ledger_rpc_url`
    #[serde(default)]
    pub dev_ledger: bool,

    /// Owner (and first Admin) of the in-process ledger
    #[serde(default = "default_dev_owner")]
    pub dev_owner: String,
}

fn default_http_port() -> u16 {
    3001
}

fn default_ledger_rpc_url() -> String {
    "http://localhost:8545".to_string()
}

fn default_ledger_timeout_secs() -> u64 {
    30
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_dev_owner() -> String {
    "0x0000000000000000000000000000000000000001".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            ledger_rpc_url: default_ledger_rpc_url(),
            ledger_events_url: None,
            ledger_timeout_secs: default_ledger_timeout_secs(),
            events_reconnect_secs: default_reconnect_delay_secs(),
            dev_ledger: false,
            dev_owner: default_dev_owner(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| RegistryError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RegistryError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| RegistryError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger_timeout_secs)
    }

    pub fn events_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.events_reconnect_secs)
    }

    /// Get metadata cache database path
    pub fn cache_db_path(&self) -> PathBuf {
        self.storage_dir.join("metadata.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: Config = toml::from_str("http_port = 8080\n").unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.ledger_rpc_url, "http://localhost:8545");
        assert_eq!(config.ledger_timeout(), Duration::from_secs(30));
        assert!(config.ledger_events_url.is_none());
        assert!(!config.dev_ledger);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            storage_dir: dir.path().to_path_buf(),
            ledger_events_url: Some("ws://ledger:8546".into()),
            dev_ledger: true,
            ..Config::default()
        };
        config.save(config.config_path()).unwrap();

        let loaded = Config::load(config.config_path()).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.cache_db_path(), dir.path().join("metadata.sled"));
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "http_port = \"not a port\"").unwrap();
        assert!(matches!(Config::load(&path), Err(RegistryError::Config(_))));
    }
}
