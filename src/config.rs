//! Configuration management for PharmaChain

use crate::blockchain::GENESIS_TIMESTAMP;
use crate::error::ChainError;
use crate::network::{NetworkSettings, PeerAddr};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hex digits in a SHA-256 hash; no difficulty can exceed it.
pub const MAX_DIFFICULTY: usize = 64;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_monitor_port")]
    pub monitor_port: u16,
    /// `host:port` entries registered at startup.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_broadcasts")]
    pub max_concurrent_broadcasts: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            monitor_port: default_monitor_port(),
            bootstrap_peers: Vec::new(),
            read_timeout_secs: default_read_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_concurrent_broadcasts: default_max_concurrent_broadcasts(),
        }
    }
}

impl NetworkConfig {
    pub fn settings(&self) -> NetworkSettings {
        NetworkSettings {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_concurrent_broadcasts: self.max_concurrent_broadcasts,
            ..NetworkSettings::default()
        }
    }

    pub fn parsed_bootstrap_peers(&self) -> Result<Vec<PeerAddr>, ChainError> {
        self.bootstrap_peers
            .iter()
            .map(|peer| {
                peer.parse::<PeerAddr>()
                    .map_err(|e| ChainError::ConfigError(format!("network.bootstrap_peers: {}", e)))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_difficulty")]
    pub difficulty: usize,
    #[serde(default = "default_genesis_timestamp")]
    pub genesis_timestamp: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            genesis_timestamp: default_genesis_timestamp(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CryptoConfig {
    /// Compressed secp256k1 public key (hex) that every block's content key is wrapped for.
    #[serde(default)]
    pub institution_public_key: Option<String>,
    /// Password-protected keystore holding the institution's secret key.
    #[serde(default)]
    pub secret_key_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_audit_path")]
    pub path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_audit_path(),
        }
    }
}

impl Config {
    pub fn from_toml(raw: &str) -> Result<Self, ChainError> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ChainError::ConfigError(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate critical values
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.ledger.difficulty > MAX_DIFFICULTY {
            return Err(ChainError::ConfigError(format!(
                "ledger.difficulty must be at most {}, got {}",
                MAX_DIFFICULTY, self.ledger.difficulty
            )));
        }
        if self.node.data_dir.is_empty() {
            return Err(ChainError::ConfigError("node.data_dir must be set".to_string()));
        }
        if self.network.read_timeout_secs == 0 || self.network.connect_timeout_secs == 0 {
            return Err(ChainError::ConfigError("network timeouts must be positive".to_string()));
        }
        if self.network.max_concurrent_broadcasts == 0 {
            return Err(ChainError::ConfigError(
                "network.max_concurrent_broadcasts must be positive".to_string(),
            ));
        }
        if self.audit.enabled && self.audit.path.is_empty() {
            return Err(ChainError::ConfigError("audit.path must be set when audit is enabled".to_string()));
        }
        self.network.parsed_bootstrap_peers()?;
        Ok(())
    }

    /// Audit database location, relative paths resolved against `node.data_dir`.
    pub fn audit_path(&self) -> PathBuf {
        let path = Path::new(&self.audit.path);
        if path.is_absolute() || self.audit.path == ":memory:" {
            path.to_path_buf()
        } else {
            Path::new(&self.node.data_dir).join(path)
        }
    }
}

/// Load `path`, falling back to defaults when the file is absent.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ChainError> {
    let path = path.as_ref();
    let config_str = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(ChainError::ConfigError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    Config::from_toml(&config_str)
}

fn default_node_name() -> String {
    "pharmachain-node".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_monitor_port() -> u16 {
    8080
}

fn default_read_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_max_concurrent_broadcasts() -> usize {
    8
}

fn default_difficulty() -> usize {
    4
}

fn default_genesis_timestamp() -> u64 {
    GENESIS_TIMESTAMP
}

fn default_audit_path() -> String {
    "audit.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("config.toml")).unwrap();

        assert_eq!(config.network.listen_port, 5000);
        assert_eq!(config.network.read_timeout_secs, 10);
        assert_eq!(config.ledger.difficulty, 4);
        assert_eq!(config.ledger.genesis_timestamp, GENESIS_TIMESTAMP);
        assert!(!config.audit.enabled);
        assert!(config.crypto.institution_public_key.is_none());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [network]
            listen_port = 5101
            bootstrap_peers = ["127.0.0.1:5102", "node-c:5103"]

            [ledger]
            difficulty = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.network.listen_port, 5101);
        assert_eq!(config.network.monitor_port, 8080);
        assert_eq!(config.ledger.difficulty, 2);
        assert_eq!(
            config.network.parsed_bootstrap_peers().unwrap(),
            vec![PeerAddr::new("127.0.0.1", 5102), PeerAddr::new("node-c", 5103)]
        );
        assert_eq!(config.network.settings().read_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Config::from_toml("[ledger]\ndifficulty = 65").is_err());
        assert!(Config::from_toml("[network]\nmax_concurrent_broadcasts = 0").is_err());
        assert!(Config::from_toml("[network]\nbootstrap_peers = [\"nope\"]").is_err());
        assert!(Config::from_toml("[network]\nlisten_port = \"x\"").is_err());
    }

    #[test]
    fn test_audit_path_resolves_under_data_dir() {
        let config = Config::from_toml("[node]\ndata_dir = \"/var/pharma\"\n[audit]\nenabled = true").unwrap();
        assert_eq!(config.audit_path(), PathBuf::from("/var/pharma/audit.db"));
    }
}
