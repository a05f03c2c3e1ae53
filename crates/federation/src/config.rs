//! Node configuration

use anyhow::Context;
use hashweave_hashgraph::ConsensusConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a Hashweave node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable node name
    pub moniker: String,
    /// Address to listen on
    pub bind_addr: String,
    /// Address announced to peers, defaults to the bound address
    pub advertise_addr: Option<String>,
    /// Directory for the sled database; in-memory when unset
    pub data_dir: Option<PathBuf>,
    /// Gossip interval while there is work to do
    pub heartbeat_ms: u64,
    /// Gossip interval while idle
    pub slow_heartbeat_ms: u64,
    /// Maximum events in one sync response
    pub sync_limit: usize,
    /// Maximum concurrent inbound requests
    pub max_pool: usize,
    /// Per-request network timeout
    pub tcp_timeout_ms: u64,
    /// How long join and leave wait for the peer set to change
    pub join_timeout_ms: u64,
    /// Start from a peer's snapshot instead of replaying history
    pub enable_fast_sync: bool,
    /// Stop creating events once undetermined events exceed this many per peer
    pub suspend_limit: usize,
    /// Consensus parameters, identical on every validator
    pub consensus: ConsensusConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            moniker: "hashweave-node".to_string(),
            bind_addr: "127.0.0.1:1337".to_string(),
            advertise_addr: None,
            data_dir: None,
            heartbeat_ms: 20,
            slow_heartbeat_ms: 1000,
            sync_limit: 1000,
            max_pool: 2,
            tcp_timeout_ms: 1000,
            join_timeout_ms: 10_000,
            enable_fast_sync: false,
            suspend_limit: 300,
            consensus: ConsensusConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load a JSON configuration file; absent fields keep their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }

    pub fn slow_heartbeat(&self) -> Duration {
        Duration::from_millis(self.slow_heartbeat_ms.max(self.heartbeat_ms).max(1))
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Address peers should use to reach this node.
    pub fn advertised(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"moniker": "alpha", "sync_limit": 50}"#).unwrap();

        let config = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.moniker, "alpha");
        assert_eq!(config.sync_limit, 50);
        assert_eq!(config.max_pool, 2);
        assert_eq!(config.consensus, ConsensusConfig::default());
        assert_eq!(config.advertised(), "127.0.0.1:1337");
    }

    #[test]
    fn test_config_errors_name_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        let err = NodeConfig::from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
        assert!(err.to_string().contains("missing.json"));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        let err = NodeConfig::from_file(&broken).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
