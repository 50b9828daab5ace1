//! Node configuration
//!
//! Loaded from a JSON file whose keys mirror the fields below in camelCase.
//! Every field has a default so a partial file is enough.

use crate::network::message::Peer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    /// Chain flavour this node relays
    pub chain: String,
    /// Accept and re-broadcast blocks; when false the node only observes
    pub peering: bool,
    /// Discover peers through the seeds' peer lists instead of using them verbatim
    pub fetch_peers: bool,
    /// Bootstrap peers
    pub peers: Vec<Peer>,
    pub minimum_version: String,
    /// Blocks a peer may trail the best known height before eviction
    pub acceptable_block_lag: u64,
    /// Window cap
    pub blocks: usize,
    /// Fraction of alive peers an accepted block is re-broadcast to
    pub broadcast_range: f64,
    /// Seconds between peer list rebuilds
    pub peer_refresh: u64,
    /// Seconds between peer status refreshes
    pub status_refresh: u64,
    /// Per-request timeout in milliseconds
    pub timeout: u64,
    /// Headers sent with every outbound request
    pub headers: serde_json::Map<String, serde_json::Value>,
    /// Listening port for the HTTP surface
    pub port: u16,
    /// Resync attempts before the node reports itself degraded
    pub sync_retries: u32,
    /// Base backoff between resync attempts, in milliseconds
    pub retry_backoff: u64,
    /// Proxy everything to `anchor` instead of a random peer
    pub use_anchor: bool,
    pub anchor: Option<Peer>,
    pub verbose: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let mut headers = serde_json::Map::new();
        headers.insert("version".to_string(), "1.0.1".into());
        headers.insert("port".to_string(), 4001.into());

        Self {
            chain: "ark-v2".to_string(),
            peering: true,
            fetch_peers: true,
            peers: Vec::new(),
            minimum_version: "1.0.0".to_string(),
            acceptable_block_lag: 5,
            blocks: 51,
            broadcast_range: 0.2,
            peer_refresh: 300,
            status_refresh: 8,
            timeout: 3000,
            headers,
            port: 4001,
            sync_retries: 5,
            retry_backoff: 1000,
            use_anchor: false,
            anchor: None,
            verbose: false,
        }
    }
}

impl NodeConfig {
    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocks == 0 {
            return Err(ConfigError::Invalid("blocks must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.broadcast_range) {
            return Err(ConfigError::Invalid(format!(
                "broadcastRange must be within 0..=1, got {}",
                self.broadcast_range
            )));
        }
        if self.version().is_none() {
            return Err(ConfigError::Invalid("headers.version must be set".to_string()));
        }
        if self.use_anchor && self.anchor.is_none() {
            return Err(ConfigError::Invalid("useAnchor requires an anchor".to_string()));
        }
        Ok(())
    }

    /// Our advertised node version
    pub fn version(&self) -> Option<&str> {
        self.headers.get("version").and_then(|v| v.as_str())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn peer_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.peer_refresh.max(1))
    }

    pub fn status_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.status_refresh.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff)
    }
}
