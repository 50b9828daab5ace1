//! DPoS relay: a lightweight relay/observer node for delegated-proof-of-stake networks
//!
//! The node keeps no ledger. It maintains a bounded in-memory window of the
//! most recent blocks, rebuilt from peers whenever needed:
//! - Peer registry with periodic health checks and quarantine
//! - Quorum-based reconciliation of divergent peer chains
//! - Byte-exact block codec with ECDSA (secp256k1) signature verification
//! - Validation, append and re-broadcast of announced blocks
//! - HTTP peer protocol, block queries and proxying of everything else
//!
//! # Example
//!
//! ```rust,no_run
//! use dpos_relay::config::NodeConfig;
//! use dpos_relay::network::Node;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = NodeConfig::load("config.json")?;
//! let node = Node::new(config)?;
//! node.start().await;
//!
//! let status = node.status().await;
//! println!("Height {:?} from {} peers", status.height, status.peers);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod core;
pub mod crypto;
pub mod network;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use api::{create_router, ApiState};
pub use config::{ConfigError, NodeConfig};
pub use core::{Block, BlockData, BlockWindow};
pub use crypto::KeyPair;
pub use network::{ChainSync, Node, NodeStatus, PeerRegistry};
