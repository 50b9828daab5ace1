//! Peer networking
//!
//! # Features
//! - HTTP peer client behind the `PeerClient` trait
//! - Peer registry with health checks and quarantine
//! - Chain synchronization, fork detection and block broadcast
//! - Node orchestration with periodic refresh loops

pub mod client;
pub mod message;
pub mod node;
pub mod peer;
pub mod sync;

pub use client::{ForwardRequest, ForwardResponse, HttpPeerClient, PeerClient};
pub use message::{Peer, StatusResponse};
pub use node::{Node, NodeStatus};
pub use peer::{PeerError, PeerRegistry, RefreshReport};
pub use sync::{AddOutcome, ChainSync, DelegateRefresh, SyncError, SyncReport, SyncState};
