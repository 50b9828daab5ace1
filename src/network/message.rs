//! Peer protocol wire types
//!
//! JSON bodies exchanged with other nodes over HTTP.

use crate::core::BlockData;
use serde::{Deserialize, Serialize};

/// Header carrying the sender's node version
pub const VERSION_HEADER: &str = "version";

/// A peer as advertised in peer lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

impl Peer {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            version: None,
            height: None,
            os: None,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

/// `GET /peer/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub success: bool,
    pub height: u64,
    #[serde(default)]
    pub forging_allowed: bool,
    #[serde(default)]
    pub current_slot: i64,
    pub header: BlockData,
}

/// `GET /peer/list`, `GET /api/peers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListResponse {
    #[serde(default)]
    pub success: bool,
    pub peers: Vec<Peer>,
}

/// `GET /peer/blocks`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksResponse {
    #[serde(default)]
    pub success: bool,
    pub blocks: Vec<BlockData>,
}

/// `POST /peer/blocks` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostBlockRequest {
    pub block: BlockData,
}

/// `POST /peer/blocks` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostBlockResponse {
    pub success: bool,
    #[serde(default)]
    pub id: Option<String>,
}
