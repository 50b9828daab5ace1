//! Shared fixtures for unit tests: signed block chains and an in-memory
//! network implementing `PeerClient`.

use crate::config::NodeConfig;
use crate::core::{codec, Block, BlockData};
use crate::crypto::{sha256, KeyPair};
use crate::network::client::{ForwardRequest, ForwardResponse, PeerClient};
use crate::network::message::{Peer, PostBlockResponse, StatusResponse};
use crate::network::peer::PeerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Recompute signature and id after editing a header
pub fn resign(kp: &KeyPair, data: &mut BlockData) {
    data.generator_public_key = kp.public_key_hex();
    let digest = codec::hash(data, false).unwrap();
    data.block_signature = hex::encode(kp.sign(&digest));
    data.id = codec::get_id(data).unwrap();
}

pub fn signed_block(kp: &KeyPair, height: u32, previous: Option<&str>, timestamp: u32) -> BlockData {
    let mut data = BlockData {
        id: String::new(),
        version: 0,
        timestamp,
        height,
        previous_block: previous.map(str::to_string),
        number_of_transactions: 0,
        total_amount: 0,
        total_fee: 0,
        reward: 200_000_000,
        payload_length: 0,
        payload_hash: hex::encode(sha256(b"")),
        generator_public_key: String::new(),
        block_signature: String::new(),
        transactions: Vec::new(),
    };
    resign(kp, &mut data);
    data
}

/// Child of `parent` forged at `timestamp`
pub fn next_block(kp: &KeyPair, parent: &BlockData, timestamp: u32) -> BlockData {
    signed_block(kp, parent.height + 1, Some(&parent.id), timestamp)
}

/// `count` linked blocks starting at `start_height`, oldest first
pub fn block_chain(kp: &KeyPair, start_height: u32, count: usize) -> Vec<BlockData> {
    let mut chain: Vec<BlockData> = Vec::with_capacity(count);
    for i in 0..count as u32 {
        let height = start_height + i;
        let block = match chain.last() {
            Some(parent) => next_block(kp, parent, height * 8),
            None => signed_block(kp, height, None, height * 8),
        };
        chain.push(block);
    }
    chain
}

/// `chain` plus `count` more linked blocks
pub fn extend_chain(kp: &KeyPair, chain: &[BlockData], count: usize) -> Vec<BlockData> {
    let mut extended = chain.to_vec();
    for _ in 0..count {
        let parent = extended.last().unwrap();
        let block = next_block(kp, parent, parent.timestamp + 8);
        extended.push(block);
    }
    extended
}

/// `chain` with its tip replaced by a sibling forged at `timestamp`
pub fn fork_at(kp: &KeyPair, chain: &[BlockData], timestamp: u32) -> Vec<BlockData> {
    let mut forked = chain[..chain.len() - 1].to_vec();
    let sibling = next_block(kp, forked.last().unwrap(), timestamp);
    forked.push(sibling);
    forked
}

pub fn verified(chain: Vec<BlockData>) -> Vec<Block> {
    chain.into_iter().map(|b| Block::new(b).unwrap()).collect()
}

/// Fast timeouts and retries, static peering
pub fn test_config() -> NodeConfig {
    NodeConfig {
        fetch_peers: false,
        blocks: 5,
        broadcast_range: 1.0,
        timeout: 200,
        sync_retries: 1,
        retry_backoff: 1,
        ..NodeConfig::default()
    }
}

/// Poll `condition` until it holds, failing after two seconds
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[derive(Debug, Clone, Default)]
struct MockPeer {
    offline: bool,
    chain: Vec<BlockData>,
    height: Option<u64>,
    peers: Vec<Peer>,
    delay: Option<Duration>,
    forward_status: Option<u16>,
}

impl MockPeer {
    fn height(&self) -> u64 {
        self.height
            .or_else(|| self.chain.last().map(|b| u64::from(b.height)))
            .unwrap_or(0)
    }

    fn header(&self) -> BlockData {
        if let Some(tip) = self.chain.last() {
            return tip.clone();
        }
        BlockData {
            id: "0".to_string(),
            version: 0,
            timestamp: 0,
            height: self.height() as u32,
            previous_block: None,
            number_of_transactions: 0,
            total_amount: 0,
            total_fee: 0,
            reward: 0,
            payload_length: 0,
            payload_hash: String::new(),
            generator_public_key: String::new(),
            block_signature: String::new(),
            transactions: Vec::new(),
        }
    }
}

/// In-memory peers keyed by ip. Unknown ips behave as offline.
#[derive(Default)]
pub struct MockNetwork {
    peers: Mutex<HashMap<String, MockPeer>>,
    posted: Mutex<Vec<(String, String)>>,
    forwarded: Mutex<Vec<(String, String)>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn update(&self, ip: &str, f: impl FnOnce(&mut MockPeer)) {
        let mut peers = self.peers.lock().unwrap();
        f(peers.entry(ip.to_string()).or_default());
    }

    pub fn set_chain(&self, ip: &str, chain: Vec<BlockData>) {
        self.update(ip, |p| p.chain = chain);
    }

    pub fn set_height(&self, ip: &str, height: u64) {
        self.update(ip, |p| p.height = Some(height));
    }

    pub fn set_peer_list(&self, ip: &str, peers: Vec<Peer>) {
        self.update(ip, |p| p.peers = peers);
    }

    pub fn set_offline(&self, ip: &str) {
        self.update(ip, |p| p.offline = true);
    }

    pub fn set_online(&self, ip: &str) {
        self.update(ip, |p| p.offline = false);
    }

    pub fn set_delay(&self, ip: &str, delay: Duration) {
        self.update(ip, |p| p.delay = Some(delay));
    }

    /// Answer forwarded requests with `status` and an error body
    pub fn set_forward_status(&self, ip: &str, status: u16) {
        self.update(ip, |p| p.forward_status = Some(status));
    }

    /// `(ip, block id)` for every block successfully posted
    pub fn posted(&self) -> Vec<(String, String)> {
        self.posted.lock().unwrap().clone()
    }

    /// `(ip, path)` for every forwarded request
    pub fn forwarded(&self) -> Vec<(String, String)> {
        self.forwarded.lock().unwrap().clone()
    }

    async fn reach(&self, peer: &Peer) -> Result<MockPeer, PeerError> {
        let state = self.peers.lock().unwrap().get(&peer.ip).cloned();
        let state = match state {
            Some(state) if !state.offline => state,
            _ => return Err(PeerError::Unreachable(peer.ip.clone())),
        };
        if let Some(delay) = state.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(state)
    }
}

#[async_trait]
impl PeerClient for MockNetwork {
    async fn get_peer_list(&self, peer: &Peer) -> Result<Vec<Peer>, PeerError> {
        Ok(self.reach(peer).await?.peers)
    }

    async fn get_status(&self, peer: &Peer) -> Result<StatusResponse, PeerError> {
        let state = self.reach(peer).await?;
        Ok(StatusResponse {
            success: true,
            height: state.height(),
            forging_allowed: false,
            current_slot: 0,
            header: state.header(),
        })
    }

    async fn get_blocks(
        &self,
        peer: &Peer,
        after_height: Option<u64>,
    ) -> Result<Vec<BlockData>, PeerError> {
        let state = self.reach(peer).await?;
        let after = after_height.unwrap_or(0);
        Ok(state
            .chain
            .into_iter()
            .filter(|b| u64::from(b.height) > after)
            .collect())
    }

    async fn post_block(
        &self,
        peer: &Peer,
        block: &BlockData,
    ) -> Result<PostBlockResponse, PeerError> {
        self.reach(peer).await?;
        self.posted
            .lock()
            .unwrap()
            .push((peer.ip.clone(), block.id.clone()));
        Ok(PostBlockResponse {
            success: true,
            id: Some(block.id.clone()),
        })
    }

    async fn forward(
        &self,
        peer: &Peer,
        request: ForwardRequest,
    ) -> Result<ForwardResponse, PeerError> {
        let state = self.reach(peer).await?;
        self.forwarded
            .lock()
            .unwrap()
            .push((peer.ip.clone(), request.path.clone()));
        if let Some(status) = state.forward_status {
            let body = serde_json::json!({ "success": false, "error": "upstream busy" });
            return Ok(ForwardResponse {
                status,
                content_type: Some("application/json".to_string()),
                body: body.to_string().into_bytes(),
            });
        }
        let body = serde_json::json!({
            "success": true,
            "proxiedBy": peer.ip,
            "method": request.method,
            "path": request.path,
        });
        Ok(ForwardResponse {
            status: 200,
            content_type: Some("application/json".to_string()),
            body: body.to_string().into_bytes(),
        })
    }
}
