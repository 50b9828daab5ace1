//! Chain synchronization with peers
//!
//! `ChainSync` owns the block window. It rebuilds the window from a quorum of
//! peers (`build_blocks`), appends announced blocks one at a time
//! (`add_block`) and re-broadcasts accepted blocks to a subset of peers.
//!
//! `rebuilding` doubles as a single-flight lock: only the caller that flips it
//! from false to true may launch a background resync. Direct calls to
//! `build_blocks` queue on `resync` so two rebuilds never overlap.

use crate::config::NodeConfig;
use crate::core::consensus::{self, Reconciliation};
use crate::core::{Block, BlockData, BlockError, BlockWindow};
use crate::network::client::PeerClient;
use crate::network::message::Peer;
use crate::network::peer::{with_timeout, PeerError, PeerRegistry};
use futures::future::join_all;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Upper bound for the backoff between resync attempts
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Synchronization errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Node is forked; block acceptance is paused until a resync succeeds")]
    Forked,
    #[error("Orphaned block received at height {height}: tip {tip}, received {received}")]
    Orphan {
        height: u32,
        tip: String,
        received: String,
    },
    #[error("Stale block at height {height}; tip is at {tip_height}")]
    Stale { height: u32, tip_height: u32 },
    #[error("Forked block received! Expected previous block {expected}, got {actual:?}")]
    BrokenLink {
        expected: String,
        actual: Option<String>,
    },
    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] BlockError),
    #[error("Potential fork! {diverged} of {responders} peers diverged; network majority cannot be determined")]
    NoQuorum { diverged: usize, responders: usize },
    #[error("Consensus blocks failed validation: {0}")]
    CorruptConsensus(String),
    #[error("Resync failed after {0} attempts")]
    RetriesExhausted(u32),
}

/// Result of a successful `add_block` call
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    Appended {
        id: String,
        height: u32,
        evicted: Option<String>,
    },
    /// Same id as the current tip
    Duplicate,
    /// The node was behind; a background resync was launched
    ResyncStarted,
    /// The node was behind but a resync is already running
    ResyncInProgress,
}

/// Coarse synchronizer state for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncState {
    Synced,
    Rebuilding,
    Forked,
}

/// Summary of a completed resync
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub height: u32,
    pub id: String,
    pub responders: usize,
    pub diverged: usize,
    pub synced_peers: Vec<Peer>,
}

/// Receives the peers that agreed with the consensus after each resync, so
/// the delegate list can be refreshed from trustworthy sources.
pub trait DelegateRefresh: Send + Sync {
    fn refresh(&self, synced_peers: &[Peer]);
}

/// The blockchain synchronizer
pub struct ChainSync {
    window: RwLock<BlockWindow>,
    peers: Arc<PeerRegistry>,
    client: Arc<dyn PeerClient>,
    delegates: Option<Arc<dyn DelegateRefresh>>,
    synced_peers: RwLock<Vec<Peer>>,
    forked: AtomicBool,
    rebuilding: AtomicBool,
    resync: Mutex<()>,
    degraded: AtomicBool,
    broadcasts_sent: Arc<AtomicU64>,
    broadcast_failures: Arc<AtomicU64>,
    window_size: usize,
    peering: bool,
    broadcast_range: f64,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl ChainSync {
    pub fn new(config: &NodeConfig, peers: Arc<PeerRegistry>, client: Arc<dyn PeerClient>) -> Self {
        Self {
            window: RwLock::new(BlockWindow::new(config.blocks)),
            peers,
            client,
            delegates: None,
            synced_peers: RwLock::new(Vec::new()),
            forked: AtomicBool::new(false),
            // nothing is accepted until the first resync completes
            rebuilding: AtomicBool::new(true),
            resync: Mutex::new(()),
            degraded: AtomicBool::new(false),
            broadcasts_sent: Arc::new(AtomicU64::new(0)),
            broadcast_failures: Arc::new(AtomicU64::new(0)),
            window_size: config.blocks,
            peering: config.peering,
            broadcast_range: config.broadcast_range,
            timeout: config.timeout(),
            max_retries: config.sync_retries,
            backoff: config.retry_backoff(),
        }
    }

    /// Notify `delegates` after every successful resync
    pub fn with_delegates(mut self, delegates: Arc<dyn DelegateRefresh>) -> Self {
        self.delegates = Some(delegates);
        self
    }

    pub fn state(&self) -> SyncState {
        if self.is_rebuilding() {
            SyncState::Rebuilding
        } else if self.is_forked() {
            SyncState::Forked
        } else {
            SyncState::Synced
        }
    }

    pub fn is_forked(&self) -> bool {
        self.forked.load(Ordering::SeqCst)
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::SeqCst)
    }

    /// Set when resync retries ran out; cleared by the next successful resync
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn broadcasts_sent(&self) -> u64 {
        self.broadcasts_sent.load(Ordering::SeqCst)
    }

    pub fn broadcast_failures(&self) -> u64 {
        self.broadcast_failures.load(Ordering::SeqCst)
    }

    /// Newest block in the window
    pub async fn get_latest(&self) -> Option<Block> {
        self.window.read().await.tail().cloned()
    }

    pub async fn get_height(&self) -> Option<u32> {
        self.window.read().await.height()
    }

    pub async fn get_block(&self, id: &str) -> Option<Block> {
        self.window.read().await.get_block(id).cloned()
    }

    /// Newest first
    pub async fn get_blocks(&self, limit: Option<usize>) -> Vec<Block> {
        self.window.read().await.get_blocks(limit)
    }

    /// Ascending, strictly above `height`
    pub async fn blocks_after(&self, height: u32) -> Vec<Block> {
        self.window.read().await.blocks_after(height)
    }

    /// Full window, oldest first
    pub async fn window(&self) -> Vec<Block> {
        self.window.read().await.iter().cloned().collect()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Peers that agreed with the last accepted consensus
    pub async fn synced_peers(&self) -> Vec<Peer> {
        self.synced_peers.read().await.clone()
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Fetch one peer's tip height, then the trailing window below it
    async fn fetch_window(&self, peer: &Peer) -> Result<Vec<BlockData>, PeerError> {
        let status = with_timeout(self.timeout, peer, self.client.get_status(peer)).await?;
        let tip = status.height;
        let from = tip.saturating_sub(self.window_size as u64);

        let mut blocks =
            with_timeout(self.timeout, peer, self.client.get_blocks(peer, Some(from))).await?;
        blocks.retain(|b| u64::from(b.height) <= tip);
        blocks.sort_by(|a, b| b.height.cmp(&a.height));
        blocks.truncate(self.window_size);

        if blocks.is_empty() {
            return Err(PeerError::NoBlocks(peer.ip.clone()));
        }
        Ok(blocks)
    }

    /// Query every peer concurrently. Failed peers are quarantined and left out.
    async fn fetch_windows(&self, peer_list: &[Peer]) -> Vec<(Peer, Vec<BlockData>)> {
        let results = join_all(peer_list.iter().map(|peer| async move {
            (peer, self.fetch_window(peer).await)
        }))
        .await;

        let mut reports = Vec::new();
        let mut errors = 0;
        for (peer, result) in results {
            match result {
                Ok(blocks) => reports.push((peer.clone(), blocks)),
                Err(e) => {
                    errors += 1;
                    log::debug!("Block request to {} failed: {}", peer.ip, e);
                    self.peers.kill_peer(&peer.ip).await;
                }
            }
        }
        if errors > 0 {
            log::warn!("Error querying {} peers for blocks", errors);
        }
        reports
    }

    /// Reconcile peer reports and install the winner as the window
    async fn apply_consensus(
        &self,
        reports: Vec<(Peer, Vec<BlockData>)>,
    ) -> Result<SyncReport, SyncError> {
        let responders = reports.len();
        let (peers, mut lists): (Vec<Peer>, Vec<Vec<BlockData>>) = reports.into_iter().unzip();

        let (candidate, diverged, agreeing) = match consensus::reconcile(&lists) {
            Some(Reconciliation::Agreed {
                candidate,
                diverged,
                agreeing,
            }) => (candidate, diverged, agreeing),
            Some(Reconciliation::NoQuorum {
                diverged,
                responders,
            }) => {
                self.window.write().await.clear();
                self.forked.store(true, Ordering::SeqCst);
                self.rebuilding.store(false, Ordering::SeqCst);
                log::error!(
                    "Potential fork! Network majority cannot be determined ({} of {} peers diverged)",
                    diverged,
                    responders
                );
                return Err(SyncError::NoQuorum {
                    diverged,
                    responders,
                });
            }
            None => return Err(SyncError::CorruptConsensus("no blocks reported".to_string())),
        };

        let blocks = std::mem::take(&mut lists[candidate])
            .into_iter()
            .map(Block::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SyncError::CorruptConsensus(e.to_string()))?;

        let (height, id) = {
            let mut window = self.window.write().await;
            window
                .replace(blocks)
                .map_err(|e| SyncError::CorruptConsensus(e.to_string()))?;
            let tail = window
                .tail()
                .ok_or_else(|| SyncError::CorruptConsensus("empty consensus".to_string()))?;
            (tail.height(), tail.id().to_string())
        };

        let synced_peers: Vec<Peer> = agreeing.into_iter().map(|i| peers[i].clone()).collect();
        *self.synced_peers.write().await = synced_peers.clone();

        self.forked.store(false, Ordering::SeqCst);
        self.degraded.store(false, Ordering::SeqCst);
        self.rebuilding.store(false, Ordering::SeqCst);
        log::info!("Latest height - {} - {}", height, id);

        if let Some(delegates) = &self.delegates {
            delegates.refresh(&synced_peers);
        }

        Ok(SyncReport {
            height,
            id,
            responders,
            diverged,
            synced_peers,
        })
    }

    /// Rebuild the window from `peer_list`.
    ///
    /// When nobody answers, or the agreed blocks fail validation, the peer
    /// list is rebuilt and the attempt repeated with exponential backoff, up
    /// to the configured retry count.
    ///
    /// Runs are serialized; a call made while another is in flight waits for
    /// it to finish. Background callers should use `trigger_resync`, which
    /// drops the request instead of queueing it.
    pub async fn build_blocks(&self, peer_list: Vec<Peer>) -> Result<SyncReport, SyncError> {
        let _running = self.resync.lock().await;
        self.rebuilding.store(true, Ordering::SeqCst);
        let mut peers = peer_list;
        let mut attempt = 0u32;

        loop {
            let reports = self.fetch_windows(&peers).await;
            if reports.is_empty() {
                log::warn!("Error getting any blocks. Attempting to resync again.");
            } else {
                log::info!("Processing blocks from {} peers", reports.len());
                match self.apply_consensus(reports).await {
                    Ok(report) => return Ok(report),
                    Err(e @ SyncError::NoQuorum { .. }) => return Err(e),
                    Err(e) => log::warn!("{}. Attempting to sync again.", e),
                }
            }

            attempt += 1;
            if attempt > self.max_retries {
                self.degraded.store(true, Ordering::SeqCst);
                self.rebuilding.store(false, Ordering::SeqCst);
                log::error!("Resync gave up after {} attempts; node is degraded", attempt);
                return Err(SyncError::RetriesExhausted(attempt));
            }

            tokio::time::sleep(self.backoff_for(attempt)).await;
            self.peers.build_list().await;
            peers = self.peers.get_peer_list().await;
            if peers.is_empty() {
                peers = self.peers.seeds().to_vec();
            }
        }
    }

    /// Launch a background resync unless one is already running
    pub fn trigger_resync(self: &Arc<Self>) -> AddOutcome {
        if self
            .rebuilding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return AddOutcome::ResyncInProgress;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut peers = this.peers.get_peer_list().await;
            if peers.is_empty() {
                log::info!("Resyncing with configured peers");
                peers = this.peers.seeds().to_vec();
            } else {
                log::info!("Resyncing with current peers");
            }
            if let Err(e) = this.build_blocks(peers).await {
                log::error!("Resync failed: {}", e);
            }
        });
        AddOutcome::ResyncStarted
    }

    /// Advisory from the peer registry that peer heights have no clear
    /// majority. Only a resync may declare the node forked.
    pub fn escalate_quorum(self: &Arc<Self>) -> AddOutcome {
        log::warn!("Peer heights disagree; verifying consensus with a resync");
        self.trigger_resync()
    }

    /// Validate and append an announced block
    pub async fn add_block(self: &Arc<Self>, data: BlockData) -> Result<AddOutcome, SyncError> {
        if self.is_forked() {
            self.trigger_resync();
            return Err(SyncError::Forked);
        }

        let rebuilding = self.is_rebuilding();
        let mut window = self.window.write().await;
        let Some(tail) = window.tail() else {
            drop(window);
            return Ok(self.trigger_resync());
        };

        let diff = i64::from(data.height) - i64::from(tail.height());
        if diff > 1 {
            if !rebuilding {
                log::warn!(
                    "Blockchain not ready. Incoming: {} | Latest Height: {}",
                    data.height,
                    tail.height()
                );
            }
            drop(window);
            return Ok(self.trigger_resync());
        }
        if diff == 0 {
            if data.id == tail.id() {
                return Ok(AddOutcome::Duplicate);
            }
            log::warn!(
                "Orphaned block received! Height: {} ID: {} | Received ID: {}",
                tail.height(),
                tail.id(),
                data.id
            );
            return Err(SyncError::Orphan {
                height: data.height,
                tip: tail.id().to_string(),
                received: data.id,
            });
        }
        if diff < 0 {
            return Err(SyncError::Stale {
                height: data.height,
                tip_height: tail.height(),
            });
        }

        if data.previous_block.as_deref() != Some(tail.id()) && !rebuilding {
            log::warn!(
                "Forked block received! Expected previous block: {} | Received's previous: {:?}",
                tail.id(),
                data.previous_block
            );
            return Err(SyncError::BrokenLink {
                expected: tail.id().to_string(),
                actual: data.previous_block,
            });
        }

        let block = Block::new(data).map_err(|e| {
            log::warn!("{}", e);
            SyncError::InvalidBlock(e)
        })?;

        log::info!("Adding new block. ID: {} | Height: {}", block.id(), block.height());
        let evicted = window.push(block.clone()).map(|b| b.id().to_string());
        drop(window);

        if self.peering && block.number_of_transactions() == 0 {
            self.broadcast(block.clone());
        }

        Ok(AddOutcome::Appended {
            id: block.id().to_string(),
            height: block.height(),
            evicted,
        })
    }

    /// Fire-and-forget fan-out to `ceil(broadcastRange * peers)` random peers
    fn broadcast(self: &Arc<Self>, block: Block) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let peers = this.peers.get_peer_list().await;
            let count = (this.broadcast_range * peers.len() as f64).ceil() as usize;
            let targets: Vec<Peer> = peers
                .choose_multiple(&mut rand::thread_rng(), count)
                .cloned()
                .collect();

            log::info!("Broadcasting block {} to {} peers", block.id(), targets.len());
            let data = block.into_data();
            for peer in targets {
                let client = Arc::clone(&this.client);
                let sent = Arc::clone(&this.broadcasts_sent);
                let failures = Arc::clone(&this.broadcast_failures);
                let data = data.clone();
                let timeout = this.timeout;
                tokio::spawn(async move {
                    match with_timeout(timeout, &peer, client.post_block(&peer, &data)).await {
                        Ok(_) => {
                            sent.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            failures.fetch_add(1, Ordering::SeqCst);
                            log::debug!("Broadcast to {} failed: {}", peer.ip, e);
                        }
                    }
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::testing::{
        block_chain, eventually, extend_chain, fork_at, next_block, test_config, MockNetwork,
    };
    use std::sync::Mutex;

    struct RecordingDelegates(Mutex<Vec<Vec<String>>>);

    impl DelegateRefresh for RecordingDelegates {
        fn refresh(&self, synced_peers: &[Peer]) {
            let ips = synced_peers.iter().map(|p| p.ip.clone()).collect();
            self.0.lock().unwrap().push(ips);
        }
    }

    fn setup(network: &Arc<MockNetwork>, config: NodeConfig) -> Arc<ChainSync> {
        let registry = Arc::new(PeerRegistry::new(&config, network.clone()));
        Arc::new(ChainSync::new(&config, registry, network.clone()))
    }

    fn peers(ips: &[&str]) -> Vec<Peer> {
        ips.iter().map(|ip| Peer::new(*ip, 4001)).collect()
    }

    async fn synced(network: &Arc<MockNetwork>, chain: &[BlockData], config: NodeConfig) -> Arc<ChainSync> {
        network.set_chain("1.1.1.1", chain.to_vec());
        let sync = setup(network, config);
        sync.peers.add_peer(Peer::new("1.1.1.1", 4001)).await.unwrap();
        sync.build_blocks(peers(&["1.1.1.1"])).await.unwrap();
        sync
    }

    #[tokio::test]
    async fn test_initial_state_is_rebuilding() {
        let network = MockNetwork::new();
        let sync = setup(&network, test_config());
        assert_eq!(sync.state(), SyncState::Rebuilding);
        assert!(sync.get_latest().await.is_none());
    }

    #[tokio::test]
    async fn test_three_agreeing_peers() {
        let network = MockNetwork::new();
        let chain = block_chain(&KeyPair::generate(), 1, 5);
        for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            network.set_chain(ip, chain.clone());
        }
        let delegates = Arc::new(RecordingDelegates(Mutex::new(Vec::new())));
        let config = test_config();
        let registry = Arc::new(PeerRegistry::new(&config, network.clone()));
        let sync = ChainSync::new(&config, registry, network.clone()).with_delegates(delegates.clone());

        let report = sync
            .build_blocks(peers(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]))
            .await
            .unwrap();

        assert_eq!(report.height, 5);
        assert_eq!(report.responders, 3);
        assert_eq!(report.diverged, 0);
        assert!(!sync.is_forked());
        assert!(!sync.is_rebuilding());
        assert_eq!(sync.state(), SyncState::Synced);

        let window: Vec<BlockData> = sync.window().await.into_iter().map(Block::into_data).collect();
        assert_eq!(window, chain);
        assert_eq!(
            delegates.0.lock().unwrap().clone(),
            vec![vec!["1.1.1.1".to_string(), "2.2.2.2".to_string(), "3.3.3.3".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_earlier_orphan_wins_resync() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let base = block_chain(&kp, 95, 5);
        let late = fork_at(&kp, &base, 9_000);
        let early = fork_at(&kp, &base, 1_000);

        network.set_chain("1.1.1.1", late);
        network.set_chain("2.2.2.2", early.clone());
        network.set_chain("3.3.3.3", early.clone());
        let sync = setup(&network, test_config());

        let report = sync
            .build_blocks(peers(&["1.1.1.1", "2.2.2.2", "3.3.3.3"]))
            .await
            .unwrap();

        assert_eq!(report.diverged, 1);
        assert_eq!(report.height, 99);
        assert_eq!(report.id, early.last().unwrap().id);
        assert!(!sync.is_forked());
    }

    #[tokio::test]
    async fn test_majority_divergence_forks_and_clears() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let chain = block_chain(&kp, 1, 3);
        let sync = synced(&network, &chain, test_config()).await;
        assert_eq!(sync.window().await.len(), 3);

        let mut reported = chain.clone();
        let ips = ["1.1.1.1", "2.2.2.2", "3.3.3.3", "4.4.4.4", "5.5.5.5"];
        for ip in ips {
            network.set_chain(ip, reported.clone());
            reported = extend_chain(&kp, &reported, 1);
        }

        let err = sync.build_blocks(peers(&ips)).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::NoQuorum {
                diverged: 4,
                responders: 5
            }
        ));
        assert!(sync.is_forked());
        assert!(!sync.is_rebuilding());
        assert_eq!(sync.state(), SyncState::Forked);
        assert!(sync.window().await.is_empty());

        let next = next_block(&kp, chain.last().unwrap(), 1_000);
        assert!(matches!(sync.add_block(next).await, Err(SyncError::Forked)));
    }

    #[tokio::test]
    async fn test_total_network_failure_is_bounded() {
        let network = MockNetwork::new();
        network.set_offline("1.1.1.1");
        let mut config = test_config();
        config.peers = peers(&["1.1.1.1"]);
        config.sync_retries = 2;
        let sync = setup(&network, config);

        let err = sync.build_blocks(peers(&["1.1.1.1"])).await.unwrap_err();
        assert!(matches!(err, SyncError::RetriesExhausted(3)));
        assert!(sync.is_degraded());
        assert!(!sync.is_rebuilding());
        assert!(sync.peers.is_dead("1.1.1.1").await);
    }

    #[tokio::test]
    async fn test_corrupt_consensus_is_retried_then_abandoned() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let mut chain = block_chain(&kp, 1, 4);
        chain[2] = block_chain(&kp, 3, 1).remove(0);
        network.set_chain("1.1.1.1", chain);

        let sync = setup(&network, test_config());
        let err = sync.build_blocks(peers(&["1.1.1.1"])).await.unwrap_err();
        assert!(matches!(err, SyncError::RetriesExhausted(_)));
        assert!(sync.window().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let network = MockNetwork::new();
        let chain = block_chain(&KeyPair::generate(), 1, 5);
        network.set_chain("1.1.1.1", chain.clone());
        network.set_offline("2.2.2.2");
        let sync = setup(&network, test_config());
        sync.peers.add_peer(Peer::new("2.2.2.2", 4001)).await.unwrap();

        let report = sync
            .build_blocks(peers(&["1.1.1.1", "2.2.2.2"]))
            .await
            .unwrap();
        assert_eq!(report.responders, 1);
        assert!(sync.peers.is_dead("2.2.2.2").await);
    }

    #[tokio::test]
    async fn test_resync_window_is_capped() {
        let network = MockNetwork::new();
        let chain = block_chain(&KeyPair::generate(), 1, 12);
        let mut config = test_config();
        config.blocks = 5;
        let sync = synced(&network, &chain, config).await;

        let heights: Vec<u32> = sync.window().await.iter().map(Block::height).collect();
        assert_eq!(heights, vec![8, 9, 10, 11, 12]);
    }

    #[tokio::test]
    async fn test_add_block_appends_and_evicts() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let chain = block_chain(&kp, 1, 5);
        let mut config = test_config();
        config.peering = false;
        let sync = synced(&network, &chain, config).await;

        let mut tip = chain.last().unwrap().clone();
        for _ in 0..7 {
            let next = next_block(&kp, &tip, tip.timestamp + 8);
            let outcome = sync.add_block(next.clone()).await.unwrap();
            assert!(matches!(outcome, AddOutcome::Appended { .. }));
            tip = next;
        }

        let window = sync.window().await;
        assert_eq!(window.len(), 5);
        assert_eq!(window[0].height(), 8);
        assert_eq!(sync.get_height().await, Some(12));
        for pair in window.windows(2) {
            assert_eq!(pair[1].previous_block(), Some(pair[0].id()));
        }
    }

    #[tokio::test]
    async fn test_add_block_is_idempotent() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let chain = block_chain(&kp, 1, 3);
        let sync = synced(&network, &chain, test_config()).await;

        let next = next_block(&kp, chain.last().unwrap(), 100);
        sync.add_block(next.clone()).await.unwrap();
        let before = sync.window().await;

        assert_eq!(sync.add_block(next).await.unwrap(), AddOutcome::Duplicate);
        assert_eq!(sync.window().await, before);
    }

    #[tokio::test]
    async fn test_add_block_rejections_leave_window_untouched() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let chain = block_chain(&kp, 1, 3);
        let sync = synced(&network, &chain, test_config()).await;
        let before = sync.window().await;
        let tip = chain.last().unwrap();

        let orphan = next_block(&kp, &chain[1], 999);
        assert!(matches!(
            sync.add_block(orphan).await,
            Err(SyncError::Orphan { height: 3, .. })
        ));

        let stale = chain[0].clone();
        assert!(matches!(
            sync.add_block(stale).await,
            Err(SyncError::Stale { .. })
        ));

        let mut unlinked = next_block(&kp, tip, 100);
        unlinked.previous_block = Some("123".to_string());
        assert!(matches!(
            sync.add_block(unlinked).await,
            Err(SyncError::BrokenLink { .. })
        ));

        let mut forged = next_block(&kp, tip, 100);
        forged.reward += 1;
        assert!(matches!(
            sync.add_block(forged).await,
            Err(SyncError::InvalidBlock(_))
        ));

        assert_eq!(sync.window().await, before);
    }

    #[tokio::test]
    async fn test_forged_id_is_rejected() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let chain = block_chain(&kp, 1, 3);
        let sync = synced(&network, &chain, test_config()).await;
        let before = sync.window().await;

        let next = next_block(&kp, chain.last().unwrap(), 100);
        let mut renamed = next.clone();
        renamed.id = "42".to_string();
        assert!(matches!(
            sync.add_block(renamed).await,
            Err(SyncError::InvalidBlock(BlockError::IdMismatch { .. }))
        ));
        assert_eq!(sync.window().await, before);

        // the genuine block and its child still chain onto the tip
        let child = next_block(&kp, &next, 108);
        sync.add_block(next.clone()).await.unwrap();
        sync.add_block(child).await.unwrap();
        assert_eq!(sync.get_height().await, Some(5));
        assert_eq!(sync.get_block(&next.id).await.map(|b| b.height()), Some(4));
    }

    #[tokio::test]
    async fn test_resync_rejects_renamed_tip() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let mut chain = block_chain(&kp, 1, 3);
        chain[2].id = "42".to_string();
        network.set_chain("1.1.1.1", chain);

        let sync = setup(&network, test_config());
        let err = sync.build_blocks(peers(&["1.1.1.1"])).await.unwrap_err();
        assert!(matches!(err, SyncError::RetriesExhausted(_)));
        assert!(sync.get_block("42").await.is_none());
    }

    #[tokio::test]
    async fn test_direct_resyncs_do_not_overlap() {
        let network = MockNetwork::new();
        let chain = block_chain(&KeyPair::generate(), 1, 3);
        let sync = synced(&network, &chain, test_config()).await;
        // status and blocks requests each take 40ms, so one rebuild takes 80ms
        network.set_delay("1.1.1.1", Duration::from_millis(40));

        let (first, second, midway) = tokio::join!(
            sync.build_blocks(peers(&["1.1.1.1"])),
            sync.build_blocks(peers(&["1.1.1.1"])),
            async {
                tokio::time::sleep(Duration::from_millis(120)).await;
                sync.is_rebuilding()
            }
        );

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(midway, "second rebuild should still be running after the first");
        assert!(!sync.is_rebuilding());
        assert_eq!(sync.state(), SyncState::Synced);
    }

    #[tokio::test]
    async fn test_gap_triggers_single_resync() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let chain = block_chain(&kp, 1, 3);
        let sync = synced(&network, &chain, test_config()).await;

        let longer = extend_chain(&kp, &chain, 4);
        network.set_chain("1.1.1.1", longer.clone());
        network.set_delay("1.1.1.1", Duration::from_millis(50));

        let ahead = longer.last().unwrap().clone();
        assert_eq!(
            sync.add_block(ahead.clone()).await.unwrap(),
            AddOutcome::ResyncStarted
        );
        assert_eq!(
            sync.add_block(ahead).await.unwrap(),
            AddOutcome::ResyncInProgress
        );

        let watched = Arc::clone(&sync);
        eventually(move || !watched.is_rebuilding()).await;
        assert_eq!(sync.get_height().await, Some(7));
        assert_eq!(sync.state(), SyncState::Synced);
    }

    #[tokio::test]
    async fn test_accepted_block_is_broadcast() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let chain = block_chain(&kp, 1, 3);
        let sync = synced(&network, &chain, test_config()).await;
        for ip in ["2.2.2.2", "3.3.3.3"] {
            network.set_chain(ip, chain.clone());
            sync.peers.add_peer(Peer::new(ip, 4001)).await.unwrap();
        }
        network.set_offline("3.3.3.3");

        let next = next_block(&kp, chain.last().unwrap(), 100);
        sync.add_block(next.clone()).await.unwrap();

        let watched = Arc::clone(&sync);
        eventually(move || watched.broadcasts_sent() + watched.broadcast_failures() == 3).await;
        assert_eq!(sync.broadcast_failures(), 1);

        let posted = network.posted();
        assert_eq!(posted.len(), 2);
        assert!(posted.iter().all(|(_, id)| *id == next.id));
    }

    #[tokio::test]
    async fn test_blocks_with_transactions_are_not_broadcast() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let chain = block_chain(&kp, 1, 3);
        let sync = synced(&network, &chain, test_config()).await;

        let mut next = next_block(&kp, chain.last().unwrap(), 100);
        next.number_of_transactions = 2;
        crate::testing::resign(&kp, &mut next);
        sync.add_block(next).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sync.broadcasts_sent(), 0);
        assert!(network.posted().is_empty());
    }

    #[tokio::test]
    async fn test_quorum_escalation_resyncs() {
        let network = MockNetwork::new();
        let kp = KeyPair::generate();
        let chain = block_chain(&kp, 1, 3);
        let sync = synced(&network, &chain, test_config()).await;

        network.set_chain("1.1.1.1", extend_chain(&kp, &chain, 2));
        assert_eq!(sync.escalate_quorum(), AddOutcome::ResyncStarted);

        let watched = Arc::clone(&sync);
        eventually(move || !watched.is_rebuilding()).await;
        assert_eq!(sync.get_height().await, Some(5));
        assert!(!sync.is_forked());
    }
}
