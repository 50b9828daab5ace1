//! Relay node
//!
//! Wires the peer registry and the synchronizer together, performs the
//! initial sync and runs the periodic status and peer-list refresh loops.

use crate::config::NodeConfig;
use crate::network::client::{HttpPeerClient, PeerClient};
use crate::network::peer::{PeerError, PeerRegistry};
use crate::network::sync::{ChainSync, DelegateRefresh, SyncState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// The relay node
pub struct Node {
    pub config: NodeConfig,
    pub client: Arc<dyn PeerClient>,
    pub peers: Arc<PeerRegistry>,
    pub chain_sync: Arc<ChainSync>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node that talks to peers over HTTP
    pub fn new(config: NodeConfig) -> Result<Self, PeerError> {
        let client = HttpPeerClient::new(config.timeout(), &config.headers)?;
        Ok(Self::with_client(config, Arc::new(client)))
    }

    /// Create a node on top of an arbitrary peer client
    pub fn with_client(config: NodeConfig, client: Arc<dyn PeerClient>) -> Self {
        Self::build(config, client, None)
    }

    /// Like `with_client`, notifying `delegates` after every successful resync
    pub fn with_delegates(
        config: NodeConfig,
        client: Arc<dyn PeerClient>,
        delegates: Arc<dyn DelegateRefresh>,
    ) -> Self {
        Self::build(config, client, Some(delegates))
    }

    fn build(
        config: NodeConfig,
        client: Arc<dyn PeerClient>,
        delegates: Option<Arc<dyn DelegateRefresh>>,
    ) -> Self {
        let peers = Arc::new(PeerRegistry::new(&config, client.clone()));
        let mut chain_sync = ChainSync::new(&config, peers.clone(), client.clone());
        if let Some(delegates) = delegates {
            chain_sync = chain_sync.with_delegates(delegates);
        }

        Self {
            config,
            client,
            peers,
            chain_sync: Arc::new(chain_sync),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build the peer list, run the initial sync and spawn the refresh loops.
    ///
    /// A failed initial sync is logged, not returned: the refresh loops keep
    /// retrying and the node reports itself forked or degraded meanwhile.
    pub async fn start(&self) {
        let count = self.peers.build_list().await;
        log::info!("Starting relay for {} with {} peers", self.config.chain, count);

        if self.config.peering {
            let mut peers = self.peers.get_peer_list().await;
            if peers.is_empty() {
                peers = self.peers.seeds().to_vec();
            }
            match self.chain_sync.build_blocks(peers).await {
                Ok(report) => log::info!(
                    "Initial sync complete at height {} ({} of {} peers diverged)",
                    report.height,
                    report.diverged,
                    report.responders
                ),
                Err(e) => log::error!("Initial sync failed: {}", e),
            }
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_status_refresh());
        tasks.push(self.spawn_peer_refresh());
    }

    fn spawn_status_refresh(&self) -> JoinHandle<()> {
        let peers = self.peers.clone();
        let chain_sync = self.chain_sync.clone();
        let period = self.config.status_refresh_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let report = peers.refresh_status().await;
                log::debug!(
                    "Status refresh: {} responded, {} failed, {} lagging",
                    report.responded,
                    report.failed,
                    report.lagging
                );
                if report.quorum_indeterminate && !chain_sync.is_forked() {
                    chain_sync.escalate_quorum();
                }
            }
        })
    }

    fn spawn_peer_refresh(&self) -> JoinHandle<()> {
        let peers = self.peers.clone();
        let chain_sync = self.chain_sync.clone();
        let period = self.config.peer_refresh_interval();
        let peering = self.config.peering;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                peers.build_list().await;
                if peering && (chain_sync.is_forked() || chain_sync.is_degraded()) {
                    log::info!("Attempting to recover from {:?} state", chain_sync.state());
                    chain_sync.trigger_resync();
                }
            }
        })
    }

    /// Snapshot for `/health`
    pub async fn status(&self) -> NodeStatus {
        node_status(&self.peers, &self.chain_sync, self.config.port).await
    }

    /// Stop the refresh loops
    pub async fn shutdown(&self) {
        log::info!("Node shutting down...");
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

/// Node status information
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub port: u16,
    pub height: Option<u32>,
    pub id: Option<String>,
    pub peers: usize,
    pub dead_peers: usize,
    /// Alive peer ips grouped by last reported height
    pub peers_by_height: BTreeMap<u64, Vec<String>>,
    pub state: SyncState,
    pub forked: bool,
    pub rebuilding: bool,
    pub degraded: bool,
    pub broadcasts_sent: u64,
    pub broadcast_failures: u64,
}

pub async fn node_status(peers: &PeerRegistry, chain_sync: &ChainSync, port: u16) -> NodeStatus {
    let latest = chain_sync.get_latest().await;
    let alive = peers.get_peer_list().await;

    let mut peers_by_height: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for peer in &alive {
        if let Some(height) = peer.height {
            peers_by_height.entry(height).or_default().push(peer.ip.clone());
        }
    }
    for ips in peers_by_height.values_mut() {
        ips.sort();
    }

    NodeStatus {
        port,
        height: latest.as_ref().map(|b| b.height()),
        id: latest.map(|b| b.id().to_string()),
        peers: alive.len(),
        dead_peers: peers.get_dead_peers().await.len(),
        peers_by_height,
        state: chain_sync.state(),
        forked: chain_sync.is_forked(),
        rebuilding: chain_sync.is_rebuilding(),
        degraded: chain_sync.is_degraded(),
        broadcasts_sent: chain_sync.broadcasts_sent(),
        broadcast_failures: chain_sync.broadcast_failures(),
    }
}
