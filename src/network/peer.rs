//! Peer registry
//!
//! Tracks which peers are alive and which are quarantined, refreshes their
//! status periodically and hands out random peers for proxying. A peer lives
//! in exactly one of the two sets at a time.

use crate::config::NodeConfig;
use crate::network::client::PeerClient;
use crate::network::message::Peer;
use futures::future::join_all;
use rand::seq::IteratorRandom;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

/// Fraction of surviving peers that may lag before a refresh is flagged
pub const LAG_QUORUM_THRESHOLD: f64 = 0.51;

/// Peer communication errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Request to {0} timed out")]
    Timeout(String),
    #[error("Peer {0} is unreachable")]
    Unreachable(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Peer {0} returned no blocks")]
    NoBlocks(String),
    #[error("No peers available")]
    NoPeersAvailable,
    #[error("Incompatible peer version: {0}")]
    Incompatible(String),
}

/// Bound a peer request by `timeout`
pub(crate) async fn with_timeout<T, F>(timeout: Duration, peer: &Peer, fut: F) -> Result<T, PeerError>
where
    F: Future<Output = Result<T, PeerError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| PeerError::Timeout(peer.ip.clone()))?
}

/// Compare dotted version strings numerically; missing parts count as zero
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                part.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Outcome of one `refresh_status` batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub responded: usize,
    pub failed: usize,
    /// Evicted for falling more than `acceptableBlockLag` behind
    pub lagging: usize,
    pub max_height: Option<u64>,
    /// Too many peers lag to tell where the majority is
    pub quorum_indeterminate: bool,
}

#[derive(Debug, Default)]
struct PeerSets {
    alive: HashMap<String, Peer>,
    dead: HashMap<String, Peer>,
}

/// Registry of alive and quarantined peers
pub struct PeerRegistry {
    sets: RwLock<PeerSets>,
    client: Arc<dyn PeerClient>,
    seeds: Vec<Peer>,
    fetch_peers: bool,
    minimum_version: String,
    acceptable_block_lag: u64,
    timeout: Duration,
}

impl PeerRegistry {
    pub fn new(config: &NodeConfig, client: Arc<dyn PeerClient>) -> Self {
        Self {
            sets: RwLock::new(PeerSets::default()),
            client,
            seeds: config.peers.clone(),
            fetch_peers: config.fetch_peers,
            minimum_version: config.minimum_version.clone(),
            acceptable_block_lag: config.acceptable_block_lag,
            timeout: config.timeout(),
        }
    }

    /// Configured bootstrap peers
    pub fn seeds(&self) -> &[Peer] {
        &self.seeds
    }

    fn check_version(&self, peer: &Peer) -> Result<(), PeerError> {
        if let Some(version) = &peer.version {
            // other relays advertise an "n" build suffix; don't peer with them
            if version.contains('n')
                || compare_versions(version, &self.minimum_version) == Ordering::Less
            {
                return Err(PeerError::Incompatible(format!("{} ({})", peer.ip, version)));
            }
        }
        Ok(())
    }

    /// Admit `peer` to the alive set, reviving it if quarantined
    pub async fn add_peer(&self, peer: Peer) -> Result<(), PeerError> {
        self.check_version(&peer)?;
        let mut sets = self.sets.write().await;
        sets.dead.remove(&peer.ip);
        sets.alive.insert(peer.ip.clone(), peer);
        Ok(())
    }

    /// Quarantine the peer at `ip`, keeping its last known data
    pub async fn kill_peer(&self, ip: &str) {
        let mut sets = self.sets.write().await;
        if let Some(peer) = sets.alive.remove(ip) {
            log::debug!("Quarantining peer {}", ip);
            sets.dead.insert(ip.to_string(), peer);
        }
    }

    /// A uniformly random alive peer
    pub async fn get_random_peer(&self) -> Result<Peer, PeerError> {
        let sets = self.sets.read().await;
        sets.alive
            .values()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(PeerError::NoPeersAvailable)
    }

    /// A random alive peer whose ip is not in `excluded`
    pub async fn get_random_peer_excluding(&self, excluded: &[String]) -> Result<Peer, PeerError> {
        let sets = self.sets.read().await;
        sets.alive
            .values()
            .filter(|peer| !excluded.contains(&peer.ip))
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(PeerError::NoPeersAvailable)
    }

    /// Snapshot of the alive peers
    pub async fn get_peer_list(&self) -> Vec<Peer> {
        let sets = self.sets.read().await;
        sets.alive.values().cloned().collect()
    }

    /// Snapshot of the quarantined peers
    pub async fn get_dead_peers(&self) -> Vec<Peer> {
        let sets = self.sets.read().await;
        sets.dead.values().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.sets.read().await.alive.len()
    }

    pub async fn is_alive(&self, ip: &str) -> bool {
        self.sets.read().await.alive.contains_key(ip)
    }

    pub async fn is_dead(&self, ip: &str) -> bool {
        self.sets.read().await.dead.contains_key(ip)
    }

    /// Rebuild the alive set from the seeds. Returns the alive count.
    pub async fn build_list(&self) -> usize {
        log::info!("Building peer list...");

        if !self.fetch_peers {
            for peer in &self.seeds {
                if let Err(e) = self.add_peer(peer.clone()).await {
                    log::warn!("Ignoring configured peer: {}", e);
                }
            }
        } else {
            let responses = join_all(self.seeds.iter().map(|seed| async move {
                let result =
                    with_timeout(self.timeout, seed, self.client.get_peer_list(seed)).await;
                (seed, result)
            }))
            .await;

            let mut errors = 0;
            for (seed, result) in responses {
                match result {
                    Ok(peers) => {
                        for peer in peers {
                            if let Err(e) = self.add_peer(peer).await {
                                log::debug!("Rejected peer: {}", e);
                            }
                        }
                    }
                    Err(e) => {
                        errors += 1;
                        log::warn!("Error querying for peers - {}: {}", seed.ip, e);
                        self.kill_peer(&seed.ip).await;
                    }
                }
            }
            if errors > 0 {
                log::warn!("Error querying {} peers for peer lists", errors);
            }
        }

        let count = self.peer_count().await;
        log::info!("Peers found - {}", count);
        count
    }

    /// Poll every known peer's status, revive responders and quarantine
    /// failures and laggards.
    pub async fn refresh_status(&self) -> RefreshReport {
        let targets: Vec<Peer> = {
            let sets = self.sets.read().await;
            sets.alive.values().chain(sets.dead.values()).cloned().collect()
        };

        let results = join_all(targets.iter().map(|peer| async move {
            let result = with_timeout(self.timeout, peer, self.client.get_status(peer)).await;
            (peer, result)
        }))
        .await;

        let mut report = RefreshReport::default();
        let mut heights: Vec<(String, u64)> = Vec::new();

        for (peer, result) in results {
            match result {
                Ok(status) => {
                    let mut updated = peer.clone();
                    updated.height = Some(status.height);
                    match self.add_peer(updated).await {
                        Ok(()) => {
                            report.responded += 1;
                            heights.push((peer.ip.clone(), status.height));
                        }
                        Err(e) => {
                            log::debug!("Dropping peer after status: {}", e);
                            self.kill_peer(&peer.ip).await;
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    log::debug!("Status request to {} failed: {}", peer.ip, e);
                    self.kill_peer(&peer.ip).await;
                }
            }
        }

        if report.failed > 0 {
            log::warn!("Error querying {} peers for status", report.failed);
        }

        report.max_height = heights.iter().map(|(_, h)| *h).max();
        if let Some(max_height) = report.max_height {
            for (ip, height) in &heights {
                if height.saturating_add(self.acceptable_block_lag) < max_height {
                    report.lagging += 1;
                    self.kill_peer(ip).await;
                }
            }
        }

        if report.lagging > 0 {
            log::info!("Found {} peers too far behind chain", report.lagging);
        }

        let surviving = self.peer_count().await;
        if report.lagging > 0 && report.lagging as f64 > surviving as f64 * LAG_QUORUM_THRESHOLD {
            log::warn!("Potential fork! Network majority cannot be determined from peer heights");
            report.quorum_indeterminate = true;
        }

        report
    }
}
