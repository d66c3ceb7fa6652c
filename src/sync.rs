//! Chain synchronization for PharmaChain
//!
//! Best-effort longest-valid-chain resolution:
//! - ask every peer for its chain length (`GET_CHAIN`)
//! - fetch the full chain from peers that are ahead (`GET_FULL_CHAIN`)
//! - validate each candidate and adopt the strictly longest one wholesale
//!
//! An equal-length chain never displaces the local one, and among several
//! equally long candidates the first peer queried wins.

use crate::blockchain::{validate_foreign_chain, Block, Ledger};
use crate::error::ChainError;
use crate::network::{PeerAddr, PeerClient};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Peer sync information
#[derive(Debug, Clone)]
pub struct PeerSyncInfo {
    pub peer: PeerAddr,
    pub height: usize,
    pub last_seen: Instant,
    pub blocks_received: u64,
    pub sync_failures: u32,
}

impl PeerSyncInfo {
    pub fn new(peer: PeerAddr, height: usize) -> Self {
        Self {
            peer,
            height,
            last_seen: Instant::now(),
            blocks_received: 0,
            sync_failures: 0,
        }
    }

    /// Check if peer should be considered unreliable
    pub fn is_unreliable(&self) -> bool {
        self.sync_failures >= 3
    }

    /// Check if peer is stale (not seen in 5 minutes)
    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > Duration::from_secs(300)
    }
}

/// Sync statistics
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub rounds: u64,
    pub chains_adopted: u64,
    pub total_blocks_synced: u64,
    pub last_round: Option<Instant>,
}

/// Sync state tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
    Failed,
}

/// Result of one sync round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    KeptLocal { length: usize },
    Adopted { peer: PeerAddr, length: usize },
}

/// Pick the chain to adopt, if any: valid, strictly longer than `local_len`
/// and strictly longer than every earlier candidate.
pub fn select_longest_valid<I>(local_len: usize, candidates: I, difficulty: usize) -> Option<(PeerAddr, Vec<Block>)>
where
    I: IntoIterator<Item = (PeerAddr, Vec<Block>)>,
{
    let mut best: Option<(PeerAddr, Vec<Block>)> = None;
    for (peer, chain) in candidates {
        let to_beat = best.as_ref().map_or(local_len, |(_, b)| b.len());
        if chain.len() <= to_beat {
            continue;
        }
        match validate_foreign_chain(&chain, difficulty) {
            Ok(()) => best = Some((peer, chain)),
            Err(failure) => warn!(peer = %peer, %failure, "Rejecting invalid chain"),
        }
    }
    best
}

/// Tracks peer heights and drives sync rounds against a shared ledger.
pub struct ChainSync {
    client: PeerClient,
    peers: RwLock<HashMap<PeerAddr, PeerSyncInfo>>,
    sync_state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
}

impl ChainSync {
    pub fn new(client: PeerClient) -> Self {
        Self {
            client,
            peers: RwLock::new(HashMap::new()),
            sync_state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Update peer height information, tracking the peer on first sight.
    pub async fn update_peer_height(&self, peer: &PeerAddr, height: usize) {
        let mut peers = self.peers.write().await;
        let info = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerSyncInfo::new(peer.clone(), height));
        info.height = height;
        info.last_seen = Instant::now();
    }

    /// Record sync failure for a peer
    pub async fn record_sync_failure(&self, peer: &PeerAddr) {
        let mut peers = self.peers.write().await;
        let info = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerSyncInfo::new(peer.clone(), 0));
        info.sync_failures += 1;
        if info.is_unreliable() {
            warn!(peer = %peer, failures = info.sync_failures, "Peer marked as unreliable");
        }
    }

    async fn record_blocks_received(&self, peer: &PeerAddr, count: usize) {
        if let Some(info) = self.peers.write().await.get_mut(peer) {
            info.blocks_received += count as u64;
            info.last_seen = Instant::now();
        }
    }

    /// Highest reliable, non-stale peer we know of.
    pub async fn get_best_peer(&self) -> Option<PeerAddr> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| !p.is_unreliable() && !p.is_stale())
            .max_by_key(|p| p.height)
            .map(|p| p.peer.clone())
    }

    pub async fn get_peer_info(&self, peer: &PeerAddr) -> Option<PeerSyncInfo> {
        self.peers.read().await.get(peer).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Get current sync state
    pub async fn get_sync_state(&self) -> SyncState {
        *self.sync_state.read().await
    }

    pub async fn is_synced(&self) -> bool {
        self.get_sync_state().await == SyncState::Synced
    }

    /// Get sync statistics
    pub async fn get_stats(&self) -> SyncStats {
        self.stats.read().await.clone()
    }

    async fn set_sync_state(&self, state: SyncState) {
        *self.sync_state.write().await = state;
    }

    /// Run one sync round against `peers` and adopt a longer valid chain if one exists.
    pub async fn synchronize(&self, ledger: &RwLock<Ledger>, peers: &[PeerAddr]) -> Result<SyncOutcome, ChainError> {
        self.set_sync_state(SyncState::Syncing).await;
        let (local_len, difficulty) = {
            let ledger = ledger.read().await;
            (ledger.len(), ledger.difficulty())
        };
        debug!(local_len, peers = peers.len(), "Starting sync round");

        let mut reachable = 0usize;
        let mut candidates = Vec::new();
        for peer in peers {
            let height = match self.client.chain_length(peer).await {
                Ok(height) => height,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Chain length query failed");
                    self.record_sync_failure(peer).await;
                    continue;
                }
            };
            reachable += 1;
            self.update_peer_height(peer, height).await;
            if height <= local_len {
                continue;
            }

            match self.client.full_chain(peer).await {
                Ok(chain) => {
                    self.record_blocks_received(peer, chain.len()).await;
                    candidates.push((peer.clone(), chain));
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Full chain fetch failed");
                    self.record_sync_failure(peer).await;
                }
            }
        }

        let outcome = match select_longest_valid(local_len, candidates, difficulty) {
            Some((peer, chain)) => {
                let mut ledger = ledger.write().await;
                // The local chain may have grown while we were fetching.
                if chain.len() > ledger.len() {
                    let length = chain.len();
                    let gained = length - ledger.len();
                    ledger.replace_chain(chain)?;
                    info!(peer = %peer, length, "Adopted longer chain");

                    let mut stats = self.stats.write().await;
                    stats.chains_adopted += 1;
                    stats.total_blocks_synced += gained as u64;
                    SyncOutcome::Adopted { peer, length }
                } else {
                    SyncOutcome::KeptLocal { length: ledger.len() }
                }
            }
            None => SyncOutcome::KeptLocal { length: ledger.read().await.len() },
        };

        {
            let mut stats = self.stats.write().await;
            stats.rounds += 1;
            stats.last_round = Some(Instant::now());
        }
        let state = if !peers.is_empty() && reachable == 0 {
            SyncState::Failed
        } else {
            SyncState::Synced
        };
        self.set_sync_state(state).await;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::default_client;

    fn grow(ledger: &mut Ledger, blocks: usize) {
        for i in 0..blocks {
            let mut block = Block::new(ledger.head_hash());
            block.seal(vec![format!("cA{}", i)], "aw==".to_string());
            block.mine(ledger.difficulty());
            ledger.append(block);
        }
    }

    fn chain_of(len: usize) -> Vec<Block> {
        let mut ledger = Ledger::new(1);
        grow(&mut ledger, len - 1);
        ledger.snapshot()
    }

    #[test]
    fn test_equal_length_keeps_local() {
        let candidate = (PeerAddr::new("a", 1), chain_of(3));
        assert!(select_longest_valid(3, vec![candidate], 1).is_none());
    }

    #[test]
    fn test_strictly_longest_wins_and_ties_keep_first() {
        let candidates = vec![
            (PeerAddr::new("a", 1), chain_of(3)),
            (PeerAddr::new("b", 2), chain_of(4)),
            (PeerAddr::new("c", 3), chain_of(4)),
        ];
        let (peer, chain) = select_longest_valid(2, candidates, 1).unwrap();
        assert_eq!(peer, PeerAddr::new("b", 2));
        assert_eq!(chain.len(), 4);
    }

    #[test]
    fn test_invalid_longer_chain_is_skipped() {
        let mut broken = chain_of(5);
        broken[3].previous_hash = "f00d".to_string();
        let candidates = vec![
            (PeerAddr::new("bad", 1), broken),
            (PeerAddr::new("good", 2), chain_of(3)),
        ];
        let (peer, _) = select_longest_valid(2, candidates, 1).unwrap();
        assert_eq!(peer, PeerAddr::new("good", 2));
    }

    #[test]
    fn test_chain_below_local_difficulty_is_rejected() {
        let candidates = vec![(PeerAddr::new("weak", 1), chain_of(4))];
        // Mined at difficulty 1; a node at difficulty 6 will not accept it.
        assert!(select_longest_valid(1, candidates, 6).is_none());
    }

    #[tokio::test]
    async fn test_peer_failure_tracking() {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let sync = ChainSync::new(default_client());
            let peer = PeerAddr::new("127.0.0.1", 8333);

            sync.update_peer_height(&peer, 100).await;
            for _ in 0..3 {
                sync.record_sync_failure(&peer).await;
            }

            let info = sync.get_peer_info(&peer).await.unwrap();
            assert!(info.is_unreliable());
            assert_eq!(info.height, 100);
            assert!(sync.get_best_peer().await.is_none());
        })
        .await
        .expect("test_peer_failure_tracking timed out");
    }

    #[tokio::test]
    async fn test_get_best_peer() {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let sync = ChainSync::new(default_client());
            sync.update_peer_height(&PeerAddr::new("127.0.0.1", 8333), 100).await;
            sync.update_peer_height(&PeerAddr::new("127.0.0.2", 8334), 200).await;

            assert_eq!(sync.peer_count().await, 2);
            assert_eq!(sync.get_best_peer().await.unwrap().port, 8334);
        })
        .await
        .expect("test_get_best_peer timed out");
    }

    #[tokio::test]
    async fn test_round_with_no_peers_keeps_local() {
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            let sync = ChainSync::new(default_client());
            let ledger = RwLock::new(Ledger::new(1));

            assert_eq!(sync.get_sync_state().await, SyncState::Idle);
            let outcome = sync.synchronize(&ledger, &[]).await.unwrap();
            assert_eq!(outcome, SyncOutcome::KeptLocal { length: 1 });
            assert!(sync.is_synced().await);
            assert_eq!(sync.get_stats().await.rounds, 1);
        })
        .await
        .expect("test_round_with_no_peers_keeps_local timed out");
    }
}
