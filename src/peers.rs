//! # Peer Table
//!
//! Per-known-node state: recorded public keys, the last valid freshness pair,
//! a reputation score in `[0, 1]`, and the peer lifecycle state.
//!
//! ## Lifecycle
//!
//! ```text
//! HEALTHY ⇄ SUSPECTED → QUARANTINED → EVICTED
//! ```
//!
//! A suspected peer can recover; quarantine and eviction are absorbing within
//! a process lifetime. There is deliberately no rehabilitation path out of
//! QUARANTINED — recovery requires a quorum-validated revocation reversal in
//! a future epoch, which this core does not implement.
//!
//! Reputation only ever decreases (penalties for contradicted claims and
//! sustained rate-limit violations). Crossing `reputation_floor_suspect`
//! demotes a peer to SUSPECTED, crossing `reputation_floor_quarantine` to
//! QUARANTINED.
//!
//! Writer discipline: the session manager is the single writer; all other
//! components read snapshots.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::QuorumConfig;
use crate::hooks::PersistenceHook;
use crate::identity::{Freshness, NodeId};
use crate::logging::{log_warn, LogCategory};
use crate::transport::Addr;
use crate::wire::Capability;
use crate::{MeshError, Result};

/// Persistence key for the known-peer snapshot.
pub const KEY_KNOWN_PEERS: &str = "peers/known";

/// Peer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// Participating normally; counted toward quorum
    Healthy,
    /// Reputation or behavior is concerning; excluded from quorum
    Suspected,
    /// Locally isolated pending (or following) quorum revocation
    Quarantined,
    /// Removed from the mesh; no traffic is accepted
    Evicted,
}

impl PeerState {
    /// Severity rank; transitions may never decrease past QUARANTINED.
    fn rank(&self) -> u8 {
        match self {
            PeerState::Healthy => 0,
            PeerState::Suspected => 1,
            PeerState::Quarantined => 2,
            PeerState::Evicted => 3,
        }
    }
}

/// Everything this node knows about one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub node_id: NodeId,
    /// Long-term signing public key, installed via introduction claim (or
    /// TOFU in lab mode)
    pub signing_pubkey: Vec<u8>,
    /// Current KEM public key, refreshed from beacons on epoch bumps
    pub kem_pubkey: Vec<u8>,
    /// Last known transport address
    pub addr: Option<Addr>,
    /// Last valid `(epoch, nonce)` accepted from this peer
    pub last_freshness: Option<Freshness>,
    /// Reputation score in [0, 1]
    pub reputation: f64,
    pub state: PeerState,
    /// Wall-clock of the last accepted beacon
    pub last_beacon_ms: u64,
    /// EWMA of handshake latency toward this peer, in milliseconds
    pub handshake_latency_ewma_ms: f64,
    pub capabilities: Vec<Capability>,
}

impl PeerRecord {
    pub fn new(node_id: NodeId, signing_pubkey: Vec<u8>, kem_pubkey: Vec<u8>) -> Self {
        Self {
            node_id,
            signing_pubkey,
            kem_pubkey,
            addr: None,
            last_freshness: None,
            reputation: 1.0,
            state: PeerState::Healthy,
            last_beacon_ms: 0,
            handshake_latency_ewma_ms: 0.0,
            capabilities: Vec::new(),
        }
    }
}

/// Subset of a peer record that survives restarts: keys and reputation only.
/// Replay counters are deliberately dropped and rebuilt from gossip with a
/// quarantine-if-unknown policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedPeer {
    node_id: NodeId,
    signing_pubkey: Vec<u8>,
    reputation: f64,
}

/// The node's view of every known peer.
pub struct PeerTable {
    peers: DashMap<NodeId, PeerRecord>,
    config: QuorumConfig,
}

impl PeerTable {
    pub fn new(config: QuorumConfig) -> Self {
        Self {
            peers: DashMap::new(),
            config,
        }
    }

    /// Install a newly introduced peer. Idempotent for identical keys;
    /// re-introduction with a different signing key is rejected.
    pub fn install(&self, record: PeerRecord) -> Result<()> {
        match self.peers.get(&record.node_id) {
            Some(existing) if existing.signing_pubkey != record.signing_pubkey => {
                Err(MeshError::BadSignature(format!(
                    "peer {} re-introduced with a different signing key",
                    record.node_id.short()
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.peers.insert(record.node_id, record);
                Ok(())
            }
        }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.peers.contains_key(node)
    }

    pub fn get(&self, node: &NodeId) -> Option<PeerRecord> {
        self.peers.get(node).map(|r| r.clone())
    }

    pub fn state(&self, node: &NodeId) -> Option<PeerState> {
        self.peers.get(node).map(|r| r.state)
    }

    pub fn set_addr(&self, node: &NodeId, addr: Addr) {
        if let Some(mut record) = self.peers.get_mut(node) {
            record.addr = Some(addr);
        }
    }

    /// Record an accepted beacon: freshness, timing, capabilities, and the
    /// advertised KEM key (which rotates with the peer's epoch).
    pub fn record_beacon(
        &self,
        node: &NodeId,
        freshness: Freshness,
        kem_pubkey: &[u8],
        capabilities: &[Capability],
        now_ms: u64,
    ) {
        if let Some(mut record) = self.peers.get_mut(node) {
            record.last_freshness = Some(freshness);
            record.last_beacon_ms = now_ms;
            if record.kem_pubkey != kem_pubkey {
                record.kem_pubkey = kem_pubkey.to_vec();
            }
            if record.capabilities != capabilities {
                record.capabilities = capabilities.to_vec();
            }
        }
    }

    /// Fold a handshake latency sample into the peer's EWMA.
    pub fn record_handshake_latency(&self, node: &NodeId, latency_ms: f64, alpha: f64) {
        if let Some(mut record) = self.peers.get_mut(node) {
            record.handshake_latency_ewma_ms = if record.handshake_latency_ewma_ms == 0.0 {
                latency_ms
            } else {
                alpha * latency_ms + (1.0 - alpha) * record.handshake_latency_ewma_ms
            };
        }
    }

    /// Transition a peer's state. Escalations always apply; de-escalation is
    /// permitted only from SUSPECTED back to HEALTHY.
    pub fn set_state(&self, node: &NodeId, next: PeerState) -> Result<PeerState> {
        let mut record = self
            .peers
            .get_mut(node)
            .ok_or_else(|| MeshError::PeerUnknown(node.to_string()))?;
        let current = record.state;
        let allowed = next.rank() >= current.rank()
            || (current == PeerState::Suspected && next == PeerState::Healthy);
        if !allowed {
            return Err(MeshError::Validation(format!(
                "peer {} cannot move {current:?} → {next:?}",
                node.short()
            )));
        }
        record.state = next;
        Ok(current)
    }

    /// Restore a SUSPECTED peer to HEALTHY, but only when its reputation
    /// sits above the suspect floor (fresh valid traffic clears suspicion
    /// born of staleness, never suspicion born of misbehavior).
    pub fn try_restore_healthy(&self, node: &NodeId) -> bool {
        let Some(mut record) = self.peers.get_mut(node) else {
            return false;
        };
        if record.state == PeerState::Suspected
            && record.reputation >= self.config.reputation_floor_suspect
        {
            record.state = PeerState::Healthy;
            return true;
        }
        record.state == PeerState::Healthy
    }

    /// Apply a reputation penalty and any floor-triggered demotion. Returns
    /// the resulting state.
    pub fn penalize(&self, node: &NodeId, amount: f64) -> Option<PeerState> {
        let mut record = self.peers.get_mut(node)?;
        record.reputation = (record.reputation - amount).max(0.0);
        let floors = &self.config;
        if record.reputation < floors.reputation_floor_quarantine
            && record.state.rank() < PeerState::Quarantined.rank()
        {
            log_warn(
                LogCategory::Quorum,
                &format!(
                    "peer {} reputation {:.3} below quarantine floor",
                    node.short(),
                    record.reputation
                ),
            );
            record.state = PeerState::Quarantined;
        } else if record.reputation < floors.reputation_floor_suspect
            && record.state == PeerState::Healthy
        {
            record.state = PeerState::Suspected;
        }
        Some(record.state)
    }

    /// Count of HEALTHY peers, the `n` for quorum thresholds. Includes this
    /// node itself via the `plus_self` flag.
    pub fn healthy_population(&self, plus_self: bool) -> usize {
        let peers = self
            .peers
            .iter()
            .filter(|r| r.state == PeerState::Healthy)
            .count();
        if plus_self {
            peers + 1
        } else {
            peers
        }
    }

    pub fn healthy_peers(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|r| r.state == PeerState::Healthy)
            .map(|r| *r.key())
            .collect()
    }

    pub fn known_peers(&self) -> Vec<NodeId> {
        self.peers.iter().map(|r| *r.key()).collect()
    }

    /// Peers whose last beacon is older than `node_timeout`, eviction
    /// candidates for the failure-claim path.
    pub fn timed_out_peers(&self, now_ms: u64, node_timeout_ms: u64) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|r| {
                r.state == PeerState::Healthy
                    && r.last_beacon_ms > 0
                    && now_ms.saturating_sub(r.last_beacon_ms) > node_timeout_ms
            })
            .map(|r| *r.key())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|r| r.clone()).collect()
    }

    /// Persist keys and reputations through the hook.
    pub async fn persist(&self, persistence: &Arc<dyn PersistenceHook>) -> Result<()> {
        let persisted: Vec<PersistedPeer> = self
            .peers
            .iter()
            .filter(|r| r.state != PeerState::Evicted)
            .map(|r| PersistedPeer {
                node_id: r.node_id,
                signing_pubkey: r.signing_pubkey.clone(),
                reputation: r.reputation,
            })
            .collect();
        let bytes =
            serde_json::to_vec(&persisted).map_err(|e| MeshError::Persistence(e.to_string()))?;
        persistence.save(KEY_KNOWN_PEERS, &bytes).await
    }

    /// Rehydrate from the hook. Restored peers start SUSPECTED: their replay
    /// counters are gone, so they stay out of quorum counts until fresh,
    /// replay-checked beacons re-establish them. Senders absent from the
    /// restored set fall under the usual unknown-peer rejection.
    pub async fn rehydrate(&self, persistence: &Arc<dyn PersistenceHook>) -> Result<usize> {
        let Some(bytes) = persistence.load(KEY_KNOWN_PEERS).await? else {
            return Ok(0);
        };
        let persisted: Vec<PersistedPeer> =
            serde_json::from_slice(&bytes).map_err(|e| MeshError::Persistence(e.to_string()))?;
        let count = persisted.len();
        for peer in persisted {
            let mut record = PeerRecord::new(peer.node_id, peer.signing_pubkey, Vec::new());
            record.reputation = peer.reputation;
            record.state = PeerState::Suspected;
            self.peers.entry(peer.node_id).or_insert(record);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::MemoryPersistence;

    fn table() -> PeerTable {
        PeerTable::new(QuorumConfig::default())
    }

    fn peer(tag: u8) -> PeerRecord {
        PeerRecord::new(NodeId::from_bytes([tag; 16]), vec![tag; 32], vec![tag; 32])
    }

    #[test]
    fn install_is_idempotent_but_key_changes_are_rejected() {
        let table = table();
        let record = peer(1);
        table.install(record.clone()).unwrap();
        table.install(record.clone()).unwrap();

        let mut hijack = record;
        hijack.signing_pubkey = vec![0xff; 32];
        assert!(matches!(
            table.install(hijack),
            Err(MeshError::BadSignature(_))
        ));
    }

    #[test]
    fn quarantine_is_absorbing() {
        let table = table();
        let record = peer(1);
        let id = record.node_id;
        table.install(record).unwrap();

        table.set_state(&id, PeerState::Suspected).unwrap();
        table.set_state(&id, PeerState::Healthy).unwrap();
        table.set_state(&id, PeerState::Quarantined).unwrap();
        assert!(table.set_state(&id, PeerState::Healthy).is_err());
        assert!(table.set_state(&id, PeerState::Suspected).is_err());
        table.set_state(&id, PeerState::Evicted).unwrap();
        assert!(table.set_state(&id, PeerState::Quarantined).is_err());
    }

    #[test]
    fn reputation_floors_demote() {
        let table = table();
        let record = peer(1);
        let id = record.node_id;
        table.install(record).unwrap();

        // 1.0 → 0.1: below the suspect floor (0.2).
        for _ in 0..9 {
            table.penalize(&id, 0.1);
        }
        assert_eq!(table.state(&id), Some(PeerState::Suspected));

        // Below 0.05: quarantined, and never below zero.
        let state = table.penalize(&id, 0.09).unwrap();
        assert_eq!(state, PeerState::Quarantined);
        table.penalize(&id, 5.0);
        assert!(table.get(&id).unwrap().reputation >= 0.0);
    }

    #[test]
    fn healthy_population_counts_self() {
        let table = table();
        table.install(peer(1)).unwrap();
        table.install(peer(2)).unwrap();
        table.install(peer(3)).unwrap();
        table.set_state(&NodeId::from_bytes([3; 16]), PeerState::Suspected).unwrap();

        assert_eq!(table.healthy_population(false), 2);
        assert_eq!(table.healthy_population(true), 3);
    }

    #[test]
    fn timed_out_peers_are_reported() {
        let table = table();
        table.install(peer(1)).unwrap();
        let id = NodeId::from_bytes([1; 16]);
        table.record_beacon(&id, Freshness::default(), &[1u8], &[], 10_000);

        assert!(table.timed_out_peers(40_000, 50_000).is_empty());
        assert_eq!(table.timed_out_peers(70_000, 50_000), vec![id]);
    }

    #[tokio::test]
    async fn rehydrated_peers_start_suspected() {
        let persistence: Arc<dyn PersistenceHook> = Arc::new(MemoryPersistence::new());
        let table = table();
        table.install(peer(1)).unwrap();
        table.penalize(&NodeId::from_bytes([1; 16]), 0.3);
        table.persist(&persistence).await.unwrap();

        let restored = PeerTable::new(QuorumConfig::default());
        assert_eq!(restored.rehydrate(&persistence).await.unwrap(), 1);
        let record = restored.get(&NodeId::from_bytes([1; 16])).unwrap();
        assert_eq!(record.state, PeerState::Suspected);
        assert!((record.reputation - 0.7).abs() < 1e-9);
        assert!(record.last_freshness.is_none());
    }
}
