//! # Beacon / Gossip Engine
//!
//! Emits this node's signed liveness beacon and applies beacons received
//! from peers. Beacons are addressed 1-hop (direct peers only); a beacon is
//! self-contained gossip, so *novel* beacons are additionally relayed along
//! established channels with duplicate suppression — that is how every node
//! converges on a routable view of the whole graph. Claims propagate
//! multi-hop through the same duplicate-suppressed path.
//!
//! ## Reception Pipeline
//!
//! For each incoming beacon, in order:
//!
//! 1. Authentication — known senders must hold an established secure
//!    channel; quarantined and evicted senders are dropped outright
//! 2. New senders are installed only through an introduction (an accepted
//!    introduction claim, an identity-provider pin, or TOFU in lab mode —
//!    TOFU is forbidden in production)
//! 3. Detached signature verification against the *recorded* key (a beacon
//!    is self-contained gossip; its signature is re-verified here)
//! 4. Freshness — strictly increasing `(epoch, nonce)`, advisory timestamp
//!    within the clock-skew bound
//! 5. Ordering — out-of-order beacons wait in a small per-peer reorder
//!    window rather than being discarded
//! 6. Rate limiting — excess beacons are dropped; only a sustained excess
//!    feeds reputation
//! 7. Merge — advertised neighbors become topology edges observed now
//!
//! Edge costs carried in our own beacons are EWMA-smoothed RTT samples
//! (α = 0.2) toward each active peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use smallvec::SmallVec;

use crate::config::BeaconConfig;
use crate::crypto_protocols::{CryptoProvider, KeyManager};
use crate::hooks::IdentityProviderHook;
use crate::identity::{Freshness, NodeId};
use crate::logging::{log_info, log_warn, LogCategory};
use crate::peers::{PeerRecord, PeerState, PeerTable};
use crate::quorum::QuorumValidator;
use crate::secure_channel::ReplayGuard;
use crate::topology::TopologyStore;
use crate::transport::Addr;
use crate::wire::{seal_envelope, BeaconFrame, Capability, ClaimFrame, FrameKind, NeighborEdge};
use crate::{MeshError, Result};

/// Edge cost assumed for a peer with no RTT sample yet (10 ms).
const DEFAULT_EDGE_COST_US: u32 = 10_000;

/// Consecutive rate-limited windows before the excess counts as misbehavior.
const SUSTAINED_VIOLATION_WINDOWS: u32 = 3;

/// What happened to one received beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconOutcome {
    /// Validated and merged into the topology
    Applied,
    /// Valid but ahead of its order; parked in the reorder window
    Buffered,
    /// Dropped by the per-sender rate limit
    RateLimited,
}

struct BeaconRate {
    window_start_ms: u64,
    accepted: u32,
    violation_windows: u32,
    violated_this_window: bool,
}

struct ReorderSlot {
    frame: BeaconFrame,
    src_addr: Option<Addr>,
    buffered_at_ms: u64,
}

/// How an unknown sender earned its installation.
enum Introduction {
    IdentityProvider,
    Tofu,
}

pub struct GossipEngine {
    self_id: NodeId,
    config: BeaconConfig,
    allow_tofu: bool,
    peers: Arc<PeerTable>,
    topology: Arc<TopologyStore>,
    replay: Arc<ReplayGuard>,
    identity_provider: Arc<dyn IdentityProviderHook>,
    /// EWMA RTT toward each active peer, microseconds
    rtt_ewma: DashMap<NodeId, f64>,
    rate: DashMap<NodeId, BeaconRate>,
    reorder: DashMap<NodeId, SmallVec<[ReorderSlot; 4]>>,
    /// Claim-hash dedup for gossip relay, value = first-seen ms
    seen_claims: DashMap<[u8; 32], u64>,
    accepted_total: AtomicU64,
}

impl GossipEngine {
    pub fn new(
        self_id: NodeId,
        config: BeaconConfig,
        allow_tofu: bool,
        peers: Arc<PeerTable>,
        topology: Arc<TopologyStore>,
        replay: Arc<ReplayGuard>,
        identity_provider: Arc<dyn IdentityProviderHook>,
    ) -> Self {
        Self {
            self_id,
            config,
            allow_tofu,
            peers,
            topology,
            replay,
            identity_provider,
            rtt_ewma: DashMap::new(),
            rate: DashMap::new(),
            reorder: DashMap::new(),
            seen_claims: DashMap::new(),
            accepted_total: AtomicU64::new(0),
        }
    }

    /// Total beacons accepted since startup (replay-rejected ones excluded).
    pub fn accepted_count(&self) -> u64 {
        self.accepted_total.load(Ordering::Relaxed)
    }

    /// Fold an RTT sample toward `peer` into the EWMA used for edge costs.
    pub fn record_rtt_sample(&self, peer: NodeId, rtt_us: u32) {
        let alpha = self.config.rtt_ewma_alpha;
        let mut entry = self.rtt_ewma.entry(peer).or_insert(f64::from(rtt_us));
        *entry = alpha * f64::from(rtt_us) + (1.0 - alpha) * *entry;
    }

    fn edge_cost_us(&self, peer: &NodeId) -> u32 {
        self.rtt_ewma
            .get(peer)
            .map(|v| *v as u32)
            .unwrap_or(DEFAULT_EDGE_COST_US)
    }

    /// Build this node's signed beacon over the current neighbor set,
    /// sealed into its transport envelope.
    pub fn build_beacon(
        &self,
        key_manager: &KeyManager,
        provider: &CryptoProvider,
        active_peers: &[NodeId],
        capabilities: &[Capability],
        now_ms: u64,
    ) -> Result<Vec<u8>> {
        let freshness = key_manager.next_freshness();
        let neighbors = active_peers
            .iter()
            .map(|peer| NeighborEdge {
                dst: *peer,
                cost_us: self.edge_cost_us(peer),
            })
            .collect();

        let mut frame = BeaconFrame {
            node_id: self.self_id,
            epoch: freshness.epoch,
            nonce: freshness.nonce,
            timestamp_ms: now_ms,
            neighbors,
            capabilities: capabilities.to_vec(),
            signing_pubkey: key_manager.signing_pubkey(),
            kem_pubkey: key_manager.kem_pubkey(),
            signature: Vec::new(),
        };
        let signed = frame.signed_payload()?;
        frame.signature = provider.sig.sign(key_manager.sig_keypair(), &signed)?;
        seal_envelope(FrameKind::Beacon, frame.encode()?)
    }

    /// Full reception pipeline for one beacon frame (envelope already
    /// opened). `src_addr` is the transport sender's address when the beacon
    /// arrived directly from its originator, `None` for relayed copies —
    /// relays teach topology, never addressing. `authenticated` reports
    /// whether the transport sender holds an established secure channel.
    pub async fn apply_beacon(
        &self,
        frame_bytes: &[u8],
        src_addr: Option<&Addr>,
        provider: &CryptoProvider,
        authenticated: bool,
        now_ms: u64,
    ) -> Result<BeaconOutcome> {
        let frame = BeaconFrame::decode(frame_bytes)?;
        if frame.node_id == self.self_id {
            // Our own beacon reflected back; nothing to learn.
            return Ok(BeaconOutcome::Applied);
        }

        let sender = frame.node_id;
        let known = self.peers.get(&sender);

        // Quarantined and evicted peers must not mutate any local state.
        if let Some(record) = &known {
            if matches!(record.state, PeerState::Quarantined | PeerState::Evicted) {
                return Err(MeshError::PolicyDenied(format!(
                    "beacon from {} peer {}",
                    if record.state == PeerState::Quarantined {
                        "quarantined"
                    } else {
                        "evicted"
                    },
                    sender.short()
                )));
            }
            if !authenticated {
                return Err(MeshError::PeerUnknown(format!(
                    "beacon from {} without an established channel",
                    sender.short()
                )));
            }
        }

        // Advisory timestamp: reject wild clocks before touching any state.
        if frame.timestamp_ms.abs_diff(now_ms) > self.config.clock_skew_max_ms {
            return Err(MeshError::Validation(format!(
                "beacon timestamp skew {} ms from {}",
                frame.timestamp_ms.abs_diff(now_ms),
                sender.short()
            )));
        }

        // Pick the verification key first; nothing is installed until the
        // signature checks out against it.
        let (signing_pubkey, introduction) = match &known {
            Some(record) => (record.signing_pubkey.clone(), None),
            None => {
                let (pubkey, how) = self.resolve_introduction(&frame).await?;
                (pubkey, Some(how))
            }
        };

        // A beacon is self-contained gossip: the detached signature is
        // verified here even though the channel already authenticated the
        // bytes in flight.
        let signed = frame.signed_payload()?;
        provider
            .sig
            .verify(&signing_pubkey, &signed, &frame.signature)?;

        if let Some(how) = introduction {
            self.install_peer(&frame, src_addr)?;
            match how {
                Introduction::IdentityProvider => log_info(
                    LogCategory::Beacon,
                    &format!(
                        "peer {} introduced via identity provider",
                        frame.node_id.short()
                    ),
                ),
                Introduction::Tofu => log_warn(
                    LogCategory::Beacon,
                    &format!(
                        "peer {} installed via trust-on-first-use",
                        frame.node_id.short()
                    ),
                ),
            }
        }

        let freshness = Freshness::new(frame.epoch, frame.nonce);

        // Transport reordering tolerance: a nonce gap parks the beacon in
        // the reorder window instead of burning the replay counter past it.
        if let Some(last) = self.replay.last_accepted(&sender) {
            if freshness.epoch == last.epoch && freshness.nonce > last.nonce + 1 {
                let mut slots = self.reorder.entry(sender).or_default();
                if slots.len() < self.config.reorder_window_slots {
                    slots.push(ReorderSlot {
                        frame,
                        src_addr: src_addr.cloned(),
                        buffered_at_ms: now_ms,
                    });
                    return Ok(BeaconOutcome::Buffered);
                }
                // Window full: fall through and apply out of order.
            }
        }

        let outcome = self.commit_beacon(&frame, src_addr, now_ms)?;
        if outcome == BeaconOutcome::Applied {
            self.drain_reorder(&sender, now_ms);
        }
        Ok(outcome)
    }

    /// Decide whether an unknown sender may be introduced, and with which
    /// verification key. Installation happens only after its signature
    /// verifies.
    async fn resolve_introduction(&self, frame: &BeaconFrame) -> Result<(Vec<u8>, Introduction)> {
        let sender = frame.node_id;

        // An identity-provider pin is an out-of-band introduction.
        if let Some(record) = self.identity_provider.resolve(&sender).await {
            if let Some(pinned) = record.signing_pubkey {
                if pinned != frame.signing_pubkey {
                    return Err(MeshError::BadSignature(format!(
                        "beacon key for {} does not match identity provider pin",
                        sender.short()
                    )));
                }
                return Ok((pinned, Introduction::IdentityProvider));
            }
        }

        if self.allow_tofu {
            return Ok((frame.signing_pubkey.clone(), Introduction::Tofu));
        }

        Err(MeshError::PeerUnknown(format!(
            "beacon from unintroduced peer {}",
            sender.short()
        )))
    }

    fn install_peer(&self, frame: &BeaconFrame, src_addr: Option<&Addr>) -> Result<()> {
        let mut record = PeerRecord::new(
            frame.node_id,
            frame.signing_pubkey.clone(),
            frame.kem_pubkey.clone(),
        );
        record.addr = src_addr.cloned();
        record.capabilities = frame.capabilities.clone();
        self.peers.install(record)
    }

    /// Install a peer vouched for by an accepted introduction claim.
    pub fn install_introduced_peer(
        &self,
        node: NodeId,
        signing_pubkey: Vec<u8>,
        kem_pubkey: Vec<u8>,
        addr: Option<Addr>,
    ) -> Result<()> {
        let mut record = PeerRecord::new(node, signing_pubkey, kem_pubkey);
        record.addr = addr;
        self.peers.install(record)
    }

    /// Post-ordering half of the pipeline: replay window, rate limit, then
    /// the actual merge.
    fn commit_beacon(
        &self,
        frame: &BeaconFrame,
        src_addr: Option<&Addr>,
        now_ms: u64,
    ) -> Result<BeaconOutcome> {
        let sender = frame.node_id;
        let freshness = Freshness::new(frame.epoch, frame.nonce);

        self.replay.check_and_update(
            sender,
            freshness,
            now_ms,
            self.config.clock_skew_max_ms,
        )?;

        if !self.admit_rate(&sender, now_ms) {
            return Ok(BeaconOutcome::RateLimited);
        }

        self.peers.record_beacon(
            &sender,
            freshness,
            &frame.kem_pubkey,
            &frame.capabilities,
            now_ms,
        );
        if let Some(addr) = src_addr {
            self.peers.set_addr(&sender, addr.clone());
        }
        // Fresh, valid traffic from a peer suspected only for staleness
        // restores it to quorum eligibility.
        self.peers.try_restore_healthy(&sender);

        for edge in &frame.neighbors {
            self.topology
                .upsert_edge(sender, edge.dst, edge.cost_us, now_ms)?;
        }

        self.accepted_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mesh_beacons_accepted_total", 1);
        Ok(BeaconOutcome::Applied)
    }

    /// Accepted-beacon budget per sender. Over budget drops the beacon;
    /// only a sustained pattern of over-budget windows is misbehavior.
    fn admit_rate(&self, sender: &NodeId, now_ms: u64) -> bool {
        let mut rate = self.rate.entry(*sender).or_insert(BeaconRate {
            window_start_ms: now_ms,
            accepted: 0,
            violation_windows: 0,
            violated_this_window: false,
        });
        if now_ms.saturating_sub(rate.window_start_ms) >= 1_000 {
            if !rate.violated_this_window {
                rate.violation_windows = 0;
            }
            rate.window_start_ms = now_ms;
            rate.accepted = 0;
            rate.violated_this_window = false;
        }
        rate.accepted += 1;
        if rate.accepted > self.config.beacon_rate_limit_per_sec {
            if !rate.violated_this_window {
                rate.violated_this_window = true;
                rate.violation_windows += 1;
                if rate.violation_windows >= SUSTAINED_VIOLATION_WINDOWS {
                    drop(rate);
                    log_warn(
                        LogCategory::Beacon,
                        &format!("sustained beacon flood from {}", sender.short()),
                    );
                    self.peers.penalize(sender, 0.1);
                }
            }
            return false;
        }
        true
    }

    /// Apply any buffered successors that became in-order.
    fn drain_reorder(&self, sender: &NodeId, now_ms: u64) {
        loop {
            let next = {
                let Some(mut slots) = self.reorder.get_mut(sender) else {
                    return;
                };
                let Some(last) = self.replay.last_accepted(sender) else {
                    return;
                };
                let position = slots.iter().position(|slot| {
                    slot.frame.epoch == last.epoch && slot.frame.nonce == last.nonce + 1
                });
                match position {
                    Some(i) => slots.swap_remove(i),
                    None => return,
                }
            };
            let _ = self.commit_beacon(&next.frame, next.src_addr.as_ref(), now_ms);
        }
    }

    /// Sweep housekeeping: flush reorder slots past their TTL (applied out
    /// of order rather than lost) and expire the claim dedup set.
    pub fn sweep(&self, now_ms: u64) {
        let mut expired = Vec::new();
        for mut entry in self.reorder.iter_mut() {
            let slots = entry.value_mut();
            let mut i = 0;
            while i < slots.len() {
                if now_ms.saturating_sub(slots[i].buffered_at_ms)
                    > self.config.reorder_window_ttl_ms
                {
                    expired.push(slots.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for slot in expired {
            let _ = self.commit_beacon(&slot.frame, slot.src_addr.as_ref(), now_ms);
        }
        self.reorder.retain(|_, slots| !slots.is_empty());
        self.seen_claims
            .retain(|_, first_seen| now_ms.saturating_sub(*first_seen) <= self.config.claim_seen_ttl_ms);
    }

    /// Ingest a gossiped claim frame. Returns the frame bytes to re-gossip
    /// when this delivery contributed new endorsements and the claim is not
    /// yet suppressed by the seen-set.
    pub fn ingest_claim(
        &self,
        frame_bytes: &[u8],
        validator: &QuorumValidator,
        own_pubkey: &[u8],
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>> {
        let frame = ClaimFrame::decode(frame_bytes)?;
        let id = frame.claim_id;
        let first_sight = !self.seen_claims.contains_key(&id);

        let added = validator.ingest(frame, own_pubkey, now_ms)?;
        self.seen_claims.entry(id).or_insert(now_ms);

        if added || first_sight {
            // Relay the merged signature set, not just what we received.
            if let Some(merged) = validator.frame_of(&id) {
                return Ok(Some(seal_envelope(FrameKind::Claim, merged.encode()?)?));
            }
        }
        Ok(None)
    }

    /// Whether a claim id is inside the duplicate-suppression window.
    pub fn claim_seen(&self, id: &[u8; 32]) -> bool {
        self.seen_claims.contains_key(id)
    }
}

/// Beacon emission period with ±10 % jitter.
pub fn jittered_interval(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return base;
    }
    let spread = base_ms / 10;
    let low = base_ms - spread;
    let high = base_ms + spread;
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuorumConfig;
    use crate::crypto_protocols::{KemAlgorithm, KemEngine, SigAlgorithm, SigEngine};
    use crate::hooks::{PersistenceHook, MemoryPersistence, StaticIdentityProvider};
    use crate::identity::Epoch;

    struct Rig {
        engine: GossipEngine,
        provider: Arc<CryptoProvider>,
        peers: Arc<PeerTable>,
        topology: Arc<TopologyStore>,
    }

    async fn rig(allow_tofu: bool) -> Rig {
        let provider = Arc::new(CryptoProvider::with_engines(
            KemEngine::new(KemAlgorithm::X25519),
            SigEngine::new(SigAlgorithm::Ed25519),
            None,
            false,
        ));
        let peers = Arc::new(PeerTable::new(QuorumConfig::default()));
        let topology = Arc::new(TopologyStore::new());
        let engine = GossipEngine::new(
            NodeId::from_bytes([0xaa; 16]),
            BeaconConfig::default(),
            allow_tofu,
            Arc::clone(&peers),
            Arc::clone(&topology),
            Arc::new(ReplayGuard::new()),
            Arc::new(StaticIdentityProvider::default()),
        );
        Rig {
            engine,
            provider,
            peers,
            topology,
        }
    }

    async fn sender_keys(provider: &CryptoProvider) -> Arc<KeyManager> {
        let persistence: Arc<dyn PersistenceHook> = Arc::new(MemoryPersistence::new());
        Arc::new(
            KeyManager::load_or_bootstrap(provider, &persistence)
                .await
                .unwrap(),
        )
    }

    fn beacon_from(
        rig: &Rig,
        keys: &KeyManager,
        sender: NodeId,
        freshness: Freshness,
        neighbors: &[(NodeId, u32)],
        now_ms: u64,
    ) -> Vec<u8> {
        let mut frame = BeaconFrame {
            node_id: sender,
            epoch: freshness.epoch,
            nonce: freshness.nonce,
            timestamp_ms: now_ms,
            neighbors: neighbors
                .iter()
                .map(|(dst, cost)| NeighborEdge {
                    dst: *dst,
                    cost_us: *cost,
                })
                .collect(),
            capabilities: vec![Capability::Relay],
            signing_pubkey: keys.signing_pubkey(),
            kem_pubkey: keys.kem_pubkey(),
            signature: Vec::new(),
        };
        let signed = frame.signed_payload().unwrap();
        frame.signature = rig
            .provider
            .sig
            .sign(keys.sig_keypair(), &signed)
            .unwrap();
        frame.encode().unwrap()
    }

    #[tokio::test]
    async fn tofu_installs_unknown_sender_and_merges_edges() {
        let rig = rig(true).await;
        let keys = sender_keys(&rig.provider).await;
        let sender = NodeId::from_bytes([1; 16]);
        let neighbor = NodeId::from_bytes([2; 16]);

        let bytes = beacon_from(
            &rig,
            &keys,
            sender,
            Freshness::new(Epoch(0), 0),
            &[(neighbor, 4_000)],
            1_000,
        );
        let outcome = rig
            .engine
            .apply_beacon(&bytes, Some(&"addr-1".to_string()), &rig.provider, false, 1_000)
            .await
            .unwrap();
        assert_eq!(outcome, BeaconOutcome::Applied);
        assert!(rig.peers.contains(&sender));
        assert_eq!(
            rig.topology.snapshot().edge(&sender, &neighbor).unwrap().cost_us,
            4_000
        );
        assert_eq!(rig.engine.accepted_count(), 1);
    }

    #[tokio::test]
    async fn unknown_sender_rejected_without_tofu() {
        let rig = rig(false).await;
        let keys = sender_keys(&rig.provider).await;
        let sender = NodeId::from_bytes([1; 16]);
        let bytes = beacon_from(&rig, &keys, sender, Freshness::new(Epoch(0), 0), &[], 500);
        let err = rig
            .engine
            .apply_beacon(&bytes, Some(&"addr-1".to_string()), &rig.provider, false, 500)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::PeerUnknown(_)));
        assert!(!rig.peers.contains(&sender));
    }

    #[tokio::test]
    async fn replayed_beacon_adds_nothing() {
        let rig = rig(true).await;
        let keys = sender_keys(&rig.provider).await;
        let sender = NodeId::from_bytes([1; 16]);
        let neighbor = NodeId::from_bytes([2; 16]);
        let bytes = beacon_from(
            &rig,
            &keys,
            sender,
            Freshness::new(Epoch(7), 42),
            &[(neighbor, 1_000)],
            1_000,
        );

        rig.engine
            .apply_beacon(&bytes, Some(&"addr-1".to_string()), &rig.provider, true, 1_000)
            .await
            .unwrap();
        let accepted_before = rig.engine.accepted_count();
        let edges_before = rig.topology.snapshot().edge_count();

        // Identical bytes replayed: rejected, counters unchanged.
        let err = rig
            .engine
            .apply_beacon(&bytes, Some(&"addr-1".to_string()), &rig.provider, true, 1_100)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Replay(_)));
        assert_eq!(rig.engine.accepted_count(), accepted_before);
        assert_eq!(rig.topology.snapshot().edge_count(), edges_before);
    }

    #[tokio::test]
    async fn tampered_beacon_fails_signature() {
        let rig = rig(true).await;
        let keys = sender_keys(&rig.provider).await;
        let sender = NodeId::from_bytes([1; 16]);
        let mut bytes = beacon_from(&rig, &keys, sender, Freshness::new(Epoch(0), 0), &[], 100);
        // Flip a low-order timestamp bit: inside the skew bound, but the
        // signature no longer covers the bytes.
        bytes[34] ^= 1;
        let result = rig
            .engine
            .apply_beacon(&bytes, Some(&"addr-1".to_string()), &rig.provider, false, 100)
            .await;
        assert!(result.is_err());
        assert!(!rig.peers.contains(&sender));
    }

    #[tokio::test]
    async fn quarantined_sender_cannot_mutate_topology() {
        let rig = rig(true).await;
        let keys = sender_keys(&rig.provider).await;
        let sender = NodeId::from_bytes([1; 16]);

        let bytes = beacon_from(&rig, &keys, sender, Freshness::new(Epoch(0), 0), &[], 100);
        rig.engine
            .apply_beacon(&bytes, Some(&"addr-1".to_string()), &rig.provider, true, 100)
            .await
            .unwrap();
        rig.peers.set_state(&sender, PeerState::Quarantined).unwrap();

        let bytes = beacon_from(
            &rig,
            &keys,
            sender,
            Freshness::new(Epoch(0), 1),
            &[(NodeId::from_bytes([9; 16]), 1_000)],
            200,
        );
        let err = rig
            .engine
            .apply_beacon(&bytes, Some(&"addr-1".to_string()), &rig.provider, true, 200)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::PolicyDenied(_)));
        assert_eq!(rig.topology.snapshot().edge_count(), 0);
    }

    #[tokio::test]
    async fn out_of_order_beacons_buffer_then_apply_in_order() {
        let rig = rig(true).await;
        let keys = sender_keys(&rig.provider).await;
        let sender = NodeId::from_bytes([1; 16]);
        let addr = "addr-1".to_string();

        let b0 = beacon_from(&rig, &keys, sender, Freshness::new(Epoch(3), 0), &[], 100);
        let b1 = beacon_from(&rig, &keys, sender, Freshness::new(Epoch(3), 1), &[], 100);
        let b2 = beacon_from(&rig, &keys, sender, Freshness::new(Epoch(3), 2), &[], 100);

        rig.engine
            .apply_beacon(&b0, Some(&addr), &rig.provider, true, 100)
            .await
            .unwrap();
        // Nonce 2 arrives before nonce 1: parked.
        let outcome = rig
            .engine
            .apply_beacon(&b2, Some(&addr), &rig.provider, true, 150)
            .await
            .unwrap();
        assert_eq!(outcome, BeaconOutcome::Buffered);
        assert_eq!(rig.engine.accepted_count(), 1);

        // Nonce 1 lands: both it and the parked nonce 2 apply.
        rig.engine
            .apply_beacon(&b1, Some(&addr), &rig.provider, true, 200)
            .await
            .unwrap();
        assert_eq!(rig.engine.accepted_count(), 3);
    }

    #[tokio::test]
    async fn reorder_ttl_flushes_gapped_beacons() {
        let rig = rig(true).await;
        let keys = sender_keys(&rig.provider).await;
        let sender = NodeId::from_bytes([1; 16]);
        let addr = "addr-1".to_string();

        let b0 = beacon_from(&rig, &keys, sender, Freshness::new(Epoch(1), 0), &[], 100);
        let b5 = beacon_from(&rig, &keys, sender, Freshness::new(Epoch(1), 5), &[], 100);

        rig.engine
            .apply_beacon(&b0, Some(&addr), &rig.provider, true, 100)
            .await
            .unwrap();
        rig.engine
            .apply_beacon(&b5, Some(&addr), &rig.provider, true, 200)
            .await
            .unwrap();
        assert_eq!(rig.engine.accepted_count(), 1);

        // The gap never fills; past the TTL the beacon applies anyway.
        rig.engine.sweep(200 + 1_001);
        assert_eq!(rig.engine.accepted_count(), 2);
    }

    #[tokio::test]
    async fn beacon_rate_limit_drops_excess() {
        let rig = rig(true).await;
        let keys = sender_keys(&rig.provider).await;
        let sender = NodeId::from_bytes([1; 16]);
        let addr = "addr-1".to_string();

        let mut outcomes = Vec::new();
        for nonce in 0..12u64 {
            let bytes = beacon_from(
                &rig,
                &keys,
                sender,
                Freshness::new(Epoch(0), nonce),
                &[],
                1_000,
            );
            outcomes.push(
                rig.engine
                    .apply_beacon(&bytes, Some(&addr), &rig.provider, true, 1_000 + nonce)
                    .await
                    .unwrap(),
            );
        }
        let applied = outcomes
            .iter()
            .filter(|o| **o == BeaconOutcome::Applied)
            .count();
        let limited = outcomes
            .iter()
            .filter(|o| **o == BeaconOutcome::RateLimited)
            .count();
        assert_eq!(applied, 10);
        assert_eq!(limited, 2);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_millis(10_000);
        for _ in 0..100 {
            let jittered = jittered_interval(base);
            assert!(jittered >= Duration::from_millis(9_000));
            assert!(jittered <= Duration::from_millis(11_000));
        }
    }
}
