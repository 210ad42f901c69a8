//! # Byzantine-Tolerant Quorum Validator
//!
//! Network-impacting facts — peer failures, revocations, configuration
//! changes, fallback activations, introductions — circulate as *claims* and
//! gain binding force only through quorum endorsement.
//!
//! ## Quorum Math
//!
//! For a claim created when the HEALTHY population is `n`:
//!
//! - threshold = `⌈2n/3⌉` (frozen at creation; later churn does not move it)
//! - tolerated Byzantine population `f = ⌊(n−1)/3⌋`; a claim needs at least
//!   `f + 1` distinct signers, so no claim binds on Byzantine votes alone
//! - boundary cases: `n = 1` → threshold 1, but a solo node may self-accept
//!   claims about itself only; `n = 2` → both peers must endorse
//!
//! Above `n/3` Byzantine nodes, safety is explicitly not guaranteed.
//!
//! ## Lifecycle
//!
//! A claim is PENDING from first sight, ACCEPTED when distinct healthy
//! signers reach the threshold, and REJECTED when its deadline passes or a
//! contradicting claim reaches quorum first. Terminal states are final;
//! accepted/rejected claims are retained briefly for dedup, then pruned.
//!
//! Signers of a claim that loses to a contradiction pay a reputation
//! penalty, which is what ultimately quarantines persistent liars.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::QuorumConfig;
use crate::crypto_protocols::{sha3_256, CryptoProvider, KeyManager};
use crate::identity::{Epoch, NodeId};
use crate::logging::{log_info, log_warn, LogCategory};
use crate::peers::{PeerState, PeerTable};
use crate::wire::{ClaimFrame, ClaimSignature, ClaimType};
use crate::{MeshError, Result};

/// Claim payload semantics, serialized as the frame payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClaimBody {
    /// `target` is believed failed; `reporter` saw the evidence
    NodeFailure { reporter: NodeId, evidence: String },
    /// `target`'s credentials are revoked mesh-wide
    Revocation { reason: String },
    /// A mesh-wide configuration value change
    ConfigChange { key: String, value: String },
    /// `target` degraded to classical crypto; carries the degraded suite
    FallbackActivated { kem: String, sig: String },
    /// Vouches for a new peer, carrying its keys and address
    Introduction {
        signing_pubkey: Vec<u8>,
        kem_pubkey: Vec<u8>,
        addr: Option<String>,
        /// Epoch the introduced node reported at introduction time
        epoch: Epoch,
    },
}

impl ClaimBody {
    pub fn claim_type(&self) -> ClaimType {
        match self {
            ClaimBody::NodeFailure { .. } => ClaimType::NodeFailure,
            ClaimBody::Revocation { .. } => ClaimType::Revocation,
            ClaimBody::ConfigChange { .. } => ClaimType::ConfigChange,
            ClaimBody::FallbackActivated { .. } => ClaimType::FallbackActivated,
            ClaimBody::Introduction { .. } => ClaimType::Introduction,
        }
    }
}

/// Compute a claim's content hash: type, target, and payload — never the
/// signature set, so endorsements accumulate under one identifier.
pub fn claim_id(claim_type: ClaimType, target: &NodeId, payload: &[u8]) -> [u8; 32] {
    sha3_256(&[&[claim_type as u8], target.as_bytes(), payload])
}

/// Quorum threshold `⌈2n/3⌉`.
pub fn quorum_threshold(population: usize) -> usize {
    population.saturating_mul(2).div_ceil(3)
}

/// Tolerated Byzantine count `⌊(n−1)/3⌋`.
pub fn byzantine_bound(population: usize) -> usize {
    population.saturating_sub(1) / 3
}

/// Terminal or pending status of a tracked claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimStatus {
    Pending,
    Accepted,
    Rejected,
}

/// Why a claim was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Deadline passed below threshold
    TimedOut,
    /// A contradicting claim reached quorum first
    Contradicted,
}

/// Typed event fired when a claim reaches a terminal state.
#[derive(Debug, Clone)]
pub enum QuorumEvent {
    ClaimAccepted {
        claim_id: [u8; 32],
        target: NodeId,
        body: ClaimBody,
        signers: Vec<NodeId>,
    },
    ClaimRejected {
        claim_id: [u8; 32],
        target: NodeId,
        body: ClaimBody,
        reason: RejectReason,
    },
}

struct TrackedClaim {
    frame: ClaimFrame,
    body: ClaimBody,
    signers: BTreeSet<NodeId>,
    /// HEALTHY population at creation; the threshold base never drifts
    population_at_creation: usize,
    threshold: usize,
    created_at_ms: u64,
    deadline_ms: u64,
    status: ClaimStatus,
}

#[derive(Default)]
struct RateWindow {
    window_start_ms: u64,
    count: u32,
}

impl RateWindow {
    /// Count one event against a 1-second budget. Returns false on overflow.
    fn admit(&mut self, now_ms: u64, budget: u32) -> bool {
        if now_ms.saturating_sub(self.window_start_ms) >= 1_000 {
            self.window_start_ms = now_ms;
            self.count = 0;
        }
        self.count += 1;
        self.count <= budget
    }
}

/// The validator: tracks claim endorsement progress and fires typed events
/// consumed by the MAPE-K executor.
pub struct QuorumValidator {
    self_id: NodeId,
    peers: Arc<PeerTable>,
    provider: Arc<CryptoProvider>,
    config: QuorumConfig,
    claims: DashMap<[u8; 32], TrackedClaim>,
    claim_rate: DashMap<NodeId, RateWindow>,
    endorsement_rate: DashMap<NodeId, RateWindow>,
    events: broadcast::Sender<QuorumEvent>,
}

impl QuorumValidator {
    pub fn new(
        self_id: NodeId,
        peers: Arc<PeerTable>,
        provider: Arc<CryptoProvider>,
        config: QuorumConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            self_id,
            peers,
            provider,
            config,
            claims: DashMap::new(),
            claim_rate: DashMap::new(),
            endorsement_rate: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QuorumEvent> {
        self.events.subscribe()
    }

    /// Build and sign a new claim originated by this node.
    pub fn create_claim(
        &self,
        key_manager: &KeyManager,
        target: NodeId,
        body: &ClaimBody,
    ) -> Result<ClaimFrame> {
        let payload =
            serde_json::to_vec(body).map_err(|e| MeshError::Validation(e.to_string()))?;
        let claim_type = body.claim_type();
        let id = claim_id(claim_type, &target, &payload);
        let mut frame = ClaimFrame {
            claim_type,
            claim_id: id,
            target,
            payload,
            signatures: Vec::new(),
        };
        let endorsed = frame.endorsed_payload()?;
        let signature = self
            .provider
            .sig
            .sign(key_manager.sig_keypair(), &endorsed)?;
        frame.signatures.push(ClaimSignature {
            signer_id: self.self_id,
            signature,
        });
        Ok(frame)
    }

    /// Endorse a pending claim with this node's signature, returning the
    /// frame to re-gossip. Endorsing twice adds one distinct signer, not
    /// two.
    pub fn endorse(
        &self,
        key_manager: &KeyManager,
        id: &[u8; 32],
    ) -> Result<Option<ClaimFrame>> {
        let mut tracked = match self.claims.get_mut(id) {
            Some(t) => t,
            None => return Ok(None),
        };
        if tracked.status != ClaimStatus::Pending || tracked.signers.contains(&self.self_id) {
            return Ok(None);
        }
        let endorsed = tracked.frame.endorsed_payload()?;
        let signature = self
            .provider
            .sig
            .sign(key_manager.sig_keypair(), &endorsed)?;
        tracked.frame.signatures.push(ClaimSignature {
            signer_id: self.self_id,
            signature,
        });
        tracked.signers.insert(self.self_id);
        let frame = tracked.frame.clone();
        drop(tracked);
        // Our signature may be the one that tips the threshold.
        self.evaluate_acceptance(id);
        Ok(Some(frame))
    }

    /// Ingest a claim frame from gossip (or loopback). Verifies structure
    /// and every signature, merges endorsements, and returns whether any new
    /// distinct signer was added (the relay predicate).
    pub fn ingest(&self, frame: ClaimFrame, own_pubkey: &[u8], now_ms: u64) -> Result<bool> {
        let body: ClaimBody = serde_json::from_slice(&frame.payload)
            .map_err(|e| MeshError::Validation(format!("claim payload: {e}")))?;
        if body.claim_type() != frame.claim_type {
            return Err(MeshError::Validation("claim type/payload mismatch".into()));
        }
        let expected = claim_id(frame.claim_type, &frame.target, &frame.payload);
        if expected != frame.claim_id {
            return Err(MeshError::Validation("claim id is not the content hash".into()));
        }
        if frame.signatures.is_empty() {
            return Err(MeshError::Validation("claim carries no signatures".into()));
        }

        let endorsed = frame.endorsed_payload()?;

        // Reporter (first signer) rate limit applies to new claims only.
        let reporter = frame.signatures[0].signer_id;
        let is_new = !self.claims.contains_key(&frame.claim_id);
        if is_new && reporter != self.self_id {
            let admitted = self
                .claim_rate
                .entry(reporter)
                .or_default()
                .admit(now_ms, self.config.claim_rate_limit_per_sec);
            if !admitted {
                self.peers
                    .penalize(&reporter, self.config.reputation_decrement);
                return Err(MeshError::RateLimited(format!(
                    "reporter {} exceeded claim budget",
                    reporter.short()
                )));
            }
        }

        let mut tracked = self.claims.entry(frame.claim_id).or_insert_with(|| {
            let population = self.peers.healthy_population(true);
            TrackedClaim {
                frame: ClaimFrame {
                    claim_type: frame.claim_type,
                    claim_id: frame.claim_id,
                    target: frame.target,
                    payload: frame.payload.clone(),
                    signatures: Vec::new(),
                },
                body: body.clone(),
                signers: BTreeSet::new(),
                population_at_creation: population,
                threshold: quorum_threshold(population),
                created_at_ms: now_ms,
                deadline_ms: now_ms + self.config.claim_ttl_ms,
                status: ClaimStatus::Pending,
            }
        });

        if tracked.status != ClaimStatus::Pending {
            return Ok(false);
        }

        let mut added = false;
        for sig in &frame.signatures {
            if tracked.signers.contains(&sig.signer_id) {
                continue;
            }
            // Only distinct HEALTHY reporters count toward quorum. Our own
            // signature verifies against our own key; peers against their
            // recorded keys.
            let pubkey = if sig.signer_id == self.self_id {
                own_pubkey.to_vec()
            } else {
                match self.peers.get(&sig.signer_id) {
                    Some(record) if record.state == PeerState::Healthy => record.signing_pubkey,
                    Some(_) | None => continue,
                }
            };
            if sig.signer_id != self.self_id {
                let admitted = self
                    .endorsement_rate
                    .entry(sig.signer_id)
                    .or_default()
                    .admit(now_ms, self.config.endorsement_rate_limit_per_sec);
                if !admitted {
                    self.peers
                        .penalize(&sig.signer_id, self.config.reputation_decrement);
                    continue;
                }
            }
            if self
                .provider
                .sig
                .verify(&pubkey, &endorsed, &sig.signature)
                .is_err()
            {
                metrics::counter!("mesh_claim_bad_signatures_total", 1);
                continue;
            }
            tracked.signers.insert(sig.signer_id);
            tracked.frame.signatures.push(sig.clone());
            added = true;
        }

        let id = frame.claim_id;
        drop(tracked);
        self.evaluate_acceptance(&id);
        Ok(added)
    }

    /// Transition a pending claim to ACCEPTED if its signer set now clears
    /// the frozen threshold, firing the event and suppressing contradicted
    /// rivals.
    fn evaluate_acceptance(&self, id: &[u8; 32]) {
        let Some(mut tracked) = self.claims.get_mut(id) else {
            return;
        };
        if tracked.status != ClaimStatus::Pending {
            return;
        }
        let reached = tracked.signers.len() >= tracked.threshold
            && tracked.signers.len() > byzantine_bound(tracked.population_at_creation)
            && self.solo_rule_satisfied(&tracked);
        if !reached {
            return;
        }
        tracked.status = ClaimStatus::Accepted;
        let event = QuorumEvent::ClaimAccepted {
            claim_id: tracked.frame.claim_id,
            target: tracked.frame.target,
            body: tracked.body.clone(),
            signers: tracked.signers.iter().copied().collect(),
        };
        let target = tracked.frame.target;
        let winning_id = tracked.frame.claim_id;
        let winning_body = tracked.body.clone();
        drop(tracked);
        log_info(
            LogCategory::Quorum,
            &format!("claim {} accepted for {}", hex4(&winning_id), target.short()),
        );
        metrics::counter!("mesh_claims_accepted_total", 1);
        let _ = self.events.send(event);
        self.reject_contradicted(&winning_id, &winning_body, target);
    }

    /// A solo mesh (`n = 1`) may self-accept claims about itself only.
    fn solo_rule_satisfied(&self, tracked: &TrackedClaim) -> bool {
        tracked.population_at_creation > 1 || tracked.frame.target == self.self_id
    }

    /// Walk pending claims past their deadline into REJECTED.
    pub fn sweep_deadlines(&self, now_ms: u64) -> usize {
        let mut rejected = Vec::new();
        for mut entry in self.claims.iter_mut() {
            if entry.status == ClaimStatus::Pending && now_ms >= entry.deadline_ms {
                entry.status = ClaimStatus::Rejected;
                rejected.push(QuorumEvent::ClaimRejected {
                    claim_id: entry.frame.claim_id,
                    target: entry.frame.target,
                    body: entry.body.clone(),
                    reason: RejectReason::TimedOut,
                });
            }
        }
        let count = rejected.len();
        for event in rejected {
            metrics::counter!("mesh_claims_timed_out_total", 1);
            let _ = self.events.send(event);
        }
        // Terminal claims linger for one more TTL as dedup tombstones.
        self.claims.retain(|_, c| {
            c.status == ClaimStatus::Pending
                || now_ms.saturating_sub(c.deadline_ms) < self.config.claim_ttl_ms
        });
        count
    }

    /// Claims still awaiting endorsements (the MAPE-K quorum-backlog
    /// sample).
    pub fn pending_count(&self) -> usize {
        self.claims
            .iter()
            .filter(|c| c.status == ClaimStatus::Pending)
            .count()
    }

    pub fn status_of(&self, id: &[u8; 32]) -> Option<ClaimStatus> {
        self.claims.get(id).map(|c| c.status)
    }

    /// The tracked frame (with merged signatures) for re-gossip.
    pub fn frame_of(&self, id: &[u8; 32]) -> Option<ClaimFrame> {
        self.claims.get(id).map(|c| c.frame.clone())
    }

    fn reject_contradicted(&self, winner_id: &[u8; 32], winner: &ClaimBody, target: NodeId) {
        let mut events = Vec::new();
        for mut entry in self.claims.iter_mut() {
            if entry.frame.claim_id == *winner_id || entry.status != ClaimStatus::Pending {
                continue;
            }
            if entry.frame.target == target && contradicts(winner, &entry.body) {
                entry.status = ClaimStatus::Rejected;
                log_warn(
                    LogCategory::Quorum,
                    &format!(
                        "claim {} contradicted by accepted {}",
                        hex4(&entry.frame.claim_id),
                        hex4(winner_id)
                    ),
                );
                // Signers of the losing claim asserted something the mesh
                // decided is false; they pay for it.
                for signer in entry.signers.iter() {
                    if *signer != self.self_id {
                        self.peers.penalize(signer, self.config.reputation_decrement);
                    }
                }
                events.push(QuorumEvent::ClaimRejected {
                    claim_id: entry.frame.claim_id,
                    target: entry.frame.target,
                    body: entry.body.clone(),
                    reason: RejectReason::Contradicted,
                });
            }
        }
        for event in events {
            let _ = self.events.send(event);
        }
    }
}

/// Opposite-semantics test for claims about the same target.
fn contradicts(winner: &ClaimBody, loser: &ClaimBody) -> bool {
    match (winner, loser) {
        // Same config key, different value: first to quorum wins.
        (
            ClaimBody::ConfigChange { key: wk, value: wv },
            ClaimBody::ConfigChange { key: lk, value: lv },
        ) => wk == lk && wv != lv,
        // A freshly vouched-for peer cannot simultaneously be failed or
        // revoked, and vice versa.
        (ClaimBody::Introduction { .. }, ClaimBody::NodeFailure { .. })
        | (ClaimBody::Introduction { .. }, ClaimBody::Revocation { .. })
        | (ClaimBody::NodeFailure { .. }, ClaimBody::Introduction { .. })
        | (ClaimBody::Revocation { .. }, ClaimBody::Introduction { .. }) => true,
        _ => false,
    }
}

fn hex4(id: &[u8; 32]) -> String {
    id[..4].iter().map(|b| format!("{b:02x}")).collect()
}
