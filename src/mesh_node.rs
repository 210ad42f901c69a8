//! # Mesh Node Orchestrator
//!
//! Wires the six control-plane components into one running node:
//!
//! - one task per component (transport dispatch, beacon emitter,
//!   housekeeping sweeper, quorum event consumer, key rotation, MAPE-K)
//! - a bounded crypto worker pool: incoming frames are processed under a
//!   semaphore sized `min(8, cores)`, so signature verification never
//!   starves the runtime
//! - typed channels everywhere; components never hold references to each
//!   other, only to the shared stores and queues
//!
//! The orchestrator also implements the MAPE-K loop's two seams:
//! [`MonitorSource`] (world sampling) and [`PlanExecutor`] (running recovery
//! actions through the owning components).
//!
//! ## Lifecycle
//!
//! `new` initializes crypto (fail-closed in production), loads or mints the
//! node identity, and rehydrates persisted state. `start` spawns the
//! component tasks. `shutdown` cancels them cooperatively and persists the
//! knowledge base, peer set, and identity before returning.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MeshConfig;
use crate::crypto_protocols::{CryptoProvider, KeyManager};
use crate::gossip::{jittered_interval, BeaconOutcome, GossipEngine};
use crate::hooks::{Hooks, PolicyDecision};
use crate::identity::NodeId;
use crate::logging::{log_error, log_info, log_warn, LogCategory};
use crate::peers::{PeerState, PeerTable};
use crate::quorum::{ClaimBody, QuorumEvent, QuorumValidator};
use crate::routing::Router;
use crate::secure_channel::{ChannelManager, PendingHandshake, ReplayGuard};
use crate::self_healing::{
    MapeKLoop, MonitorSource, Observation, PlanAction, PlanExecutor,
};
use crate::topology::{TopologyDelta, TopologyStore};
use crate::transport::{Addr, Transport, UdpTransport};
use crate::wire::{open_envelope, seal_envelope, BeaconFrame, DataFrame, FrameKind};
use crate::{MeshError, Result};

/// Persistence key for the node's stable identifier.
const KEY_NODE_ID: &str = "identity/node_id";

/// Hop budget stamped on originated data frames.
const DEFAULT_HOP_BUDGET: u8 = 16;

/// Aggregate external health, surfaced through the system report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealth {
    /// All components nominal
    Healthy,
    /// Something needs attention but the node is fully functional
    Warning,
    /// The healing loop is suppressed or the node runs on fallback crypto
    Degraded,
    /// Self-quarantined or otherwise not participating
    Critical,
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeHealth::Healthy => write!(f, "HEALTHY"),
            NodeHealth::Warning => write!(f, "WARNING"),
            NodeHealth::Degraded => write!(f, "DEGRADED"),
            NodeHealth::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Handshake bookkeeping feeding the MAPE-K monitor.
#[derive(Default)]
struct HandshakeStats {
    attempts: AtomicU64,
    failures: AtomicU64,
    per_peer_failures: DashMap<NodeId, u32>,
    latencies_ms: Mutex<Vec<f64>>,
}

impl HandshakeStats {
    fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, peer: NodeId) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.per_peer_failures.entry(peer).or_insert(0) += 1;
    }

    fn record_latency(&self, latency_ms: f64) {
        self.latencies_ms.lock().push(latency_ms);
    }

    /// Drain the window into an observation fragment.
    fn drain(&self) -> (f64, std::collections::HashMap<NodeId, u32>, f64) {
        let attempts = self.attempts.swap(0, Ordering::Relaxed);
        let failures = self.failures.swap(0, Ordering::Relaxed);
        let rate = if attempts == 0 {
            0.0
        } else {
            failures as f64 / attempts as f64
        };
        let per_peer = self
            .per_peer_failures
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        self.per_peer_failures.clear();

        let mut latencies = std::mem::take(&mut *self.latencies_ms.lock());
        let p95 = if latencies.is_empty() {
            0.0
        } else {
            latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let idx = ((latencies.len() as f64) * 0.95).ceil() as usize;
            latencies[idx.saturating_sub(1).min(latencies.len() - 1)]
        };
        (rate, per_peer, p95)
    }
}

/// Shared state behind every component task.
struct NodeInner {
    config: MeshConfig,
    hooks: Hooks,
    node_id: NodeId,
    provider: Arc<CryptoProvider>,
    key_manager: Arc<KeyManager>,
    channels: Arc<ChannelManager>,
    replay: Arc<ReplayGuard>,
    peers: Arc<PeerTable>,
    topology: Arc<TopologyStore>,
    router: Arc<Router>,
    gossip: Arc<GossipEngine>,
    quorum: Arc<QuorumValidator>,
    transport: Arc<dyn Transport>,
    /// Client-side handshakes awaiting their response
    pending_handshakes: DashMap<NodeId, PendingHandshake>,
    /// Transport address → node id, learned from beacons and handshakes
    addr_index: DashMap<Addr, NodeId>,
    handshake_stats: HandshakeStats,
    /// Edges added/removed since the last monitor sample
    churn_counter: AtomicU64,
    /// Multiplier applied to the beacon interval (ReduceBeaconRate)
    beacon_backoff: AtomicU32,
    self_quarantined: AtomicBool,
    /// Delivered application payloads, (origin, plaintext)
    delivered: broadcast::Sender<(NodeId, Vec<u8>)>,
    crypto_pool: Arc<Semaphore>,
    system: Mutex<sysinfo::System>,
    started_at: Instant,
    cancel: CancellationToken,
}

impl NodeInner {
    fn now_ms(&self) -> u64 {
        self.hooks.clock.now_ms()
    }

    fn emit(&self, event: &str, value: f64) {
        self.hooks.telemetry.emit(event, &[], value);
    }

    /// Session-authenticated peers right now.
    fn active_peers(&self) -> Vec<NodeId> {
        self.channels.active_peers(self.now_ms())
    }

    fn addr_of(&self, peer: &NodeId) -> Option<Addr> {
        self.peers.get(peer).and_then(|r| r.addr)
    }

    /// Send one framed envelope to a peer by node id.
    async fn send_to_peer(&self, peer: &NodeId, bytes: &[u8]) -> Result<()> {
        let addr = self
            .addr_of(peer)
            .ok_or_else(|| MeshError::PeerUnknown(peer.to_string()))?;
        self.transport.send(&addr, bytes).await
    }

    /// Broadcast an envelope to every active session peer, except `skip`.
    /// Sends run concurrently; per-peer failures are logged, not propagated.
    async fn broadcast_to_sessions(&self, bytes: &[u8], skip: Option<&NodeId>) {
        let sends = self
            .active_peers()
            .into_iter()
            .filter(|peer| Some(peer) != skip)
            .map(|peer| async move { (peer, self.send_to_peer(&peer, bytes).await) });
        for (peer, result) in futures::future::join_all(sends).await {
            if let Err(e) = result {
                log_warn(
                    LogCategory::Transport,
                    &format!("broadcast to {} failed: {e}", peer.short()),
                );
            }
        }
    }

    /// Emit one beacon now: to every active session peer plus the
    /// configured bootstrap addresses (which may not have sessions yet).
    async fn emit_beacon(&self) -> Result<()> {
        if self.self_quarantined.load(Ordering::SeqCst) {
            return Ok(());
        }
        let now_ms = self.now_ms();
        let active = self.active_peers();
        // Our own adjacency also feeds our local graph.
        for peer in &active {
            let cost = self
                .peers
                .get(peer)
                .map(|r| (r.handshake_latency_ewma_ms * 1_000.0) as u32)
                .filter(|c| *c > 0)
                .unwrap_or(10_000);
            let _ = self.topology.upsert_edge(self.node_id, *peer, cost, now_ms);
        }
        let bytes = self.gossip.build_beacon(
            &self.key_manager,
            &self.provider,
            &active,
            &[],
            now_ms,
        )?;

        let mut targets: HashSet<Addr> = self
            .active_peers()
            .iter()
            .filter_map(|p| self.addr_of(p))
            .collect();
        for addr in &self.config.peers {
            targets.insert(addr.clone());
        }
        for addr in targets {
            if addr == self.transport.local_addr() {
                continue;
            }
            if let Err(e) = self.transport.send(&addr, &bytes).await {
                log_warn(
                    LogCategory::Beacon,
                    &format!("beacon to {addr} failed: {e}"),
                );
            }
        }
        metrics::counter!("mesh_beacons_emitted_total", 1);
        Ok(())
    }

    /// Start a handshake toward `peer` if none is active or pending.
    async fn initiate_handshake(&self, peer: NodeId) -> Result<()> {
        let now_ms = self.now_ms();
        if self.channels.session(&peer, now_ms).is_some()
            || self.pending_handshakes.contains_key(&peer)
        {
            return Ok(());
        }
        let record = self
            .peers
            .get(&peer)
            .ok_or_else(|| MeshError::PeerUnknown(peer.to_string()))?;
        if record.kem_pubkey.is_empty() {
            return Err(MeshError::PeerUnknown(format!(
                "no kem key recorded for {}",
                peer.short()
            )));
        }
        self.handshake_stats.record_attempt();
        let (init_bytes, pending) = self.channels.initiate(peer, &record.kem_pubkey, now_ms)?;
        self.pending_handshakes.insert(peer, pending);
        let envelope = seal_envelope(FrameKind::HandshakeInit, init_bytes)?;
        self.send_to_peer(&peer, &envelope).await
    }

    /// Dispatch one received envelope.
    async fn dispatch(self: &Arc<Self>, src_addr: Addr, bytes: Vec<u8>) {
        let (kind, frame) = match open_envelope(&bytes) {
            Ok(parts) => parts,
            Err(_) => {
                metrics::counter!("mesh_frames_malformed_total", 1);
                return;
            }
        };
        let result = match kind {
            FrameKind::Beacon => self.handle_beacon(&src_addr, frame).await,
            FrameKind::HandshakeInit => self.handle_handshake_init(&src_addr, frame).await,
            FrameKind::HandshakeResp => self.handle_handshake_resp(&src_addr, frame).await,
            FrameKind::Claim => self.handle_claim(&src_addr, frame).await,
            FrameKind::Data => self.handle_data(&src_addr, frame).await,
        };
        if let Err(e) = result {
            // Adversarial or malformed input is absorbed and counted, never
            // propagated.
            metrics::counter!("mesh_frames_rejected_total", 1);
            match &e {
                // Relay echoes reject as replays by design; keep them out of
                // the warn stream.
                MeshError::Replay(_) | MeshError::EpochStale(_) => {
                    tracing::debug!(category = "transport", "frame from {src_addr} rejected: {e}");
                }
                _ => log_warn(
                    LogCategory::Transport,
                    &format!("frame from {src_addr} rejected: {e}"),
                ),
            }
        }
    }

    async fn handle_beacon(self: &Arc<Self>, src_addr: &Addr, frame: &[u8]) -> Result<()> {
        let now_ms = self.now_ms();
        let beacon = BeaconFrame::decode(frame)?;
        if beacon.node_id == self.node_id {
            return Ok(());
        }

        // Direct = the transport sender is (or can be) the originator. A
        // relayed copy arrives from an address already mapped to a different
        // node; it teaches topology but never addressing.
        let direct = match self.addr_index.get(src_addr) {
            Some(mapped) => *mapped == beacon.node_id,
            None => true,
        };
        // The transport-level sender authenticates the delivery; the beacon
        // signature authenticates the originator.
        let authenticated = self
            .addr_index
            .get(src_addr)
            .map(|peer| self.channels.session(&peer, now_ms).is_some())
            .unwrap_or(false)
            || (self.config.allow_tofu && !self.config.production);

        let outcome = self
            .gossip
            .apply_beacon(
                frame,
                direct.then_some(src_addr),
                &self.provider,
                authenticated,
                now_ms,
            )
            .await?;
        if direct {
            self.addr_index.insert(src_addr.clone(), beacon.node_id);
        }

        if outcome == BeaconOutcome::Applied {
            // Sessions ride on introductions: a directly heard peer gets a
            // handshake as soon as its beacon lands.
            if direct && self.peers.contains(&beacon.node_id) {
                if let Err(e) = self.initiate_handshake(beacon.node_id).await {
                    log_warn(
                        LogCategory::SecureChannel,
                        &format!("handshake toward {} failed: {e}", beacon.node_id.short()),
                    );
                }
            }
            // Novel topology knowledge propagates: relay through the
            // duplicate-suppressed gossip path (the replay guard rejects the
            // echo when it loops back).
            let envelope = seal_envelope(FrameKind::Beacon, frame.to_vec())?;
            self.broadcast_to_sessions(&envelope, Some(&beacon.node_id)).await;
        }
        Ok(())
    }

    async fn handle_handshake_init(self: &Arc<Self>, src_addr: &Addr, frame: &[u8]) -> Result<()> {
        let now_ms = self.now_ms();
        let init = crate::wire::HandshakeInitFrame::decode(frame)?;
        let record = self
            .peers
            .get(&init.client_id)
            .ok_or_else(|| MeshError::PeerUnknown(init.client_id.to_string()))?;
        if matches!(record.state, PeerState::Quarantined | PeerState::Evicted) {
            return Err(MeshError::PolicyDenied(format!(
                "handshake from {} peer",
                init.client_id.short()
            )));
        }

        let served = self
            .channels
            .respond(frame, &record.signing_pubkey, now_ms)?;
        self.channels.install(served.session, now_ms);
        self.addr_index.insert(src_addr.clone(), init.client_id);
        self.peers.set_addr(&init.client_id, src_addr.clone());

        let envelope = seal_envelope(FrameKind::HandshakeResp, served.response_bytes)?;
        self.transport.send(src_addr, &envelope).await?;
        log_info(
            LogCategory::SecureChannel,
            &format!("session established with {} (server)", init.client_id.short()),
        );
        Ok(())
    }

    async fn handle_handshake_resp(self: &Arc<Self>, src_addr: &Addr, frame: &[u8]) -> Result<()> {
        let now_ms = self.now_ms();
        let resp = crate::wire::HandshakeRespFrame::decode(frame)?;
        let (peer, pending) = self
            .pending_handshakes
            .remove(&resp.server_id)
            .ok_or_else(|| {
                MeshError::Validation(format!(
                    "unsolicited handshake response from {}",
                    resp.server_id.short()
                ))
            })?;

        let latency_ms = now_ms.saturating_sub(pending.started_at_ms) as f64;
        match self.channels.finalize(pending, frame, now_ms) {
            Ok(session) => {
                self.channels.install(session, now_ms);
                self.addr_index.insert(src_addr.clone(), peer);
                self.handshake_stats.record_latency(latency_ms);
                self.peers
                    .record_handshake_latency(&peer, latency_ms, self.config.beacon.rtt_ewma_alpha);
                self.gossip
                    .record_rtt_sample(peer, (latency_ms * 1_000.0) as u32);
                log_info(
                    LogCategory::SecureChannel,
                    &format!("session established with {} (client)", peer.short()),
                );
                Ok(())
            }
            Err(e) => {
                self.handshake_stats.record_failure(peer);
                Err(e)
            }
        }
    }

    async fn handle_claim(self: &Arc<Self>, src_addr: &Addr, frame: &[u8]) -> Result<()> {
        let now_ms = self.now_ms();
        let own_pubkey = self.key_manager.signing_pubkey();
        if let Some(relay) = self
            .gossip
            .ingest_claim(frame, &self.quorum, &own_pubkey, now_ms)?
        {
            let skip = self.addr_index.get(src_addr).map(|e| *e.value());
            self.broadcast_to_sessions(&relay, skip.as_ref()).await;
        }
        self.maybe_endorse(frame, now_ms).await;
        Ok(())
    }

    /// Endorse a pending claim when local observation corroborates it, then
    /// re-gossip the merged signature set.
    async fn maybe_endorse(self: &Arc<Self>, frame: &[u8], now_ms: u64) {
        let Ok(claim) = crate::wire::ClaimFrame::decode(frame) else {
            return;
        };
        if self.quorum.status_of(&claim.claim_id)
            != Some(crate::quorum::ClaimStatus::Pending)
        {
            return;
        }
        let Ok(body) = serde_json::from_slice::<ClaimBody>(&claim.payload) else {
            return;
        };
        let corroborated = match &body {
            ClaimBody::NodeFailure { .. } => {
                // We co-sign a failure only when the target looks dead to us
                // as well.
                self.peers
                    .timed_out_peers(now_ms, self.config.beacon.node_timeout_ms)
                    .contains(&claim.target)
            }
            ClaimBody::Revocation { .. } => matches!(
                self.peers.state(&claim.target),
                Some(PeerState::Quarantined) | Some(PeerState::Suspected)
            ),
            ClaimBody::Introduction { signing_pubkey, .. } => {
                match self.peers.get(&claim.target) {
                    // Known with the same key: vouch.
                    Some(record) => record.signing_pubkey == *signing_pubkey,
                    None => match self.hooks.identity_provider.resolve(&claim.target).await {
                        Some(record) => {
                            record.signing_pubkey.as_deref() == Some(&signing_pubkey[..])
                        }
                        None => false,
                    },
                }
            }
            // A fallback self-report is proven by the reporter's own
            // signature on the claim.
            ClaimBody::FallbackActivated { .. } => claim
                .signatures
                .first()
                .map(|s| s.signer_id == claim.target)
                .unwrap_or(false),
            // Config changes need operator judgment, not auto-endorsement.
            ClaimBody::ConfigChange { .. } => false,
        };
        if !corroborated {
            return;
        }
        match self.quorum.endorse(&self.key_manager, &claim.claim_id) {
            Ok(Some(merged)) => {
                if let Ok(bytes) = merged.encode() {
                    if let Ok(envelope) = seal_envelope(FrameKind::Claim, bytes) {
                        self.broadcast_to_sessions(&envelope, None).await;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => log_warn(
                LogCategory::Quorum,
                &format!("endorsement failed: {e}"),
            ),
        }
    }

    async fn handle_data(self: &Arc<Self>, src_addr: &Addr, frame: &[u8]) -> Result<()> {
        let now_ms = self.now_ms();
        let data = DataFrame::decode(frame)?;
        let prev_hop = self
            .addr_index
            .get(src_addr)
            .map(|e| *e.value())
            .ok_or_else(|| MeshError::PeerUnknown(format!("data from unmapped {src_addr}")))?;

        // Hop-by-hop seal: the payload is sealed for us by the previous hop.
        let (freshness, plaintext) = self.channels.open_from(&prev_hop, &data.payload, now_ms)?;
        self.replay.check_and_update(
            prev_hop,
            freshness,
            now_ms,
            self.config.beacon.clock_skew_max_ms,
        )?;

        if data.dst == self.node_id {
            let _ = self.delivered.send((data.src, plaintext));
            metrics::counter!("mesh_data_delivered_total", 1);
            return Ok(());
        }

        if data.hop_budget == 0 {
            return Err(MeshError::Unreachable(format!(
                "hop budget exhausted for {}",
                data.dst.short()
            )));
        }
        let forwarded = DataFrame {
            src: data.src,
            dst: data.dst,
            hop_budget: data.hop_budget - 1,
            payload: plaintext,
        };
        self.send_data(forwarded).await
    }

    /// Route and send a data frame, failing over around dead next-hops.
    async fn send_data(self: &Arc<Self>, frame: DataFrame) -> Result<()> {
        let now_ms = self.now_ms();
        let mut excluded: HashSet<(NodeId, NodeId)> = HashSet::new();

        for attempt in 0..=self.router.max_failover_hops() {
            let route = if excluded.is_empty() {
                self.router.route(self.node_id, frame.dst)?.as_ref().clone()
            } else {
                self.router
                    .route_excluding(self.node_id, frame.dst, &excluded)?
            };
            let Some(next_hop) = route.next_hop() else {
                return Ok(()); // destination is self
            };

            let session = self
                .channels
                .session(&next_hop, now_ms)
                .ok_or_else(|| MeshError::PeerUnknown(format!(
                    "no session with next hop {}",
                    next_hop.short()
                )))?;
            let freshness = self.key_manager.next_freshness();
            let sealed = session.seal_message(freshness, &frame.payload)?;
            let hop_frame = DataFrame {
                src: frame.src,
                dst: frame.dst,
                hop_budget: frame.hop_budget,
                payload: sealed,
            };
            let envelope = seal_envelope(FrameKind::Data, hop_frame.encode()?)?;

            match self.send_to_peer(&next_hop, &envelope).await {
                Ok(()) => {
                    self.router.record_send_success(next_hop);
                    return Ok(());
                }
                Err(MeshError::Unreachable(_)) | Err(MeshError::Backpressure(_)) => {
                    excluded.insert((self.node_id, next_hop));
                    if let Some(evidence) = self.router.record_send_failure(next_hop) {
                        self.emit("route_failure_evidence", evidence.consecutive_failures as f64);
                        log_warn(
                            LogCategory::Topology,
                            &format!(
                                "next hop {} persistently unreachable ({} failures)",
                                next_hop.short(),
                                evidence.consecutive_failures
                            ),
                        );
                    }
                    if attempt == self.router.max_failover_hops() {
                        return Err(MeshError::Unreachable(frame.dst.to_string()));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(MeshError::Unreachable(frame.dst.to_string()))
    }

    /// Gossip a claim we originated (after counting our own endorsement).
    async fn gossip_own_claim(self: &Arc<Self>, body: ClaimBody, target: NodeId) -> Result<()> {
        let frame = self.quorum.create_claim(&self.key_manager, target, &body)?;
        let own_pubkey = self.key_manager.signing_pubkey();
        let now_ms = self.now_ms();
        // Loop the claim through our own validator first so a solo node can
        // self-accept claims about itself.
        let bytes = frame.encode()?;
        if let Some(relay) = self
            .gossip
            .ingest_claim(&bytes, &self.quorum, &own_pubkey, now_ms)?
        {
            self.broadcast_to_sessions(&relay, None).await;
        }
        Ok(())
    }

    /// Quarantine this node: beacons cease, peers will time us out.
    fn self_quarantine(&self, reason: &str) {
        if !self.self_quarantined.swap(true, Ordering::SeqCst) {
            log_error(
                LogCategory::System,
                &format!("self-quarantine engaged: {reason}"),
            );
            self.emit("self_quarantine", 1.0);
        }
    }

    /// Apply an accepted claim to local state.
    async fn apply_accepted_claim(self: &Arc<Self>, target: NodeId, body: ClaimBody) {
        match body {
            ClaimBody::NodeFailure { .. } | ClaimBody::Revocation { .. } => {
                if target == self.node_id {
                    self.self_quarantine("mesh revoked this node");
                    return;
                }
                let action = match body {
                    ClaimBody::Revocation { .. } => "revoke",
                    _ => "evict",
                };
                match self.hooks.policy.evaluate(&target, action).await {
                    PolicyDecision::Deny => {
                        log_warn(
                            LogCategory::Quorum,
                            &format!("policy denied {action} of {}", target.short()),
                        );
                        return;
                    }
                    PolicyDecision::Audit => {
                        self.emit("policy_audit", 1.0);
                    }
                    PolicyDecision::Allow => {}
                }
                let _ = self.peers.set_state(&target, PeerState::Evicted);
                self.topology.mark_evicted(target);
                self.channels.drop_session(&target);
                self.router.invalidate_cache();
                log_info(
                    LogCategory::Quorum,
                    &format!("peer {} evicted by quorum", target.short()),
                );
            }
            ClaimBody::Introduction {
                signing_pubkey,
                kem_pubkey,
                addr,
                ..
            } => {
                if let Err(e) = self.gossip.install_introduced_peer(
                    target,
                    signing_pubkey,
                    kem_pubkey,
                    addr,
                ) {
                    log_warn(
                        LogCategory::Quorum,
                        &format!("introduction of {} refused: {e}", target.short()),
                    );
                }
            }
            ClaimBody::ConfigChange { key, value } => {
                // The core records the binding decision; actual reconfig is
                // an operator concern.
                log_info(
                    LogCategory::Quorum,
                    &format!("mesh config change bound: {key} = {value}"),
                );
                self.emit("config_change_accepted", 1.0);
            }
            ClaimBody::FallbackActivated { kem, sig } => {
                log_warn(
                    LogCategory::Quorum,
                    &format!(
                        "peer {} degraded to classical crypto ({kem}/{sig})",
                        target.short()
                    ),
                );
                self.emit("peer_fallback_active", 1.0);
            }
        }
    }
}

impl MonitorSource for NodeInner {
    fn sample(&self, now_ms: u64) -> Observation {
        let (handshake_failure_rate, per_peer_handshake_failures, handshake_latency_p95_ms) =
            self.handshake_stats.drain();

        let window_min = (self.config.healing.tick_interval_ms as f64 / 60_000.0).max(1e-9);
        let churn = self.churn_counter.swap(0, Ordering::Relaxed) as f64 / window_min;

        let (cpu_percent, memory_used_mb) = {
            let mut system = self.system.lock();
            system.refresh_cpu();
            system.refresh_memory();
            (
                f64::from(system.global_cpu_info().cpu_usage()),
                system.used_memory() / (1024 * 1024),
            )
        };

        let fallback = self.provider.fallback;
        Observation {
            at_ms: now_ms,
            session_count: self.channels.active_peers(now_ms).len(),
            handshake_failure_rate,
            per_peer_handshake_failures,
            handshake_latency_p95_ms,
            topology_churn_per_min: churn,
            fallback_active: fallback.is_some(),
            fallback_remaining_ms: fallback.map(|f| f.remaining_ms(now_ms)).unwrap_or(0),
            quorum_backlog: self.quorum.pending_count(),
            timed_out_peers: self
                .peers
                .timed_out_peers(now_ms, self.config.beacon.node_timeout_ms),
            cpu_percent,
            memory_used_mb,
        }
    }
}

#[async_trait]
impl PlanExecutor for Arc<NodeInner> {
    async fn execute(&self, action: &PlanAction) -> Result<()> {
        match action {
            PlanAction::RestartPqcSession(peer) => {
                self.channels.drop_session(peer);
                // Bounded retry with the exponential handshake backoff; the
                // response arrives asynchronously, so each round waits out
                // its backoff before checking for an installed session.
                let mut last_err = None;
                for attempt in 0..self.config.crypto.handshake_retry_attempts {
                    self.pending_handshakes.remove(peer);
                    match self.initiate_handshake(*peer).await {
                        Ok(()) => {}
                        Err(e) => {
                            last_err = Some(e);
                            self.handshake_stats.record_failure(*peer);
                        }
                    }
                    tokio::time::sleep(crate::secure_channel::retry_backoff(attempt)).await;
                    if self.channels.session(peer, self.now_ms()).is_some() {
                        return Ok(());
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    MeshError::Timeout(format!("re-handshake with {} timed out", peer.short()))
                }))
            }
            PlanAction::QuarantinePeer(peer) if *peer == self.node_id => {
                self.self_quarantine("fallback ttl expired");
                Ok(())
            }
            PlanAction::QuarantinePeer(peer) => {
                match self.hooks.policy.evaluate(peer, "quarantine").await {
                    PolicyDecision::Deny => {
                        return Err(MeshError::PolicyDenied(peer.to_string()));
                    }
                    PolicyDecision::Audit => self.emit("policy_audit", 1.0),
                    PolicyDecision::Allow => {}
                }
                self.peers.set_state(peer, PeerState::Quarantined)?;
                self.channels.drop_session(peer);
                self.gossip_own_claim(
                    ClaimBody::Revocation {
                        reason: "quarantined by local healing loop".into(),
                    },
                    *peer,
                )
                .await
            }
            PlanAction::RotateKemKey => {
                let epoch = self
                    .key_manager
                    .rotate_kem(&self.provider, self.now_ms())?;
                self.key_manager.persist(&self.hooks.persistence).await?;
                log_info(
                    LogCategory::SecureChannel,
                    &format!("kem key rotated; epoch now {epoch}"),
                );
                // Fresh keys reach peers on the next beacon; emit one now.
                self.emit_beacon().await
            }
            PlanAction::RecomputeRoutes => {
                self.router.invalidate_cache();
                Ok(())
            }
            PlanAction::ReduceBeaconRate => {
                let current = self.beacon_backoff.load(Ordering::SeqCst);
                let next = (current * 2).clamp(2, 8);
                self.beacon_backoff.store(next, Ordering::SeqCst);
                log_info(
                    LogCategory::Beacon,
                    &format!("beacon interval backed off ×{next}"),
                );
                Ok(())
            }
            PlanAction::RequestPeerCheck(peer) => {
                self.gossip_own_claim(
                    ClaimBody::NodeFailure {
                        reporter: self.node_id,
                        evidence: format!(
                            "no accepted beacon within {} ms",
                            self.config.beacon.node_timeout_ms
                        ),
                    },
                    *peer,
                )
                .await
            }
        }
    }
}

/// A running mesh control-plane node.
pub struct MeshNode {
    inner: Arc<NodeInner>,
    mape: Arc<MapeKLoop>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Create a node over the UDP transport named in the configuration.
    pub async fn new(config: MeshConfig) -> Result<Self> {
        let listen = config.listen.clone().unwrap_or_else(|| "0.0.0.0:0".into());
        let transport = Arc::new(UdpTransport::bind(&listen).await?);
        Self::with_transport(config, Hooks::default(), transport).await
    }

    /// Create a node over an explicit transport and hook set (tests inject
    /// the in-memory hub and mock clock here).
    pub async fn with_transport(
        config: MeshConfig,
        hooks: Hooks,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let now_ms = hooks.clock.now_ms();

        let provider = Arc::new(CryptoProvider::initialize(
            &config.crypto,
            config.production,
            now_ms,
        )?);
        let key_manager = Arc::new(
            KeyManager::load_or_bootstrap(&provider, &hooks.persistence).await?,
        );

        let node_id = match &config.node_id {
            Some(id) => id.parse()?,
            None => match hooks.persistence.load(KEY_NODE_ID).await? {
                Some(bytes) => serde_json::from_slice(&bytes)
                    .map_err(|e| MeshError::Persistence(e.to_string()))?,
                None => NodeId::generate(),
            },
        };
        hooks
            .persistence
            .save(
                KEY_NODE_ID,
                &serde_json::to_vec(&node_id).map_err(|e| MeshError::Persistence(e.to_string()))?,
            )
            .await?;

        let peers = Arc::new(PeerTable::new(config.quorum.clone()));
        peers.rehydrate(&hooks.persistence).await?;
        let topology = Arc::new(TopologyStore::new());
        let replay = Arc::new(ReplayGuard::new());
        let router = Arc::new(Router::new(
            Arc::clone(&topology),
            Arc::clone(&peers),
            config.router.clone(),
        ));
        let channels = Arc::new(ChannelManager::new(
            node_id,
            Arc::clone(&key_manager),
            Arc::clone(&provider),
            config.crypto.session_ttl_ms,
            config.crypto.rekey_grace_ms,
        ));
        let gossip = Arc::new(GossipEngine::new(
            node_id,
            config.beacon.clone(),
            config.allow_tofu,
            Arc::clone(&peers),
            Arc::clone(&topology),
            Arc::clone(&replay),
            Arc::clone(&hooks.identity_provider),
        ));
        let quorum = Arc::new(QuorumValidator::new(
            node_id,
            Arc::clone(&peers),
            Arc::clone(&provider),
            config.quorum.clone(),
        ));

        let (delivered, _) = broadcast::channel(256);
        let pool_size = config.crypto_worker_pool_size();

        let inner = Arc::new(NodeInner {
            hooks,
            node_id,
            provider: Arc::clone(&provider),
            key_manager,
            channels,
            replay,
            peers,
            topology,
            router,
            gossip,
            quorum,
            transport,
            pending_handshakes: DashMap::new(),
            addr_index: DashMap::new(),
            handshake_stats: HandshakeStats::default(),
            churn_counter: AtomicU64::new(0),
            beacon_backoff: AtomicU32::new(1),
            self_quarantined: AtomicBool::new(false),
            delivered,
            crypto_pool: Arc::new(Semaphore::new(pool_size)),
            system: Mutex::new(sysinfo::System::new()),
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
            config,
        });

        let mape = Arc::new(MapeKLoop::new(
            node_id,
            inner.config.healing.clone(),
            Arc::clone(&inner) as Arc<dyn MonitorSource>,
            Arc::new(Arc::clone(&inner)) as Arc<dyn PlanExecutor>,
            None,
            Some(Arc::clone(&inner.hooks.persistence)),
        ));
        mape.knowledge_base()
            .rehydrate(&inner.hooks.persistence)
            .await?;

        if provider.fallback_active() {
            log_warn(
                LogCategory::System,
                "post-quantum primitives unavailable; running on bounded classical fallback",
            );
        }

        Ok(Self {
            inner,
            mape,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn local_addr(&self) -> Addr {
        self.inner.transport.local_addr()
    }

    pub fn known_peers(&self) -> Vec<NodeId> {
        self.inner.peers.known_peers()
    }

    /// Peers with live secure sessions right now.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.inner.active_peers()
    }

    /// Lifecycle state of a known peer.
    pub fn peer_state(&self, peer: &NodeId) -> Option<PeerState> {
        self.inner.peers.state(peer)
    }

    pub fn is_self_quarantined(&self) -> bool {
        self.inner.self_quarantined.load(Ordering::SeqCst)
    }

    /// Receiver of application payloads addressed to this node.
    pub fn subscribe_delivered(&self) -> broadcast::Receiver<(NodeId, Vec<u8>)> {
        self.inner.delivered.subscribe()
    }

    /// Subscribe to quorum decisions.
    pub fn subscribe_quorum(&self) -> broadcast::Receiver<QuorumEvent> {
        self.inner.quorum.subscribe()
    }

    /// Route an application payload to `dst` across the mesh.
    pub async fn send_to(&self, dst: NodeId, payload: &[u8]) -> Result<()> {
        if self.is_self_quarantined() {
            return Err(MeshError::PolicyDenied("node is self-quarantined".into()));
        }
        self.inner
            .send_data(DataFrame {
                src: self.inner.node_id,
                dst,
                hop_budget: DEFAULT_HOP_BUDGET,
                payload: payload.to_vec(),
            })
            .await
    }

    /// The route the router would take to `dst` right now.
    pub fn route_to(&self, dst: NodeId) -> Result<crate::routing::Route> {
        Ok(self.inner.router.route(self.inner.node_id, dst)?.as_ref().clone())
    }

    /// Aggregate health, as external observers should see it.
    pub fn health_check(&self) -> NodeHealth {
        let now_ms = self.inner.now_ms();
        if self.is_self_quarantined()
            || self.inner.provider.check_fallback_ttl(now_ms).is_err()
        {
            return NodeHealth::Critical;
        }
        if self.inner.provider.fallback_active()
            || self.mape.state() == crate::self_healing::LoopState::Degraded
        {
            return NodeHealth::Degraded;
        }
        if self.inner.quorum.pending_count() > 0 || !self.inner.peers.timed_out_peers(
            now_ms,
            self.inner.config.beacon.node_timeout_ms,
        )
        .is_empty()
        {
            return NodeHealth::Warning;
        }
        NodeHealth::Healthy
    }

    /// JSON status snapshot for the external admin surface.
    pub fn system_report(&self) -> serde_json::Value {
        let now_ms = self.inner.now_ms();
        let snapshot = self.inner.topology.snapshot();
        serde_json::json!({
            "node_id": self.inner.node_id.to_string(),
            "health": self.health_check(),
            "uptime_seconds": self.inner.started_at.elapsed().as_secs(),
            "epoch": self.inner.key_manager.epoch().0,
            "production": self.inner.config.production,
            "fallback_active": self.inner.provider.fallback_active(),
            "self_quarantined": self.is_self_quarantined(),
            "peers": {
                "known": self.inner.peers.known_peers().len(),
                "healthy": self.inner.peers.healthy_population(false),
                "sessions": self.inner.channels.active_peers(now_ms).len(),
            },
            "topology": {
                "nodes": snapshot.node_count(),
                "edges": snapshot.edge_count(),
                "version": snapshot.version(),
            },
            "quorum_backlog": self.inner.quorum.pending_count(),
            "healing_state": format!("{:?}", self.mape.state()),
            "timestamp_ms": now_ms,
            "generated_at": chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Spawn every component task. Idempotent only in the sense that calling
    /// it twice is a caller bug caught by the task list.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = Vec::new();
        if !self.tasks.lock().is_empty() {
            return Err(MeshError::SystemError("node already started".into()));
        }

        log_info(
            LogCategory::System,
            &format!(
                "mesh node {} starting on {} ({} / {})",
                self.inner.node_id.short(),
                self.inner.transport.local_addr(),
                self.inner.provider.kem.algorithm,
                self.inner.provider.sig.algorithm,
            ),
        );

        // Fallback is loud: gossip the claim as soon as the node is up.
        if self.inner.provider.fallback_active() {
            let inner = Arc::clone(&self.inner);
            let body = ClaimBody::FallbackActivated {
                kem: inner.provider.kem.algorithm.to_string(),
                sig: inner.provider.sig.algorithm.to_string(),
            };
            let target = inner.node_id;
            tasks.push(tokio::spawn(async move {
                if let Err(e) = inner.gossip_own_claim(body, target).await {
                    log_warn(
                        LogCategory::Quorum,
                        &format!("fallback claim gossip failed: {e}"),
                    );
                }
            }));
        }

        // Transport read loop with the bounded crypto worker pool.
        {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        received = inner.transport.recv() => {
                            let (src, bytes) = match received {
                                Ok(pair) => pair,
                                Err(_) => break,
                            };
                            let worker = Arc::clone(&inner);
                            let permit = Arc::clone(&inner.crypto_pool)
                                .acquire_owned()
                                .await;
                            let Ok(permit) = permit else { break };
                            tokio::spawn(async move {
                                worker.dispatch(src, bytes).await;
                                drop(permit);
                            });
                        }
                    }
                }
            }));
        }

        // Beacon emitter.
        {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move {
                loop {
                    let backoff = inner.beacon_backoff.load(Ordering::SeqCst).max(1);
                    let base = Duration::from_millis(
                        inner.config.beacon.beacon_interval_ms * u64::from(backoff),
                    );
                    let sleep = jittered_interval(base);
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        _ = tokio::time::sleep(sleep) => {
                            let deadline =
                                Duration::from_millis(inner.config.beacon.beacon_emit_deadline_ms);
                            let emit = tokio::time::timeout(deadline, inner.emit_beacon()).await;
                            match emit {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => log_warn(
                                    LogCategory::Beacon,
                                    &format!("beacon emission failed: {e}"),
                                ),
                                Err(_) => log_warn(
                                    LogCategory::Beacon,
                                    "beacon emission exceeded its deadline",
                                ),
                            }
                        }
                    }
                }
            }));
        }

        // Housekeeping sweeper: edges, sessions, reorder windows, claim
        // deadlines, fallback TTL.
        {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move {
                let period = Duration::from_millis(inner.config.beacon.edge_ttl_ms / 2);
                loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        _ = tokio::time::sleep(period) => {
                            let now_ms = inner.now_ms();
                            inner.topology.expire_edges(now_ms, inner.config.beacon.edge_ttl_ms);
                            inner.channels.sweep(now_ms);
                            inner.gossip.sweep(now_ms);
                            inner.quorum.sweep_deadlines(now_ms);
                            // Handshakes that never got a response are the
                            // failure signal the healing loop watches.
                            let deadline = inner.config.crypto.handshake_deadline_ms;
                            let expired: Vec<NodeId> = inner
                                .pending_handshakes
                                .iter()
                                .filter(|e| now_ms.saturating_sub(e.started_at_ms) > deadline)
                                .map(|e| *e.key())
                                .collect();
                            for peer in expired {
                                if inner.pending_handshakes.remove(&peer).is_some() {
                                    inner.handshake_stats.record_failure(peer);
                                }
                            }
                            if inner.provider.check_fallback_ttl(now_ms).is_err() {
                                inner.self_quarantine("fallback ttl expired");
                            }
                        }
                    }
                }
            }));
        }

        // Churn accounting for the monitor.
        {
            let inner = Arc::clone(&self.inner);
            let mut deltas = self.inner.topology.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        delta = deltas.recv() => match delta {
                            Ok(TopologyDelta::EdgeAdded { .. })
                            | Ok(TopologyDelta::EdgeRemoved { .. }) => {
                                inner.churn_counter.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(TopologyDelta::NodeEvicted { .. }) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            }));
        }

        // Quorum decision consumer.
        {
            let inner = Arc::clone(&self.inner);
            let mut events = self.inner.quorum.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(QuorumEvent::ClaimAccepted { target, body, .. }) => {
                                inner.apply_accepted_claim(target, body).await;
                            }
                            Ok(QuorumEvent::ClaimRejected { .. }) => {
                                metrics::counter!("mesh_claims_rejected_total", 1);
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            }));
        }

        // Scheduled KEM rotation.
        {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move {
                let period = Duration::from_millis(inner.config.crypto.key_rotation_interval_ms);
                loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        _ = tokio::time::sleep(period) => {
                            match inner.key_manager.rotate_kem(&inner.provider, inner.now_ms()) {
                                Ok(epoch) => {
                                    let _ = inner
                                        .key_manager
                                        .persist(&inner.hooks.persistence)
                                        .await;
                                    log_info(
                                        LogCategory::SecureChannel,
                                        &format!("scheduled rotation; epoch now {epoch}"),
                                    );
                                    let _ = inner.emit_beacon().await;
                                }
                                Err(e) => log_error(
                                    LogCategory::SecureChannel,
                                    &format!("scheduled rotation failed: {e}"),
                                ),
                            }
                        }
                    }
                }
            }));
        }

        // MAPE-K loop tick.
        {
            let inner = Arc::clone(&self.inner);
            let mape = Arc::clone(&self.mape);
            tasks.push(tokio::spawn(async move {
                let period = inner.config.mape_k_interval();
                loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        _ = tokio::time::sleep(period) => {
                            mape.tick(inner.now_ms()).await;
                        }
                    }
                }
            }));
        }

        *self.tasks.lock() = tasks;

        // First beacon goes out immediately so bootstrap peers learn us.
        self.inner.emit_beacon().await?;
        Ok(())
    }

    /// Cooperative shutdown: cancel tasks, then persist durable state.
    pub async fn shutdown(&self) {
        log_info(
            LogCategory::System,
            &format!("mesh node {} shutting down", self.inner.node_id.short()),
        );
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        let _ = self
            .mape
            .knowledge_base()
            .persist(&self.inner.hooks.persistence)
            .await;
        let _ = self.inner.peers.persist(&self.inner.hooks.persistence).await;
        let _ = self
            .inner
            .key_manager
            .persist(&self.inner.hooks.persistence)
            .await;
    }

    /// Solicit mesh endorsement of a failure claim against `peer` — the
    /// operator-facing path to the `RequestPeerCheck` plan action.
    pub async fn propose_peer_check(&self, peer: NodeId) -> Result<()> {
        PlanExecutor::execute(&self.inner, &PlanAction::RequestPeerCheck(peer)).await
    }

    /// Operator access to the healing loop (clear DEGRADED, inspect state).
    pub fn healing(&self) -> &Arc<MapeKLoop> {
        &self.mape
    }
}
