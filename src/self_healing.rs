//! # MAPE-K Self-Healing Loop
//!
//! The autonomic controller: **M**onitor → **A**nalyze → **P**lan →
//! **E**xecute → **K**nowledge, one serialized logical loop per node.
//!
//! ## Phases
//!
//! - **Monitor** samples session health, topology churn, PQC status, quorum
//!   backlog, and local resource pressure into a bounded observation ring
//! - **Analyze** runs threshold and pattern detectors (plus an optional ML
//!   anomaly scorer) over the observation window; each firing detector
//!   yields a `Diagnosis`
//! - **Plan** consults the knowledge base for a proven plan
//!   (confidence ≥ 0.6) before synthesizing one from the fixed catalogue,
//!   cheapest action first
//! - **Execute** runs plan steps through the owning components with per-step
//!   timeouts and idempotency keys
//! - **Knowledge** folds each outcome back into the per-pattern confidence
//!   (EWMA, α = 0.3 on success, α = 0.5 on failure) and periodically
//!   persists a snapshot through the persistence hook
//!
//! ## Degradation
//!
//! A fatal phase error moves the loop to DEGRADED: monitoring continues but
//! Plan/Execute are suppressed until an operator clears it or the cooldown
//! elapses. Repeated `RotateKemKey` failures force DEGRADED — a node that
//! cannot rotate its keys must not keep healing around that fact.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::HealingConfig;
use crate::hooks::PersistenceHook;
use crate::identity::NodeId;
use crate::logging::{log_error, log_info, log_warn, LogCategory};
use crate::{MeshError, Result};

/// Persistence key for the knowledge-base snapshot.
pub const KEY_KB_SNAPSHOT: &str = "kb/knowledge_base_snapshot";

/// Consecutive key-rotation failures that force DEGRADED.
const ROTATE_FAILURE_LIMIT: u32 = 3;

/// One normalized sample of the node's world, appended per Monitor phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observation {
    pub at_ms: u64,
    /// Active secure sessions
    pub session_count: usize,
    /// Handshake failures / attempts over the sampling window
    pub handshake_failure_rate: f64,
    /// Per-peer handshake failures over the window
    pub per_peer_handshake_failures: HashMap<NodeId, u32>,
    /// p95 handshake latency over the window, milliseconds
    pub handshake_latency_p95_ms: f64,
    /// Edges added + removed per minute
    pub topology_churn_per_min: f64,
    pub fallback_active: bool,
    pub fallback_remaining_ms: u64,
    /// Claims still awaiting endorsements
    pub quorum_backlog: usize,
    /// Peers whose beacons have timed out
    pub timed_out_peers: Vec<NodeId>,
    /// Local resource pressure via the external hook
    pub cpu_percent: f64,
    pub memory_used_mb: u64,
}

impl Observation {
    /// Flatten into the vector handed to the optional ML detector.
    pub fn as_vector(&self) -> Vec<f64> {
        vec![
            self.session_count as f64,
            self.handshake_failure_rate,
            self.handshake_latency_p95_ms,
            self.topology_churn_per_min,
            if self.fallback_active { 1.0 } else { 0.0 },
            self.quorum_backlog as f64,
            self.timed_out_peers.len() as f64,
            self.cpu_percent,
            self.memory_used_mb as f64,
        ]
    }
}

/// Bounded ring of observations; oldest evicted first.
pub struct ObservationRing {
    ring: Mutex<VecDeque<Observation>>,
    capacity: usize,
}

impl ObservationRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, observation: Observation) {
        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(observation);
    }

    /// Observations inside the trailing `window_ms` as of `now_ms`.
    pub fn window(&self, now_ms: u64, window_ms: u64) -> Vec<Observation> {
        self.ring
            .lock()
            .iter()
            .filter(|o| now_ms.saturating_sub(o.at_ms) <= window_ms)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

/// A firing detector's conclusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    /// Stable pattern key into the knowledge base
    pub pattern: String,
    pub symptom: String,
    /// The peer suspected at fault, when the pattern names one
    pub suspected_root: Option<NodeId>,
    pub confidence: f64,
}

/// Optional ML anomaly scorer. Absence is a first-class state, not an
/// error: an unwired detector simply contributes no signal.
pub trait AnomalyDetector: Send + Sync {
    /// Anomaly score in `[0, 1]` for one observation vector.
    fn score(&self, observation_vector: &[f64]) -> f64;
}

/// One step of a recovery plan, total-ordered by cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanAction {
    /// Invalidate the route cache and let Dijkstra re-run
    RecomputeRoutes,
    /// Drop and re-handshake the session with a peer
    RestartPqcSession(NodeId),
    /// Back off beacon emission under congestion
    ReduceBeaconRate,
    /// Emit evidence soliciting endorsements of a failure claim
    RequestPeerCheck(NodeId),
    /// Rotate our KEM key (bumps the epoch, broadcasts fresh keys)
    RotateKemKey,
    /// Quarantine locally and propose a revocation claim
    QuarantinePeer(NodeId),
}

impl PlanAction {
    /// Relative execution cost; plans run cheapest-first.
    pub fn cost(&self) -> u32 {
        match self {
            PlanAction::RecomputeRoutes => 1,
            PlanAction::RestartPqcSession(_) => 2,
            PlanAction::ReduceBeaconRate => 3,
            PlanAction::RequestPeerCheck(_) => 4,
            PlanAction::RotateKemKey => 5,
            PlanAction::QuarantinePeer(_) => 6,
        }
    }
}

/// A recovery plan bound to the diagnosis that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Idempotency key: pattern + suspected root
    pub id: String,
    pub pattern: String,
    pub actions: Vec<PlanAction>,
}

/// Structured result of executing one plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub success: bool,
    pub latency_ms: u64,
    pub side_effects: Vec<String>,
}

/// Knowledge-base entry for one diagnostic pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub pattern: String,
    pub diagnosis: String,
    pub plan: Vec<PlanAction>,
    /// Last outcome, summarized
    pub outcome: String,
    /// EWMA-updated success confidence in [0, 1]
    pub confidence: f64,
    pub updated_at_ms: u64,
}

/// The K in MAPE-K: what has worked before, and how much we trust it.
pub struct KnowledgeBase {
    entries: RwLock<HashMap<String, KnowledgeEntry>>,
}

impl Default for KnowledgeBase {
    fn default() -> Self {
        Self::new()
    }
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, pattern: &str) -> Option<KnowledgeEntry> {
        self.entries.read().get(pattern).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Fold an execution outcome into the pattern's confidence.
    pub fn record_outcome(
        &self,
        diagnosis: &Diagnosis,
        plan: &Plan,
        outcome: &PlanOutcome,
        config: &HealingConfig,
        now_ms: u64,
    ) -> f64 {
        let mut entries = self.entries.write();
        let entry = entries
            .entry(plan.pattern.clone())
            .or_insert_with(|| KnowledgeEntry {
                pattern: plan.pattern.clone(),
                diagnosis: diagnosis.symptom.clone(),
                plan: plan.actions.clone(),
                outcome: String::new(),
                confidence: 0.5,
                updated_at_ms: now_ms,
            });
        let (alpha, target) = if outcome.success {
            (config.kb_alpha_success, 1.0)
        } else {
            (config.kb_alpha_failure, 0.0)
        };
        entry.confidence = alpha * target + (1.0 - alpha) * entry.confidence;
        entry.plan = plan.actions.clone();
        entry.outcome = if outcome.success {
            format!("success in {} ms", outcome.latency_ms)
        } else {
            format!("failure after {} ms", outcome.latency_ms)
        };
        entry.updated_at_ms = now_ms;
        entry.confidence
    }

    /// Persist a snapshot through the hook. Atomic from readers' view: the
    /// serialized bytes come from one consistent read.
    pub async fn persist(&self, persistence: &Arc<dyn PersistenceHook>) -> Result<()> {
        let snapshot: Vec<KnowledgeEntry> = self.entries.read().values().cloned().collect();
        let bytes =
            serde_json::to_vec(&snapshot).map_err(|e| MeshError::Persistence(e.to_string()))?;
        persistence.save(KEY_KB_SNAPSHOT, &bytes).await
    }

    /// Best-effort rehydration; an empty KB is a valid start state.
    pub async fn rehydrate(&self, persistence: &Arc<dyn PersistenceHook>) -> Result<usize> {
        let Some(bytes) = persistence.load(KEY_KB_SNAPSHOT).await? else {
            return Ok(0);
        };
        let snapshot: Vec<KnowledgeEntry> =
            serde_json::from_slice(&bytes).map_err(|e| MeshError::Persistence(e.to_string()))?;
        let mut entries = self.entries.write();
        let count = snapshot.len();
        for entry in snapshot {
            entries.insert(entry.pattern.clone(), entry);
        }
        Ok(count)
    }
}

/// Where the Monitor phase gets its samples. Implemented by the node
/// orchestrator; test rigs provide synthetic worlds.
pub trait MonitorSource: Send + Sync {
    fn sample(&self, now_ms: u64) -> Observation;
}

/// Where Execute sends its steps. Implemented by the node orchestrator,
/// which routes each action through the owning component.
#[async_trait]
pub trait PlanExecutor: Send + Sync {
    async fn execute(&self, action: &PlanAction) -> Result<()>;
}

/// Loop phase / health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Idle,
    Monitor,
    Analyze,
    Plan,
    Execute,
    Learn,
    /// Monitoring continues; Plan/Execute suppressed until cleared
    Degraded,
}

struct LoopStatus {
    state: LoopState,
    degraded_since_ms: Option<u64>,
    rotate_failures: u32,
    /// Idempotency ledger: plan id → last executed
    recent_plans: HashMap<String, u64>,
    last_persist_ms: u64,
}

/// Everything one `tick` did, for observers and tests.
#[derive(Debug, Default)]
pub struct TickReport {
    pub diagnoses: Vec<Diagnosis>,
    pub executed: Vec<(Plan, PlanOutcome)>,
    pub state: Option<LoopState>,
}

/// The loop itself. `tick` is serialized by construction: the orchestrator
/// drives it from a single task on a fixed interval.
pub struct MapeKLoop {
    self_id: NodeId,
    config: HealingConfig,
    ring: ObservationRing,
    kb: KnowledgeBase,
    monitor: Arc<dyn MonitorSource>,
    executor: Arc<dyn PlanExecutor>,
    ml_detector: Option<Arc<dyn AnomalyDetector>>,
    persistence_hook: Option<Arc<dyn PersistenceHook>>,
    status: Mutex<LoopStatus>,
}

impl MapeKLoop {
    pub fn new(
        self_id: NodeId,
        config: HealingConfig,
        monitor: Arc<dyn MonitorSource>,
        executor: Arc<dyn PlanExecutor>,
        ml_detector: Option<Arc<dyn AnomalyDetector>>,
        persistence_hook: Option<Arc<dyn PersistenceHook>>,
    ) -> Self {
        let ring = ObservationRing::new(config.observation_ring_capacity);
        Self {
            self_id,
            config,
            ring,
            kb: KnowledgeBase::new(),
            monitor,
            executor,
            ml_detector,
            persistence_hook,
            status: Mutex::new(LoopStatus {
                state: LoopState::Idle,
                degraded_since_ms: None,
                rotate_failures: 0,
                recent_plans: HashMap::new(),
                last_persist_ms: 0,
            }),
        }
    }

    pub fn knowledge_base(&self) -> &KnowledgeBase {
        &self.kb
    }

    pub fn observations(&self) -> &ObservationRing {
        &self.ring
    }

    pub fn state(&self) -> LoopState {
        self.status.lock().state
    }

    /// Operator hook: clear DEGRADED immediately.
    pub fn clear_degraded(&self) {
        let mut status = self.status.lock();
        if status.state == LoopState::Degraded {
            status.state = LoopState::Idle;
            status.degraded_since_ms = None;
            status.rotate_failures = 0;
            log_info(LogCategory::Healing, "degraded state cleared by operator");
        }
    }

    /// Signal queue overflow on the plan-execution path; the loop stays in
    /// DEGRADED rather than heal against a saturated executor.
    pub fn enter_degraded(&self, now_ms: u64, reason: &str) {
        let mut status = self.status.lock();
        if status.state != LoopState::Degraded {
            log_error(
                LogCategory::Healing,
                &format!("loop entering DEGRADED: {reason}"),
            );
            status.state = LoopState::Degraded;
            status.degraded_since_ms = Some(now_ms);
        }
    }

    /// One full M-A-P-E-K cycle. Serialized (no re-entrance); a long-running
    /// plan belongs to this tick, while the next tick's Monitor still runs
    /// because observations land in the shared ring.
    pub async fn tick(&self, now_ms: u64) -> TickReport {
        let mut report = TickReport::default();

        // M — always, even degraded.
        self.set_state(LoopState::Monitor);
        let observation = self.monitor.sample(now_ms);
        self.ring.push(observation);

        // DEGRADED: check cooldown, then stop before Analyze can plan.
        if self.degraded_gate(now_ms) {
            self.set_state(LoopState::Degraded);
            report.state = Some(LoopState::Degraded);
            self.maybe_persist(now_ms).await;
            return report;
        }

        // A
        self.set_state(LoopState::Analyze);
        let window = self
            .ring
            .window(now_ms, self.config.observation_window_ms);
        let diagnoses = self.analyze(&window);
        report.diagnoses = diagnoses.clone();

        if diagnoses.is_empty() {
            self.set_state(LoopState::Idle);
            report.state = Some(LoopState::Idle);
            self.maybe_persist(now_ms).await;
            return report;
        }

        // P + E + K, per diagnosis, cheapest plans first.
        for diagnosis in diagnoses {
            self.set_state(LoopState::Plan);
            let Some(plan) = self.plan(&diagnosis) else {
                continue;
            };
            if !self.admit_plan(&plan, now_ms) {
                continue;
            }

            self.set_state(LoopState::Execute);
            let outcome = self.execute(&plan, now_ms).await;

            self.set_state(LoopState::Learn);
            let confidence =
                self.kb
                    .record_outcome(&diagnosis, &plan, &outcome, &self.config, now_ms);
            if !outcome.success {
                log_warn(
                    LogCategory::Healing,
                    &format!(
                        "plan {} failed; kb confidence for {} now {confidence:.2}",
                        plan.id, plan.pattern
                    ),
                );
            }
            report.executed.push((plan, outcome));

            if self.status.lock().state == LoopState::Degraded {
                break;
            }
        }

        let final_state = {
            let status = self.status.lock();
            status.state
        };
        if final_state != LoopState::Degraded {
            self.set_state(LoopState::Idle);
            report.state = Some(LoopState::Idle);
        } else {
            report.state = Some(LoopState::Degraded);
        }
        self.maybe_persist(now_ms).await;
        report
    }

    /// True while DEGRADED holds (cooldown not yet elapsed).
    fn degraded_gate(&self, now_ms: u64) -> bool {
        let mut status = self.status.lock();
        if status.state != LoopState::Degraded {
            return false;
        }
        match status.degraded_since_ms {
            Some(since) if now_ms.saturating_sub(since) >= self.config.degraded_cooldown_ms => {
                status.state = LoopState::Idle;
                status.degraded_since_ms = None;
                status.rotate_failures = 0;
                log_info(LogCategory::Healing, "degraded cooldown elapsed; resuming");
                false
            }
            _ => true,
        }
    }

    /// A — run every detector over the window.
    fn analyze(&self, window: &[Observation]) -> Vec<Diagnosis> {
        let mut diagnoses = Vec::new();
        let Some(latest) = window.last() else {
            return diagnoses;
        };

        // Fallback expiry outranks everything: the node must quarantine
        // itself now.
        if latest.fallback_active && latest.fallback_remaining_ms == 0 {
            diagnoses.push(Diagnosis {
                pattern: "fallback_ttl_expired".into(),
                symptom: "classical fallback exceeded its hard TTL".into(),
                suspected_root: None,
                confidence: 1.0,
            });
        } else if latest.fallback_active {
            diagnoses.push(Diagnosis {
                pattern: "pqc_fallback_active".into(),
                symptom: format!(
                    "running on classical crypto, {} s remaining",
                    latest.fallback_remaining_ms / 1_000
                ),
                suspected_root: None,
                confidence: 1.0,
            });
        }

        // Pattern detector: repeated handshake failures against one peer.
        let mut per_peer: HashMap<NodeId, u32> = HashMap::new();
        for observation in window {
            for (peer, failures) in &observation.per_peer_handshake_failures {
                *per_peer.entry(*peer).or_default() += failures;
            }
        }
        for (peer, failures) in per_peer {
            if failures >= 3 {
                diagnoses.push(Diagnosis {
                    pattern: "handshake_failure_burst".into(),
                    symptom: format!("{failures} handshake failures toward {}", peer.short()),
                    suspected_root: Some(peer),
                    confidence: (0.5 + 0.1 * f64::from(failures)).min(0.95),
                });
            }
        }

        // Threshold detectors.
        if latest.handshake_failure_rate > 0.5 {
            diagnoses.push(Diagnosis {
                pattern: "handshake_failure_rate_high".into(),
                symptom: format!(
                    "aggregate handshake failure rate {:.2}",
                    latest.handshake_failure_rate
                ),
                suspected_root: None,
                confidence: 0.7,
            });
        }
        for peer in &latest.timed_out_peers {
            diagnoses.push(Diagnosis {
                pattern: "peer_timeout".into(),
                symptom: format!("no accepted beacon from {} within timeout", peer.short()),
                suspected_root: Some(*peer),
                confidence: 0.8,
            });
        }
        if latest.topology_churn_per_min > 30.0 {
            diagnoses.push(Diagnosis {
                pattern: "topology_churn".into(),
                symptom: format!(
                    "{:.0} edge changes per minute",
                    latest.topology_churn_per_min
                ),
                suspected_root: None,
                confidence: 0.6,
            });
        }
        if latest.quorum_backlog > 16 {
            diagnoses.push(Diagnosis {
                pattern: "quorum_backlog".into(),
                symptom: format!("{} claims awaiting endorsements", latest.quorum_backlog),
                suspected_root: None,
                confidence: 0.6,
            });
        }
        if latest.cpu_percent > 90.0 {
            diagnoses.push(Diagnosis {
                pattern: "resource_pressure".into(),
                symptom: format!("cpu at {:.0}%", latest.cpu_percent),
                suspected_root: None,
                confidence: 0.6,
            });
        }

        // Optional ML detector; unwired means no signal.
        if let Some(detector) = &self.ml_detector {
            let score = detector.score(&latest.as_vector());
            if score > 0.8 {
                diagnoses.push(Diagnosis {
                    pattern: "ml_anomaly".into(),
                    symptom: format!("anomaly score {score:.2}"),
                    suspected_root: None,
                    confidence: score,
                });
            }
        }

        diagnoses
    }

    /// P — reuse a trusted KB plan or synthesize from the catalogue.
    fn plan(&self, diagnosis: &Diagnosis) -> Option<Plan> {
        let id = match &diagnosis.suspected_root {
            Some(root) => format!("{}:{}", diagnosis.pattern, root.short()),
            None => diagnosis.pattern.clone(),
        };

        if let Some(entry) = self.kb.lookup(&diagnosis.pattern) {
            if entry.confidence >= self.config.kb_reuse_confidence && !entry.plan.is_empty() {
                let mut actions = entry.plan.clone();
                actions.sort_by_key(|a| a.cost());
                return Some(Plan {
                    id,
                    pattern: diagnosis.pattern.clone(),
                    actions: rebind_actions(actions, diagnosis.suspected_root),
                });
            }
        }

        let mut actions = match (diagnosis.pattern.as_str(), diagnosis.suspected_root) {
            // Self-quarantine: the node takes itself out of the mesh.
            ("fallback_ttl_expired", _) => vec![PlanAction::QuarantinePeer(self.self_id)],
            ("pqc_fallback_active", _) => Vec::new(), // observable, not healable locally
            ("handshake_failure_burst", Some(peer)) => {
                vec![
                    PlanAction::RestartPqcSession(peer),
                    PlanAction::RequestPeerCheck(peer),
                ]
            }
            ("handshake_failure_rate_high", _) => vec![PlanAction::RotateKemKey],
            ("peer_timeout", Some(peer)) => vec![
                PlanAction::RequestPeerCheck(peer),
                PlanAction::RecomputeRoutes,
            ],
            ("topology_churn", _) => vec![PlanAction::RecomputeRoutes],
            ("quorum_backlog", _) => vec![PlanAction::ReduceBeaconRate],
            ("resource_pressure", _) => vec![PlanAction::ReduceBeaconRate],
            ("ml_anomaly", _) => vec![PlanAction::RecomputeRoutes],
            _ => Vec::new(),
        };
        if actions.is_empty() {
            return None;
        }
        actions.sort_by_key(|a| a.cost());
        Some(Plan {
            id,
            pattern: diagnosis.pattern.clone(),
            actions,
        })
    }

    /// Idempotency gate: the same plan id runs at most once per two ticks.
    fn admit_plan(&self, plan: &Plan, now_ms: u64) -> bool {
        let mut status = self.status.lock();
        let window = self.config.tick_interval_ms * 2;
        status
            .recent_plans
            .retain(|_, at| now_ms.saturating_sub(*at) < window);
        if status.recent_plans.contains_key(&plan.id) {
            return false;
        }
        status.recent_plans.insert(plan.id.clone(), now_ms);
        true
    }

    /// E — run the steps through the executor with per-step timeouts.
    async fn execute(&self, plan: &Plan, now_ms: u64) -> PlanOutcome {
        let started = std::time::Instant::now();
        let mut side_effects = Vec::new();
        let mut success = true;

        for action in &plan.actions {
            let step = tokio::time::timeout(
                std::time::Duration::from_millis(self.config.step_timeout_ms),
                self.executor.execute(action),
            )
            .await;
            match step {
                Ok(Ok(())) => {
                    side_effects.push(format!("{action:?}"));
                    if matches!(action, PlanAction::RotateKemKey) {
                        self.status.lock().rotate_failures = 0;
                    }
                }
                Ok(Err(MeshError::Backpressure(reason))) => {
                    success = false;
                    self.enter_degraded(now_ms, &format!("plan queue backpressure: {reason}"));
                    break;
                }
                Ok(Err(e)) => {
                    success = false;
                    side_effects.push(format!("{action:?} failed: {e}"));
                    if matches!(action, PlanAction::RotateKemKey) {
                        let mut status = self.status.lock();
                        status.rotate_failures += 1;
                        if status.rotate_failures >= ROTATE_FAILURE_LIMIT {
                            drop(status);
                            self.enter_degraded(now_ms, "repeated RotateKemKey failure");
                        }
                    }
                    break;
                }
                Err(_) => {
                    success = false;
                    side_effects.push(format!("{action:?} timed out"));
                    break;
                }
            }
        }

        metrics::counter!(
            "mesh_healing_plans_total",
            1,
            "outcome" => if success { "success" } else { "failure" }
        );
        PlanOutcome {
            success,
            latency_ms: started.elapsed().as_millis() as u64,
            side_effects,
        }
    }

    /// Advance the phase. DEGRADED is sticky: only the cooldown or the
    /// operator clears it, never an ordinary phase transition.
    fn set_state(&self, state: LoopState) {
        let mut status = self.status.lock();
        if status.state != LoopState::Degraded {
            status.state = state;
        }
    }

    async fn maybe_persist(&self, now_ms: u64) {
        let due = {
            let mut status = self.status.lock();
            if now_ms.saturating_sub(status.last_persist_ms) >= self.config.kb_persist_interval_ms {
                status.last_persist_ms = now_ms;
                true
            } else {
                false
            }
        };
        if due {
            if let Some(persistence) = &self.persistence_hook {
                if let Err(e) = self.kb.persist(persistence).await {
                    log_warn(
                        LogCategory::Healing,
                        &format!("kb snapshot persist failed: {e}"),
                    );
                }
            }
        }
    }
}

/// Re-target stored plan actions at the current diagnosis root; a reused
/// plan for `handshake_failure_burst` must restart the session with the peer
/// failing *now*, not the one recorded last month.
fn rebind_actions(actions: Vec<PlanAction>, root: Option<NodeId>) -> Vec<PlanAction> {
    let Some(root) = root else {
        return actions;
    };
    actions
        .into_iter()
        .map(|action| match action {
            PlanAction::RestartPqcSession(_) => PlanAction::RestartPqcSession(root),
            PlanAction::RequestPeerCheck(_) => PlanAction::RequestPeerCheck(root),
            PlanAction::QuarantinePeer(_) => PlanAction::QuarantinePeer(root),
            other => other,
        })
        .collect()
}
