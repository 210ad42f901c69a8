//! # External Collaborator Hooks
//!
//! The control plane core deliberately excludes admin APIs, metric scrapers,
//! durable stores, and identity backends. Each of those collaborators reaches
//! the core through one of the small interfaces below, and every interface
//! ships with an in-process default so a node can run self-contained.
//!
//! ## Hook Inventory
//!
//! - [`ClockHook`] — the only source of protocol time; injectable for tests
//! - [`TelemetryHook`] — non-blocking, best-effort event emission
//! - [`PersistenceHook`] — opaque key/value storage for identity and KB snapshots
//! - [`IdentityProviderHook`] — SPIFFE-style workload identity resolution
//! - [`PolicyHook`] — allow/deny/audit decisions at quarantine and revocation
//!
//! Hook calls that may block (persistence, identity, policy) are async and
//! therefore suspension points; no component holds a lock across them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::identity::{NodeId, WorkloadIdentity};
use crate::Result;

/// Injectable wall clock. All protocol timestamps flow through this.
pub trait ClockHook: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Best-effort telemetry emission. Implementations must not block.
pub trait TelemetryHook: Send + Sync {
    /// Emit a named event with labels and a numeric value.
    fn emit(&self, event: &str, labels: &[(&'static str, String)], value: f64);
}

/// Opaque key/value persistence used for identity material, the knowledge
/// base snapshot, and the known-peer set.
#[async_trait]
pub trait PersistenceHook: Send + Sync {
    /// Load the bytes stored under `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Store `bytes` under `key`, replacing any previous value.
    async fn save(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Resolved identity for a node, as reported by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// SPIFFE-style workload identity
    pub identity: WorkloadIdentity,
    /// Pinned long-term signing public key, when the provider knows one
    pub signing_pubkey: Option<Vec<u8>>,
}

/// SPIFFE-style identity resolution, consulted when validating introduction
/// claims for previously unknown peers.
#[async_trait]
pub trait IdentityProviderHook: Send + Sync {
    /// Resolve the identity record for a node, if the provider knows it.
    async fn resolve(&self, node_id: &NodeId) -> Option<IdentityRecord>;
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyDecision {
    /// Proceed with the action
    Allow,
    /// Refuse the action
    Deny,
    /// Proceed, but record the action for audit
    Audit,
}

/// Authorization check invoked before quarantine and revocation actions.
#[async_trait]
pub trait PolicyHook: Send + Sync {
    /// Evaluate whether `action` may be taken against `peer`.
    async fn evaluate(&self, peer: &NodeId, action: &str) -> PolicyDecision;
}

/// Bundle of hook implementations handed to the node at construction.
#[derive(Clone)]
pub struct Hooks {
    pub clock: Arc<dyn ClockHook>,
    pub telemetry: Arc<dyn TelemetryHook>,
    pub persistence: Arc<dyn PersistenceHook>,
    pub identity_provider: Arc<dyn IdentityProviderHook>,
    pub policy: Arc<dyn PolicyHook>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            telemetry: Arc::new(NoopTelemetry),
            persistence: Arc::new(MemoryPersistence::new()),
            identity_provider: Arc::new(StaticIdentityProvider::default()),
            policy: Arc::new(AllowAllPolicy),
        }
    }
}

/// Wall-clock backed [`ClockHook`].
pub struct SystemClock;

impl ClockHook for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Deterministic clock for tests and simulations. Starts at an arbitrary
/// fixed origin and only moves when advanced.
pub struct MockClock {
    now_ms: AtomicU64,
}

impl MockClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Advance the clock by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Jump the clock to an absolute timestamp.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl ClockHook for MockClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Telemetry sink that forwards to the `metrics` facade and otherwise
/// discards events. The facade keeps counters cheap even with no recorder
/// installed.
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {
    fn emit(&self, event: &str, _labels: &[(&'static str, String)], value: f64) {
        metrics::gauge!(format!("mesh_{event}"), value);
    }
}

/// In-memory [`PersistenceHook`]; the default when no durable store is wired.
pub struct MemoryPersistence {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceHook for MemoryPersistence {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Identity provider backed by a fixed map, suitable for lab meshes where
/// the roster is known up front.
#[derive(Default)]
pub struct StaticIdentityProvider {
    records: HashMap<NodeId, IdentityRecord>,
}

impl StaticIdentityProvider {
    pub fn new(records: HashMap<NodeId, IdentityRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl IdentityProviderHook for StaticIdentityProvider {
    async fn resolve(&self, node_id: &NodeId) -> Option<IdentityRecord> {
        self.records.get(node_id).cloned()
    }
}

/// Policy hook that allows everything; the default for lab meshes.
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyHook for AllowAllPolicy {
    async fn evaluate(&self, _peer: &NodeId, _action: &str) -> PolicyDecision {
        PolicyDecision::Allow
    }
}
