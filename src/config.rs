//! # Configuration Management
//!
//! Every tunable of the control plane lives here, grouped per component, with
//! defaults matching the protocol's reference values. Configuration is
//! read-only after startup: the node validates once, then shares an immutable
//! copy with every task.
//!
//! Sources are layered in increasing precedence:
//!
//! 1. Struct defaults (this file)
//! 2. Optional TOML/JSON file (`--config`)
//! 3. Environment variables (`PRODUCTION_MODE`, `ALLOW_MOCK_PQC`,
//!    `KEM_ALGORITHM`, `SIG_ALGORITHM`)
//! 4. CLI flags (applied by the binary)
//!
//! Invalid configuration is fatal at startup (exit code 64); nothing here is
//! re-validated on the hot path.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto_protocols::{KemAlgorithm, SigAlgorithm};
use crate::{MeshError, Result};

/// Beacon and gossip tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Beacon emission period in milliseconds (jittered ±10%)
    pub beacon_interval_ms: u64,
    /// Edge expiry; edges older than this are swept (default 3× beacon interval)
    pub edge_ttl_ms: u64,
    /// Node eviction timeout (default 5× beacon interval)
    pub node_timeout_ms: u64,
    /// Maximum tolerated sender clock skew in milliseconds
    pub clock_skew_max_ms: u64,
    /// Per-sender accepted-beacon budget per second
    pub beacon_rate_limit_per_sec: u32,
    /// EWMA smoothing factor for observed RTT edge costs
    pub rtt_ewma_alpha: f64,
    /// Out-of-order beacon buffer slots per peer
    pub reorder_window_slots: usize,
    /// Lifetime of a buffered out-of-order beacon in milliseconds
    pub reorder_window_ttl_ms: u64,
    /// Duplicate-suppression lifetime for gossiped claims in milliseconds
    pub claim_seen_ttl_ms: u64,
    /// Beacon emit deadline in milliseconds
    pub beacon_emit_deadline_ms: u64,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            beacon_interval_ms: 10_000,
            edge_ttl_ms: 30_000,     // 3× beacon interval
            node_timeout_ms: 50_000, // 5× beacon interval
            clock_skew_max_ms: 30_000,
            beacon_rate_limit_per_sec: 10,
            rtt_ewma_alpha: 0.2,
            reorder_window_slots: 4,
            reorder_window_ttl_ms: 1_000,
            claim_seen_ttl_ms: 600_000, // 10 minutes
            beacon_emit_deadline_ms: 1_000,
        }
    }
}

/// Cryptographic channel tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Key encapsulation algorithm (default ML-KEM-768)
    pub kem_algorithm: KemAlgorithm,
    /// Signature algorithm (default ML-DSA-65)
    pub sig_algorithm: SigAlgorithm,
    /// Established session lifetime in milliseconds
    pub session_ttl_ms: u64,
    /// Window during which pre-rotation sessions stay valid, in milliseconds
    pub rekey_grace_ms: u64,
    /// KEM key rotation period in milliseconds (rotation bumps the epoch)
    pub key_rotation_interval_ms: u64,
    /// Hard lifetime of the classical fallback before self-quarantine
    pub fallback_ttl_ms: u64,
    /// Handshake deadline in milliseconds
    pub handshake_deadline_ms: u64,
    /// Handshake retry attempts (exponential backoff 100 ms → 400 ms → 1.6 s)
    pub handshake_retry_attempts: u32,
    /// Permit mock/classical primitives; always rejected in production
    pub allow_mock_pqc: bool,
    /// Fault injection for drills: treat the PQC self-test as failed
    pub simulate_pqc_unavailable: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kem_algorithm: KemAlgorithm::MlKem768,
            sig_algorithm: SigAlgorithm::MlDsa65,
            session_ttl_ms: 3_600_000, // 1 hour
            rekey_grace_ms: 10_000,
            key_rotation_interval_ms: 3_600_000, // 1 hour
            fallback_ttl_ms: 3_600_000,          // 1 hour
            handshake_deadline_ms: 2_000,
            handshake_retry_attempts: 3,
            allow_mock_pqc: false,
            simulate_pqc_unavailable: false,
        }
    }
}

/// Quorum validation tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Claim endorsement deadline in milliseconds
    pub claim_ttl_ms: u64,
    /// Endorsement round-trip deadline in milliseconds
    pub endorsement_deadline_ms: u64,
    /// Reputation lost by signers of a contradicted claim
    pub reputation_decrement: f64,
    /// Reputation below which a peer becomes SUSPECTED
    pub reputation_floor_suspect: f64,
    /// Reputation below which a peer becomes QUARANTINED
    pub reputation_floor_quarantine: f64,
    /// Per-reporter new-claim budget per second
    pub claim_rate_limit_per_sec: u32,
    /// Per-reporter endorsement budget per second
    pub endorsement_rate_limit_per_sec: u32,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            claim_ttl_ms: 60_000,
            endorsement_deadline_ms: 5_000,
            reputation_decrement: 0.1,
            reputation_floor_suspect: 0.2,
            reputation_floor_quarantine: 0.05,
            claim_rate_limit_per_sec: 1,
            endorsement_rate_limit_per_sec: 10,
        }
    }
}

/// Router tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Additive cost penalty in microseconds for non-HEALTHY intermediates
    pub unhealthy_penalty_us: u32,
    /// Maximum failover recomputations per send
    pub max_failover_hops: u32,
    /// Dijkstra deadline in milliseconds; exceeding it raises an alert
    pub dijkstra_deadline_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            unhealthy_penalty_us: 5_000, // +5 ms
            max_failover_hops: 3,
            dijkstra_deadline_ms: 50,
        }
    }
}

/// MAPE-K loop tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    /// Loop tick period in milliseconds
    pub tick_interval_ms: u64,
    /// Analysis window over the observation ring in milliseconds
    pub observation_window_ms: u64,
    /// Observation ring capacity
    pub observation_ring_capacity: usize,
    /// Knowledge-base snapshot persistence period in milliseconds
    pub kb_persist_interval_ms: u64,
    /// Minimum KB confidence to reuse a stored plan
    pub kb_reuse_confidence: f64,
    /// EWMA factor applied to KB confidence on success
    pub kb_alpha_success: f64,
    /// EWMA factor applied to KB confidence on failure
    pub kb_alpha_failure: f64,
    /// DEGRADED cooldown before Plan/Execute resume, in milliseconds
    pub degraded_cooldown_ms: u64,
    /// Per-plan-step execution timeout in milliseconds
    pub step_timeout_ms: u64,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            observation_window_ms: 60_000,
            observation_ring_capacity: 256,
            kb_persist_interval_ms: 300_000, // 5 minutes
            kb_reuse_confidence: 0.6,
            kb_alpha_success: 0.3,
            kb_alpha_failure: 0.5,
            degraded_cooldown_ms: 60_000,
            step_timeout_ms: 5_000,
        }
    }
}

/// Bounded queue sizes. Every inter-component channel is bounded; overflow
/// behavior is component-specific (drop-oldest, drop-lowest-reputation, or
/// DEGRADED).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub beacon_rx_queue: usize,
    pub claim_queue: usize,
    pub plan_queue: usize,
    pub topology_mutation_queue: usize,
    pub crypto_job_queue: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            beacon_rx_queue: 1_024,
            claim_queue: 512,
            plan_queue: 64,
            topology_mutation_queue: 1_024,
            crypto_job_queue: 256,
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MeshConfig {
    /// Fixed node id (hex); minted at first boot when absent
    pub node_id: Option<String>,
    /// Listen address for the UDP transport
    pub listen: Option<String>,
    /// Bootstrap peer addresses
    pub peers: Vec<String>,
    /// Production mode: PQC is mandatory and TOFU/mock paths are rejected
    pub production: bool,
    /// Permit trust-on-first-use peer installation (lab use only)
    pub allow_tofu: bool,
    /// Emit JSON logs
    pub log_json: bool,
    pub beacon: BeaconConfig,
    pub crypto: CryptoConfig,
    pub quorum: QuorumConfig,
    pub router: RouterConfig,
    pub healing: HealingConfig,
    pub queues: QueueConfig,
}

impl MeshConfig {
    /// Load configuration from an optional file, then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let mut cfg: MeshConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| MeshError::Configuration(e.to_string()))?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply the documented environment variables on top of the current
    /// values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("PRODUCTION_MODE") {
            self.production = parse_bool("PRODUCTION_MODE", &v)?;
        }
        if let Ok(v) = std::env::var("ALLOW_MOCK_PQC") {
            self.crypto.allow_mock_pqc = parse_bool("ALLOW_MOCK_PQC", &v)?;
        }
        if let Ok(v) = std::env::var("KEM_ALGORITHM") {
            self.crypto.kem_algorithm = v.parse()?;
        }
        if let Ok(v) = std::env::var("SIG_ALGORITHM") {
            self.crypto.sig_algorithm = v.parse()?;
        }
        Ok(())
    }

    /// Validate cross-field constraints. Called once at startup; failures are
    /// fatal with exit code 64.
    pub fn validate(&self) -> Result<()> {
        if self.production && self.crypto.allow_mock_pqc {
            return Err(MeshError::Configuration(
                "ALLOW_MOCK_PQC is rejected in production mode".into(),
            ));
        }
        if self.production && self.allow_tofu {
            return Err(MeshError::Configuration(
                "trust-on-first-use is forbidden in production mode".into(),
            ));
        }
        if self.beacon.beacon_interval_ms == 0 {
            return Err(MeshError::Configuration(
                "beacon_interval_ms must be positive".into(),
            ));
        }
        if self.beacon.edge_ttl_ms < self.beacon.beacon_interval_ms {
            return Err(MeshError::Configuration(
                "edge_ttl_ms must be at least one beacon interval".into(),
            ));
        }
        if self.beacon.node_timeout_ms < self.beacon.edge_ttl_ms {
            return Err(MeshError::Configuration(
                "node_timeout_ms must be at least edge_ttl_ms".into(),
            ));
        }
        for (name, alpha) in [
            ("rtt_ewma_alpha", self.beacon.rtt_ewma_alpha),
            ("kb_alpha_success", self.healing.kb_alpha_success),
            ("kb_alpha_failure", self.healing.kb_alpha_failure),
        ] {
            if !(0.0..=1.0).contains(&alpha) {
                return Err(MeshError::Configuration(format!(
                    "{name} must lie in [0, 1], got {alpha}"
                )));
            }
        }
        if self.quorum.reputation_floor_quarantine >= self.quorum.reputation_floor_suspect {
            return Err(MeshError::Configuration(
                "quarantine floor must be below suspect floor".into(),
            ));
        }
        Ok(())
    }

    /// Size of the cryptographic verification worker pool.
    pub fn crypto_worker_pool_size(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().min(8))
            .unwrap_or(1)
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon.beacon_interval_ms)
    }

    pub fn edge_ttl(&self) -> Duration {
        Duration::from_millis(self.beacon.edge_ttl_ms)
    }

    pub fn mape_k_interval(&self) -> Duration {
        Duration::from_millis(self.healing.tick_interval_ms)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(MeshError::Configuration(format!(
            "{name} expects a boolean, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        MeshConfig::default().validate().unwrap();
    }

    #[test]
    fn default_ttls_track_beacon_interval() {
        let cfg = BeaconConfig::default();
        assert_eq!(cfg.edge_ttl_ms, 3 * cfg.beacon_interval_ms);
        assert_eq!(cfg.node_timeout_ms, 5 * cfg.beacon_interval_ms);
    }

    #[test]
    fn production_rejects_mock_pqc() {
        let mut cfg = MeshConfig::default();
        cfg.production = true;
        cfg.crypto.allow_mock_pqc = true;
        assert!(matches!(
            cfg.validate(),
            Err(MeshError::Configuration(_))
        ));
    }

    #[test]
    fn production_rejects_tofu() {
        let mut cfg = MeshConfig::default();
        cfg.production = true;
        cfg.allow_tofu = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn edge_ttl_below_beacon_interval_is_invalid() {
        let mut cfg = MeshConfig::default();
        cfg.beacon.edge_ttl_ms = cfg.beacon.beacon_interval_ms - 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool("X", "TRUE").unwrap());
        assert!(!parse_bool("X", "off").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
