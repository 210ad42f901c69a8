//! # Quantum Mesh Core
//!
//! A production-ready, self-healing mesh control plane secured with post-quantum
//! cryptography. Every participant runs an identical node process that discovers
//! peers, authenticates them with NIST-standardized PQC primitives, maintains a
//! distributed view of the topology, routes messages across multiple hops,
//! isolates Byzantine peers via quorum validation, and continuously heals itself
//! through an autonomic MAPE-K loop.
//!
//! ## 🏗️ Architecture Overview
//!
//! The control plane is composed of six cooperating components, each owned by a
//! dedicated task and coordinated through typed channels:
//!
//! ### Transport
//! - **Framed delivery**: opaque byte payloads over UDP (or an in-memory hub in tests)
//! - **64 KiB logical frames**: larger payloads fragment at the secure-channel layer
//! - **No trust**: transport is not cryptographically trusted; all trust lives above it
//!
//! ### PQ-Secure Channel
//! - **ML-KEM-768 key encapsulation** (FIPS 203) with per-epoch key rotation
//! - **ML-DSA-65 signatures** (FIPS 204) for long-term identity and per-message binding
//! - **AES-256-GCM sealing** keyed by HKDF-derived session secrets
//! - **Anti-replay**: strictly increasing `(epoch, nonce)` pairs per peer
//! - **Fail-closed fallback**: classical degrade is forbidden in production and
//!   TTL-bounded everywhere else
//!
//! ### Beacon / Gossip Engine
//! - **Signed liveness beacons**: periodic, jittered, one hop only
//! - **Claim gossip**: multi-hop propagation with duplicate suppression
//! - **Rate limiting**: per-sender budgets feeding the reputation system
//!
//! ### Topology Store and Router
//! - **Single-writer graph** with lock-free versioned snapshots
//! - **Dijkstra routing** over EWMA RTT edge costs with health-aware penalties
//! - **Failover**: automatic recomputation around failed next-hops
//!
//! ### Quorum Validator
//! - **Byzantine-tolerant claims**: network-impacting facts bind only at `⌈2n/3⌉`
//!   endorsements from distinct healthy peers
//! - **Reputation**: contradicted signers lose standing and are eventually quarantined
//!
//! ### MAPE-K Self-Healing Loop
//! - **Monitor → Analyze → Plan → Execute → Knowledge** on a fixed tick
//! - **Plan catalogue**: session restarts, key rotation, quarantine, route recompute
//! - **Knowledge base**: EWMA-smoothed confidence per diagnostic pattern, persisted
//!   through an external hook
//!
//! ## 🔐 Security Guarantees
//!
//! - **Post-quantum resistance**: ML-KEM + ML-DSA by default, algorithm-agile via config
//! - **Forward secrecy**: KEM rotation invalidates prior session keys within a grace window
//! - **No trust-on-first-use in production**: new peers require an introduction claim
//! - **Adversarial input never crashes a node**: malformed or replayed traffic is
//!   absorbed, counted, and fed into reputation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quantum_mesh_core::{MeshConfig, MeshNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Create a node with a fresh identity and default tunables
//!     let config = MeshConfig::default();
//!     let node = MeshNode::new(config).await?;
//!
//!     // Start the control plane: beacons, gossip, quorum, MAPE-K
//!     node.start().await?;
//!
//!     // Route a payload across the mesh
//!     let dest = node.known_peers().first().cloned().expect("a peer");
//!     node.send_to(dest, b"hello, mesh").await?;
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Protocol version carried in the first byte of every wire frame.
pub const PROTOCOL_VERSION: u8 = 1;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Operational modules - logging, configuration, external collaborator hooks
pub mod config;       // Tunables, env layering, startup validation
pub mod hooks;        // Telemetry, persistence, identity, clock, policy seams
pub mod logging;      // Structured logging, category helpers

// Core control-plane modules
pub mod crypto_protocols; // Post-quantum KEM/DSA engines, fallback, AEAD, HKDF
pub mod gossip;           // Beacon emission/application, claim propagation
pub mod identity;         // NodeId, workload identity, epochs, key custody
pub mod mesh_node;        // Orchestrator: task wiring, worker pool, public API
pub mod peers;            // Peer table, states, reputation
pub mod quorum;           // Byzantine-tolerant claim validation
pub mod routing;          // Dijkstra, route cache, failover
pub mod secure_channel;   // 1-RTT handshake, sessions, anti-replay
pub mod self_healing;     // MAPE-K loop and knowledge base
pub mod topology;         // Versioned graph store with delta subscriptions
pub mod transport;        // UDP / in-memory framed transports
pub mod wire;             // Canonical binary frame codecs

// Re-export the orchestrator types for convenient access
pub use config::MeshConfig;
pub use identity::{Epoch, NodeId};
pub use mesh_node::{MeshNode, NodeHealth};

/// Comprehensive error type covering every control-plane failure mode.
///
/// Message-layer failures (bad signatures, replays, unknown peers) are absorbed
/// where they occur and surface only as counters and reputation changes; they
/// appear here so the absorbing code can classify them. Claim-layer failures
/// become state transitions, not errors. Only process-initialization variants
/// (`Configuration`, `CryptoInit`) are allowed to terminate the node.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum MeshError {
    /// Signature verification failed for a beacon, claim, or handshake
    #[error("bad signature: {0}")]
    BadSignature(String),

    /// AEAD tag verification failed on a sealed payload
    #[error("bad mac: {0}")]
    BadMac(String),

    /// Message carried an `(epoch, nonce)` pair at or below the last accepted pair
    #[error("replay detected: {0}")]
    Replay(String),

    /// Message epoch predates the sender's current epoch beyond the grace window
    #[error("stale epoch: {0}")]
    EpochStale(String),

    /// Sender is not in the peer table and no introduction claim accompanied it
    #[error("peer unknown: {0}")]
    PeerUnknown(String),

    /// Key encapsulation or decapsulation failed
    #[error("kem failure: {0}")]
    KemFailure(String),

    /// Classical fallback exceeded its hard TTL; node must self-quarantine
    #[error("fallback ttl expired")]
    FallbackTtlExpired,

    /// Destination is not present in the topology snapshot
    #[error("no route: {0}")]
    NoRoute(String),

    /// Destination exists but no path survives in the current snapshot
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// A bounded queue refused the payload
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// Claim failed to reach quorum before its deadline
    #[error("quorum timeout: {0}")]
    QuorumTimeout(String),

    /// Per-sender rate budget exceeded
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Queues, file descriptors, or memory are exhausted
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid configuration detected at startup; fatal
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Cryptographic initialization failed; fatal in production mode
    #[error("crypto initialization error: {0}")]
    CryptoInit(String),

    /// Transport-level send/receive failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Wire frame failed structural validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Persistence hook failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Policy hook denied the requested action
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// Operation exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// Unexpected internal condition
    #[error("system error: {0}")]
    SystemError(String),
}

/// Result type for all mesh control-plane operations.
pub type Result<T> = std::result::Result<T, MeshError>;
