//! # Mesh Identity
//!
//! Naming and freshness primitives for the control plane:
//!
//! - [`NodeId`] — the opaque, stable identifier a node mints at first boot and
//!   binds to its long-term signing key
//! - [`WorkloadIdentity`] — SPIFFE-style `<trust-domain>/<workload-path>` used
//!   for authorization decisions; distinct from `NodeId` and may outlive a
//!   node instance
//! - [`Epoch`] — a per-node monotonic counter bumped on key rotation and
//!   crash-restart; together with a nonce it totally orders everything a node
//!   says
//!
//! Epoch arithmetic saturates. A saturated epoch still compares correctly
//! against every earlier one, which preserves replay rejection even in the
//! (unreachable in practice) overflow case.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::MeshError;

/// Stable, opaque, globally unique identifier of a mesh participant.
///
/// 16 opaque bytes, minted from a v4 UUID at first boot. Ordering is
/// lexicographic over the raw bytes and is used as the deterministic
/// tie-break in routing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    pub const LEN: usize = 16;

    /// Mint a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex_encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_encode(&self.0))
    }
}

impl FromStr for NodeId {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != '-').collect();
        if cleaned.len() != 32 {
            return Err(MeshError::Validation(format!(
                "node id must be 32 hex chars, got {}",
                cleaned.len()
            )));
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&cleaned[i * 2..i * 2 + 2], 16)
                .map_err(|_| MeshError::Validation("node id is not valid hex".into()))?;
        }
        Ok(Self(bytes))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// SPIFFE-style workload identity: `<trust-domain>/<workload-path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub trust_domain: String,
    pub workload_path: String,
}

impl WorkloadIdentity {
    pub fn new(trust_domain: impl Into<String>, workload_path: impl Into<String>) -> Self {
        Self {
            trust_domain: trust_domain.into(),
            workload_path: workload_path.into(),
        }
    }

    /// Parse `<trust-domain>/<workload-path>`; the path may itself contain
    /// slashes.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s.split_once('/') {
            Some((domain, path)) if !domain.is_empty() && !path.is_empty() => {
                Ok(Self::new(domain, path))
            }
            _ => Err(MeshError::Validation(format!(
                "workload identity must look like <trust-domain>/<path>: {s}"
            ))),
        }
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trust_domain, self.workload_path)
    }
}

/// Monotonic per-node counter, bumped on every key rotation and restart.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch(pub u64);

impl Epoch {
    /// The successor epoch. Saturates instead of wrapping.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An `(epoch, nonce)` freshness pair. Lexicographic ordering: a message is
/// fresh iff its pair is strictly greater than the last accepted pair from
/// the same node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Freshness {
    pub epoch: Epoch,
    pub nonce: u64,
}

impl Freshness {
    pub fn new(epoch: Epoch, nonce: u64) -> Self {
        Self { epoch, nonce }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_round_trips_through_display() {
        let id = NodeId::generate();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn node_id_accepts_uuid_formatting() {
        let id: NodeId = "00112233-4455-6677-8899-aabbccddeeff".parse().unwrap();
        assert_eq!(id.0[0], 0x00);
        assert_eq!(id.0[15], 0xff);
    }

    #[test]
    fn node_id_rejects_bad_lengths() {
        assert!("abcd".parse::<NodeId>().is_err());
        assert!("zz112233445566778899aabbccddeeff".parse::<NodeId>().is_err());
    }

    #[test]
    fn workload_identity_parses_nested_paths() {
        let id = WorkloadIdentity::parse("mesh.example.org/relay/edge-7").unwrap();
        assert_eq!(id.trust_domain, "mesh.example.org");
        assert_eq!(id.workload_path, "relay/edge-7");
        assert!(WorkloadIdentity::parse("no-slash").is_err());
    }

    #[test]
    fn epoch_saturates_at_max() {
        let top = Epoch(u64::MAX);
        assert_eq!(top.next(), top);
        assert!(Epoch(3) < Epoch(4));
    }

    #[test]
    fn freshness_orders_lexicographically() {
        let older = Freshness::new(Epoch(7), 42);
        let same_epoch_newer = Freshness::new(Epoch(7), 43);
        let newer_epoch = Freshness::new(Epoch(8), 0);
        assert!(older < same_epoch_newer);
        assert!(same_epoch_newer < newer_epoch);
    }
}
