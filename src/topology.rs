//! # Topology Store
//!
//! The authoritative in-memory graph of the mesh from this node's point of
//! view: directed edges keyed by `NodeId`, each carrying a cost and a
//! monotonic `observed_at` timestamp.
//!
//! ## Concurrency Model
//!
//! A single mutator (the beacon application path) serializes writes; readers
//! take lock-free snapshots. Every mutation bumps a version counter and
//! regenerates the shared `Arc` snapshot, so the router and the MAPE-K
//! monitor always see an internally consistent graph and can key caches on
//! the version.
//!
//! ## Consistency
//!
//! Eventually consistent across the mesh: each node's graph is its own view,
//! and no global agreement on edge sets is attempted. Binding agreement
//! exists only for quorum-validated claims.
//!
//! Invariant: the graph never contains an edge incident to an EVICTED node.
//! `mark_evicted` is irreversible for the process lifetime.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::identity::NodeId;
use crate::logging::{log_info, LogCategory};
use crate::Result;

/// One directed edge's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeState {
    /// EWMA RTT in microseconds
    pub cost_us: u32,
    /// Monotonic observation timestamp in epoch milliseconds
    pub observed_at_ms: u64,
}

/// Immutable graph snapshot handed to readers.
///
/// Adjacency uses `BTreeMap` so iteration order is deterministic — the
/// router's lexicographic tie-break depends on it.
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    edges: HashMap<NodeId, BTreeMap<NodeId, EdgeState>>,
    version: u64,
}

impl TopologyGraph {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn neighbors(&self, node: &NodeId) -> Option<&BTreeMap<NodeId, EdgeState>> {
        self.edges.get(node)
    }

    pub fn edge(&self, src: &NodeId, dst: &NodeId) -> Option<EdgeState> {
        self.edges.get(src)?.get(dst).copied()
    }

    pub fn contains_node(&self, node: &NodeId) -> bool {
        self.edges.contains_key(node)
            || self.edges.values().any(|adj| adj.contains_key(node))
    }

    pub fn node_count(&self) -> usize {
        let mut nodes: Vec<NodeId> = self.edges.keys().copied().collect();
        for adj in self.edges.values() {
            nodes.extend(adj.keys().copied());
        }
        nodes.sort_unstable();
        nodes.dedup();
        nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|adj| adj.len()).sum()
    }
}

/// Change notification sent to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyDelta {
    EdgeAdded {
        src: NodeId,
        dst: NodeId,
        cost_us: u32,
    },
    EdgeRemoved {
        src: NodeId,
        dst: NodeId,
    },
    NodeEvicted {
        node: NodeId,
    },
}

/// Versioned, snapshot-publishing graph store.
pub struct TopologyStore {
    inner: RwLock<Inner>,
    evicted: DashSet<NodeId>,
    deltas: broadcast::Sender<TopologyDelta>,
}

struct Inner {
    graph: TopologyGraph,
    snapshot: Arc<TopologyGraph>,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyStore {
    pub fn new() -> Self {
        let (deltas, _) = broadcast::channel(1_024);
        Self {
            inner: RwLock::new(Inner {
                graph: TopologyGraph::default(),
                snapshot: Arc::new(TopologyGraph::default()),
            }),
            evicted: DashSet::new(),
            deltas,
        }
    }

    /// Current immutable snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<TopologyGraph> {
        self.inner.read().snapshot.clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().graph.version
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyDelta> {
        self.deltas.subscribe()
    }

    pub fn is_evicted(&self, node: &NodeId) -> bool {
        self.evicted.contains(node)
    }

    /// Insert or refresh a directed edge. Idempotent: re-applying identical
    /// state is a no-op. Within the monotonic window, the newest observation
    /// wins on cost; an older observation never overwrites a newer one.
    pub fn upsert_edge(
        &self,
        src: NodeId,
        dst: NodeId,
        cost_us: u32,
        observed_at_ms: u64,
    ) -> Result<bool> {
        if self.evicted.contains(&src) || self.evicted.contains(&dst) || src == dst {
            return Ok(false);
        }
        let mut inner = self.inner.write();
        let adjacency = inner.graph.edges.entry(src).or_default();
        let incoming = EdgeState {
            cost_us,
            observed_at_ms,
        };
        let changed = match adjacency.get(&dst) {
            Some(existing) if existing.observed_at_ms > observed_at_ms => false,
            Some(existing) if *existing == incoming => false,
            _ => {
                adjacency.insert(dst, incoming);
                true
            }
        };
        if changed {
            Self::publish(&mut inner, &self.deltas, TopologyDelta::EdgeAdded { src, dst, cost_us });
        }
        Ok(changed)
    }

    /// Remove one directed edge if present.
    pub fn remove_edge(&self, src: NodeId, dst: NodeId) -> bool {
        let mut inner = self.inner.write();
        let removed = inner
            .graph
            .edges
            .get_mut(&src)
            .map(|adj| adj.remove(&dst).is_some())
            .unwrap_or(false);
        if removed {
            if inner.graph.edges.get(&src).is_some_and(|adj| adj.is_empty()) {
                inner.graph.edges.remove(&src);
            }
            Self::publish(&mut inner, &self.deltas, TopologyDelta::EdgeRemoved { src, dst });
        }
        removed
    }

    /// Evict a node: remove every incident edge and bar it from the graph
    /// for the rest of the process lifetime.
    pub fn mark_evicted(&self, node: NodeId) {
        if !self.evicted.insert(node) {
            return;
        }
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        if let Some(adj) = inner.graph.edges.remove(&node) {
            for dst in adj.keys() {
                removed.push(TopologyDelta::EdgeRemoved { src: node, dst: *dst });
            }
        }
        for (src, adj) in inner.graph.edges.iter_mut() {
            if adj.remove(&node).is_some() {
                removed.push(TopologyDelta::EdgeRemoved { src: *src, dst: node });
            }
        }
        inner.graph.edges.retain(|_, adj| !adj.is_empty());
        removed.push(TopologyDelta::NodeEvicted { node });
        for delta in removed {
            Self::publish(&mut inner, &self.deltas, delta);
        }
        log_info(
            LogCategory::Topology,
            &format!("node {} evicted from topology", node.short()),
        );
    }

    /// Sweep edges whose observation is older than `edge_ttl`. Returns the
    /// number removed. The orchestrator runs this every `edge_ttl / 2`.
    pub fn expire_edges(&self, now_ms: u64, edge_ttl_ms: u64) -> usize {
        let mut inner = self.inner.write();
        let mut expired = Vec::new();
        for (src, adj) in inner.graph.edges.iter_mut() {
            adj.retain(|dst, state| {
                let keep = now_ms.saturating_sub(state.observed_at_ms) <= edge_ttl_ms;
                if !keep {
                    expired.push(TopologyDelta::EdgeRemoved {
                        src: *src,
                        dst: *dst,
                    });
                }
                keep
            });
        }
        inner.graph.edges.retain(|_, adj| !adj.is_empty());
        let count = expired.len();
        for delta in expired {
            Self::publish(&mut inner, &self.deltas, delta);
        }
        count
    }

    fn publish(inner: &mut Inner, deltas: &broadcast::Sender<TopologyDelta>, delta: TopologyDelta) {
        inner.graph.version += 1;
        inner.snapshot = Arc::new(inner.graph.clone());
        // Best-effort: a lagging subscriber only misses deltas, never state;
        // it can resynchronize from a snapshot.
        let _ = deltas.send(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(tag: u8) -> NodeId {
        NodeId::from_bytes([tag; 16])
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = TopologyStore::new();
        assert!(store.upsert_edge(node(1), node(2), 500, 1_000).unwrap());
        let version = store.version();
        // Identical re-apply: no state change, no version bump.
        assert!(!store.upsert_edge(node(1), node(2), 500, 1_000).unwrap());
        assert_eq!(store.version(), version);
        assert_eq!(store.snapshot().edge_count(), 1);
    }

    #[test]
    fn newer_observation_wins_older_loses() {
        let store = TopologyStore::new();
        store.upsert_edge(node(1), node(2), 500, 2_000).unwrap();
        // Older observation cannot roll the cost back.
        assert!(!store.upsert_edge(node(1), node(2), 900, 1_000).unwrap());
        assert_eq!(
            store.snapshot().edge(&node(1), &node(2)).unwrap().cost_us,
            500
        );
        // Newer observation updates it.
        assert!(store.upsert_edge(node(1), node(2), 700, 3_000).unwrap());
        assert_eq!(
            store.snapshot().edge(&node(1), &node(2)).unwrap().cost_us,
            700
        );
    }

    #[test]
    fn eviction_removes_incident_edges_and_is_permanent() {
        let store = TopologyStore::new();
        store.upsert_edge(node(1), node(2), 100, 1_000).unwrap();
        store.upsert_edge(node(2), node(3), 100, 1_000).unwrap();
        store.upsert_edge(node(3), node(2), 100, 1_000).unwrap();

        store.mark_evicted(node(2));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.edge_count(), 0);
        assert!(!snapshot.contains_node(&node(2)));

        // Future upserts touching the evicted node are refused.
        assert!(!store.upsert_edge(node(1), node(2), 100, 2_000).unwrap());
        assert!(!store.upsert_edge(node(2), node(3), 100, 2_000).unwrap());
        assert!(store.is_evicted(&node(2)));
    }

    #[test]
    fn expiry_sweeps_stale_edges_only() {
        let store = TopologyStore::new();
        store.upsert_edge(node(1), node(2), 100, 1_000).unwrap();
        store.upsert_edge(node(1), node(3), 100, 20_000).unwrap();

        let removed = store.expire_edges(40_000, 30_000);
        assert_eq!(removed, 1);
        let snapshot = store.snapshot();
        assert!(snapshot.edge(&node(1), &node(2)).is_none());
        assert!(snapshot.edge(&node(1), &node(3)).is_some());
    }

    #[test]
    fn snapshots_are_stable_under_later_writes() {
        let store = TopologyStore::new();
        store.upsert_edge(node(1), node(2), 100, 1_000).unwrap();
        let before = store.snapshot();
        store.upsert_edge(node(1), node(3), 100, 1_000).unwrap();
        assert_eq!(before.edge_count(), 1);
        assert_eq!(store.snapshot().edge_count(), 2);
        assert!(store.snapshot().version() > before.version());
    }

    #[tokio::test]
    async fn subscribers_see_deltas() {
        let store = TopologyStore::new();
        let mut rx = store.subscribe();
        store.upsert_edge(node(1), node(2), 100, 1_000).unwrap();
        store.mark_evicted(node(2));

        assert_eq!(
            rx.recv().await.unwrap(),
            TopologyDelta::EdgeAdded {
                src: node(1),
                dst: node(2),
                cost_us: 100
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            TopologyDelta::EdgeRemoved {
                src: node(1),
                dst: node(2)
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            TopologyDelta::NodeEvicted { node: node(2) }
        );
    }
}
