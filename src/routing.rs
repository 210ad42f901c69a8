//! # Routing Service
//!
//! Shortest-path routing over the current topology snapshot: Dijkstra with
//! EWMA RTT edge weights, a small additive penalty per non-HEALTHY
//! intermediate (prefer healthy paths without excluding degraded ones), and
//! a deterministic lexicographic `NodeId` tie-break.
//!
//! Routes are cached under `(destination, topology_version)`; any topology
//! mutation advances the version and thereby invalidates every cached route
//! without coordination.
//!
//! Failover is cooperative: the send path reports transport failures back,
//! the router recomputes around the failed edge, and persistent
//! unreachability surfaces as evidence for a `NodeFailureClaim` — the router
//! itself never issues claims.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::config::RouterConfig;
use crate::identity::NodeId;
use crate::logging::{log_warn, LogCategory};
use crate::peers::{PeerState, PeerTable};
use crate::topology::{TopologyGraph, TopologyStore};
use crate::{MeshError, Result};

/// Consecutive send failures to one next-hop before evidence is emitted.
const EVIDENCE_THRESHOLD: u32 = 3;

/// A computed route. `path` lists every hop after the source, ending with
/// the destination; an empty path means the destination is the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dst: NodeId,
    pub path: Vec<NodeId>,
    /// Sum of the traversed edges' costs (penalties excluded)
    pub total_cost_us: u64,
    /// Topology version the route was computed against
    pub topology_version: u64,
}

impl Route {
    pub fn next_hop(&self) -> Option<NodeId> {
        self.path.first().copied()
    }

    pub fn hop_count(&self) -> usize {
        self.path.len()
    }
}

/// Evidence that a next-hop is persistently unreachable. Consumed by the
/// MAPE-K loop, which may turn it into a `NodeFailureClaim` proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteFailureEvidence {
    pub next_hop: NodeId,
    pub consecutive_failures: u32,
}

pub struct Router {
    topology: Arc<TopologyStore>,
    peers: Arc<PeerTable>,
    config: RouterConfig,
    cache: DashMap<(NodeId, u64), Arc<Route>>,
    send_failures: DashMap<NodeId, u32>,
}

impl Router {
    pub fn new(topology: Arc<TopologyStore>, peers: Arc<PeerTable>, config: RouterConfig) -> Self {
        Self {
            topology,
            peers,
            config,
            cache: DashMap::new(),
            send_failures: DashMap::new(),
        }
    }

    /// Route from `src` (this node) to `dst` over the current snapshot.
    pub fn route(&self, src: NodeId, dst: NodeId) -> Result<Arc<Route>> {
        let snapshot = self.topology.snapshot();
        let version = snapshot.version();

        if let Some(route) = self.cache.get(&(dst, version)) {
            return Ok(route.clone());
        }

        let route = Arc::new(self.compute(&snapshot, src, dst, &HashSet::new())?);
        // Stale versions dominate the cache after churn; prune them with the
        // insert rather than on a timer.
        if self.cache.len() > 1_024 {
            self.cache.retain(|(_, v), _| *v == version);
        }
        self.cache.insert((dst, version), route.clone());
        Ok(route)
    }

    /// Route avoiding a set of directed edges; used during failover. Results
    /// are not cached.
    pub fn route_excluding(
        &self,
        src: NodeId,
        dst: NodeId,
        excluded: &HashSet<(NodeId, NodeId)>,
    ) -> Result<Route> {
        let snapshot = self.topology.snapshot();
        self.compute(&snapshot, src, dst, excluded)
    }

    /// Maximum failover recomputations the send path should attempt.
    pub fn max_failover_hops(&self) -> u32 {
        self.config.max_failover_hops
    }

    /// Record a transport failure toward `next_hop`. Returns evidence once
    /// the failure run crosses the persistence threshold.
    pub fn record_send_failure(&self, next_hop: NodeId) -> Option<RouteFailureEvidence> {
        let mut count = self.send_failures.entry(next_hop).or_insert(0);
        *count += 1;
        (*count >= EVIDENCE_THRESHOLD).then(|| RouteFailureEvidence {
            next_hop,
            consecutive_failures: *count,
        })
    }

    /// Clear the failure run after a successful send.
    pub fn record_send_success(&self, next_hop: NodeId) {
        self.send_failures.remove(&next_hop);
    }

    /// Drop every cached route (cheap; used by the MAPE-K `RecomputeRoutes`
    /// plan).
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    fn compute(
        &self,
        graph: &TopologyGraph,
        src: NodeId,
        dst: NodeId,
        excluded: &HashSet<(NodeId, NodeId)>,
    ) -> Result<Route> {
        if src == dst {
            return Ok(Route {
                dst,
                path: Vec::new(),
                total_cost_us: 0,
                topology_version: graph.version(),
            });
        }
        if !graph.contains_node(&dst) {
            return Err(MeshError::NoRoute(dst.to_string()));
        }

        let deadline = Instant::now();
        let penalty = u64::from(self.config.unhealthy_penalty_us);

        // dist holds the penalized cost used for ordering; true_cost the
        // unpenalized sum reported in the route.
        let mut dist: HashMap<NodeId, u64> = HashMap::new();
        let mut true_cost: HashMap<NodeId, u64> = HashMap::new();
        let mut prev: HashMap<NodeId, NodeId> = HashMap::new();
        let mut heap: BinaryHeap<Reverse<(u64, NodeId)>> = BinaryHeap::new();

        dist.insert(src, 0);
        true_cost.insert(src, 0);
        heap.push(Reverse((0, src)));

        while let Some(Reverse((cost, node))) = heap.pop() {
            if deadline.elapsed().as_millis() as u64 > self.config.dijkstra_deadline_ms {
                log_warn(
                    LogCategory::Topology,
                    &format!(
                        "dijkstra exceeded {} ms at {} nodes; topology pathologically large",
                        self.config.dijkstra_deadline_ms,
                        dist.len()
                    ),
                );
                metrics::counter!("mesh_router_deadline_exceeded_total", 1);
                return Err(MeshError::Timeout("dijkstra deadline exceeded".into()));
            }
            if cost > *dist.get(&node).unwrap_or(&u64::MAX) {
                continue;
            }
            if node == dst {
                break;
            }
            let Some(neighbors) = graph.neighbors(&node) else {
                continue;
            };
            for (next, edge) in neighbors {
                if excluded.contains(&(node, *next)) {
                    continue;
                }
                // Prefer healthy paths: entering a non-HEALTHY intermediate
                // costs extra, but the destination is never penalized.
                let node_penalty = if *next != dst && !self.is_healthy(next) {
                    penalty
                } else {
                    0
                };
                let next_cost = cost
                    .saturating_add(u64::from(edge.cost_us))
                    .saturating_add(node_penalty);
                let current = *dist.get(next).unwrap_or(&u64::MAX);
                let better = next_cost < current
                    || (next_cost == current
                        && prev.get(next).map(|p| node < *p).unwrap_or(false));
                if better {
                    dist.insert(*next, next_cost);
                    true_cost.insert(
                        *next,
                        true_cost[&node].saturating_add(u64::from(edge.cost_us)),
                    );
                    prev.insert(*next, node);
                    heap.push(Reverse((next_cost, *next)));
                }
            }
        }

        if !prev.contains_key(&dst) {
            return Err(MeshError::Unreachable(dst.to_string()));
        }

        let mut path = Vec::new();
        let mut cursor = dst;
        while cursor != src {
            path.push(cursor);
            cursor = prev[&cursor];
        }
        path.reverse();

        Ok(Route {
            dst,
            path,
            total_cost_us: true_cost[&dst],
            topology_version: graph.version(),
        })
    }

    fn is_healthy(&self, node: &NodeId) -> bool {
        matches!(self.peers.state(node), Some(PeerState::Healthy) | None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuorumConfig;
    use crate::peers::PeerRecord;

    fn node(tag: u8) -> NodeId {
        NodeId::from_bytes([tag; 16])
    }

    fn router_over(edges: &[(u8, u8, u32)]) -> Router {
        let topology = Arc::new(TopologyStore::new());
        for (src, dst, cost) in edges {
            topology
                .upsert_edge(node(*src), node(*dst), *cost, 1_000)
                .unwrap();
        }
        Router::new(
            topology,
            Arc::new(PeerTable::new(QuorumConfig::default())),
            RouterConfig::default(),
        )
    }

    #[test]
    fn routes_to_self_are_empty() {
        let router = router_over(&[(1, 2, 100)]);
        let route = router.route(node(1), node(1)).unwrap();
        assert!(route.path.is_empty());
        assert_eq!(route.total_cost_us, 0);
    }

    #[test]
    fn unknown_destination_is_no_route() {
        let router = router_over(&[(1, 2, 100)]);
        assert!(matches!(
            router.route(node(1), node(9)),
            Err(MeshError::NoRoute(_))
        ));
    }

    #[test]
    fn disconnected_destination_is_unreachable() {
        // 9 exists in the graph but only as a source of its own island.
        let router = router_over(&[(1, 2, 100), (9, 8, 100)]);
        assert!(matches!(
            router.route(node(1), node(9)),
            Err(MeshError::Unreachable(_))
        ));
    }

    #[test]
    fn shortest_path_wins() {
        // 1→2→4 costs 300; 1→3→4 costs 250.
        let router = router_over(&[(1, 2, 100), (2, 4, 200), (1, 3, 150), (3, 4, 100)]);
        let route = router.route(node(1), node(4)).unwrap();
        assert_eq!(route.path, vec![node(3), node(4)]);
        assert_eq!(route.total_cost_us, 250);
    }

    #[test]
    fn equal_cost_ties_break_lexicographically() {
        // Two equal-cost 2-hop paths via 2 and via 3: the route must pick
        // the lexicographically smaller intermediate.
        let router = router_over(&[(1, 2, 100), (2, 4, 100), (1, 3, 100), (3, 4, 100)]);
        let route = router.route(node(1), node(4)).unwrap();
        assert_eq!(route.path, vec![node(2), node(4)]);
    }

    #[test]
    fn path_cost_equals_sum_of_snapshot_edges() {
        let router = router_over(&[(1, 2, 120), (2, 3, 80), (3, 4, 55)]);
        let route = router.route(node(1), node(4)).unwrap();
        let snapshot = router.topology.snapshot();
        let mut total = 0u64;
        let mut hops = vec![node(1)];
        hops.extend(&route.path);
        for pair in hops.windows(2) {
            total += u64::from(snapshot.edge(&pair[0], &pair[1]).unwrap().cost_us);
        }
        assert_eq!(total, route.total_cost_us);
    }

    #[test]
    fn unhealthy_intermediates_are_penalized_not_excluded() {
        let topology = Arc::new(TopologyStore::new());
        // Direct path through 2 costs 200; through 3 costs 203.
        for (src, dst, cost) in [(1u8, 2u8, 100u32), (2, 4, 100), (1, 3, 101), (3, 4, 102)] {
            topology
                .upsert_edge(node(src), node(dst), cost, 1_000)
                .unwrap();
        }
        let peers = Arc::new(PeerTable::new(QuorumConfig::default()));
        for tag in [2u8, 3, 4] {
            peers
                .install(PeerRecord::new(node(tag), vec![tag], vec![tag]))
                .unwrap();
        }
        // Suspecting 2 adds +5 ms to its path, so 3 wins.
        peers.set_state(&node(2), PeerState::Suspected).unwrap();

        let router = Router::new(Arc::clone(&topology), peers, RouterConfig::default());
        let route = router.route(node(1), node(4)).unwrap();
        assert_eq!(route.path, vec![node(3), node(4)]);
        // Reported cost stays the raw edge sum.
        assert_eq!(route.total_cost_us, 203);

        // But when every path is degraded, degraded still routes.
        let excluded: HashSet<_> = [(node(1), node(3))].into_iter().collect();
        let route = router.route_excluding(node(1), node(4), &excluded).unwrap();
        assert_eq!(route.path, vec![node(2), node(4)]);
    }

    #[test]
    fn cache_hits_by_version_and_invalidates_on_mutation() {
        let router = router_over(&[(1, 2, 100), (2, 3, 100)]);
        let first = router.route(node(1), node(3)).unwrap();
        let again = router.route(node(1), node(3)).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        // Any topology mutation advances the version; the cache misses and
        // the new route reflects the better edge.
        router
            .topology
            .upsert_edge(node(1), node(3), 50, 2_000)
            .unwrap();
        let after = router.route(node(1), node(3)).unwrap();
        assert_eq!(after.path, vec![node(3)]);
        assert!(after.topology_version > first.topology_version);
    }

    #[test]
    fn failure_evidence_after_persistent_unreachability() {
        let router = router_over(&[(1, 2, 100)]);
        assert!(router.record_send_failure(node(2)).is_none());
        assert!(router.record_send_failure(node(2)).is_none());
        let evidence = router.record_send_failure(node(2)).unwrap();
        assert_eq!(evidence.consecutive_failures, 3);

        router.record_send_success(node(2));
        assert!(router.record_send_failure(node(2)).is_none());
    }
}
