//! End-to-end control-plane scenarios over the in-memory transport hub:
//! ring routing with failover, quorum-driven eviction, fallback TTL
//! self-quarantine, and the MAPE-K healing cycle.
//!
//! The multi-node meshes run on explicitly configured classical primitives
//! (a lab-mode configuration) to keep wall-clock time reasonable; the
//! default ML-KEM/ML-DSA path is exercised end-to-end in
//! `control_plane_validation.rs` and in the per-module tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use quantum_mesh_core::config::MeshConfig;
use quantum_mesh_core::hooks::Hooks;
use quantum_mesh_core::identity::NodeId;
use quantum_mesh_core::mesh_node::{MeshNode, NodeHealth};
use quantum_mesh_core::peers::PeerState;
use quantum_mesh_core::quorum::{ClaimBody, QuorumEvent};
use quantum_mesh_core::transport::TransportHub;
use quantum_mesh_core::MeshError;

fn node_id(tag: u8) -> NodeId {
    NodeId::from_bytes([tag; 16])
}

fn addr_of(i: usize) -> String {
    format!("node-{i}")
}

/// Lab configuration: fast timers, TOFU on, classical primitives.
fn lab_config(tag: u8, peers: Vec<String>) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.node_id = Some(node_id(tag).to_string());
    config.peers = peers;
    config.allow_tofu = true;
    config.crypto.kem_algorithm = "X25519".parse().unwrap();
    config.crypto.sig_algorithm = "Ed25519".parse().unwrap();
    config.beacon.beacon_interval_ms = 150;
    config.beacon.edge_ttl_ms = 450; // 3× beacon interval
    config.beacon.node_timeout_ms = 750; // 5× beacon interval
    config.beacon.reorder_window_ttl_ms = 300;
    config.quorum.claim_ttl_ms = 3_000;
    config.healing.tick_interval_ms = 300;
    config.healing.observation_window_ms = 3_000;
    config
}

async fn spawn_mesh(
    hub: &Arc<TransportHub>,
    adjacency: &[(u8, Vec<usize>)],
) -> Vec<MeshNode> {
    let mut nodes = Vec::new();
    for (i, (tag, peers)) in adjacency.iter().enumerate() {
        let config = lab_config(*tag, peers.iter().map(|p| addr_of(*p)).collect());
        let transport = Arc::new(hub.attach(&addr_of(i), 4_096));
        let node = MeshNode::with_transport(config, Hooks::default(), transport)
            .await
            .expect("node construction");
        node.start().await.expect("node start");
        nodes.push(node);
    }
    nodes
}

/// Poll `check` until it returns Some or the deadline passes.
async fn wait_for<T>(
    timeout: Duration,
    mut check: impl FnMut() -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Retry a routed send until it lands or ten seconds pass.
async fn retry_send(node: &MeshNode, dst: NodeId, payload: &[u8]) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if node.send_to(dst, payload).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ring_of_ten_routes_and_fails_over() {
    let hub = TransportHub::new();
    // Ring adjacency: node i bootstraps toward i−1 and i+1.
    let adjacency: Vec<(u8, Vec<usize>)> = (0..10)
        .map(|i| (i as u8, vec![(i + 9) % 10, (i + 1) % 10]))
        .collect();
    let nodes = spawn_mesh(&hub, &adjacency).await;

    // Topology converges via beacon relay until 0 can route to 5.
    let route = wait_for(Duration::from_secs(20), || {
        nodes[0].route_to(node_id(5)).ok()
    })
    .await
    .expect("route 0 → 5 must converge");
    // A ring admits exactly two simple paths, both five hops long.
    assert_eq!(route.path.len(), 5, "path {:?}", route.path);
    assert_eq!(route.path.last(), Some(&node_id(5)));

    // A payload actually crosses the five hops.
    let mut delivered = nodes[5].subscribe_delivered();
    let sent = retry_send(&nodes[0], node_id(5), b"around the ring").await;
    assert!(sent, "multi-hop send must eventually succeed");
    let (src, payload) = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
        .await
        .expect("delivery within deadline")
        .expect("delivery channel open");
    assert_eq!(src, node_id(0));
    assert_eq!(payload, b"around the ring");

    // Kill node 3: the mesh heals through the remaining arc.
    hub.take_down(&addr_of(3));
    let healed = wait_for(Duration::from_secs(20), || {
        match nodes[0].route_to(node_id(5)) {
            Ok(route) if !route.path.contains(&node_id(3)) => Some(route),
            _ => None,
        }
    })
    .await
    .expect("route must heal around the dead node");
    assert_eq!(healed.path.len(), 5, "remaining arc: {:?}", healed.path);

    let mut delivered = nodes[5].subscribe_delivered();
    let resent = retry_send(&nodes[0], node_id(5), b"the long way").await;
    assert!(resent);
    let (_, payload) = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
        .await
        .expect("delivery within deadline")
        .expect("delivery channel open");
    assert_eq!(payload, b"the long way");

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quorum_evicts_a_dead_node_in_a_seven_node_mesh() {
    let hub = TransportHub::new();
    // Full mesh: everyone bootstraps toward everyone.
    let adjacency: Vec<(u8, Vec<usize>)> = (0..7)
        .map(|i| (i as u8, (0..7).filter(|j| *j != i).collect()))
        .collect();
    let nodes = spawn_mesh(&hub, &adjacency).await;

    // Let sessions and beacons settle.
    wait_for(Duration::from_secs(20), || {
        (nodes[0].connected_peers().len() >= 6).then_some(())
    })
    .await
    .expect("full mesh must connect");

    let mut events = nodes[0].subscribe_quorum();
    hub.take_down(&addr_of(6));

    // Node timeouts fire RequestPeerCheck plans; corroborating peers endorse
    // until ⌈2·7/3⌉ = 5 distinct signers accept the failure claim.
    let accepted = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(QuorumEvent::ClaimAccepted { target, body, signers, .. })
                    if target == node_id(6)
                        && matches!(body, ClaimBody::NodeFailure { .. }) =>
                {
                    return signers;
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("failure claim must reach quorum");
    assert!(accepted.len() >= 5, "signers: {}", accepted.len());

    // Eviction is binding: state flips, the topology drops the node, and no
    // further beacons from it would be accepted.
    wait_for(Duration::from_secs(10), || {
        (nodes[0].peer_state(&node_id(6)) == Some(PeerState::Evicted)).then_some(())
    })
    .await
    .expect("node 6 must be evicted");
    let unroutable = wait_for(Duration::from_secs(10), || {
        match nodes[0].route_to(node_id(6)) {
            Err(MeshError::NoRoute(_)) | Err(MeshError::Unreachable(_)) => Some(()),
            _ => None,
        }
    })
    .await;
    assert!(unroutable.is_some(), "evicted node must drop out of routing");

    for node in &nodes {
        node.shutdown().await;
    }
}

#[test_log::test(tokio::test)]
async fn pqc_unavailable_is_fatal_in_production() {
    let mut config = MeshConfig::default();
    config.node_id = Some(node_id(1).to_string());
    config.production = true;
    config.crypto.simulate_pqc_unavailable = true;

    let hub = TransportHub::new();
    let transport = Arc::new(hub.attach("prod-node", 64));
    let result = MeshNode::with_transport(config, Hooks::default(), transport).await;
    assert!(
        matches!(result, Err(MeshError::CryptoInit(_))),
        "production must fail closed"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fallback_ttl_forces_self_quarantine() {
    let hub = TransportHub::new();

    // Node A limps along on the classical fallback with a short TTL.
    let mut config_a = lab_config(1, vec![addr_of(1)]);
    config_a.crypto.kem_algorithm = "ML-KEM-768".parse().unwrap();
    config_a.crypto.sig_algorithm = "ML-DSA-65".parse().unwrap();
    config_a.crypto.simulate_pqc_unavailable = true;
    config_a.crypto.fallback_ttl_ms = 1_500;
    let transport_a = Arc::new(hub.attach(&addr_of(0), 1_024));
    let node_a = MeshNode::with_transport(config_a, Hooks::default(), transport_a)
        .await
        .expect("fallback node starts outside production");
    let mut events_a = node_a.subscribe_quorum();

    let config_b = lab_config(2, vec![addr_of(0)]);
    let transport_b = Arc::new(hub.attach(&addr_of(1), 1_024));
    let node_b = MeshNode::with_transport(config_b, Hooks::default(), transport_b)
        .await
        .unwrap();

    node_a.start().await.unwrap();
    node_b.start().await.unwrap();

    // The degradation is loudly observable: a FallbackActivated claim about
    // A reaches ACCEPTED (solo-accepted before B joins, quorum otherwise).
    let observed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events_a.recv().await {
                Ok(QuorumEvent::ClaimAccepted { target, body, .. })
                    if target == node_a.node_id()
                        && matches!(body, ClaimBody::FallbackActivated { .. }) =>
                {
                    return;
                }
                Ok(_) => continue,
                Err(_) => panic!("quorum stream closed"),
            }
        }
    })
    .await;
    assert!(observed.is_ok(), "fallback claim must be recorded");

    // Past the TTL the node takes itself out of the mesh.
    wait_for(Duration::from_secs(10), || {
        (node_a.is_self_quarantined() && node_a.health_check() == NodeHealth::Critical)
            .then_some(())
    })
    .await
    .expect("fallback node must self-quarantine at TTL expiry");

    // Its silence is visible from the outside: B loses the route once the
    // stale edges expire.
    wait_for(Duration::from_secs(15), || {
        match node_b.route_to(node_a.node_id()) {
            Err(_) => Some(()),
            Ok(_) => None,
        }
    })
    .await
    .expect("peers must observe the quarantined node timing out");

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mape_k_detects_a_dead_peer_and_learns() {
    let hub = TransportHub::new();
    let adjacency: Vec<(u8, Vec<usize>)> = (0..3)
        .map(|i| (i as u8, (0..3).filter(|j| *j != i).collect()))
        .collect();
    let nodes = spawn_mesh(&hub, &adjacency).await;

    wait_for(Duration::from_secs(15), || {
        (nodes[0].connected_peers().len() >= 2).then_some(())
    })
    .await
    .expect("triangle must connect");

    hub.take_down(&addr_of(2));

    // The loop notices the timeout, runs the peer-check plan, and records
    // the outcome in the knowledge base.
    wait_for(Duration::from_secs(20), || {
        nodes[0]
            .healing()
            .knowledge_base()
            .lookup("peer_timeout")
            .filter(|entry| entry.confidence > 0.5)
            .map(|_| ())
    })
    .await
    .expect("healing loop must learn from the peer-timeout plan");

    // Escalation lands: with n = 3 the two survivors reach ⌈6/3⌉ = 2
    // signers and evict the dead node.
    wait_for(Duration::from_secs(20), || {
        (nodes[0].peer_state(&node_id(2)) == Some(PeerState::Evicted)).then_some(())
    })
    .await
    .expect("dead peer must be evicted via quorum");

    for node in &nodes {
        node.shutdown().await;
    }
}
