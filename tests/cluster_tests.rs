//! Multi-node behaviour on the in-process transport

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gradmesh::protocol::{JoinRequest, Message, MessageEnvelope};
use gradmesh::{
    Error, LocalConnector, MeshBuildMode, NodeState, ParameterServer, ParamsKind, Payload,
    ServerConfig, Transport,
};
use tokio::task::JoinSet;
use tokio_test::{assert_err, assert_ok};

use common::*;

// ─────────────────────────────────────────────────────────────────
// Topology
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_root_is_its_own_upstream() {
    let cluster = Cluster::start(0, MeshBuildMode::Mesh, 8).await;

    assert!(cluster.root.is_root());
    assert_eq!(cluster.root.state(), NodeState::Active);
    assert_eq!(cluster.root.upstream_id().as_deref(), Some(ROOT_ID));
    assert_eq!(cluster.root.mesh().total_nodes(), 1);
    assert_eq!(cluster.root.mesh().version(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_three_nodes_share_one_mesh() {
    let cluster = Cluster::start(2, MeshBuildMode::Plain, 0).await;

    let root_mesh = cluster.root.mesh();
    assert_eq!(root_mesh.version(), 2);
    for node in cluster.nodes() {
        assert_eq!(node.state(), NodeState::Active);
        assert_eq!(*node.mesh(), *root_mesh, "{} diverged", node.id());
        assert_eq!(node.mesh().version(), 2);
        assert_eq!(node.mesh().fingerprint(), root_mesh.fingerprint());
    }
    for peer in &cluster.peers {
        assert_eq!(peer.upstream_id().as_deref(), Some(ROOT_ID));
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_mesh_mode_bounds_fanout() {
    let cluster = Cluster::start(128, MeshBuildMode::Mesh, 8).await;
    let mesh = cluster.root.mesh();

    assert_eq!(mesh.version(), 128);
    assert_eq!(mesh.total_nodes(), 129);
    assert!(mesh.depth() <= 3);
    assert_ok!(mesh.validate());
    for node in mesh.nodes() {
        assert!(node.downstream_count() <= 8, "{} over fanout", node.id);
    }
    for peer in &cluster.peers {
        assert_eq!(peer.mesh().version(), 128);
    }

    cluster.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Updates
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_plain_update_reaches_everyone_once() {
    let cluster = Cluster::start(2, MeshBuildMode::Plain, 0).await;
    let counters: Vec<Arc<AtomicU64>> = cluster.nodes().map(count_updates).collect();

    // A 10x10 matrix of ones
    let payload = Payload::from_f32s(&[1.0; 100]);
    let sender = &cluster.peers[0];
    assert_ok!(sender.send_update(payload).await);
    cluster.settle().await;

    // root, peer-000 (sender), peer-001
    assert_eq!(count(&counters[0]), 1);
    assert_eq!(count(&counters[1]), 0);
    assert_eq!(count(&counters[2]), 1);

    assert_eq!(sender.stats().updates_sent, 1);
    assert_eq!(cluster.root.stats().updates_forwarded, 1);
    assert_eq!(cluster.peers[1].stats().updates_forwarded, 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_update_payload_arrives_intact() {
    let cluster = Cluster::start(3, MeshBuildMode::Mesh, 1).await;
    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    cluster.peers[2].add_updates_subscriber(move |p| {
        sink.lock().push(p.to_f32s().unwrap_or_default());
        Ok(())
    });

    // root -> peer-000 -> peer-001 -> peer-002
    assert_ok!(cluster.root.send_update(Payload::from_f32s(&[0.25, 0.5])).await);
    cluster.settle().await;

    assert_eq!(*received.lock(), vec![vec![0.25, 0.5]]);
    cluster.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Drop Recovery
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_dropped_peer_rejoins_elsewhere() {
    let mut cluster = Cluster::start(128, MeshBuildMode::Mesh, 8).await;
    let before = cluster.peers[23].mesh().version();
    let former_upstream = cluster.peers[23].upstream_id().unwrap();
    assert_eq!(before, 128);

    cluster.drop_peer(23).await;
    assert!(!cluster.root.mesh().contains(&peer_id(23)));
    assert_eq!(cluster.root.mesh().version(), 129);

    let rejoined = cluster.restart_peer(23).await;
    assert_eq!(rejoined.state(), NodeState::Active);

    let mesh = rejoined.mesh();
    assert_ne!(mesh.version(), before);
    assert_eq!(mesh.version(), cluster.root.mesh().version());
    assert_ne!(rejoined.upstream_id().unwrap(), former_upstream);
    assert_eq!(mesh.downstreams_of(rejoined.id()).len(), 0);
    assert_ok!(mesh.validate());

    // Every node converged on the root's view
    for node in cluster.nodes() {
        assert_eq!(*node.mesh(), *cluster.root.mesh(), "{} diverged", node.id());
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_update_reaches_rejoined_peer() {
    let mut cluster = Cluster::start(128, MeshBuildMode::Mesh, 8).await;
    cluster.drop_peer(23).await;
    cluster.restart_peer(23).await;

    let counters: Vec<Arc<AtomicU64>> = cluster.nodes().map(count_updates).collect();
    assert_ok!(cluster.peers[96].send_update(Payload::from(vec![7u8; 32])).await);
    cluster.settle().await;

    // counters[0] is the root, counters[i + 1] is peers[i]
    assert_eq!(count(&counters[24]), 1);
    for (i, counter) in counters.iter().enumerate() {
        let expected = if i == 97 { 0 } else { 1 };
        assert_eq!(count(counter), expected, "node index {}", i);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_orphaned_subtree_rejoins() {
    let cluster = Cluster::start(4, MeshBuildMode::Mesh, 1).await;
    // root -> peer-000 -> peer-001 -> peer-002 -> peer-003
    assert_eq!(cluster.peers[1].upstream_id().as_deref(), Some("peer-000"));

    cluster.drop_peer(1).await;

    let mesh = cluster.root.mesh();
    assert_eq!(mesh.total_nodes(), 4);
    assert!(!mesh.contains(&peer_id(1)));
    for i in [2, 3] {
        assert_eq!(cluster.peers[i].state(), NodeState::Active);
        assert!(mesh.contains(&peer_id(i)));
        assert_eq!(*cluster.peers[i].mesh(), *mesh);
    }
    assert_ok!(mesh.validate());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rejoin_syncs_parameters() {
    let mut cluster = Cluster::start(2, MeshBuildMode::Plain, 0).await;
    cluster
        .root
        .add_request_consumer(ParamsKind::Model, |_| Ok(Payload::from_f32s(&[1.0, 2.0])));
    cluster
        .root
        .add_request_consumer(ParamsKind::Updater, |_| Ok(Payload::from_f32s(&[0.1])));

    let model_hits = Arc::new(AtomicU64::new(0));
    let updater_hits = Arc::new(AtomicU64::new(0));

    cluster.drop_peer(0).await;
    let (m, u) = (Arc::clone(&model_hits), Arc::clone(&updater_hits));
    let rejoined = cluster
        .restart_peer_with(0, move |peer| {
            peer.add_model_params_subscriber(move |p| {
                assert_eq!(p.to_f32s(), Some(vec![1.0, 2.0]));
                m.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            peer.add_updater_params_subscriber(move |_| {
                u.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        })
        .await;

    assert_eq!(count(&model_hits), 1);
    assert_eq!(count(&updater_hits), 1);
    assert_eq!(rejoined.stats().responses_received, 2);
    assert_eq!(cluster.root.stats().requests_served, 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_first_join_does_not_sync() {
    let cluster = Cluster::start(0, MeshBuildMode::Plain, 0).await;
    cluster
        .root
        .add_request_consumer(ParamsKind::Model, |_| Ok(Payload::from_f32s(&[1.0])));

    let peer = cluster.spawn("fresh");
    let hits = Arc::new(AtomicU64::new(0));
    let h = Arc::clone(&hits);
    peer.add_model_params_subscriber(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert_ok!(peer.launch().await);
    cluster.settle().await;

    assert_eq!(count(&hits), 0);
    assert_eq!(cluster.root.stats().requests_served, 0);

    peer.shutdown().await;
    cluster.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_request_answered_by_root() {
    let cluster = Cluster::start(1, MeshBuildMode::Plain, 0).await;
    cluster
        .root
        .add_request_consumer(ParamsKind::Updater, |req| {
            assert_eq!(req.originator_id, "peer-000");
            Ok(Payload::from_f32s(&[9.0]))
        });

    let payload = assert_ok!(cluster.peers[0].request_updater_parameters().await);
    assert_eq!(payload.to_f32s(), Some(vec![9.0]));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_request_times_out_without_consumer() {
    let cluster = Cluster::start(1, MeshBuildMode::Plain, 0).await;

    let err = assert_err!(cluster.peers[0].request_model_parameters().await);
    assert!(matches!(err, Error::RequestTimeout { .. }), "got {:?}", err);
    assert!(err.is_retryable());
    assert_eq!(cluster.root.stats().dropped_messages, 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_requests() {
    let mut config = test_config(MeshBuildMode::Plain, 0);
    config.request_timeout = std::time::Duration::from_secs(30);
    let cluster = Cluster::start_with(1, config).await;

    let peer = cluster.peers[0].clone();
    let pending = tokio::spawn(async move { peer.request_model_parameters().await });
    // Wait for the root to discard the request it cannot answer
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while cluster.root.stats().dropped_messages == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cluster.peers[0].shutdown().await;
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::RequestCancelled { .. })), "got {:?}", result);
    assert_eq!(cluster.peers[0].state(), NodeState::Shutdown);

    cluster.root.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Membership Edge Cases
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_repeated_join_is_acknowledged_again() {
    let cluster = Cluster::start(0, MeshBuildMode::Mesh, 8).await;
    let transport = cluster.connector.register("dup", ROOT_ID);
    let peer = gradmesh::ParameterServer::new(cluster.config.clone(), transport.clone()).unwrap();
    assert_ok!(peer.launch().await);
    cluster.settle().await;
    let version = cluster.root.mesh().version();

    // Same id, same session: a replayed join
    let replay = MessageEnvelope::new(Message::JoinRequest(JoinRequest {
        node_id: "dup".to_string(),
        session: transport.session(),
        via: ROOT_ID.to_string(),
    }));
    assert_ok!(transport.send_message(replay, ROOT_ID).await);
    cluster.settle().await;

    assert_eq!(cluster.root.mesh().version(), version);
    assert_eq!(peer.state(), NodeState::Active);
    assert_eq!(peer.upstream_id().as_deref(), Some(ROOT_ID));

    peer.shutdown().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_launch_retry_after_join_timeout() {
    let connector = LocalConnector::new();
    let config = test_config(MeshBuildMode::Mesh, 8);
    let root = ParameterServer::new(config.clone(), connector.register_root(ROOT_ID)).unwrap();

    // The root is not listening yet, so the request sits in its inbox
    let impatient = ServerConfig {
        join_timeout: Duration::from_millis(200),
        ..config.clone()
    };
    let a = ParameterServer::new(impatient, connector.register("a", ROOT_ID)).unwrap();
    let err = assert_err!(a.launch().await);
    assert!(matches!(err, Error::JoinTimeout { .. }));
    assert_eq!(a.state(), NodeState::Created);

    // The root places the node; the late acknowledgment is dropped
    assert_ok!(root.launch().await);
    connector.wait_idle().await;
    assert!(root.mesh().contains("a"));
    assert_eq!(a.state(), NodeState::Created);

    assert_ok!(a.launch().await);
    connector.wait_idle().await;
    assert_eq!(a.state(), NodeState::Active);
    assert_eq!(a.upstream_id().as_deref(), Some(ROOT_ID));
    assert_eq!(root.mesh().version(), 1);
    assert_eq!(*a.mesh(), *root.mesh());

    a.shutdown().await;
    root.shutdown().await;
}

#[tokio::test]
async fn test_update_reaches_subtree_of_retried_node() {
    let connector = LocalConnector::new();
    let config = test_config(MeshBuildMode::Mesh, 1);
    let root = ParameterServer::new(config.clone(), connector.register_root(ROOT_ID)).unwrap();

    let impatient = ServerConfig {
        join_timeout: Duration::from_millis(200),
        ..config.clone()
    };
    let a = ParameterServer::new(impatient, connector.register("a", ROOT_ID)).unwrap();
    assert_err!(a.launch().await);
    assert_ok!(root.launch().await);
    connector.wait_idle().await;

    // Fanout 1 puts b under a while a still thinks it is outside
    let b = ParameterServer::new(config.clone(), connector.register("b", ROOT_ID)).unwrap();
    assert_ok!(b.launch().await);
    connector.wait_idle().await;
    assert_eq!(b.upstream_id().as_deref(), Some("a"));

    assert_ok!(a.launch().await);
    connector.wait_idle().await;
    let counter = count_updates(&b);

    // root -> a -> b
    assert_ok!(root.send_update(Payload::from_f32s(&[1.0; 4])).await);
    connector.wait_idle().await;
    assert_eq!(count(&counter), 1);
    assert_eq!(a.stats().updates_forwarded, 1);

    b.shutdown().await;
    a.shutdown().await;
    root.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_build_one_mesh() {
    let connector = LocalConnector::new();
    let config = test_config(MeshBuildMode::Mesh, 2);
    let root = ParameterServer::new(config.clone(), connector.register_root(ROOT_ID)).unwrap();
    assert_ok!(root.launch().await);

    let mut joins = JoinSet::new();
    for i in 0..64 {
        let transport = connector.register(peer_id(i), ROOT_ID);
        let peer = ParameterServer::new(config.clone(), transport).unwrap();
        joins.spawn(async move {
            peer.launch().await.map(|()| peer)
        });
    }
    let mut peers = Vec::with_capacity(64);
    while let Some(joined) = joins.join_next().await {
        peers.push(assert_ok!(joined.unwrap()));
    }
    tokio::time::timeout(Duration::from_secs(10), connector.wait_idle())
        .await
        .expect("cluster did not go idle");

    let mesh = root.mesh();
    assert_eq!(mesh.version(), 64);
    assert_eq!(mesh.total_nodes(), 65);
    assert_ok!(mesh.validate());
    for peer in &peers {
        assert_eq!(peer.state(), NodeState::Active);
        assert_eq!(*peer.mesh(), *mesh, "{} has a diverging view", peer.id());
    }

    for peer in &peers {
        peer.shutdown().await;
    }
    root.shutdown().await;
}

#[tokio::test]
async fn test_join_through_member_is_forwarded() {
    let cluster = Cluster::start(1, MeshBuildMode::Plain, 0).await;

    let transport = cluster.connector.register("late", "peer-000");
    let late = gradmesh::ParameterServer::new(cluster.config.clone(), transport).unwrap();
    assert_ok!(late.launch().await);
    cluster.settle().await;

    // PLAIN places under the root regardless of the entry point
    assert_eq!(late.upstream_id().as_deref(), Some(ROOT_ID));
    assert_eq!(cluster.root.mesh().version(), 2);

    late.shutdown().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_removes_node() {
    let cluster = Cluster::start(2, MeshBuildMode::Plain, 0).await;

    cluster.peers[1].shutdown().await;
    cluster.settle().await;

    let mesh = cluster.root.mesh();
    assert!(!mesh.contains(&peer_id(1)));
    assert_eq!(mesh.version(), 3);
    assert_eq!(*cluster.peers[0].mesh(), *mesh);

    let err = assert_err!(cluster.peers[1].send_update(Payload::from(vec![1u8])).await);
    assert!(matches!(err, Error::InvalidState { .. }));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_framed_transport_cluster() {
    let connector = gradmesh::LocalConnector::with_framing();
    let config = test_config(MeshBuildMode::Mesh, 2);
    let root = gradmesh::ParameterServer::new(config.clone(), connector.register_root(ROOT_ID)).unwrap();
    assert_ok!(root.launch().await);

    let mut peers = Vec::new();
    for i in 0..5 {
        let peer = gradmesh::ParameterServer::new(config.clone(), connector.register(peer_id(i), ROOT_ID))
            .unwrap();
        assert_ok!(peer.launch().await);
        peers.push(peer);
    }
    connector.wait_idle().await;

    let counter = count_updates(&peers[4]);
    assert_ok!(peers[0].send_update(Payload::from_f32s(&[3.0])).await);
    connector.wait_idle().await;

    assert_eq!(count(&counter), 1);
    for peer in &peers {
        assert_eq!(*peer.mesh(), *root.mesh());
    }
}
