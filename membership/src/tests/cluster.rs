//! Multi-node scenarios over the in-memory network.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use super::test_utils::{
    addr, build_node, fast_config, init_test_logging, request_join, spawn_cluster, spawn_node,
    TestNode,
};
use crate::{
    config::PROTOCOL_VERSION,
    coordinator::CoordinatorState,
    error::JoinError,
    message::{MessageKind, Payload, RejectReason},
    node::{NodeDescriptor, NodeState},
    transport::MemoryNetwork,
};

#[tokio::test(start_paused = true)]
async fn test_two_nodes_agree_after_join() {
    init_test_logging();
    let network = MemoryNetwork::new();

    let a = spawn_node(&network, addr(7000), fast_config("alpha", vec![])).await;
    assert_eq!(a.topology().version(), 1);
    assert_eq!(a.handle.state(), CoordinatorState::Running);

    let b = spawn_node(&network, addr(7001), fast_config("alpha", vec![addr(7000)])).await;

    let (ta, tb) = (a.topology(), b.topology());
    assert_eq!(ta.version(), tb.version());
    assert_eq!(ta.len(), 2);
    assert_eq!(tb.len(), 2);
    assert!(ta.same_members(&tb));
    assert_eq!(b.observer.counters.count(MessageKind::JoinAccept), 1);
    assert_eq!(a.observer.counters.count(MessageKind::JoinRequest), 1);

    // Steady-state gossip with nothing to reconcile leaves the version alone.
    sleep(Duration::from_secs(1)).await;
    let (ta, tb) = (a.topology(), b.topology());
    assert_eq!(ta.version(), tb.version());
    assert!(ta.same_members(&tb));
    assert_eq!(a.state_of(&b), Some(NodeState::Up));
    assert_eq!(b.state_of(&a), Some(NodeState::Up));
    assert!(a.observer.counters.count(MessageKind::HeartbeatRequest) > 0);
}

#[tokio::test(start_paused = true)]
async fn test_isolated_node_declared_down_within_window() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster(&network, "alpha", 7100, 3).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    sleep(Duration::from_millis(500)).await;
    for node in &nodes {
        let topology = node.topology();
        assert_eq!(topology.len(), 3);
        assert_eq!(topology.count_in(NodeState::Up), 3);
    }

    // Silence threshold, plus one round of tick granularity.
    let config = fast_config("alpha", vec![]);
    let bound = config
        .failure_detector
        .detection_window(config.gossip_interval());
    assert_eq!(
        bound,
        config.failure_detector.silence_threshold() + config.gossip_interval()
    );

    let isolated_at = Instant::now();
    network.isolate(addr(7102));
    sleep(Duration::from_secs(2)).await;

    for observer in [&a.observer, &b.observer] {
        let down_at = observer
            .first_seen(&c.id(), NodeState::Down)
            .expect("isolated node never declared down");
        assert!(down_at - isolated_at <= bound, "took {:?}", down_at - isolated_at);
    }
    assert_eq!(a.state_of(c), Some(NodeState::Down));
    assert_eq!(b.state_of(c), Some(NodeState::Down));
    assert_eq!(a.state_of(b), Some(NodeState::Up));

    for node in &nodes {
        let versions = node.observer.versions();
        assert!(
            versions.windows(2).all(|w| w[0] < w[1]),
            "versions not strictly increasing: {versions:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_cluster_name_mismatch_is_rejected() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, addr(7200), fast_config("alpha", vec![])).await;

    let (joiner, handle, _) = build_node(&network, addr(7201), fast_config("beta", vec![addr(7200)]));
    let err = joiner.start().await.unwrap_err();

    assert!(matches!(
        err,
        JoinError::Rejected {
            contact,
            reason: RejectReason::ClusterNameMismatch,
        } if contact == addr(7200)
    ));
    assert!(handle.topology().is_none());
    assert_eq!(handle.state(), CoordinatorState::Terminated);

    let topology = a.topology();
    assert_eq!(topology.len(), 1);
    assert_eq!(topology.version(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_protocol_version_mismatch_is_rejected() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, addr(7210), fast_config("alpha", vec![])).await;
    let version = a.topology().version();

    let joiner = NodeDescriptor::new(addr(7211));
    let reply = request_join(
        &network,
        addr(7210),
        joiner.clone(),
        "alpha",
        PROTOCOL_VERSION + 1,
    )
    .await;

    assert_eq!(
        reply,
        Payload::JoinReject {
            reason: RejectReason::ProtocolVersionMismatch
        }
    );
    let topology = a.topology();
    assert_eq!(topology.version(), version);
    assert!(!topology.contains(&joiner.id));
}

#[tokio::test(start_paused = true)]
async fn test_full_cluster_rejects_joiner() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let mut config = fast_config("alpha", vec![]);
    config.max_members = 2;
    let a = spawn_node(&network, addr(7220), config).await;
    let _b = spawn_node(&network, addr(7221), fast_config("alpha", vec![addr(7220)])).await;
    sleep(Duration::from_millis(300)).await;
    let version = a.topology().version();

    let (joiner, handle, _) =
        build_node(&network, addr(7222), fast_config("alpha", vec![addr(7220)]));
    let err = joiner.start().await.unwrap_err();

    assert!(matches!(
        err,
        JoinError::Rejected {
            reason: RejectReason::ClusterFull,
            ..
        }
    ));
    assert!(handle.topology().is_none());
    assert_eq!(handle.state(), CoordinatorState::Terminated);
    assert_eq!(a.topology().version(), version);
    assert_eq!(a.topology().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disjoint_clusters_reconcile_in_one_exchange() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let _left = spawn_cluster(&network, "alpha", 7300, 4).await;
    let _right = spawn_cluster(&network, "alpha", 7400, 6).await;

    let (mut x, x_handle, _) = build_node(&network, addr(7350), fast_config("alpha", vec![addr(7300)]));
    x.join().await.unwrap();
    let (mut y, y_handle, _) = build_node(&network, addr(7450), fast_config("alpha", vec![addr(7400)]));
    y.join().await.unwrap();
    assert_eq!(x_handle.topology().unwrap().len(), 5);
    assert_eq!(y_handle.topology().unwrap().len(), 7);

    // digest x -> y, update y -> x, update x -> y
    x.gossip_with(addr(7450)).await;
    y.drain_inbound().await;
    x.drain_inbound().await;
    y.drain_inbound().await;

    let tx = x_handle.topology().unwrap();
    let ty = y_handle.topology().unwrap();
    assert_eq!(tx.len(), 12);
    assert_eq!(ty.len(), 12);
    assert!(tx.same_members(&ty));
}

#[tokio::test(start_paused = true)]
async fn test_graceful_leave_is_seen_without_timeout() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let mut nodes = spawn_cluster(&network, "alpha", 7500, 3).await;
    sleep(Duration::from_millis(500)).await;

    let TestNode { handle, task, .. } = nodes.pop().unwrap();
    let leaver = handle.local_id();
    handle.shutdown();
    task.await.unwrap();
    assert_eq!(handle.state(), CoordinatorState::Terminated);
    assert_eq!(
        handle.topology().unwrap().state_of(&leaver),
        Some(NodeState::Leaving)
    );

    sleep(Duration::from_millis(10)).await;
    for node in &nodes {
        assert_eq!(node.topology().state_of(&leaver), Some(NodeState::Leaving));
    }
}

#[tokio::test(start_paused = true)]
async fn test_join_aborted_by_shutdown() {
    init_test_logging();
    let network = MemoryNetwork::new();
    // Registered but never read: requests vanish without a reply.
    let (_silent, _silent_rx) = network.register(addr(7699), 16);

    let mut config = fast_config("alpha", vec![addr(7699)]);
    config.join.timeout_ms = 10_000;
    let (joiner, handle, _) = build_node(&network, addr(7600), config);

    let join = tokio::spawn(joiner.start());
    sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.state(), CoordinatorState::Joining);

    handle.shutdown();
    let result = join.await.unwrap();
    assert!(matches!(result, Err(JoinError::Aborted)));
    assert_eq!(handle.state(), CoordinatorState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_join_gives_up_after_all_rounds() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let (_silent, _silent_rx) = network.register(addr(7698), 16);

    // One silent seed and one nobody listens on, two rounds each.
    let config = fast_config("alpha", vec![addr(7698), addr(7697)]);
    let (joiner, handle, _) = build_node(&network, addr(7601), config);

    let err = joiner.start().await.unwrap_err();
    assert!(matches!(err, JoinError::SeedsExhausted { attempts: 4 }));
    assert!(handle.topology().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_healed_partition_refutes_down_verdicts() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster(&network, "alpha", 7700, 2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    network.isolate(addr(7701));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(a.state_of(b), Some(NodeState::Down));
    assert_eq!(b.state_of(a), Some(NodeState::Down));

    network.heal(&addr(7701));
    sleep(Duration::from_secs(2)).await;

    let (ta, tb) = (a.topology(), b.topology());
    assert_eq!(ta.state_of(&b.id()), Some(NodeState::Up));
    assert_eq!(tb.state_of(&a.id()), Some(NodeState::Up));
    assert!(ta.get(&b.id()).unwrap().clock > 1);
    assert!(tb.get(&a.id()).unwrap().clock > 1);
    assert!(ta.same_members(&tb));
}

#[tokio::test(start_paused = true)]
async fn test_quarantine_removes_member_and_keeps_tombstone() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let nodes = spawn_cluster(&network, "alpha", 7800, 3).await;
    sleep(Duration::from_millis(500)).await;

    let c = &nodes[2];
    network.isolate(addr(7802));
    sleep(Duration::from_secs(7)).await;

    for node in &nodes[..2] {
        let topology = node.topology();
        assert_eq!(topology.state_of(&c.id()), Some(NodeState::Removed));
        assert_eq!(topology.len(), 3);
        assert_eq!(topology.live_count(), 2);
    }

    // The removed id cannot come back, even once the network heals.
    network.heal(&addr(7802));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(nodes[0].state_of(c), Some(NodeState::Removed));

    let version = nodes[0].topology().version();
    let mut rejoin = c.handle.local().clone();
    rejoin.address = addr(7803);
    let reply = request_join(&network, addr(7800), rejoin, "alpha", PROTOCOL_VERSION).await;
    assert_eq!(
        reply,
        Payload::JoinReject {
            reason: RejectReason::IdRemoved
        }
    );
    assert_eq!(nodes[0].topology().version(), version);
}

#[tokio::test(start_paused = true)]
async fn test_expired_tombstone_is_purged_and_id_stays_barred() {
    init_test_logging();
    let network = MemoryNetwork::new();
    let config = |seeds| {
        let mut config = fast_config("alpha", seeds);
        config.tombstone_ttl_ms = 10_000;
        config
    };
    let a = spawn_node(&network, addr(7900), config(vec![])).await;
    let b = spawn_node(&network, addr(7901), config(vec![addr(7900)])).await;
    let c = spawn_node(&network, addr(7902), config(vec![addr(7900)])).await;
    sleep(Duration::from_millis(500)).await;

    network.isolate(addr(7902));
    sleep(Duration::from_secs(7)).await;
    assert_eq!(a.state_of(&c), Some(NodeState::Removed));

    // REMOVED lands about 5.5s after isolation and expires 10s later.
    sleep(Duration::from_secs(10)).await;
    for node in [&a, &b] {
        let topology = node.topology();
        assert!(!topology.contains(&c.id()));
        assert_eq!(topology.len(), 2);
        assert_eq!(topology.count_in(NodeState::Up), 2);
        let versions = node.observer.versions();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
    }

    let version = a.topology().version();
    let mut rejoin = c.handle.local().clone();
    rejoin.address = addr(7903);
    let reply = request_join(&network, addr(7900), rejoin, "alpha", PROTOCOL_VERSION).await;
    assert_eq!(
        reply,
        Payload::JoinReject {
            reason: RejectReason::IdRemoved
        }
    );
    assert_eq!(a.topology().version(), version);
    assert!(!a.topology().contains(&c.id()));
}
