use std::{
    net::SocketAddr,
    sync::{Arc, Once},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    codec::{BincodeCodec, Codec},
    config::GossipConfig,
    coordinator::{GossipCoordinator, NodeHandle},
    message::{GossipMessage, MessageKind, Payload},
    node::{NodeDescriptor, NodeId, NodeState},
    observer::{MessageCounters, Observer},
    topology::Topology,
    transport::{MemoryNetwork, Transport},
};

static INIT: Once = Once::new();

/// Initialize test logging infrastructure
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Timings scaled down to 100ms rounds.
pub fn fast_config(cluster_name: &str, seeds: Vec<SocketAddr>) -> GossipConfig {
    let mut config = GossipConfig {
        cluster_name: cluster_name.to_string(),
        gossip_interval_ms: 100,
        ..Default::default()
    };
    config.failure_detector.heartbeat_interval_ms = 100;
    config.failure_detector.missed_beat_threshold = 3;
    config.failure_detector.suspicion_ceiling = 2;
    config.failure_detector.quarantine_interval_ms = 5_000;
    config.join.seeds = seeds;
    config.join.timeout_ms = 500;
    config.join.max_rounds = 2;
    config.join.initial_backoff_ms = 50;
    config.join.max_backoff_ms = 200;
    config
}

/// Observer that keeps every installed topology with its install time.
#[derive(Default)]
pub struct RecordingObserver {
    pub counters: MessageCounters,
    changes: Mutex<Vec<(Instant, Arc<Topology>)>>,
}

impl RecordingObserver {
    pub fn versions(&self) -> Vec<u64> {
        self.changes.lock().iter().map(|(_, t)| t.version()).collect()
    }

    /// When `node` was first seen in `state`, if ever.
    pub fn first_seen(&self, node: &NodeId, state: NodeState) -> Option<Instant> {
        self.changes
            .lock()
            .iter()
            .find(|(_, t)| t.state_of(node) == Some(state))
            .map(|(at, _)| *at)
    }
}

impl Observer for RecordingObserver {
    fn on_message(&self, kind: MessageKind) {
        self.counters.on_message(kind);
    }

    fn on_topology_change(&self, topology: &Topology) {
        self.changes
            .lock()
            .push((Instant::now(), Arc::new(topology.clone())));
    }
}

pub struct TestNode {
    pub handle: NodeHandle,
    pub task: JoinHandle<()>,
    pub observer: Arc<RecordingObserver>,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.handle.local_id()
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.handle.topology().expect("node has no topology")
    }

    pub fn state_of(&self, other: &TestNode) -> Option<NodeState> {
        self.topology().state_of(&other.id())
    }
}

/// Coordinator registered on `network` at `address`, not yet started.
pub fn build_node(
    network: &MemoryNetwork,
    address: SocketAddr,
    config: GossipConfig,
) -> (GossipCoordinator, NodeHandle, Arc<RecordingObserver>) {
    let (transport, inbound) = network.register(address, config.inbound_queue_capacity);
    let observer = Arc::new(RecordingObserver::default());
    let coordinator = GossipCoordinator::new(config, Arc::new(transport), inbound)
        .expect("valid test config")
        .with_observer(observer.clone());
    let handle = coordinator.handle();
    (coordinator, handle, observer)
}

/// Build, join and spawn a node.
pub async fn spawn_node(network: &MemoryNetwork, address: SocketAddr, config: GossipConfig) -> TestNode {
    let (coordinator, handle, observer) = build_node(network, address, config);
    let task = coordinator.start().await.expect("node failed to join");
    TestNode {
        handle,
        task,
        observer,
    }
}

/// `count` nodes on consecutive ports; the first bootstraps, the rest join it.
pub async fn spawn_cluster(
    network: &MemoryNetwork,
    cluster_name: &str,
    first_port: u16,
    count: u16,
) -> Vec<TestNode> {
    let seed = addr(first_port);
    let mut nodes = vec![spawn_node(network, seed, fast_config(cluster_name, vec![])).await];
    for port in first_port + 1..first_port + count {
        nodes.push(spawn_node(network, addr(port), fast_config(cluster_name, vec![seed])).await);
    }
    nodes
}

/// Send a JoinRequest for `descriptor` to `contact` from a bare transport at
/// the descriptor's address and return the contact's answer.
pub async fn request_join(
    network: &MemoryNetwork,
    contact: SocketAddr,
    descriptor: NodeDescriptor,
    cluster_name: &str,
    protocol_version: u32,
) -> Payload {
    let (transport, mut inbound) = network.register(descriptor.address, 16);
    let request = GossipMessage::new(
        descriptor.clone(),
        1,
        Payload::JoinRequest {
            cluster_name: cluster_name.to_string(),
            protocol_version,
            descriptor,
        },
    );
    let frame = BincodeCodec.encode(&request).expect("encode join request");
    transport
        .send(contact, frame)
        .await
        .expect("send join request");

    let reply = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
        .await
        .expect("no reply to join request")
        .expect("inbound queue closed");
    BincodeCodec.decode(&reply).expect("decode join reply").payload
}
