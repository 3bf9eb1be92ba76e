//! The per-node gossip coordinator.
//!
//! One coordinator task owns the node's topology. Inbound frames, the gossip
//! round timer and the heartbeat timer are all serviced from a single
//! `select!` loop, so every topology mutation is serialized. Readers observe
//! the published snapshot through [`NodeHandle`].

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use backoff::backoff::Backoff as _;
use bytes::Bytes;
use futures::future::join_all;
use rand::seq::{IndexedRandom, SliceRandom};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing as log;
use tracing::instrument;

use super::{
    codec::{max_topology_records, BincodeCodec, Codec},
    config::{GossipConfig, PROTOCOL_VERSION},
    digest::{build_digest, reconcile},
    error::{ConfigError, JoinError, TransportError},
    failure_detector::{FailureDetector, Verdict},
    message::{DuplicateFilter, GossipMessage, Payload, RejectReason},
    node::{NodeDescriptor, NodeId, NodeState},
    observer::{NoopObserver, Observer},
    retry::{self, PeerBackoff},
    topology::{Delta, MemberRecord, Topology, TopologyHandle, INITIAL_CLOCK},
    transport::{InboundReceiver, Transport},
};

/// Lifecycle of a coordinator. Variants are ordered so later phases compare
/// greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoordinatorState {
    Stopped,
    Joining,
    Running,
    Leaving,
    Terminated,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Stopped => "stopped",
            CoordinatorState::Joining => "joining",
            CoordinatorState::Running => "running",
            CoordinatorState::Leaving => "leaving",
            CoordinatorState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Node Handle - External View Of A Running Node
// ============================================================================

/// Cheap, cloneable handle for reading a node's topology and stopping it.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    local: NodeDescriptor,
    topology: TopologyHandle,
    state: watch::Receiver<CoordinatorState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl NodeHandle {
    pub fn local(&self) -> &NodeDescriptor {
        &self.local
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    /// Current snapshot, `None` until the node has joined or bootstrapped.
    pub fn topology(&self) -> Option<Arc<Topology>> {
        self.topology.load()
    }

    pub fn topology_handle(&self) -> &TopologyHandle {
        &self.topology
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Request a graceful stop. A joining node aborts its join; a running
    /// node broadcasts its departure before terminating.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Resolve once the coordinator has reached `state` or any later phase.
    pub async fn reached(&self, state: CoordinatorState) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|current| *current >= state).await;
    }
}

// ============================================================================
// Gossip Coordinator
// ============================================================================

pub struct GossipCoordinator {
    config: GossipConfig,
    local: NodeDescriptor,
    transport: Arc<dyn Transport>,
    inbound: InboundReceiver,
    codec: Arc<dyn Codec>,
    observer: Arc<dyn Observer>,

    topology: Option<Arc<Topology>>,
    published: TopologyHandle,
    detector: FailureDetector,
    duplicates: DuplicateFilter,
    peer_backoff: HashMap<NodeId, PeerBackoff>,
    /// Admission limit: `max_members`, lowered to what one frame can carry.
    member_cap: usize,
    /// When each REMOVED record was first installed.
    tombstones: HashMap<NodeId, Instant>,
    /// Ids whose tombstones were purged. Never admitted or merged again.
    retired: HashSet<NodeId>,

    /// Sequence id of the last message sent.
    sequence: u64,
    /// This node's own logical clock.
    clock: u64,
    last_notified_version: u64,
    leaving: bool,
    evicted: bool,

    state: watch::Sender<CoordinatorState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GossipCoordinator {
    /// Coordinator for a fresh node, reachable at `advertise_addr` or else at
    /// the transport's address.
    pub fn new(
        config: GossipConfig,
        transport: Arc<dyn Transport>,
        inbound: InboundReceiver,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let address = config
            .advertise_addr
            .unwrap_or_else(|| transport.local_addr());
        if address.ip().is_unspecified() {
            return Err(ConfigError::invalid(
                "advertise_addr",
                format!("required when the transport is bound to {}", address),
            ));
        }

        let local = NodeDescriptor::new(address);
        let member_cap = admission_cap(&config, transport.as_ref(), &BincodeCodec);
        let detector = FailureDetector::new(config.failure_detector.clone(), local.id);
        let (state, _) = watch::channel(CoordinatorState::Stopped);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            local,
            transport,
            inbound,
            codec: Arc::new(BincodeCodec),
            observer: Arc::new(NoopObserver),
            topology: None,
            published: TopologyHandle::new(),
            detector,
            duplicates: DuplicateFilter::new(),
            peer_backoff: HashMap::new(),
            member_cap,
            tombstones: HashMap::new(),
            retired: HashSet::new(),
            sequence: 0,
            clock: INITIAL_CLOCK,
            last_notified_version: 0,
            leaving: false,
            evicted: false,
            state,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.member_cap = admission_cap(&self.config, self.transport.as_ref(), codec.as_ref());
        self.codec = codec;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn local(&self) -> &NodeDescriptor {
        &self.local
    }

    /// Topology size at which join requests are refused.
    pub fn member_cap(&self) -> usize {
        self.member_cap
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            local: self.local.clone(),
            topology: self.published.clone(),
            state: self.state.subscribe(),
            shutdown: self.shutdown_tx.clone(),
        }
    }

    /// Join (or bootstrap) and then run the event loop on a new task.
    ///
    /// Join failures are returned here; nothing is spawned in that case.
    pub async fn start(mut self) -> Result<JoinHandle<()>, JoinError> {
        self.join().await?;
        Ok(tokio::spawn(self.run()))
    }

    // ------------------------------------------------------------------------
    // Join
    // ------------------------------------------------------------------------

    /// Enter the cluster through the configured seeds.
    ///
    /// With no seeds other than this node's own address the node bootstraps a
    /// new single-member cluster.
    pub async fn join(&mut self) -> Result<(), JoinError> {
        self.set_state(CoordinatorState::Joining);
        let result = self.try_join().await;
        match &result {
            Ok(()) => self.set_state(CoordinatorState::Running),
            Err(e) => {
                log::warn!("Node {} failed to join: {}", self.local.id, e);
                self.set_state(CoordinatorState::Terminated);
            }
        }
        result
    }

    async fn try_join(&mut self) -> Result<(), JoinError> {
        self.check_shutdown()?;

        let seeds: Vec<SocketAddr> = self
            .config
            .join
            .seeds
            .iter()
            .copied()
            .filter(|seed| *seed != self.local.address)
            .collect();

        if seeds.is_empty() {
            log::info!(
                "Node {} at {} bootstrapping cluster '{}'",
                self.local.id,
                self.local.address,
                self.config.cluster_name
            );
            self.install(Topology::bootstrap(self.local.clone()), Instant::now());
            return Ok(());
        }

        let mut backoff = retry::exponential(
            self.config.join.initial_backoff(),
            self.config.join.max_backoff(),
        );
        let mut attempts = 0u32;

        for round in 0..self.config.join.max_rounds {
            for seed in &seeds {
                attempts += 1;
                log::info!(
                    "Join attempt {} (round {}) via seed {}",
                    attempts,
                    round + 1,
                    seed
                );

                let request = Payload::JoinRequest {
                    cluster_name: self.config.cluster_name.clone(),
                    protocol_version: PROTOCOL_VERSION,
                    descriptor: self.local.clone(),
                };
                let reply = if self.send(None, *seed, request).await {
                    let deadline = Instant::now() + self.config.join.timeout();
                    self.await_join_reply(deadline).await?
                } else {
                    None
                };

                match reply {
                    Some(JoinReply::Accepted {
                        topology,
                        assigned_clock,
                    }) => {
                        log::info!(
                            "Joined cluster '{}' via {} at version {} with {} members",
                            self.config.cluster_name,
                            seed,
                            topology.version(),
                            topology.len()
                        );
                        self.clock = assigned_clock;
                        self.install(topology, Instant::now());
                        return Ok(());
                    }
                    Some(JoinReply::Rejected { contact, reason }) => {
                        return Err(JoinError::Rejected { contact, reason });
                    }
                    None => {
                        let delay = backoff
                            .next_backoff()
                            .unwrap_or_else(|| self.config.join.max_backoff());
                        log::debug!("No join reply from {}, retrying in {:?}", seed, delay);
                        self.sleep_or_abort(delay).await?;
                    }
                }
            }
        }

        Err(JoinError::SeedsExhausted { attempts })
    }

    async fn await_join_reply(&mut self, deadline: Instant) -> Result<Option<JoinReply>, JoinError> {
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return Err(JoinError::Aborted);
                    }
                }
                frame = self.inbound.recv() => {
                    let Some(frame) = frame else {
                        return Err(JoinError::ChannelClosed);
                    };
                    if let Some(reply) = self.join_reply_from(frame) {
                        return Ok(Some(reply));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    /// Frames other than join replies are dropped while joining.
    fn join_reply_from(&mut self, frame: Bytes) -> Option<JoinReply> {
        let message = self.decode(&frame)?;
        let kind = message.kind();
        let contact = message.sender.address;
        match message.payload {
            Payload::JoinAccept {
                topology,
                assigned_clock,
            } => Some(JoinReply::Accepted {
                topology,
                assigned_clock,
            }),
            Payload::JoinReject { reason } => Some(JoinReply::Rejected { contact, reason }),
            _ => {
                log::debug!("Dropping {} from {} while joining", kind, contact);
                None
            }
        }
    }

    async fn sleep_or_abort(&mut self, delay: Duration) -> Result<(), JoinError> {
        tokio::select! {
            biased;
            changed = self.shutdown_rx.changed() => {
                if changed.is_err() || *self.shutdown_rx.borrow() {
                    return Err(JoinError::Aborted);
                }
                Ok(())
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn check_shutdown(&mut self) -> Result<(), JoinError> {
        if *self.shutdown_rx.borrow_and_update() {
            return Err(JoinError::Aborted);
        }
        Ok(())
    }

    /// Admission checks run by a contact node.
    fn admit(
        &self,
        topology: &Topology,
        cluster_name: &str,
        protocol_version: u32,
        joiner: &NodeDescriptor,
    ) -> Result<u64, RejectReason> {
        if cluster_name != self.config.cluster_name {
            return Err(RejectReason::ClusterNameMismatch);
        }
        if protocol_version != PROTOCOL_VERSION {
            return Err(RejectReason::ProtocolVersionMismatch);
        }
        if self.retired.contains(&joiner.id) {
            return Err(RejectReason::IdRemoved);
        }
        match topology.get(&joiner.id) {
            Some(record) if record.state.is_terminal() => Err(RejectReason::IdRemoved),
            // Re-delivered request: keep the clock already assigned.
            Some(record) => Ok(record.clock),
            None if topology.len() >= self.member_cap => Err(RejectReason::ClusterFull),
            None => Ok(INITIAL_CLOCK),
        }
    }

    // ------------------------------------------------------------------------
    // Event Loop
    // ------------------------------------------------------------------------

    #[instrument(fields(node = %self.local.id), skip(self))]
    pub async fn run(mut self) {
        if self.topology.is_none() {
            log::error!("Coordinator started without a topology; call join() first");
            self.set_state(CoordinatorState::Terminated);
            return;
        }

        let mut gossip_timer = tokio::time::interval(self.config.gossip_interval());
        gossip_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_timer =
            tokio::time::interval(self.config.failure_detector.heartbeat_interval());
        heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown = *self.shutdown_rx.borrow_and_update();
        let mut round: u64 = 0;

        while !shutdown && !self.evicted {
            tokio::select! {
                biased;
                changed = self.shutdown_rx.changed() => {
                    shutdown = changed.is_err() || *self.shutdown_rx.borrow();
                }
                _ = gossip_timer.tick() => {
                    round += 1;
                    log::trace!("Gossip round {}", round);
                    self.gossip_round(Instant::now()).await;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats(Instant::now()).await;
                }
                frame = self.inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(frame, Instant::now()).await,
                    None => {
                        log::warn!("Inbound queue closed, stopping node {}", self.local.id);
                        break;
                    }
                },
            }
        }

        if self.evicted {
            log::warn!("Node {} was removed from the cluster, stopping", self.local.id);
        } else if shutdown {
            self.leave().await;
        }

        self.set_state(CoordinatorState::Terminated);
        log::info!("Node {} at {} terminated", self.local.id, self.local.address);
    }

    /// Decode and dispatch one inbound frame.
    pub(crate) async fn handle_frame(&mut self, frame: Bytes, now: Instant) {
        let Some(message) = self.decode(&frame) else {
            return;
        };
        let sender = message.sender;
        self.detector.on_heartbeat(&sender.id, now);

        match message.payload {
            Payload::JoinRequest {
                cluster_name,
                protocol_version,
                descriptor,
            } => {
                self.handle_join_request(&cluster_name, protocol_version, descriptor, now)
                    .await
            }
            Payload::JoinAccept { .. } | Payload::JoinReject { .. } => {
                log::debug!("Ignoring late join reply from {}", sender.address);
            }
            Payload::GossipDigest { mut digests, .. } => {
                let Some(topology) = self.topology.clone() else {
                    return;
                };
                digests.retain(|d| !self.retired.contains(&d.node_id));
                let plan = reconcile(&build_digest(&topology), &digests);
                if plan.is_empty() {
                    return;
                }
                log::debug!(
                    "Digest from {}: pushing {}, requesting {}",
                    sender.id,
                    plan.send_full.len(),
                    plan.request_full.len()
                );
                let update = Payload::GossipUpdate {
                    topology_version: topology.version(),
                    records: topology.records_for(&plan.send_full),
                    requested: plan.request_full.into_iter().collect(),
                };
                self.send(Some(sender.id), sender.address, update).await;
            }
            Payload::GossipUpdate {
                topology_version,
                records,
                requested,
            } => {
                self.handle_update(&sender, topology_version, records, requested, now)
                    .await
            }
            Payload::HeartbeatRequest { clock } => {
                self.observe_clock(&sender.id, clock, now);
                let reply = Payload::HeartbeatReply { clock: self.clock };
                self.send(Some(sender.id), sender.address, reply).await;
            }
            Payload::HeartbeatReply { clock } => {
                self.observe_clock(&sender.id, clock, now);
            }
        }
    }

    async fn handle_join_request(
        &mut self,
        cluster_name: &str,
        protocol_version: u32,
        joiner: NodeDescriptor,
        now: Instant,
    ) {
        let Some(topology) = self.topology.clone() else {
            return;
        };
        if self.leaving {
            log::debug!("Ignoring join request from {} while leaving", joiner.address);
            return;
        }

        let reply = match self.admit(&topology, cluster_name, protocol_version, &joiner) {
            Ok(clock) => {
                log::info!("Admitting {} at {}", joiner.id, joiner.address);
                self.install(
                    topology.apply(&Delta::Join {
                        descriptor: joiner.clone(),
                        clock,
                    }),
                    now,
                );
                let current = self.topology.as_deref().cloned().unwrap_or_default();
                Payload::JoinAccept {
                    topology: current,
                    assigned_clock: clock,
                }
            }
            Err(reason) => {
                log::info!(
                    "Rejecting join from {} at {}: {}",
                    joiner.id,
                    joiner.address,
                    reason
                );
                Payload::JoinReject { reason }
            }
        };
        self.send(Some(joiner.id), joiner.address, reply).await;
    }

    async fn handle_update(
        &mut self,
        sender: &NodeDescriptor,
        topology_version: u64,
        mut records: Vec<MemberRecord>,
        requested: Vec<NodeId>,
        now: Instant,
    ) {
        records.retain(|r| !self.retired.contains(&r.id()));
        if !records.is_empty() {
            let remote = Topology::from_records(topology_version, records);
            if let Some(current) = self.topology.clone() {
                self.install(current.merge(&remote), now);
            }
        }

        if requested.is_empty() {
            return;
        }
        let Some(topology) = self.topology.clone() else {
            return;
        };
        let records = topology.records_for(&requested);
        if records.is_empty() {
            return;
        }
        let update = Payload::GossipUpdate {
            topology_version: topology.version(),
            records,
            requested: Vec::new(),
        };
        self.send(Some(sender.id), sender.address, update).await;
    }

    /// A peer's clock seen in a heartbeat. A newer clock than the one on
    /// record is applied, which is also how a DOWN member comes back.
    fn observe_clock(&mut self, peer: &NodeId, clock: u64, now: Instant) {
        let Some(topology) = self.topology.clone() else {
            return;
        };
        if topology.get(peer).is_some_and(|r| clock > r.clock) {
            self.install(
                topology.apply(&Delta::Heartbeat {
                    node_id: *peer,
                    clock,
                }),
                now,
            );
        }
    }

    // ------------------------------------------------------------------------
    // Periodic Work
    // ------------------------------------------------------------------------

    /// Digests out to random peers, then detector verdicts, then tombstone
    /// expiry. Replies merge as they arrive on the inbound queue.
    async fn gossip_round(&mut self, now: Instant) {
        self.send_digests(now).await;
        self.apply_verdicts(now);
        self.expire_tombstones(now);
    }

    async fn send_digests(&mut self, now: Instant) {
        let Some(topology) = self.topology.clone() else {
            return;
        };
        let targets = self.gossip_targets(&topology, now);
        if targets.is_empty() {
            return;
        }
        let digests = build_digest(&topology);
        for (peer, address) in targets {
            let payload = Payload::GossipDigest {
                topology_version: topology.version(),
                digests: digests.clone(),
            };
            self.send(Some(peer), address, payload).await;
        }
    }

    fn apply_verdicts(&mut self, now: Instant) {
        for verdict in self.detector.tick(now) {
            let delta = match verdict {
                Verdict::Down(node_id) => Delta::Down { node_id },
                Verdict::Removed(node_id) => Delta::Remove { node_id },
            };
            if let Some(current) = self.topology.clone() {
                self.install(current.apply(&delta), now);
            }
        }
    }

    /// Purge REMOVED records older than `tombstone_ttl` and retire their ids.
    fn expire_tombstones(&mut self, now: Instant) {
        let ttl = self.config.tombstone_ttl();
        let expired: Vec<NodeId> = self
            .tombstones
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= ttl)
            .map(|(id, _)| *id)
            .collect();

        for node_id in expired {
            self.tombstones.remove(&node_id);
            self.retired.insert(node_id);
            if let Some(current) = self.topology.clone() {
                log::debug!("Purging tombstone of {}", node_id);
                self.install(current.apply(&Delta::Purge { node_id }), now);
            }
        }
    }

    /// `fanout` random UP peers plus one random DOWN peer, so a healed
    /// partition gets a chance to reconcile.
    fn gossip_targets(&self, topology: &Topology, now: Instant) -> Vec<(NodeId, SocketAddr)> {
        let up: Vec<(NodeId, SocketAddr)> = topology
            .records_in(NodeState::Up)
            .filter(|r| r.id() != self.local.id && self.may_contact(&r.id(), now))
            .map(|r| (r.id(), r.address()))
            .collect();
        let mut targets = choose_random(&up, self.config.fanout);

        let down: Vec<(NodeId, SocketAddr)> = topology
            .records_in(NodeState::Down)
            .map(|r| (r.id(), r.address()))
            .collect();
        if let Some(peer) = down.choose(&mut rand::rng()) {
            targets.push(*peer);
        }
        targets
    }

    async fn send_heartbeats(&mut self, now: Instant) {
        let Some(topology) = self.topology.clone() else {
            return;
        };
        let peers: Vec<(NodeId, SocketAddr)> = topology
            .members()
            .values()
            .filter(|r| {
                r.id() != self.local.id
                    && matches!(
                        r.state,
                        NodeState::Joining | NodeState::Up | NodeState::Leaving
                    )
                    && self.may_contact(&r.id(), now)
            })
            .map(|r| (r.id(), r.address()))
            .collect();

        let clock = self.clock;
        for (peer, address) in peers {
            self.send(Some(peer), address, Payload::HeartbeatRequest { clock })
                .await;
        }
    }

    fn may_contact(&self, peer: &NodeId, now: Instant) -> bool {
        self.peer_backoff
            .get(peer)
            .map_or(true, |backoff| backoff.should_retry(now))
    }

    // ------------------------------------------------------------------------
    // Leave
    // ------------------------------------------------------------------------

    /// Mark this node LEAVING and tell up to `leave_fanout` peers, bounded by
    /// `leave_timeout`.
    async fn leave(&mut self) {
        self.set_state(CoordinatorState::Leaving);
        self.leaving = true;

        let Some(current) = self.topology.clone() else {
            return;
        };
        self.install(
            current.apply(&Delta::Leave {
                node_id: self.local.id,
            }),
            Instant::now(),
        );

        let Some(topology) = self.topology.clone() else {
            return;
        };
        let Some(own) = topology.get(&self.local.id).cloned() else {
            return;
        };
        let peers: Vec<(NodeId, SocketAddr)> = topology
            .members()
            .values()
            .filter(|r| {
                r.id() != self.local.id
                    && matches!(
                        r.state,
                        NodeState::Joining | NodeState::Up | NodeState::Leaving
                    )
            })
            .map(|r| (r.id(), r.address()))
            .collect();
        let targets = choose_random(&peers, self.config.leave_fanout);
        if targets.is_empty() {
            return;
        }

        let Some(frame) = self.encode(Payload::GossipUpdate {
            topology_version: topology.version(),
            records: vec![own],
            requested: Vec::new(),
        }) else {
            return;
        };

        log::info!("Node {} leaving, notifying {} peers", self.local.id, targets.len());
        let sends = targets.into_iter().map(|(_, address)| {
            let transport = self.transport.clone();
            let frame = frame.clone();
            async move { (address, transport.send(address, frame).await) }
        });

        match tokio::time::timeout(self.config.leave_timeout(), join_all(sends)).await {
            Ok(results) => {
                for (address, result) in results {
                    if let Err(e) = result {
                        log::warn!("Leave notification to {} failed: {}", address, e);
                    }
                }
            }
            Err(_) => log::warn!(
                "Leave broadcast timed out after {:?}",
                self.config.leave_timeout()
            ),
        }
    }

    // ------------------------------------------------------------------------
    // Topology Installation
    // ------------------------------------------------------------------------

    /// Publish `next` if it advances the version, then sync the detector and
    /// notify the observer.
    fn install(&mut self, next: Topology, now: Instant) {
        let next = self.refute_if_suspected(next);
        if self
            .topology
            .as_ref()
            .is_some_and(|current| next.version() <= current.version())
        {
            return;
        }

        self.detector.sync(&next, now);
        for removed in next.records_in(NodeState::Removed) {
            self.duplicates.forget(&removed.id());
            self.tombstones.entry(removed.id()).or_insert(now);
        }
        self.peer_backoff.retain(|id, _| {
            next.get(id)
                .is_some_and(|record| !record.state.is_terminal())
        });

        let next = Arc::new(next);
        log::debug!(
            "Installing topology version {} ({} members)",
            next.version(),
            next.live_count()
        );
        self.published.store(next.clone());
        self.topology = Some(next.clone());

        if next.version() != self.last_notified_version {
            self.last_notified_version = next.version();
            self.observer.on_topology_change(&next);
        }
    }

    /// A running node contradicts a DOWN or LEAVING verdict about itself by
    /// bumping its clock. A REMOVED verdict is final.
    fn refute_if_suspected(&mut self, next: Topology) -> Topology {
        let Some(own) = next.get(&self.local.id) else {
            return next;
        };
        match own.state {
            NodeState::Removed => {
                self.evicted = true;
                next
            }
            NodeState::Down | NodeState::Leaving if !self.leaving => {
                let clock = own.clock.max(self.clock) + 1;
                log::info!(
                    "Refuting {} verdict about this node with clock {}",
                    own.state,
                    clock
                );
                self.clock = clock;
                next.apply(&Delta::Heartbeat {
                    node_id: self.local.id,
                    clock,
                })
            }
            _ => next,
        }
    }

    // ------------------------------------------------------------------------
    // Wire Helpers
    // ------------------------------------------------------------------------

    /// Decode, drop loopback and duplicate frames, and count the message.
    fn decode(&mut self, frame: &[u8]) -> Option<GossipMessage> {
        let message = match self.codec.decode(frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping undecodable frame ({} bytes): {}", frame.len(), e);
                return None;
            }
        };
        if message.sender_id() == self.local.id {
            return None;
        }
        if !self.duplicates.accept(message.sender_id(), message.sequence) {
            log::trace!(
                "Dropping duplicate {} #{} from {}",
                message.kind(),
                message.sequence,
                message.sender_id()
            );
            return None;
        }
        self.observer.on_message(message.kind());
        Some(message)
    }

    fn encode(&mut self, payload: Payload) -> Option<Bytes> {
        self.sequence += 1;
        let message = GossipMessage::new(self.local.clone(), self.sequence, payload);
        match self.codec.encode(&message) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::warn!("Failed to encode {}: {}", message.kind(), e);
                None
            }
        }
    }

    /// Returns whether the transport accepted the frame. Failures put the peer
    /// on backoff; they never abort the caller.
    async fn send(&mut self, peer: Option<NodeId>, to: SocketAddr, payload: Payload) -> bool {
        let kind = payload.kind();
        let Some(frame) = self.encode(payload) else {
            return false;
        };

        match self.transport.send(to, frame).await {
            Ok(()) => {
                if let Some(backoff) = peer.and_then(|id| self.peer_backoff.get_mut(&id)) {
                    backoff.reset();
                }
                true
            }
            // Local sizing problem, not the peer's fault.
            Err(e @ TransportError::FrameTooLarge { .. }) => {
                log::error!("Dropping {} to {}: {}", kind, to, e);
                false
            }
            Err(e) => {
                match peer {
                    Some(id) => {
                        let initial = self.config.gossip_interval();
                        let max = self.config.failure_detector.quarantine_interval();
                        let backoff = self
                            .peer_backoff
                            .entry(id)
                            .or_insert_with(|| PeerBackoff::new(initial, max));
                        let delay = backoff.record_failure(Instant::now());
                        log::warn!(
                            "Failed to send {} to {} (attempt {}): {}. Next retry in {:?}",
                            kind,
                            to,
                            backoff.attempt_count(),
                            e,
                            delay
                        );
                    }
                    None => log::warn!("Failed to send {} to {}: {}", kind, to, e),
                }
                false
            }
        }
    }

    fn set_state(&self, state: CoordinatorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Coordinator {} -> {}", previous, state);
        }
    }

    // ------------------------------------------------------------------------
    // Test Hooks
    // ------------------------------------------------------------------------

    /// Send one digest to `peer` outside the round timer.
    #[cfg(test)]
    pub(crate) async fn gossip_with(&mut self, peer: SocketAddr) {
        let Some(topology) = self.topology.clone() else {
            return;
        };
        let payload = Payload::GossipDigest {
            topology_version: topology.version(),
            digests: build_digest(&topology),
        };
        self.send(None, peer, payload).await;
    }

    /// Handle every frame already queued, without blocking.
    #[cfg(test)]
    pub(crate) async fn drain_inbound(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(frame) = self.inbound.try_recv() {
            self.handle_frame(frame, Instant::now()).await;
            handled += 1;
        }
        handled
    }
}

/// `max_members`, lowered when a topology that large would not fit in one
/// frame of `transport` under `codec`.
fn admission_cap(config: &GossipConfig, transport: &dyn Transport, codec: &dyn Codec) -> usize {
    let Some(limit) = transport.max_frame_size() else {
        return config.max_members;
    };
    match max_topology_records(codec, limit) {
        Ok(fit) if fit < config.max_members => {
            log::warn!(
                "max_members={} does not fit a {} byte frame with the {} codec, admitting at most {}",
                config.max_members,
                limit,
                codec.name(),
                fit
            );
            fit
        }
        Ok(_) => config.max_members,
        Err(e) => {
            log::warn!("Could not size {} frames: {}", codec.name(), e);
            config.max_members
        }
    }
}

enum JoinReply {
    Accepted {
        topology: Topology,
        assigned_clock: u64,
    },
    Rejected {
        contact: SocketAddr,
        reason: RejectReason,
    },
}

/// Up to `k` distinct items in random order.
fn choose_random<T: Copy>(items: &[T], k: usize) -> Vec<T> {
    let mut rng = rand::rng();
    if k >= items.len() {
        let mut all = items.to_vec();
        all.shuffle(&mut rng);
        return all;
    }
    items.choose_multiple(&mut rng, k).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::JsonCodec,
        transport::{udp::MAX_DATAGRAM_SIZE, MemoryNetwork, UdpTransport},
    };

    #[test]
    fn test_choose_random_bounds() {
        let items: Vec<u32> = (0..10).collect();
        let picked = choose_random(&items, 3);
        assert_eq!(picked.len(), 3);
        let mut unique = picked.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 3);

        let all = choose_random(&items, 50);
        assert_eq!(all.len(), 10);
        assert!(choose_random::<u32>(&[], 2).is_empty());
    }

    #[test]
    fn test_coordinator_states_are_ordered() {
        assert!(CoordinatorState::Stopped < CoordinatorState::Joining);
        assert!(CoordinatorState::Running < CoordinatorState::Leaving);
        assert!(CoordinatorState::Leaving < CoordinatorState::Terminated);
        assert_eq!(CoordinatorState::Running.to_string(), "running");
    }

    #[test]
    fn test_unspecified_bind_needs_advertise_addr() {
        let network = MemoryNetwork::new();
        let bind = SocketAddr::from(([0, 0, 0, 0], 7946));

        let (transport, inbound) = network.register(bind, 8);
        let err =
            GossipCoordinator::new(GossipConfig::default(), Arc::new(transport), inbound).err();
        assert!(matches!(
            err,
            Some(ConfigError::Invalid {
                field: "advertise_addr",
                ..
            })
        ));

        let advertised = SocketAddr::from(([10, 0, 0, 7], 7946));
        let config = GossipConfig {
            advertise_addr: Some(advertised),
            ..Default::default()
        };
        let (transport, inbound) = network.register(bind, 8);
        let coordinator = GossipCoordinator::new(config, Arc::new(transport), inbound).unwrap();
        assert_eq!(coordinator.local().address, advertised);
        assert_eq!(coordinator.handle().local().address, advertised);
    }

    #[tokio::test]
    async fn test_member_cap_follows_datagram_limit() {
        let bind = SocketAddr::from(([127, 0, 0, 1], 0));
        let bincode_cap = max_topology_records(&BincodeCodec, MAX_DATAGRAM_SIZE).unwrap();

        let (transport, inbound) = UdpTransport::bind(bind, 8).await.unwrap();
        let config = GossipConfig {
            max_members: 100_000,
            ..Default::default()
        };
        let coordinator = GossipCoordinator::new(config, Arc::new(transport), inbound).unwrap();
        assert_eq!(coordinator.member_cap(), bincode_cap);

        let coordinator = coordinator.with_codec(Arc::new(JsonCodec));
        assert!(coordinator.member_cap() < bincode_cap);

        // The default limit fits as configured.
        let (transport, inbound) = UdpTransport::bind(bind, 8).await.unwrap();
        let coordinator =
            GossipCoordinator::new(GossipConfig::default(), Arc::new(transport), inbound).unwrap();
        assert_eq!(coordinator.member_cap(), GossipConfig::default().max_members);

        // Unbounded transports keep the configured limit.
        let network = MemoryNetwork::new();
        let (transport, inbound) = network.register(SocketAddr::from(([127, 0, 0, 1], 7000)), 8);
        let config = GossipConfig {
            max_members: 100_000,
            ..Default::default()
        };
        let coordinator = GossipCoordinator::new(config, Arc::new(transport), inbound).unwrap();
        assert_eq!(coordinator.member_cap(), 100_000);
    }
}
