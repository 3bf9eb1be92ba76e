//! Versioned topology snapshots and the merge rules that reconcile them.
//!
//! A [`Topology`] is never mutated after construction. Every accepted change
//! produces a new snapshot with a strictly higher version, which the
//! coordinator publishes through a [`TopologyHandle`].

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use super::node::{NodeDescriptor, NodeId, NodeState};

/// Clock assigned to a member when it is first admitted.
pub const INITIAL_CLOCK: u64 = 1;

// ============================================================================
// Member Record - One Node As Seen By The Cluster
// ============================================================================

/// Ordering key of a member record.
///
/// Field order is the merge order: a removed record beats everything, then the
/// higher clock, then state precedence, then the topology version at which the
/// record was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberVersion {
    pub removed: bool,
    pub clock: u64,
    pub state: NodeState,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRecord {
    pub descriptor: NodeDescriptor,
    pub state: NodeState,
    /// Per-member logical clock, advanced only by the member itself.
    pub clock: u64,
    /// Topology version at which this record was produced.
    pub version: u64,
}

impl MemberRecord {
    pub fn new(descriptor: NodeDescriptor, state: NodeState, clock: u64, version: u64) -> Self {
        Self {
            descriptor,
            state,
            clock,
            version,
        }
    }

    pub fn id(&self) -> NodeId {
        self.descriptor.id
    }

    pub fn address(&self) -> SocketAddr {
        self.descriptor.address
    }

    pub fn member_version(&self) -> MemberVersion {
        MemberVersion {
            removed: self.state.is_terminal(),
            clock: self.clock,
            state: self.state,
            version: self.version,
        }
    }

    /// True when this record wins over `other` regardless of which topology
    /// version produced either of them.
    pub fn outranks(&self, other: &MemberRecord) -> bool {
        let mine = self.member_version();
        let theirs = other.member_version();
        (mine.removed, mine.clock, mine.state) > (theirs.removed, theirs.clock, theirs.state)
    }

    /// Stable 64-bit hash of every field, used by digests to detect divergence.
    pub fn state_hash(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.descriptor.id.as_bytes());
        hasher.update(self.descriptor.address.to_string().as_bytes());
        hasher.update(&self.descriptor.join_order.to_le_bytes());
        hasher.update(&[self.state as u8]);
        hasher.update(&self.clock.to_le_bytes());
        hasher.update(&self.version.to_le_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }

    // Total order used to pick a merge winner. The descriptor fields only
    // matter for records that agree on everything else.
    fn merge_key(&self) -> (MemberVersion, u64, SocketAddr) {
        (
            self.member_version(),
            self.descriptor.join_order,
            self.descriptor.address,
        )
    }

    fn evolve(&self, state: NodeState, clock: u64, version: u64) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            state,
            clock,
            version,
        }
    }
}

// ============================================================================
// Delta - Single Confirmed Event
// ============================================================================

/// A single confirmed membership event applied with [`Topology::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// Admit a member as UP with the clock its contact assigned.
    Join {
        descriptor: NodeDescriptor,
        clock: u64,
    },
    /// A heartbeat carrying the member's current clock. Only a newer clock
    /// changes anything; it is the one path that brings a DOWN member back.
    Heartbeat { node_id: NodeId, clock: u64 },
    Leave { node_id: NodeId },
    Down { node_id: NodeId },
    /// Mark a DOWN member REMOVED after quarantine.
    Remove { node_id: NodeId },
    /// Drop an expired REMOVED record. The caller keeps the id barred, since
    /// a peer still holding the tombstone would otherwise gossip it back.
    Purge { node_id: NodeId },
}

impl Delta {
    pub fn node_id(&self) -> NodeId {
        match self {
            Delta::Join { descriptor, .. } => descriptor.id,
            Delta::Heartbeat { node_id, .. }
            | Delta::Leave { node_id }
            | Delta::Down { node_id }
            | Delta::Remove { node_id }
            | Delta::Purge { node_id } => *node_id,
        }
    }
}

// ============================================================================
// Topology - Immutable Versioned Snapshot
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Topology {
    version: u64,
    members: BTreeMap<NodeId, MemberRecord>,
}

impl Topology {
    /// Topology of a node that starts a new cluster on its own.
    pub fn bootstrap(local: NodeDescriptor) -> Self {
        let record = MemberRecord::new(local, NodeState::Up, INITIAL_CLOCK, 1);
        Self::from_records(1, [record])
    }

    pub fn from_records(version: u64, records: impl IntoIterator<Item = MemberRecord>) -> Self {
        Self {
            version,
            members: records.into_iter().map(|r| (r.id(), r)).collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn members(&self) -> &BTreeMap<NodeId, MemberRecord> {
        &self.members
    }

    pub fn get(&self, id: &NodeId) -> Option<&MemberRecord> {
        self.members.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains_key(id)
    }

    /// Number of member records, tombstones included.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn state_of(&self, id: &NodeId) -> Option<NodeState> {
        self.members.get(id).map(|r| r.state)
    }

    /// Members that have not been removed.
    pub fn live_count(&self) -> usize {
        self.members
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    pub fn count_in(&self, state: NodeState) -> usize {
        self.members.values().filter(|r| r.state == state).count()
    }

    pub fn records_in(&self, state: NodeState) -> impl Iterator<Item = &MemberRecord> {
        self.members.values().filter(move |r| r.state == state)
    }

    /// Clones of the records for `ids`, skipping ids this snapshot lacks.
    pub fn records_for<'a>(&self, ids: impl IntoIterator<Item = &'a NodeId>) -> Vec<MemberRecord> {
        ids.into_iter()
            .filter_map(|id| self.members.get(id).cloned())
            .collect()
    }

    /// Sub-snapshot restricted to `ids`, keeping this snapshot's version.
    pub fn partial<'a>(&self, ids: impl IntoIterator<Item = &'a NodeId>) -> Topology {
        Topology::from_records(self.version, self.records_for(ids))
    }

    /// Member-set equality, ignoring the snapshot version.
    pub fn same_members(&self, other: &Topology) -> bool {
        self.members == other.members
    }

    /// Reconcile with a remote snapshot (full or partial).
    ///
    /// Per id the record with the greater [`MemberVersion`] survives. The
    /// version advances past both inputs only if some member changed.
    pub fn merge(&self, remote: &Topology) -> Topology {
        let mut members = self.members.clone();
        let mut changed = false;

        for (id, incoming) in &remote.members {
            match members.get(id) {
                Some(existing) if existing.merge_key() >= incoming.merge_key() => {}
                _ => {
                    members.insert(*id, incoming.clone());
                    changed = true;
                }
            }
        }

        if !changed {
            return self.clone();
        }

        Topology {
            version: self.version.max(remote.version) + 1,
            members,
        }
    }

    /// Apply one confirmed event. Returns an unchanged clone when the event
    /// loses against the current record.
    pub fn apply(&self, delta: &Delta) -> Topology {
        let next_version = self.version + 1;
        let current = self.members.get(&delta.node_id());

        if let Delta::Purge { node_id } = delta {
            return match current {
                Some(record) if record.state.is_terminal() => {
                    let mut members = self.members.clone();
                    members.remove(node_id);
                    Topology {
                        version: next_version,
                        members,
                    }
                }
                _ => self.clone(),
            };
        }

        let candidate = match (delta, current) {
            (Delta::Join { descriptor, clock }, _) => Some(MemberRecord::new(
                descriptor.clone(),
                NodeState::Up,
                *clock,
                next_version,
            )),
            (Delta::Heartbeat { clock, .. }, Some(record)) => {
                Some(record.evolve(NodeState::Up, *clock, next_version))
            }
            (Delta::Leave { .. }, Some(record)) => {
                Some(record.evolve(NodeState::Leaving, record.clock, next_version))
            }
            (Delta::Down { .. }, Some(record)) => {
                Some(record.evolve(NodeState::Down, record.clock, next_version))
            }
            (Delta::Remove { .. }, Some(record)) if record.state == NodeState::Down => {
                Some(record.evolve(NodeState::Removed, record.clock, next_version))
            }
            _ => None,
        };

        match candidate {
            Some(record) if current.map_or(true, |c| record.outranks(c)) => {
                let mut members = self.members.clone();
                members.insert(record.id(), record);
                Topology {
                    version: next_version,
                    members,
                }
            }
            _ => self.clone(),
        }
    }
}

/// Free-function form of [`Topology::merge`].
pub fn merge(local: &Topology, remote: &Topology) -> Topology {
    local.merge(remote)
}

/// Free-function form of [`Topology::apply`].
pub fn apply(local: &Topology, delta: &Delta) -> Topology {
    local.apply(delta)
}

// ============================================================================
// Topology Handle - Lock-Free Snapshot Publication
// ============================================================================

/// Shared reference to a node's current topology.
///
/// Readers get a point-in-time `Arc<Topology>` without locking. Only the
/// owning coordinator installs new snapshots. Empty until the node has
/// bootstrapped or joined.
#[derive(Debug, Clone, Default)]
pub struct TopologyHandle {
    current: Arc<ArcSwapOption<Topology>>,
}

impl TopologyHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Option<Arc<Topology>> {
        self.current.load_full()
    }

    pub fn version(&self) -> Option<u64> {
        self.current.load().as_ref().map(|t| t.version())
    }

    pub(crate) fn store(&self, topology: Arc<Topology>) {
        self.current.store(Some(topology));
    }
}
