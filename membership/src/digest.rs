//! Anti-entropy digests.
//!
//! A digest entry costs a fixed handful of bytes per member no matter how large
//! the member record grows, so a round ships O(members) data and full records
//! only travel for the ids that actually diverge.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{
    node::NodeId,
    topology::{MemberVersion, Topology},
};

/// Compact summary of one member record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub node_id: NodeId,
    /// Same ordering the merge uses, so "newer" agrees with the merge winner.
    pub version: MemberVersion,
    pub state_hash: u64,
}

/// Ids to pull from and push to the remote side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub request_full: BTreeSet<NodeId>,
    pub send_full: BTreeSet<NodeId>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.request_full.is_empty() && self.send_full.is_empty()
    }
}

/// One digest entry per known member, in id order.
pub fn build_digest(topology: &Topology) -> Vec<Digest> {
    topology
        .members()
        .values()
        .map(|record| Digest {
            node_id: record.id(),
            version: record.member_version(),
            state_hash: record.state_hash(),
        })
        .collect()
}

/// Compare local and remote digests.
///
/// Common ids with equal hashes are in sync. Otherwise the newer side wins;
/// equal versions with different hashes are exchanged both ways so the merge
/// can settle them. Ids known to one side only are pulled or pushed.
pub fn reconcile(local: &[Digest], remote: &[Digest]) -> Reconciliation {
    let local_by_id: BTreeMap<NodeId, &Digest> = local.iter().map(|d| (d.node_id, d)).collect();
    let remote_by_id: BTreeMap<NodeId, &Digest> =
        remote.iter().map(|d| (d.node_id, d)).collect();
    let mut result = Reconciliation::default();

    for (id, theirs) in &remote_by_id {
        match local_by_id.get(id) {
            None => {
                result.request_full.insert(*id);
            }
            Some(ours) if ours.state_hash == theirs.state_hash => {}
            Some(ours) => {
                if theirs.version >= ours.version {
                    result.request_full.insert(*id);
                }
                if ours.version >= theirs.version {
                    result.send_full.insert(*id);
                }
            }
        }
    }

    for id in local_by_id.keys() {
        if !remote_by_id.contains_key(id) {
            result.send_full.insert(*id);
        }
    }

    result
}
