//! Wire messages exchanged between membership nodes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    digest::Digest,
    node::{NodeDescriptor, NodeId},
    topology::{MemberRecord, Topology},
};

/// Envelope of every wire message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Sender identity and reply address.
    pub sender: NodeDescriptor,
    /// Monotonic per-sender sequence id, used to drop duplicates.
    pub sequence: u64,
    pub payload: Payload,
}

impl GossipMessage {
    pub fn new(sender: NodeDescriptor, sequence: u64, payload: Payload) -> Self {
        Self {
            sender,
            sequence,
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn sender_id(&self) -> NodeId {
        self.sender.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    JoinRequest {
        cluster_name: String,
        protocol_version: u32,
        descriptor: NodeDescriptor,
    },
    JoinAccept {
        topology: Topology,
        assigned_clock: u64,
    },
    JoinReject {
        reason: RejectReason,
    },
    GossipDigest {
        topology_version: u64,
        digests: Vec<Digest>,
    },
    /// Records for divergent ids. `requested` lists ids the sender wants back.
    GossipUpdate {
        topology_version: u64,
        records: Vec<MemberRecord>,
        requested: Vec<NodeId>,
    },
    HeartbeatRequest {
        clock: u64,
    },
    HeartbeatReply {
        clock: u64,
    },
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::JoinRequest { .. } => MessageKind::JoinRequest,
            Payload::JoinAccept { .. } => MessageKind::JoinAccept,
            Payload::JoinReject { .. } => MessageKind::JoinReject,
            Payload::GossipDigest { .. } => MessageKind::GossipDigest,
            Payload::GossipUpdate { .. } => MessageKind::GossipUpdate,
            Payload::HeartbeatRequest { .. } => MessageKind::HeartbeatRequest,
            Payload::HeartbeatReply { .. } => MessageKind::HeartbeatReply,
        }
    }
}

/// Discriminant of [`Payload`], used as a counter index and metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    JoinRequest,
    JoinAccept,
    JoinReject,
    GossipDigest,
    GossipUpdate,
    HeartbeatRequest,
    HeartbeatReply,
}

impl MessageKind {
    pub const COUNT: usize = 7;

    pub const ALL: [MessageKind; Self::COUNT] = [
        MessageKind::JoinRequest,
        MessageKind::JoinAccept,
        MessageKind::JoinReject,
        MessageKind::GossipDigest,
        MessageKind::GossipUpdate,
        MessageKind::HeartbeatRequest,
        MessageKind::HeartbeatReply,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::JoinRequest => "join_request",
            MessageKind::JoinAccept => "join_accept",
            MessageKind::JoinReject => "join_reject",
            MessageKind::GossipDigest => "gossip_update_digest",
            MessageKind::GossipUpdate => "gossip_update",
            MessageKind::HeartbeatRequest => "heartbeat_request",
            MessageKind::HeartbeatReply => "heartbeat_reply",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason code carried by JOIN_REJECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum RejectReason {
    #[error("cluster name mismatch")]
    ClusterNameMismatch,
    #[error("protocol version mismatch")]
    ProtocolVersionMismatch,
    #[error("cluster is at capacity")]
    ClusterFull,
    #[error("node id was already removed from the cluster")]
    IdRemoved,
}

// ============================================================================
// Duplicate Suppression - Per-Sender Sliding Window
// ============================================================================

const WINDOW_BITS: u64 = 64;

#[derive(Debug, Clone, Copy, Default)]
struct SequenceWindow {
    highest: u64,
    // Bit i set means `highest - i` was seen.
    seen: u64,
}

/// Drops re-delivered messages using a 64-entry window per sender.
#[derive(Debug, Default)]
pub struct DuplicateFilter {
    windows: HashMap<NodeId, SequenceWindow>,
}

impl DuplicateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time `(sender, sequence)` is seen and false for
    /// duplicates or sequences older than the window.
    pub fn accept(&mut self, sender: NodeId, sequence: u64) -> bool {
        let window = self.windows.entry(sender).or_default();

        if window.seen == 0 || sequence > window.highest {
            let shift = sequence.saturating_sub(window.highest);
            window.seen = if window.seen == 0 || shift >= WINDOW_BITS {
                1
            } else {
                (window.seen << shift) | 1
            };
            window.highest = sequence;
            return true;
        }

        let age = window.highest - sequence;
        if age >= WINDOW_BITS {
            return false;
        }
        let bit = 1u64 << age;
        if window.seen & bit != 0 {
            return false;
        }
        window.seen |= bit;
        true
    }

    /// Drop bookkeeping for a sender that will never speak again.
    pub fn forget(&mut self, sender: &NodeId) {
        self.windows.remove(sender);
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
