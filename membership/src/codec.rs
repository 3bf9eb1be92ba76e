//! Pluggable wire encoding for [`GossipMessage`].
//!
//! The coordinator is handed a codec at construction; nothing in the crate
//! relies on a process-wide serializer registry.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use bytes::Bytes;

use super::{
    error::CodecError,
    message::{GossipMessage, Payload},
    node::{NodeDescriptor, NodeId, NodeState},
    topology::{MemberRecord, Topology},
};

pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, message: &GossipMessage) -> Result<Bytes, CodecError>;

    fn decode(&self, frame: &[u8]) -> Result<GossipMessage, CodecError>;
}

/// Compact binary encoding; the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode(&self, message: &GossipMessage) -> Result<Bytes, CodecError> {
        bincode::serialize(message)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, frame: &[u8]) -> Result<GossipMessage, CodecError> {
        bincode::deserialize(frame).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Human-readable encoding, handy when sniffing traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, message: &GossipMessage) -> Result<Bytes, CodecError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, frame: &[u8]) -> Result<GossipMessage, CodecError> {
        serde_json::from_slice(frame).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Largest topology, in records, whose JOIN_ACCEPT still fits in
/// `frame_limit` bytes under `codec`.
///
/// Sized from records with the longest address and integer fields, so any
/// real topology of that many records encodes no larger. A JOIN_ACCEPT is the
/// largest frame the protocol sends, since digests and updates carry at most
/// one entry per record.
pub fn max_topology_records(codec: &dyn Codec, frame_limit: usize) -> Result<usize, CodecError> {
    let one = codec.encode(&widest_join_accept(1))?.len();
    let two = codec.encode(&widest_join_accept(2))?.len();
    let per_record = two.saturating_sub(one).max(1);
    if frame_limit < one {
        return Ok(0);
    }
    Ok(1 + (frame_limit - one) / per_record)
}

fn widest_descriptor() -> NodeDescriptor {
    let ip = Ipv6Addr::new(0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff);
    NodeDescriptor {
        id: NodeId::new(),
        address: SocketAddr::V6(SocketAddrV6::new(ip, u16::MAX, 0, u32::MAX)),
        join_order: u64::MAX,
    }
}

fn widest_join_accept(records: usize) -> GossipMessage {
    let members = (0..records).map(|_| {
        MemberRecord::new(widest_descriptor(), NodeState::Removed, u64::MAX, u64::MAX)
    });
    GossipMessage::new(
        widest_descriptor(),
        u64::MAX,
        Payload::JoinAccept {
            topology: Topology::from_records(u64::MAX, members),
            assigned_clock: u64::MAX,
        },
    )
}
