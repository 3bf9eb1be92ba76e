//! Gossip-Based Cluster Membership
//!
//! Every node holds a versioned, immutable [`Topology`] snapshot of the
//! cluster and keeps it consistent with its peers through:
//! - A join handshake against seed nodes, with cluster name and protocol checks
//! - Periodic anti-entropy rounds exchanging compact digests with random peers
//! - Heartbeat-driven failure detection with suspicion and quarantine
//! - A deterministic, commutative merge that never resurrects removed members
//!
//! The [`GossipCoordinator`] owns all mutation; readers use a [`NodeHandle`].

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod digest;
pub mod error;
pub mod failure_detector;
pub mod message;
pub mod node;
pub mod observer;
pub mod retry;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use codec::{max_topology_records, BincodeCodec, Codec, JsonCodec};
pub use config::{FailureDetectorConfig, GossipConfig, JoinConfig, PROTOCOL_VERSION};
pub use coordinator::{CoordinatorState, GossipCoordinator, NodeHandle};
pub use digest::{build_digest, reconcile, Digest, Reconciliation};
pub use error::{CodecError, ConfigError, JoinError, MembershipError, Result, TransportError};
pub use failure_detector::{FailureDetector, FailureRecord, Verdict};
pub use message::{GossipMessage, MessageKind, Payload, RejectReason};
pub use node::{NodeDescriptor, NodeId, NodeState};
pub use observer::{CountersSnapshot, MessageCounters, MetricsObserver, NoopObserver, Observer};
pub use topology::{
    apply, merge, Delta, MemberRecord, MemberVersion, Topology, TopologyHandle, INITIAL_CLOCK,
};
pub use transport::{InboundReceiver, MemoryNetwork, MemoryTransport, Transport, UdpTransport};
