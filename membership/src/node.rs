use std::{
    net::SocketAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Node Identity - Globally Unique, Never Reused
// ============================================================================

/// Node ID, a random UUID minted once per process start.
///
/// A restarted process always mints a new id; a removed id is dead forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a new node ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse node ID from string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Node Descriptor - Immutable Addressing Record
// ============================================================================

/// Identity and address of a cluster member. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub address: SocketAddr,
    /// Startup wall clock in milliseconds since the UNIX epoch.
    pub join_order: u64,
}

impl NodeDescriptor {
    /// Describe a freshly started process listening on `address`.
    pub fn new(address: SocketAddr) -> Self {
        let join_order = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            id: NodeId::new(),
            address,
            join_order,
        }
    }
}

// ============================================================================
// Node State - Membership Lifecycle
// ============================================================================

/// Membership lifecycle of a node as seen in a topology.
///
/// Variants are declared in precedence order, so the derived `Ord` is the
/// tie-break used by the merge: `Removed > Down > Leaving > Up > Joining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeState {
    Joining,
    Up,
    Leaving,
    Down,
    Removed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Joining => "joining",
            NodeState::Up => "up",
            NodeState::Leaving => "leaving",
            NodeState::Down => "down",
            NodeState::Removed => "removed",
        }
    }

    /// States the failure detector watches for missed heartbeats.
    pub fn is_monitored(&self) -> bool {
        matches!(self, NodeState::Up | NodeState::Leaving)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Removed)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
