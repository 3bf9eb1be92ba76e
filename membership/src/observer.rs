//! Hooks for watching a node from the outside.

use std::sync::atomic::{AtomicU64, Ordering};

use super::{message::MessageKind, topology::Topology};

/// Callbacks invoked from the coordinator task. Implementations must return
/// quickly; they run inline with message handling.
pub trait Observer: Send + Sync {
    /// Once per received message, before it is handled.
    fn on_message(&self, kind: MessageKind);

    /// Once per installed topology version change.
    fn on_topology_change(&self, _topology: &Topology) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn on_message(&self, _kind: MessageKind) {}
}

/// In-process per-kind message counters.
///
/// `topology_version` advances by the version delta since the previous call,
/// so it never moves backwards; `members` is a gauge.
#[derive(Debug)]
pub struct MessageCounters {
    received: [AtomicU64; MessageKind::COUNT],
    topology_changes: AtomicU64,
    topology_version: AtomicU64,
    highest_version: AtomicU64,
    members: AtomicU64,
}

impl MessageCounters {
    pub fn new() -> Self {
        Self {
            received: std::array::from_fn(|_| AtomicU64::new(0)),
            topology_changes: AtomicU64::new(0),
            topology_version: AtomicU64::new(0),
            highest_version: AtomicU64::new(0),
            members: AtomicU64::new(0),
        }
    }

    pub fn count(&self, kind: MessageKind) -> u64 {
        self.received[kind.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.received
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            received: std::array::from_fn(|i| self.received[i].load(Ordering::Relaxed)),
            topology_changes: self.topology_changes.load(Ordering::Relaxed),
            topology_version: self.topology_version.load(Ordering::Relaxed),
            members: self.members.load(Ordering::Relaxed),
        }
    }
}

impl Default for MessageCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for MessageCounters {
    fn on_message(&self, kind: MessageKind) {
        self.received[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn on_topology_change(&self, topology: &Topology) {
        let version = topology.version();
        let previous = self.highest_version.fetch_max(version, Ordering::Relaxed);
        self.topology_changes.fetch_add(1, Ordering::Relaxed);
        self.topology_version
            .fetch_add(version.saturating_sub(previous), Ordering::Relaxed);
        self.members
            .store(topology.live_count() as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`MessageCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub received: [u64; MessageKind::COUNT],
    pub topology_changes: u64,
    pub topology_version: u64,
    pub members: u64,
}

impl CountersSnapshot {
    pub fn count(&self, kind: MessageKind) -> u64 {
        self.received[kind.index()]
    }
}

/// Publishes through the `metrics` facade so any installed recorder
/// (Prometheus in the node binary) picks the values up.
#[derive(Debug, Default)]
pub struct MetricsObserver {
    highest_version: AtomicU64,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Observer for MetricsObserver {
    fn on_message(&self, kind: MessageKind) {
        metrics::counter!("membership_messages_received_total", "kind" => kind.as_str())
            .increment(1);
    }

    fn on_topology_change(&self, topology: &Topology) {
        let version = topology.version();
        let previous = self.highest_version.fetch_max(version, Ordering::Relaxed);
        metrics::counter!("membership_topology_version").increment(version.saturating_sub(previous));
        metrics::counter!("membership_topology_changes_total").increment(1);
        metrics::gauge!("membership_members").set(topology.live_count() as f64);
    }
}
