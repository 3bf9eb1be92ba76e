//! Heartbeat-driven failure detection.
//!
//! The detector never touches the topology. It keeps one [`FailureRecord`] per
//! peer, mirrors peer states through [`FailureDetector::sync`], and reports
//! verdicts from [`FailureDetector::tick`] that the coordinator turns into
//! topology deltas.

use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    config::FailureDetectorConfig,
    node::{NodeId, NodeState},
    topology::Topology,
};

/// Per-peer liveness bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub last_heartbeat_at: Instant,
    pub suspicion_level: u32,
    pub missed_count: u32,
    /// Set while the peer is DOWN; quarantine is measured from here.
    pub down_since: Option<Instant>,
    state: NodeState,
}

impl FailureRecord {
    fn new(now: Instant, state: NodeState) -> Self {
        Self {
            last_heartbeat_at: now,
            suspicion_level: 0,
            missed_count: 0,
            down_since: (state == NodeState::Down).then_some(now),
            state,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }
}

/// Outcome of a detector tick that requires a topology mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Down(NodeId),
    Removed(NodeId),
}

pub struct FailureDetector {
    config: FailureDetectorConfig,
    local: NodeId,
    records: HashMap<NodeId, FailureRecord>,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig, local: NodeId) -> Self {
        Self {
            config,
            local,
            records: HashMap::new(),
        }
    }

    pub fn config(&self) -> &FailureDetectorConfig {
        &self.config
    }

    pub fn record(&self, id: &NodeId) -> Option<&FailureRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Liveness evidence from `id`. Returns false for untracked peers.
    pub fn on_heartbeat(&mut self, id: &NodeId, now: Instant) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        record.last_heartbeat_at = now;
        record.missed_count = 0;
        record.suspicion_level = 0;
        if record.state == NodeState::Down {
            // Contradicting evidence restarts the quarantine.
            record.down_since = Some(now);
        }
        true
    }

    /// Mirror the member states of a freshly installed topology.
    ///
    /// New peers start with a fresh heartbeat, removed or vanished peers lose
    /// their record, and state changes move quarantine bookkeeping along.
    pub fn sync(&mut self, topology: &Topology, now: Instant) {
        self.records.retain(|id, _| {
            topology
                .get(id)
                .is_some_and(|record| !record.state.is_terminal())
        });

        for member in topology.members().values() {
            let id = member.id();
            if id == self.local || member.state.is_terminal() {
                continue;
            }

            let record = self
                .records
                .entry(id)
                .or_insert_with(|| FailureRecord::new(now, member.state));
            if record.state == member.state {
                continue;
            }

            debug!(peer = %id, from = %record.state, to = %member.state, "Detector state change");
            if member.state == NodeState::Down {
                record.down_since.get_or_insert(now);
            } else {
                if record.state == NodeState::Down {
                    record.last_heartbeat_at = now;
                    record.suspicion_level = 0;
                    record.missed_count = 0;
                }
                record.down_since = None;
            }
            record.state = member.state;
        }
    }

    /// One detector round. Verdicts repeat on later ticks until the
    /// coordinator's topology reflects them.
    ///
    /// Suspicion rises by one per missed beat over the last
    /// `suspicion_ceiling` beats of the silence threshold, so a peer is DOWN
    /// at the first tick on or after `heartbeat_interval * missed_beat_threshold`
    /// of silence regardless of how often the detector is ticked.
    pub fn tick(&mut self, now: Instant) -> Vec<Verdict> {
        let heartbeat_ms = self.config.heartbeat_interval().as_millis().max(1);
        let threshold = self.config.missed_beat_threshold;
        let ceiling = self.config.suspicion_ceiling.min(threshold);
        let escalation_start = threshold - ceiling;
        let quarantine = self.config.quarantine_interval();
        let mut verdicts = Vec::new();

        for (id, record) in self.records.iter_mut() {
            match record.state {
                NodeState::Up | NodeState::Leaving => {
                    let silence = now.saturating_duration_since(record.last_heartbeat_at);
                    let missed =
                        u32::try_from(silence.as_millis() / heartbeat_ms).unwrap_or(u32::MAX);
                    record.missed_count = missed;

                    let suspicion = missed.saturating_sub(escalation_start).min(ceiling);
                    if suspicion > record.suspicion_level {
                        debug!(peer = %id, missed, suspicion, "Peer missed heartbeats");
                    }
                    record.suspicion_level = suspicion;
                    if missed >= threshold {
                        info!(peer = %id, silence = ?silence, "Peer declared down");
                        verdicts.push(Verdict::Down(*id));
                    }
                }
                NodeState::Down => {
                    let since = *record.down_since.get_or_insert(now);
                    if now.saturating_duration_since(since) >= quarantine {
                        info!(peer = %id, "Peer quarantine elapsed, removing");
                        verdicts.push(Verdict::Removed(*id));
                    }
                }
                NodeState::Joining | NodeState::Removed => {}
            }
        }

        verdicts
    }
}
