//! Membership configuration.
//!
//! All durations are carried as integer milliseconds so the structs load
//! directly from YAML/JSON; the `Duration` accessors are what the runtime uses.

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::ConfigError;

/// Wire protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Nodes only admit joiners that present the same cluster name.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Address peers use to reach this node. Defaults to the transport's
    /// local address, which must then be a concrete IP.
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Period of the coordinator round timer.
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// Number of UP peers a round sends its digest to.
    #[serde(default = "default_fanout")]
    pub fanout: usize,

    /// Capacity of the bounded inbound frame queue.
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,

    /// Join requests are rejected once the topology holds this many records,
    /// tombstones included. Lowered further if a full topology would not fit
    /// in one transport frame.
    #[serde(default = "default_max_members")]
    pub max_members: usize,

    /// How long a REMOVED record is kept and gossiped before it is purged.
    /// The id stays barred from rejoining after the purge.
    #[serde(default = "default_tombstone_ttl_ms")]
    pub tombstone_ttl_ms: u64,

    /// Peers that receive the leave notification on graceful shutdown.
    #[serde(default = "default_leave_fanout")]
    pub leave_fanout: usize,

    /// Hard limit on the leave broadcast.
    #[serde(default = "default_leave_timeout_ms")]
    pub leave_timeout_ms: u64,

    #[serde(default)]
    pub failure_detector: FailureDetectorConfig,

    #[serde(default)]
    pub join: JoinConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetectorConfig {
    /// Expected period between heartbeats from each peer.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence, in heartbeat intervals, after which a peer is declared DOWN.
    #[serde(default = "default_missed_beat_threshold")]
    pub missed_beat_threshold: u32,

    /// Suspicion levels spread over the last missed beats before DOWN. Must
    /// not exceed `missed_beat_threshold`.
    #[serde(default = "default_suspicion_ceiling")]
    pub suspicion_ceiling: u32,

    /// Time a DOWN peer stays DOWN before it is REMOVED.
    #[serde(default = "default_quarantine_interval_ms")]
    pub quarantine_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Contact nodes tried in order. Empty means this node starts the cluster.
    #[serde(default)]
    pub seeds: Vec<SocketAddr>,

    /// How long to wait for JOIN_ACCEPT/JOIN_REJECT from one seed.
    #[serde(default = "default_join_timeout_ms")]
    pub timeout_ms: u64,

    /// Passes over the full seed list before giving up.
    #[serde(default = "default_join_rounds")]
    pub max_rounds: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_cluster_name() -> String {
    "default".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    1_000
}

fn default_fanout() -> usize {
    3
}

fn default_inbound_queue_capacity() -> usize {
    1_024
}

fn default_max_members() -> usize {
    512
}

fn default_tombstone_ttl_ms() -> u64 {
    600_000
}

fn default_leave_fanout() -> usize {
    8
}

fn default_leave_timeout_ms() -> u64 {
    2_000
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_missed_beat_threshold() -> u32 {
    3
}

fn default_suspicion_ceiling() -> u32 {
    2
}

fn default_quarantine_interval_ms() -> u64 {
    30_000
}

fn default_join_timeout_ms() -> u64 {
    3_000
}

fn default_join_rounds() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            advertise_addr: None,
            gossip_interval_ms: default_gossip_interval_ms(),
            fanout: default_fanout(),
            inbound_queue_capacity: default_inbound_queue_capacity(),
            max_members: default_max_members(),
            tombstone_ttl_ms: default_tombstone_ttl_ms(),
            leave_fanout: default_leave_fanout(),
            leave_timeout_ms: default_leave_timeout_ms(),
            failure_detector: FailureDetectorConfig::default(),
            join: JoinConfig::default(),
        }
    }
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            missed_beat_threshold: default_missed_beat_threshold(),
            suspicion_ceiling: default_suspicion_ceiling(),
            quarantine_interval_ms: default_quarantine_interval_ms(),
        }
    }
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            timeout_ms: default_join_timeout_ms(),
            max_rounds: default_join_rounds(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl GossipConfig {
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.is_empty() {
            return Err(ConfigError::invalid("cluster_name", "must not be empty"));
        }
        if self.gossip_interval_ms == 0 {
            return Err(ConfigError::invalid("gossip_interval_ms", "must be > 0"));
        }
        if self.fanout == 0 {
            return Err(ConfigError::invalid("fanout", "must be >= 1"));
        }
        if self.inbound_queue_capacity == 0 {
            return Err(ConfigError::invalid("inbound_queue_capacity", "must be >= 1"));
        }
        if self.max_members < 1 {
            return Err(ConfigError::invalid("max_members", "must be >= 1"));
        }
        if let Some(addr) = self.advertise_addr {
            if addr.ip().is_unspecified() {
                return Err(ConfigError::invalid(
                    "advertise_addr",
                    format!("{} is not reachable by peers", addr.ip()),
                ));
            }
        }
        self.failure_detector.validate()?;
        if self.tombstone_ttl() < self.failure_detector.quarantine_interval() * 2 {
            return Err(ConfigError::invalid(
                "tombstone_ttl_ms",
                "must be at least twice failure_detector.quarantine_interval_ms",
            ));
        }
        self.join.validate()
    }
}

impl FailureDetectorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn quarantine_interval(&self) -> Duration {
        Duration::from_millis(self.quarantine_interval_ms)
    }

    /// Silence after which a peer is DOWN.
    pub fn silence_threshold(&self) -> Duration {
        self.heartbeat_interval() * self.missed_beat_threshold
    }

    /// Upper bound between a peer's last heartbeat and it being declared DOWN,
    /// for a detector ticked every `round`.
    pub fn detection_window(&self, round: Duration) -> Duration {
        self.silence_threshold() + round
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::invalid("heartbeat_interval_ms", "must be > 0"));
        }
        if self.missed_beat_threshold == 0 {
            return Err(ConfigError::invalid("missed_beat_threshold", "must be >= 1"));
        }
        if self.suspicion_ceiling == 0 {
            return Err(ConfigError::invalid("suspicion_ceiling", "must be >= 1"));
        }
        if self.suspicion_ceiling > self.missed_beat_threshold {
            return Err(ConfigError::invalid(
                "suspicion_ceiling",
                "must be <= missed_beat_threshold",
            ));
        }
        if self.quarantine_interval() < self.heartbeat_interval() {
            return Err(ConfigError::invalid(
                "quarantine_interval_ms",
                "must be at least one heartbeat interval",
            ));
        }
        if self.missed_beat_threshold < 2 {
            warn!(
                "missed_beat_threshold={} does not tolerate a single lost heartbeat",
                self.missed_beat_threshold
            );
        }
        Ok(())
    }
}

impl JoinConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("join.timeout_ms", "must be > 0"));
        }
        if self.max_rounds == 0 {
            return Err(ConfigError::invalid("join.max_rounds", "must be >= 1"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::invalid(
                "join.max_backoff_ms",
                "must be >= join.initial_backoff_ms",
            ));
        }
        Ok(())
    }
}
