//! Node configuration loading.
//!
//! A YAML file supplies the full [`GossipConfig`]; command-line flags override
//! individual fields on top of it.

use std::{net::SocketAddr, path::Path};

use anyhow::{Context, Result};
use gossip_membership::GossipConfig;

/// Load `path`, or the built-in defaults when no file is given.
pub fn load(path: Option<&Path>) -> Result<GossipConfig> {
    let Some(path) = path else {
        return Ok(GossipConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Flag values that take precedence over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub cluster_name: Option<String>,
    pub seeds: Vec<SocketAddr>,
    pub fanout: Option<usize>,
    pub gossip_interval_ms: Option<u64>,
    pub advertise_addr: Option<SocketAddr>,
}

impl Overrides {
    pub fn apply(self, config: &mut GossipConfig) {
        if let Some(name) = self.cluster_name {
            config.cluster_name = name;
        }
        if !self.seeds.is_empty() {
            config.join.seeds = self.seeds;
        }
        if let Some(fanout) = self.fanout {
            config.fanout = fanout;
        }
        if let Some(interval) = self.gossip_interval_ms {
            config.gossip_interval_ms = interval;
        }
        if let Some(addr) = self.advertise_addr {
            config.advertise_addr = Some(addr);
        }
    }
}
