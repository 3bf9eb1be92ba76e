//! gossip-node: run a single membership node over UDP.

mod config;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gossip_membership::{
    BincodeCodec, Codec, CoordinatorState, GossipCoordinator, JoinError, JsonCodec,
    MetricsObserver, NodeHandle, UdpTransport,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Overrides;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WireCodec {
    Bincode,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "gossip-node")]
#[command(about = "Gossip-based cluster membership node")]
struct Args {
    /// UDP address to listen on
    #[arg(long, env = "GOSSIP_BIND", default_value = "0.0.0.0:7946")]
    bind: SocketAddr,

    /// Address peers use to reach this node; required when binding 0.0.0.0
    #[arg(long = "advertise", env = "GOSSIP_ADVERTISE")]
    advertise_addr: Option<SocketAddr>,

    /// Seed node to join through; repeat or comma-separate for several
    #[arg(long = "seed", env = "GOSSIP_SEEDS", value_delimiter = ',')]
    seeds: Vec<SocketAddr>,

    /// Cluster name; joins are only accepted between equal names
    #[arg(long, env = "GOSSIP_CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// YAML configuration file
    #[arg(short, long, env = "GOSSIP_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    fanout: Option<usize>,

    #[arg(long)]
    gossip_interval_ms: Option<u64>,

    #[arg(long, value_enum, default_value = "bincode")]
    codec: WireCodec,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "GOSSIP_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Seconds between status log lines, 0 to disable
    #[arg(long, default_value_t = 30)]
    status_interval_secs: u64,
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

async fn report_status(handle: NodeHandle, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = handle.reached(CoordinatorState::Terminated) => return,
            _ = ticker.tick() => {
                if let Some(topology) = handle.topology() {
                    info!(
                        "Topology version {}: {} live members, {} total records",
                        topology.version(),
                        topology.live_count(),
                        topology.len()
                    );
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    let mut config = config::load(args.config.as_deref())?;
    Overrides {
        cluster_name: args.cluster_name,
        seeds: args.seeds,
        fanout: args.fanout,
        gossip_interval_ms: args.gossip_interval_ms,
        advertise_addr: args.advertise_addr,
    }
    .apply(&mut config);
    config.validate()?;

    if let Some(metrics_addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Serving metrics on http://{}/metrics", metrics_addr);
    }

    let (transport, inbound) = UdpTransport::bind(args.bind, config.inbound_queue_capacity)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    let codec: Arc<dyn Codec> = match args.codec {
        WireCodec::Bincode => Arc::new(BincodeCodec),
        WireCodec::Json => Arc::new(JsonCodec),
    };

    info!(
        "Starting node in cluster '{}' with {} seed(s), codec {}",
        config.cluster_name,
        config.join.seeds.len(),
        codec.name()
    );
    let coordinator = GossipCoordinator::new(config, Arc::new(transport), inbound)
        .context("invalid node configuration")?
        .with_codec(codec)
        .with_observer(Arc::new(MetricsObserver::new()));
    let handle = coordinator.handle();
    info!("Node id {}", handle.local_id());

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, leaving cluster");
            signal_handle.shutdown();
        }
    });

    let task = match coordinator.start().await {
        Ok(task) => task,
        Err(JoinError::Aborted) => {
            warn!("Interrupted before joining");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if args.status_interval_secs > 0 {
        tokio::spawn(report_status(
            handle.clone(),
            Duration::from_secs(args.status_interval_secs),
        ));
    }

    task.await.context("coordinator task panicked")?;
    info!("Node stopped");
    Ok(())
}
