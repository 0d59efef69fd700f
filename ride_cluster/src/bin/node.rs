use anyhow::{Context, Result};
use clap::Parser;
use ride_cluster::config::{
    parse_roster, ClusterConfig, ConsistencyLevel, ReplicationMode, DEFAULT_CLUSTER_SIZE, DEFAULT_HOST,
};
use ride_cluster::node::ClusterNode;
use ride_cluster::telemetry::init_tracing;
use std::net::IpAddr;
use std::time::Duration;
use tokio::signal;
use tracing::info;

/// ─────────────────────────────────────────────────────────────────────────────
/// CLI
/// ─────────────────────────────────────────────────────────────────────────────
#[derive(Parser, Debug)]
#[command(author, version, about = "One member of the ride-booking cluster", long_about = None)]
struct Args {
    /// Node id (unique per node, positive)
    #[arg(long, env = "RIDE_NODE_ID")]
    id: u32,

    /// Roster: comma-separated `id=peer_addr/rpc_addr`, or bare ids for
    /// port-derived addresses (6000+id peer, 5000+id clients).
    /// Defaults to ids 1..=cluster-size on --host.
    #[arg(long, env = "RIDE_ROSTER")]
    roster: Option<String>,

    /// Members when no roster is given
    #[arg(long, env = "RIDE_CLUSTER_SIZE", default_value_t = DEFAULT_CLUSTER_SIZE)]
    cluster_size: u32,

    /// Host for port-derived addresses
    #[arg(long, env = "RIDE_HOST", default_value_t = DEFAULT_HOST)]
    host: IpAddr,

    /// Heartbeat period in ms
    #[arg(long, env = "RIDE_HEARTBEAT_MS", default_value_t = 2000)]
    heartbeat_ms: u64,

    /// Heartbeat attempts per round before the leader counts as failed
    #[arg(long, env = "RIDE_HEARTBEAT_RETRIES", default_value_t = 3)]
    heartbeat_retries: u32,

    /// Lower bound of the pre-election delay in ms
    #[arg(long, env = "RIDE_JITTER_MIN_MS", default_value_t = 150)]
    jitter_min_ms: u64,

    /// Upper bound of the pre-election delay in ms
    #[arg(long, env = "RIDE_JITTER_MAX_MS", default_value_t = 600)]
    jitter_max_ms: u64,

    /// Timeout for any single peer call in ms
    #[arg(long, env = "RIDE_CALL_TIMEOUT_MS", default_value_t = 2000)]
    call_timeout_ms: u64,

    #[arg(long, env = "RIDE_REPLICATION", value_enum, default_value_t = ReplicationMode::Synchronous)]
    replication: ReplicationMode,

    /// Reported per write, not enforced
    #[arg(long, env = "RIDE_CONSISTENCY", value_enum, default_value_t = ConsistencyLevel::Quorum)]
    consistency: ConsistencyLevel,

    #[arg(long, env = "RIDE_BASE_FARE", default_value_t = 50.0)]
    base_fare: f64,

    #[arg(long, env = "RIDE_PER_KM_RATE", default_value_t = 12.0)]
    per_km_rate: f64,

    #[arg(long, env = "RIDE_SURGE_FACTOR", default_value_t = 1.0)]
    surge_factor: f64,

    /// Start with the demo riders and drivers loaded
    #[arg(long, env = "RIDE_SAMPLE_DATA")]
    sample_data: bool,
}

impl Args {
    fn into_config(self) -> Result<ClusterConfig> {
        let roster = match &self.roster {
            Some(list) => parse_roster(list, self.host)?,
            None => ClusterConfig::local(self.id, self.cluster_size, self.host)?.roster,
        };
        let mut config = ClusterConfig::new(self.id, roster);
        config.call_timeout = Duration::from_millis(self.call_timeout_ms);
        config.heartbeat.interval = Duration::from_millis(self.heartbeat_ms);
        config.heartbeat.retries = self.heartbeat_retries;
        config.election.jitter_min = Duration::from_millis(self.jitter_min_ms);
        config.election.jitter_max = Duration::from_millis(self.jitter_max_ms);
        config.replication.mode = self.replication;
        config.replication.consistency = self.consistency;
        config.fares.base_fare = self.base_fare;
        config.fares.per_km_rate = self.per_km_rate;
        config.fares.surge_factor = self.surge_factor;
        config.sample_data = self.sample_data;
        config.validate()?;
        Ok(config)
    }
}

/// ─────────────────────────────────────────────────────────────────────────────
/// main
/// ─────────────────────────────────────────────────────────────────────────────
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Args::parse().into_config()?;
    let id = config.node_id;
    let node = ClusterNode::start(config)
        .await
        .with_context(|| format!("starting node {id}"))?;
    let st = node.election().state();
    info!("Node {} up as {:?}, leader {}", id, st.role, st.known_leader);

    signal::ctrl_c().await?;
    info!("Node {} shutting down", id);
    Ok(())
}
