use anyhow::{Context, Result};
use clap::Parser;
use ride_cluster::balancer::LoadBalancer;
use ride_cluster::config::{BalancerConfig, DEFAULT_CLUSTER_SIZE, DEFAULT_HOST, RPC_BASE_PORT};
use ride_cluster::telemetry::init_tracing;
use ride_cluster::NodeId;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Least-connections front end for the ride cluster")]
struct Args {
    /// Listen address for clients
    #[arg(long, env = "RIDE_BALANCER_LISTEN", default_value = "127.0.0.1:5000")]
    listen: SocketAddr,

    /// Replicas: comma-separated `id=rpc_addr` (e.g. 1=127.0.0.1:5001,2=127.0.0.1:5002).
    /// Defaults to ids 1..=cluster-size on 5000+id.
    #[arg(long, env = "RIDE_REPLICAS")]
    replicas: Option<String>,

    #[arg(long, env = "RIDE_CLUSTER_SIZE", default_value_t = DEFAULT_CLUSTER_SIZE)]
    cluster_size: u32,

    #[arg(long, env = "RIDE_HOST", default_value_t = DEFAULT_HOST)]
    host: IpAddr,

    /// Health check period in ms
    #[arg(long, env = "RIDE_HEALTH_MS", default_value_t = 5000)]
    health_ms: u64,

    /// Timeout for a proxied call in ms
    #[arg(long, env = "RIDE_CALL_TIMEOUT_MS", default_value_t = 10000)]
    call_timeout_ms: u64,
}

fn parse_replicas(list: &str) -> Result<BTreeMap<NodeId, SocketAddr>> {
    let mut replicas = BTreeMap::new();
    for pair in list.split(',') {
        let p = pair.trim();
        if p.is_empty() {
            continue;
        }
        let (id, addr) = p
            .split_once('=')
            .with_context(|| format!("bad replica '{p}'; expected id=ip:port"))?;
        let id: NodeId = id.trim().parse().with_context(|| format!("bad replica id in '{p}'"))?;
        let addr: SocketAddr = addr.trim().parse().with_context(|| format!("bad replica address in '{p}'"))?;
        replicas.insert(id, addr);
    }
    Ok(replicas)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let replicas = match &args.replicas {
        Some(list) => parse_replicas(list)?,
        None => (1..=args.cluster_size)
            .map(|id| -> Result<(NodeId, SocketAddr)> {
                let port = u16::try_from(id)
                    .ok()
                    .and_then(|o| RPC_BASE_PORT.checked_add(o))
                    .with_context(|| format!("replica id {id} does not map to a port"))?;
                Ok((id, SocketAddr::new(args.host, port)))
            })
            .collect::<Result<BTreeMap<_, _>>>()?,
    };
    let config = BalancerConfig {
        listen: args.listen,
        replicas,
        health_interval: Duration::from_millis(args.health_ms),
        call_timeout: Duration::from_millis(args.call_timeout_ms),
    };

    let balancer = Arc::new(LoadBalancer::from_config(&config)?);
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!("Balancer listening on {}", config.listen);
    info!("Replicas: {:?}", config.replicas);

    tokio::spawn(balancer.clone().run_health_loop(config.health_interval));
    balancer.serve(listener).await;
    Ok(())
}
