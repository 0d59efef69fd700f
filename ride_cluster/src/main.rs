//! In-process cluster walk-through: three nodes on the memory network, loaded
//! with the demo accounts, book a ride, lose their leader and carry on under
//! the new one.

use anyhow::{bail, Result};
use ride_cluster::config::{ClusterConfig, DEFAULT_CLUSTER_SIZE, DEFAULT_HOST};
use ride_cluster::memory::MemoryNetwork;
use ride_cluster::node::ClusterNode;
use ride_cluster::protocol::{ClientCall, RideStatus, RpcRequest, RpcResponse, UserType};
use ride_cluster::telemetry::init_tracing;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

async fn call(node: &ClusterNode, call: ClientCall) -> RpcResponse {
    let clock = Some(node.lamport_time());
    let method = call.method();
    let resp = node.handle_call(RpcRequest::new(call, clock)).await;
    info!(
        "node {} {} -> success={} {}",
        node.id(),
        method,
        resp.success,
        serde_json::to_string(&resp.body).unwrap_or_default()
    );
    resp
}

fn status(nodes: &[Arc<ClusterNode>], net: &MemoryNetwork) {
    for node in nodes {
        if net.is_down(node.id()) {
            info!("node {}: down", node.id());
            continue;
        }
        let st = node.election().state();
        info!(
            "node {}: {:?}, leader {}, round {}, L{}, rides {}",
            node.id(),
            st.role,
            st.known_leader,
            st.epoch,
            node.lamport_time(),
            node.store().stats().rides_total
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Starting ride cluster simulation");

    let net = MemoryNetwork::new();
    let mut nodes = Vec::new();
    for id in 1..=DEFAULT_CLUSTER_SIZE {
        let mut config = ClusterConfig::local(id, DEFAULT_CLUSTER_SIZE, DEFAULT_HOST)?;
        config.heartbeat.interval = Duration::from_millis(500);
        config.heartbeat.backoff = Duration::from_millis(50);
        config.sample_data = true;
        let node = ClusterNode::new(config, net.transport(id));
        net.register(id, node.clone());
        nodes.push(node);
    }
    for node in &nodes {
        node.spawn_monitor();
    }
    status(&nodes, &net);

    // writes land on a follower and are forwarded to the leader
    let entry = &nodes[1];
    call(entry, ClientCall::RegisterUser("carol".into(), "pass123".into(), UserType::Rider, Some("Carol".into()), None, None)).await;
    call(entry, ClientCall::SetDriverAvailable("driver2".into(), "Mall".into(), true)).await;
    let booked = call(entry, ClientCall::BookCab("alice".into(), "Airport".into(), "Mall".into())).await;
    let Some(ride_id) = booked.get("ride_id").and_then(|v| v.as_str()).map(str::to_string) else {
        bail!("booking failed: {:?}", booked.message);
    };
    call(&nodes[2], ClientCall::GetRideStatus(ride_id.clone())).await;
    status(&nodes, &net);

    info!("=== killing leader 1 ===");
    net.kill(1);
    for _ in 0..40 {
        sleep(Duration::from_millis(250)).await;
        if nodes[1..].iter().all(|n| n.election().known_leader() == 3) {
            break;
        }
    }
    status(&nodes, &net);

    call(entry, ClientCall::UpdateRideStatus(ride_id.clone(), RideStatus::InProgress)).await;
    call(&nodes[2], ClientCall::UpdateRideStatus(ride_id.clone(), RideStatus::Completed)).await;
    call(entry, ClientCall::GetRideStatus(ride_id)).await;

    info!("=== reviving node 1 ===");
    net.revive(1);
    nodes[0].discover_leader().await;
    status(&nodes, &net);

    info!("Simulation completed");
    Ok(())
}
