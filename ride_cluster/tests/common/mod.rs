#![allow(dead_code)]

use ride_cluster::config::{ClusterConfig, DEFAULT_HOST};
use ride_cluster::memory::MemoryNetwork;
use ride_cluster::node::ClusterNode;
use ride_cluster::protocol::{ClientCall, RpcRequest, RpcResponse};
use ride_cluster::NodeId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Fast timings so failover fits in a test.
pub fn quick(mut config: ClusterConfig) -> ClusterConfig {
    config.call_timeout = Duration::from_millis(500);
    config.heartbeat.interval = Duration::from_millis(50);
    config.heartbeat.retries = 3;
    config.heartbeat.backoff = Duration::from_millis(5);
    config.election.jitter_min = Duration::ZERO;
    config.election.jitter_max = Duration::from_millis(20);
    config
}

pub fn memory_cluster(size: u32) -> (Arc<MemoryNetwork>, Vec<Arc<ClusterNode>>) {
    let net = MemoryNetwork::new();
    let nodes = (1..=size)
        .map(|id| {
            let config = quick(ClusterConfig::local(id, size, DEFAULT_HOST).unwrap());
            let node = ClusterNode::new(config, net.transport(id));
            net.register(id, node.clone());
            node
        })
        .collect();
    (net, nodes)
}

pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

pub async fn call(node: &ClusterNode, call: ClientCall) -> RpcResponse {
    node.handle_call(RpcRequest::new(call, Some(1))).await
}

pub fn leaders(nodes: &[Arc<ClusterNode>]) -> Vec<NodeId> {
    nodes.iter().map(|n| n.election().known_leader()).collect()
}
