mod common;

use bytes::Bytes;
use common::{eventually, quick};
use futures::future::join_all;
use futures::SinkExt;
use ride_cluster::balancer::{LoadBalancer, ReplicaStatus, TcpBackend};
use ride_cluster::config::{ClusterConfig, MemberAddrs};
use ride_cluster::node::ClusterNode;
use ride_cluster::protocol::{ClientCall, RpcRequest, RpcResponse, UserType};
use ride_cluster::transport::{self, framed, read_frame, write_frame};
use ride_cluster::NodeId;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

const LIMIT: Duration = Duration::from_secs(3);

struct TcpCluster {
    nodes: Vec<Arc<ClusterNode>>,
    roster: BTreeMap<NodeId, MemberAddrs>,
}

impl TcpCluster {
    async fn start(size: NodeId) -> Self {
        let mut listeners = Vec::new();
        let mut roster = BTreeMap::new();
        for id in 1..=size {
            let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let rpc = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addrs = MemberAddrs {
                peer: peer.local_addr().unwrap(),
                rpc: rpc.local_addr().unwrap(),
            };
            roster.insert(id, addrs);
            listeners.push((id, peer, rpc));
        }
        // all at once, so startup discovery finds every peer serving
        let launches = listeners.into_iter().map(|(id, peer, rpc)| {
            let config = quick(ClusterConfig::new(id, roster.clone()));
            ClusterNode::launch(config, peer, rpc)
        });
        let nodes = join_all(launches)
            .await
            .into_iter()
            .collect::<ride_cluster::Result<Vec<_>>>()
            .unwrap();
        Self { nodes, roster }
    }

    fn rpc(&self, id: NodeId) -> SocketAddr {
        self.roster[&id].rpc
    }

    async fn balancer(&self) -> (Arc<LoadBalancer>, SocketAddr) {
        let replicas: BTreeMap<NodeId, SocketAddr> = self.roster.iter().map(|(id, a)| (*id, a.rpc)).collect();
        let backend = Arc::new(TcpBackend::new(replicas.clone(), LIMIT));
        let balancer = Arc::new(LoadBalancer::new(replicas.keys().copied(), backend));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(balancer.clone().serve(listener));
        (balancer, addr)
    }
}

async fn send(addr: SocketAddr, call: ClientCall) -> RpcResponse {
    transport::call(addr, &RpcRequest::new(call, Some(1)), LIMIT).await.unwrap()
}

fn register(name: &str, kind: UserType) -> ClientCall {
    ClientCall::RegisterUser(name.into(), "pass123".into(), kind, None, None, None)
}

#[tokio::test]
async fn bookings_through_the_balancer_reach_every_node() {
    let cluster = TcpCluster::start(3).await;
    assert!(cluster.nodes.iter().all(|n| n.election().known_leader() == 1));

    let (balancer, front) = cluster.balancer().await;
    let health = balancer.health_check().await;
    assert_eq!(health, vec![(1, ReplicaStatus::Up), (2, ReplicaStatus::Up), (3, ReplicaStatus::Up)]);

    let ping = send(front, ClientCall::Ping).await;
    assert!(ping.success);
    assert_eq!(ping.get("server_id"), Some(&json!(1)));
    assert_eq!(ping.get("is_leader"), Some(&json!(true)));

    assert!(send(front, register("alice", UserType::Rider)).await.success);
    // straight to a follower, which forwards over the peer channel
    assert!(send(cluster.rpc(3), register("driver1", UserType::Driver)).await.success);
    let avail = send(front, ClientCall::SetDriverAvailable("driver1".into(), "Airport".into(), true)).await;
    assert!(avail.success, "{:?}", avail.message);

    let booked = send(cluster.rpc(2), ClientCall::BookCab("alice".into(), "Airport".into(), "Mall".into())).await;
    assert!(booked.success, "{:?}", booked.message);
    assert_eq!(booked.get("driver_name"), Some(&json!("driver1")));
    assert_eq!(booked.get("replicated_to"), Some(&json!(3)));
    let ride_id = booked.get("ride_id").and_then(|v| v.as_str()).unwrap().to_string();

    for node in &cluster.nodes {
        assert!(node.store().ride(&ride_id).is_some(), "node {} missing {}", node.id(), ride_id);
        assert!(!node.store().is_driver_available("driver1"));
    }
    let status = send(cluster.rpc(3), ClientCall::GetRideStatus(ride_id.clone())).await;
    assert_eq!(status.get("ride_info").and_then(|r| r.get("status")), Some(&json!("ACCEPTED")));

    let stats = send(front, ClientCall::Stats).await;
    let servers = stats.get("servers").and_then(|s| s.as_array()).unwrap();
    assert_eq!(servers.len(), 3);
    let dispatched: u64 = servers.iter().filter_map(|s| s["dispatched"].as_u64()).sum();
    assert_eq!(dispatched, 3);
    assert!(servers.iter().all(|s| s["active"] == json!(0)));
}

#[tokio::test]
async fn dead_replica_is_skipped_until_it_answers_again() {
    let cluster = TcpCluster::start(2).await;
    let mut replicas: BTreeMap<NodeId, SocketAddr> = BTreeMap::new();
    // nothing listens on a port we just released
    let gone = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    replicas.insert(1, gone);
    replicas.insert(2, cluster.rpc(2));
    let balancer = LoadBalancer::new([1, 2], Arc::new(TcpBackend::new(replicas, LIMIT)));

    let first = balancer.handle(RpcRequest::new(ClientCall::Ping, None)).await;
    assert!(!first.success);
    assert!(first.message.unwrap_or_default().starts_with("Replica unavailable, retry"));

    let second = balancer.handle(RpcRequest::new(ClientCall::Ping, None)).await;
    assert!(second.success);
    assert_eq!(second.get("server_id"), Some(&json!(2)));

    let health = balancer.health_check().await;
    assert_eq!(health, vec![(1, ReplicaStatus::Down), (2, ReplicaStatus::Up)]);
}

#[tokio::test]
async fn malformed_client_frames() {
    let cluster = TcpCluster::start(1).await;
    assert!(cluster.nodes[0].election().is_leader());

    let stream = TcpStream::connect(cluster.rpc(1)).await.unwrap();
    let mut conn = framed(stream);

    write_frame(&mut conn, &json!({ "call": { "method": "launch_rockets" } })).await.unwrap();
    let reply: RpcResponse = read_frame(&mut conn).await.unwrap().unwrap();
    assert!(!reply.success);
    assert!(reply.message.unwrap_or_default().starts_with("Malformed request"));

    // same connection keeps serving; a garbage clock reads as absent
    write_frame(&mut conn, &json!({ "call": { "method": "ping" }, "client_clock": "soon" })).await.unwrap();
    let reply: RpcResponse = read_frame(&mut conn).await.unwrap().unwrap();
    assert!(reply.success);

    conn.send(Bytes::from_static(b"not json at all")).await.unwrap();
    let closed = read_frame::<_, RpcResponse>(&mut conn).await;
    assert!(matches!(closed, Ok(None) | Err(_)));
}

#[tokio::test]
async fn followers_answer_clock_queries_over_tcp() {
    let cluster = TcpCluster::start(3).await;
    // everyone agrees on node 1 and heartbeats keep it that way
    assert!(
        eventually(|| cluster.nodes.iter().all(|n| n.heartbeat().failures() == 0 && n.election().known_leader() == 1))
            .await
    );
    let server_time = send(cluster.rpc(2), ClientCall::GetServerTime).await;
    assert!(server_time.get("vector_clock").is_some());
    let synced = send(cluster.rpc(2), ClientCall::SynchronizeClocks(0.0)).await;
    assert!(synced.get("time_diff").and_then(|v| v.as_f64()).unwrap() > 0.0);
}
