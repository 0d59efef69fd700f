//! One cluster member.
//!
//! Wires clocks, booking store, replication, election and heartbeat together
//! and serves the peer channel and the client RPC surface.

use crate::booking::{BookingStore, StoreStats};
use crate::clock::{LamportClock, VectorClock, VectorStamp};
use crate::config::ClusterConfig;
use crate::election::{ElectionCoordinator, Role};
use crate::error::{Error, Result};
use crate::health::{HealthChecker, PeerProbe};
use crate::heartbeat::HeartbeatMonitor;
use crate::protocol::{ClientCall, Operation, PeerMessage, PeerReply, RpcRequest, RpcResponse};
use crate::replication::{ReplicationManager, ReplicationStats};
use crate::transport::{framed, read_frame, write_frame, PeerHandler, PeerTransport, TcpTransport};
use crate::NodeId;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub server_id: NodeId,
    pub role: Role,
    pub is_leader: bool,
    pub known_leader: NodeId,
    pub neighbor: NodeId,
    pub epoch: u64,
    pub lamport_clock: u64,
    pub vector_clock: VectorStamp,
    pub system_time: String,
    pub store: StoreStats,
    pub replication: ReplicationStats,
    pub heartbeat_failures: u32,
}

pub struct ClusterNode {
    id: NodeId,
    config: ClusterConfig,
    lamport: Arc<LamportClock>,
    vector: Arc<VectorClock>,
    store: Arc<BookingStore>,
    replication: ReplicationManager,
    election: Arc<ElectionCoordinator>,
    heartbeat: Arc<HeartbeatMonitor>,
    transport: Arc<dyn PeerTransport>,
    /// Serialises leader-side plan + local apply.
    write_lock: tokio::sync::Mutex<()>,
}

impl ClusterNode {
    /// Must be called inside a runtime: replication spawns its peer workers here.
    pub fn new(config: ClusterConfig, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let id = config.node_id;
        let lamport = Arc::new(LamportClock::default());
        let vector = Arc::new(VectorClock::new(id));
        let store = Arc::new(BookingStore::new(config.fares.clone()));
        if config.sample_data {
            let loaded = store.seed_sample_data();
            info!("[{}] loaded {} sample records", id, loaded);
        }
        let replication = ReplicationManager::new(
            id,
            &config.peer_ids(),
            config.replication.clone(),
            lamport.clone(),
            vector.clone(),
            store.clone(),
            transport.clone(),
        );
        let probe = PeerProbe::new(id, transport.clone(), lamport.clone());
        let health = Arc::new(HealthChecker::new(
            probe,
            config.heartbeat.retries,
            config.heartbeat.backoff,
        ));
        let election = ElectionCoordinator::new(
            id,
            config.roster.keys().copied(),
            transport.clone(),
            health,
            config.election.clone(),
        );
        let heartbeat = Arc::new(HeartbeatMonitor::new(election.clone(), config.heartbeat.interval));

        Arc::new(Self {
            id,
            config,
            lamport,
            vector,
            store,
            replication,
            election,
            heartbeat,
            transport,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Bind both listeners from the roster and start serving.
    pub async fn start(config: ClusterConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let addrs = config
            .addrs()
            .ok_or_else(|| Error::Config(format!("node {} has no addresses", config.node_id)))?;
        let peer_listener = TcpListener::bind(addrs.peer).await?;
        let rpc_listener = TcpListener::bind(addrs.rpc).await?;
        Self::launch(config, peer_listener, rpc_listener).await
    }

    /// Start on already-bound listeners.
    pub async fn launch(config: ClusterConfig, peer_listener: TcpListener, rpc_listener: TcpListener) -> Result<Arc<Self>> {
        config.validate()?;
        let peers: BTreeMap<NodeId, SocketAddr> = config
            .roster
            .iter()
            .filter(|(id, _)| **id != config.node_id)
            .map(|(id, addrs)| (*id, addrs.peer))
            .collect();
        let transport = Arc::new(TcpTransport::new(peers, config.call_timeout));
        let node = Self::new(config, transport);

        info!(
            "[{}] peer channel on {}, clients on {}",
            node.id,
            peer_listener.local_addr()?,
            rpc_listener.local_addr()?
        );
        tokio::spawn(node.clone().serve_peers(peer_listener));
        node.discover_leader().await;
        tokio::spawn(node.clone().serve_clients(rpc_listener));
        node.spawn_monitor();
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn election(&self) -> &Arc<ElectionCoordinator> {
        &self.election
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn store(&self) -> &BookingStore {
        &self.store
    }

    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    pub fn lamport_time(&self) -> u64 {
        self.lamport.time()
    }

    pub fn vector_clock(&self) -> VectorStamp {
        self.vector.snapshot()
    }

    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.heartbeat.clone().run())
    }

    /// Ask every peer who leads and adopt the most recent answer.
    pub async fn discover_leader(&self) {
        let peers = self.config.peer_ids();
        let health = self.election.health();
        let results = health.sweep(peers.iter()).await;
        let best = peers
            .iter()
            .zip(results)
            .filter(|(_, r)| r.is_ok())
            .filter_map(|(p, _)| health.probe_ref().last_view(*p))
            .max_by_key(|v| (v.epoch, v.leader_id));
        match best {
            Some(view) if self.election.offer(view.leader_id, view.epoch) => {
                info!("[{}] joined cluster led by {} (round {})", self.id, view.leader_id, view.epoch)
            }
            _ => debug!("[{}] keeping initial view, leader {}", self.id, self.election.known_leader()),
        }
    }

    pub fn stats(&self) -> NodeStats {
        let st = self.election.state();
        NodeStats {
            server_id: self.id,
            role: st.role,
            is_leader: st.is_leader(),
            known_leader: st.known_leader,
            neighbor: self.election.neighbor(),
            epoch: st.epoch,
            lamport_clock: self.lamport.time(),
            vector_clock: self.vector.snapshot(),
            system_time: Utc::now().to_rfc3339(),
            store: self.store.stats(),
            replication: self.replication.stats(),
            heartbeat_failures: self.heartbeat.failures(),
        }
    }

    fn ack(&self) -> PeerReply {
        let st = self.election.state();
        PeerReply::Ack {
            from: self.id,
            clock: self.lamport.time(),
            leader_id: st.known_leader,
            epoch: st.leader_epoch,
        }
    }

    // ── client surface ──────────────────────────────────────────────────────

    pub async fn handle_call(&self, request: RpcRequest) -> RpcResponse {
        self.lamport.observe(request.client_clock);
        debug!("[{}] client call {}", self.id, request.call.method());
        if !request.call.is_mutating() {
            return self.answer_read(request.call);
        }
        if self.election.is_leader() {
            self.execute_write(request.call).await
        } else {
            self.forward_to_leader(request.call).await
        }
    }

    async fn forward_to_leader(&self, call: ClientCall) -> RpcResponse {
        let st = self.election.state();
        let leader = st.known_leader;
        if leader == self.id || st.election_in_progress() {
            return RpcResponse::failure(self.lamport.time(), "Leader election in progress, retry");
        }
        let request = RpcRequest::new(call, Some(self.lamport.increment()));
        match self.transport.send(leader, PeerMessage::Forward { request }).await {
            Ok(PeerReply::Response { mut response }) => {
                response.server_clock = self.lamport.observe(Some(response.server_clock));
                response
            }
            Ok(PeerReply::Rejected { reason }) => RpcResponse::failure(self.lamport.time(), reason),
            Ok(other) => {
                warn!("[{}] leader {} answered a forwarded write with {:?}", self.id, leader, other);
                RpcResponse::failure(self.lamport.time(), format!("Unexpected reply from leader {leader}"))
            }
            Err(e) => {
                warn!("[{}] leader {} unreachable for forwarded write: {}", self.id, leader, e);
                RpcResponse::failure(self.lamport.time(), format!("Leader {leader} unreachable, retry"))
            }
        }
    }

    /// A write handed over by a follower. Refused unless this node leads.
    async fn handle_forwarded(&self, request: RpcRequest) -> Result<RpcResponse> {
        self.lamport.observe(request.client_clock);
        if !request.call.is_mutating() {
            return Ok(self.answer_read(request.call));
        }
        self.try_write(request.call).await
    }

    async fn execute_write(&self, call: ClientCall) -> RpcResponse {
        match self.try_write(call).await {
            Ok(reply) => reply,
            Err(e) => RpcResponse::failure(self.lamport.time(), format!("{e}, retry")),
        }
    }

    async fn try_write(&self, call: ClientCall) -> Result<RpcResponse> {
        let guard = self.write_lock.lock().await;
        if !self.election.is_leader() {
            return Err(Error::NotLeader(self.id));
        }
        let (operation, reply) = match self.plan_write(call) {
            Ok(planned) => planned,
            Err(message) => return Ok(RpcResponse::failure(self.lamport.time(), message)),
        };
        let dispatch = self.replication.stage(operation);
        drop(guard);

        let proposal = self.replication.settle(dispatch).await;
        let mut reply = reply.with("replicated_to", proposal.acknowledged);
        reply.server_clock = self.lamport.time();
        Ok(reply)
    }

    fn next_ride_id(&self) -> String {
        loop {
            let id = format!("R{}-{}", self.id, self.lamport.increment());
            if self.store.ride(&id).is_none() {
                return id;
            }
        }
    }

    /// Validate a write against current state and decide its effect.
    fn plan_write(&self, call: ClientCall) -> std::result::Result<(Operation, RpcResponse), String> {
        let ok = RpcResponse::ok(0);
        match call {
            ClientCall::RegisterUser(username, password, user_type, name, email, phone) => {
                let op = self
                    .store
                    .plan_registration(&username, &password, user_type, name, email, phone)?;
                Ok((op, ok.with_message("User registered successfully").with("username", username)))
            }
            ClientCall::BookCab(rider, pickup, destination) => {
                let ride_id = self.next_ride_id();
                let (op, quote) = self.store.plan_booking(ride_id, &rider, &pickup, &destination)?;
                let message = if quote.driver_name.is_some() {
                    "Ride booked successfully"
                } else {
                    "Ride requested, waiting for an available driver"
                };
                let reply = ok
                    .with_message(message)
                    .with("ride_id", &quote.ride_id)
                    .with("estimated_fare", quote.estimated_fare)
                    .with("driver_name", &quote.driver_name)
                    .with("status", quote.status)
                    .with("estimated_distance", quote.estimated_distance)
                    .with("estimated_time", quote.estimated_time);
                Ok((op, reply))
            }
            ClientCall::CancelRide(ride_id) => {
                let op = self.store.plan_cancellation(&ride_id)?;
                Ok((op, ok.with_message("Ride cancelled successfully").with("ride_id", ride_id)))
            }
            ClientCall::UpdateRideStatus(ride_id, status) => {
                let op = self.store.plan_status_update(&ride_id, status)?;
                Ok((
                    op,
                    ok.with_message("Ride status updated")
                        .with("ride_id", ride_id)
                        .with("status", status),
                ))
            }
            ClientCall::SetDriverAvailable(driver, location, available) => {
                let op = self.store.plan_driver_availability(&driver, &location, available)?;
                Ok((op, ok.with_message("Driver status updated")))
            }
            other => Err(format!("{} does not change state", other.method())),
        }
    }

    fn answer_read(&self, call: ClientCall) -> RpcResponse {
        let clock = self.lamport.time();
        let ok = RpcResponse::ok(clock);
        match call {
            ClientCall::Ping => ok
                .with("status", "ok")
                .with("server_id", self.id)
                .with("is_leader", self.election.is_leader())
                .with("utc_time", Utc::now().to_rfc3339()),
            ClientCall::AuthenticateUser(username, password) => match self.store.authenticate(&username, &password) {
                Ok(user) => ok
                    .with_message("Authentication successful")
                    .with("user_type", user.user_type)
                    .with("user_info", &user),
                Err(message) => RpcResponse::failure(clock, message),
            },
            ClientCall::GetRideStatus(ride_id) => match self.store.ride(&ride_id) {
                Some(ride) => ok.with("ride_info", ride),
                None => RpcResponse::failure(clock, "Ride not found"),
            },
            ClientCall::GetAvailableCabs(location) => ok
                .with("location", location)
                .with("available_drivers", self.store.available_drivers()),
            ClientCall::GetAvailableDrivers => ok.with("available_drivers", self.store.available_drivers()),
            ClientCall::GetActiveRides => ok.with("active_rides", self.store.active_rides()),
            ClientCall::GetUserRides(username) => ok.with("rides", self.store.user_rides(&username)),
            ClientCall::GetServerTime => ok
                .with("utc_time", Utc::now().to_rfc3339())
                .with("lamport_time", clock)
                .with("vector_clock", self.vector.snapshot()),
            ClientCall::SynchronizeClocks(client_time) => {
                if !client_time.is_finite() {
                    return RpcResponse::failure(clock, "Clock synchronization failed: client time is not a number");
                }
                let server_time = Utc::now().timestamp_micros() as f64 / 1e6;
                ok.with("server_time", server_time)
                    .with("time_diff", server_time - client_time)
            }
            ClientCall::GetServerStats | ClientCall::Stats => ok.with("stats", self.stats()),
            write => RpcResponse::failure(clock, format!("{} must go through the leader", write.method())),
        }
    }

    // ── sockets ─────────────────────────────────────────────────────────────

    pub async fn serve_peers(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let me = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = me.peer_connection(stream).await {
                            warn!("[{}] dropped peer connection from {}: {}", me.id, addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("[{}] peer accept error: {}", self.id, e);
                    sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    async fn peer_connection(&self, stream: TcpStream) -> Result<()> {
        let mut framed = framed(stream);
        if let Some(message) = read_frame::<_, PeerMessage>(&mut framed).await? {
            let reply = self.handle_peer(message).await;
            write_frame(&mut framed, &reply).await?;
        }
        Ok(())
    }

    pub async fn serve_clients(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let me = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = me.client_connection(stream).await {
                            debug!("[{}] client {} went away: {}", me.id, addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("[{}] client accept error: {}", self.id, e);
                    sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    /// Many request/response pairs per connection. Frames that are JSON but
    /// not a known call get a failure response; non-JSON drops the connection.
    async fn client_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true).ok();
        let mut framed = framed(stream);
        while let Some(raw) = read_frame::<_, Value>(&mut framed).await? {
            let response = match serde_json::from_value::<RpcRequest>(raw) {
                Ok(request) => self.handle_call(request).await,
                Err(e) => RpcResponse::failure(self.lamport.time(), format!("Malformed request: {e}")),
            };
            write_frame(&mut framed, &response).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerHandler for ClusterNode {
    async fn handle_peer(&self, message: PeerMessage) -> PeerReply {
        match message {
            PeerMessage::Election {
                initiator,
                candidates,
                epoch,
            } => {
                let election = self.election.clone();
                tokio::spawn(async move { election.handle_election(initiator, candidates, epoch).await });
                self.ack()
            }
            PeerMessage::Leader {
                leader_id,
                candidates,
                initiator,
                epoch,
            } => {
                let election = self.election.clone();
                tokio::spawn(async move { election.handle_leader(leader_id, candidates, initiator, epoch).await });
                self.ack()
            }
            PeerMessage::Update { command } => {
                self.replication.replicate(&command);
                self.ack()
            }
            PeerMessage::Heartbeat { sender, clock } => {
                self.lamport.observe(Some(clock));
                debug!("[{}] heartbeat from {}", self.id, sender);
                self.ack()
            }
            PeerMessage::Forward { request } => match self.handle_forwarded(request).await {
                Ok(response) => PeerReply::Response { response },
                Err(e) => {
                    debug!("[{}] refusing forwarded write: {}", self.id, e);
                    PeerReply::Rejected {
                        reason: format!("{e}, retry"),
                    }
                }
            },
        }
    }
}
