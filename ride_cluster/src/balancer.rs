//! Least-connections front end for the replica set.
//!
//! Keeps a ledger of in-flight calls and health per replica. Each client call
//! goes to the replica with the fewest in-flight calls among those not marked
//! down, lowest id first on ties. A transport failure marks that replica down
//! until the periodic health check sees it answer again; the failed call is
//! not retried elsewhere.

use crate::clock::LamportClock;
use crate::config::BalancerConfig;
use crate::error::{Error, Result};
use crate::health::{HealthChecker, Probe};
use crate::protocol::{ClientCall, RpcRequest, RpcResponse};
use crate::transport::{self, framed, read_frame, write_frame};
use crate::NodeId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    Up,
    Down,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: NodeId,
    pub endpoint: String,
    pub active: u32,
    pub status: ReplicaStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub dispatched: u64,
    pub transport_failures: u64,
}

/// How the balancer reaches a replica.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(&self, replica: NodeId, request: &RpcRequest) -> Result<RpcResponse>;

    fn endpoint(&self, replica: NodeId) -> String {
        format!("replica {replica}")
    }
}

pub struct TcpBackend {
    replicas: BTreeMap<NodeId, SocketAddr>,
    call_timeout: Duration,
}

impl TcpBackend {
    pub fn new(replicas: BTreeMap<NodeId, SocketAddr>, call_timeout: Duration) -> Self {
        Self { replicas, call_timeout }
    }
}

#[async_trait]
impl Backend for TcpBackend {
    async fn call(&self, replica: NodeId, request: &RpcRequest) -> Result<RpcResponse> {
        let addr = *self
            .replicas
            .get(&replica)
            .ok_or_else(|| Error::transport(format!("replica {replica}"), "not configured"))?;
        transport::call(addr, request, self.call_timeout).await
    }

    fn endpoint(&self, replica: NodeId) -> String {
        self.replicas
            .get(&replica)
            .map_or_else(|| format!("replica {replica}"), |a| a.to_string())
    }
}

/// Liveness through the backend's `ping`.
pub struct PingProbe {
    backend: Arc<dyn Backend>,
}

#[async_trait]
impl Probe for PingProbe {
    type Target = NodeId;

    async fn probe(&self, target: &NodeId) -> Result<()> {
        let resp = self
            .backend
            .call(*target, &RpcRequest::new(ClientCall::Ping, None))
            .await?;
        if resp.success {
            Ok(())
        } else {
            Err(Error::Protocol(format!("ping to replica {target} failed")))
        }
    }
}

type Ledger = Mutex<BTreeMap<NodeId, LedgerEntry>>;

/// One dispatched call; gives its slot back when dropped.
pub struct InFlight<'a> {
    ledger: &'a Ledger,
    replica: NodeId,
}

impl InFlight<'_> {
    pub fn replica(&self) -> NodeId {
        self.replica
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.ledger.lock().get_mut(&self.replica) {
            entry.active = entry.active.saturating_sub(1);
        }
    }
}

pub struct LoadBalancer {
    ledger: Ledger,
    backend: Arc<dyn Backend>,
    health: HealthChecker<PingProbe>,
    clock: LamportClock,
}

impl LoadBalancer {
    pub fn new(replicas: impl IntoIterator<Item = NodeId>, backend: Arc<dyn Backend>) -> Self {
        let ledger = replicas
            .into_iter()
            .map(|id| {
                let entry = LedgerEntry {
                    id,
                    endpoint: backend.endpoint(id),
                    active: 0,
                    status: ReplicaStatus::Unknown,
                    last_check: None,
                    dispatched: 0,
                    transport_failures: 0,
                };
                (id, entry)
            })
            .collect();
        let probe = PingProbe {
            backend: backend.clone(),
        };
        Self {
            ledger: Mutex::new(ledger),
            backend,
            health: HealthChecker::new(probe, 1, Duration::ZERO),
            clock: LamportClock::default(),
        }
    }

    pub fn from_config(config: &BalancerConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(TcpBackend::new(config.replicas.clone(), config.call_timeout));
        Ok(Self::new(config.replicas.keys().copied(), backend))
    }

    /// Reserve a slot on the least-loaded replica that is not down.
    pub fn acquire(&self) -> Result<InFlight<'_>> {
        let mut ledger = self.ledger.lock();
        let entry = ledger
            .values_mut()
            .filter(|e| e.status != ReplicaStatus::Down)
            .min_by_key(|e| (e.active, e.id))
            .ok_or(Error::NoServersAvailable)?;
        entry.active += 1;
        entry.dispatched += 1;
        Ok(InFlight {
            ledger: &self.ledger,
            replica: entry.id,
        })
    }

    pub async fn dispatch(&self, request: RpcRequest) -> Result<RpcResponse> {
        let slot = self.acquire()?;
        let replica = slot.replica();
        debug!("dispatching {} to replica {}", request.call.method(), replica);
        let result = self.backend.call(replica, &request).await;
        drop(slot);

        match result {
            Ok(response) => {
                self.clock.observe(Some(response.server_clock));
                Ok(response)
            }
            Err(e) => {
                if e.is_transport() {
                    self.mark_down(replica, &e);
                }
                Err(e)
            }
        }
    }

    fn mark_down(&self, replica: NodeId, cause: &Error) {
        let mut ledger = self.ledger.lock();
        if let Some(entry) = ledger.get_mut(&replica) {
            entry.transport_failures += 1;
            if entry.status != ReplicaStatus::Down {
                warn!("replica {} ({}) marked down: {}", replica, entry.endpoint, cause);
            }
            entry.status = ReplicaStatus::Down;
        }
    }

    /// Probe every replica once and record the outcome.
    pub async fn health_check(&self) -> Vec<(NodeId, ReplicaStatus)> {
        let ids: Vec<NodeId> = self.ledger.lock().keys().copied().collect();
        let results = self.health.sweep(ids.iter()).await;
        let now = Utc::now();

        let mut ledger = self.ledger.lock();
        ids.iter()
            .zip(results)
            .filter_map(|(id, result)| {
                let entry = ledger.get_mut(id)?;
                let next = match &result {
                    Ok(()) => ReplicaStatus::Up,
                    Err(_) => ReplicaStatus::Down,
                };
                match (entry.status, &result) {
                    (ReplicaStatus::Down, Ok(())) => info!("replica {} ({}) is back up", id, entry.endpoint),
                    (ReplicaStatus::Unknown, Ok(())) => info!("replica {} ({}) is up", id, entry.endpoint),
                    (ReplicaStatus::Up | ReplicaStatus::Unknown, Err(e)) => {
                        warn!("replica {} ({}) failed health check: {}", id, entry.endpoint, e)
                    }
                    _ => {}
                }
                entry.status = next;
                entry.last_check = Some(now);
                Some((*id, next))
            })
            .collect()
    }

    /// Copy of the ledger.
    pub fn stats(&self) -> Vec<LedgerEntry> {
        self.ledger.lock().values().cloned().collect()
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let clock = self.clock.observe(request.client_clock);
        if request.call == ClientCall::Stats {
            return RpcResponse::ok(clock).with("servers", self.stats());
        }
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(Error::NoServersAvailable) => RpcResponse::failure(self.clock.time(), "No servers available"),
            Err(e) => RpcResponse::failure(self.clock.time(), format!("Replica unavailable, retry: {e}")),
        }
    }

    pub async fn run_health_loop(self: Arc<Self>, interval: Duration) {
        loop {
            self.health_check().await;
            sleep(interval).await;
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let me = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = me.connection(stream).await {
                            debug!("client {} went away: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("balancer accept error: {}", e);
                    sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    async fn connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true).ok();
        let mut framed = framed(stream);
        while let Some(raw) = read_frame::<_, Value>(&mut framed).await? {
            let response = match serde_json::from_value::<RpcRequest>(raw) {
                Ok(request) => self.handle(request).await,
                Err(e) => RpcResponse::failure(self.clock.time(), format!("Malformed request: {e}")),
            };
            write_frame(&mut framed, &response).await?;
        }
        Ok(())
    }
}
