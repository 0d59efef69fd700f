//! Wire types.
//!
//! Everything that crosses a socket is decoded once into one of the sum types
//! below: [`PeerMessage`]/[`PeerReply`] on the peer channel, and
//! [`RpcRequest`]/[`RpcResponse`] on the client-facing surface. Frames are
//! JSON; see [`crate::transport`] for the framing.

use crate::clock::VectorStamp;
use crate::NodeId;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Booking vocabulary
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserType {
    Rider,
    Driver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Requested,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: RideStatus) -> bool {
        use RideStatus::*;
        matches!(
            (self, next),
            (Requested, Accepted)
                | (Requested, Cancelled)
                | (Accepted, InProgress)
                | (Accepted, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replicated commands
// ─────────────────────────────────────────────────────────────────────────────

/// A state-changing operation. Parameters travel as an ordered JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "params", rename_all = "snake_case")]
pub enum Operation {
    /// username, password digest, user type, name, email, phone
    RegisterUser(String, String, UserType, Option<String>, Option<String>, Option<String>),
    /// ride id, rider, pickup, destination, fare, assigned driver, initial status
    BookRide(String, String, String, String, f64, Option<String>, RideStatus),
    /// ride id
    CancelRide(#[serde(with = "single")] String),
    /// ride id, new status
    UpdateRideStatus(String, RideStatus),
    /// driver, location, available
    SetDriverAvailable(String, String, bool),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::RegisterUser(..) => "register_user",
            Operation::BookRide(..) => "book_ride",
            Operation::CancelRide(..) => "cancel_ride",
            Operation::UpdateRideStatus(..) => "update_ride_status",
            Operation::SetDriverAvailable(..) => "set_driver_available",
        }
    }
}

/// One accepted write, stamped by the leader that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedCommand {
    pub origin: NodeId,
    /// Start-up id of the origin process; grows across restarts.
    pub incarnation: u64,
    pub operation: Operation,
    pub lamport_stamp: u64,
    pub vector_stamp: VectorStamp,
}


// ─────────────────────────────────────────────────────────────────────────────
// Peer channel
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Election {
        initiator: NodeId,
        candidates: Vec<NodeId>,
        epoch: u64,
    },
    Leader {
        leader_id: NodeId,
        candidates: Vec<NodeId>,
        initiator: NodeId,
        epoch: u64,
    },
    Update {
        command: ReplicatedCommand,
    },
    Heartbeat {
        sender: NodeId,
        clock: u64,
    },
    /// A client write handed from a follower to the leader.
    Forward {
        request: RpcRequest,
    },
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Election { .. } => "election",
            PeerMessage::Leader { .. } => "leader",
            PeerMessage::Update { .. } => "update",
            PeerMessage::Heartbeat { .. } => "heartbeat",
            PeerMessage::Forward { .. } => "forward",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerReply {
    Ack {
        from: NodeId,
        clock: u64,
        leader_id: NodeId,
        epoch: u64,
    },
    Response {
        response: RpcResponse,
    },
    Rejected {
        reason: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Client RPC surface
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum ClientCall {
    Ping,
    /// username, password, user type, name, email, phone
    RegisterUser(String, String, UserType, Option<String>, Option<String>, Option<String>),
    /// username, password
    AuthenticateUser(String, String),
    /// rider, pickup, destination
    #[serde(alias = "book_ride")]
    BookCab(String, String, String),
    CancelRide(#[serde(with = "single")] String),
    GetRideStatus(#[serde(with = "single")] String),
    /// ride id, new status
    UpdateRideStatus(String, RideStatus),
    /// driver, location, available
    SetDriverAvailable(String, String, bool),
    /// location
    GetAvailableCabs(#[serde(with = "single")] String),
    GetActiveRides,
    /// username
    GetUserRides(#[serde(with = "single")] String),
    GetAvailableDrivers,
    GetServerTime,
    /// client wall time, seconds since the Unix epoch
    SynchronizeClocks(#[serde(with = "single")] f64),
    GetServerStats,
    /// Balancer ledger. Answered by the balancer itself.
    Stats,
}

impl ClientCall {
    pub fn method(&self) -> &'static str {
        match self {
            ClientCall::Ping => "ping",
            ClientCall::RegisterUser(..) => "register_user",
            ClientCall::AuthenticateUser(..) => "authenticate_user",
            ClientCall::BookCab(..) => "book_cab",
            ClientCall::CancelRide(..) => "cancel_ride",
            ClientCall::GetRideStatus(..) => "get_ride_status",
            ClientCall::UpdateRideStatus(..) => "update_ride_status",
            ClientCall::SetDriverAvailable(..) => "set_driver_available",
            ClientCall::GetAvailableCabs(..) => "get_available_cabs",
            ClientCall::GetActiveRides => "get_active_rides",
            ClientCall::GetUserRides(..) => "get_user_rides",
            ClientCall::GetAvailableDrivers => "get_available_drivers",
            ClientCall::GetServerTime => "get_server_time",
            ClientCall::SynchronizeClocks(..) => "synchronize_clocks",
            ClientCall::GetServerStats => "get_server_stats",
            ClientCall::Stats => "stats",
        }
    }

    /// Calls that must go through the leader and be replicated.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            ClientCall::RegisterUser(..)
                | ClientCall::BookCab(..)
                | ClientCall::CancelRide(..)
                | ClientCall::UpdateRideStatus(..)
                | ClientCall::SetDriverAvailable(..)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub call: ClientCall,
    /// Caller's Lamport time. Missing, null or garbage all read as `None`.
    #[serde(default, deserialize_with = "lenient_clock")]
    pub client_clock: Option<u64>,
}

impl RpcRequest {
    pub fn new(call: ClientCall, client_clock: Option<u64>) -> Self {
        Self { call, client_clock }
    }
}

fn lenient_clock<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Structured result. Always carries `server_clock`; failures carry `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub server_clock: u64,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl RpcResponse {
    pub fn ok(server_clock: u64) -> Self {
        Self {
            success: true,
            message: None,
            server_clock,
            body: Map::new(),
        }
    }

    pub fn failure(server_clock: u64, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            server_clock,
            body: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }
}

/// One-parameter variants still travel as a one-element array. A bare value
/// is accepted on input.
mod single {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
        (value,).serialize(serializer)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Param<T> {
            Listed((T,)),
            Bare(T),
        }
        Ok(match Param::deserialize(deserializer)? {
            Param::Listed((value,)) => value,
            Param::Bare(value) => value,
        })
    }
}
