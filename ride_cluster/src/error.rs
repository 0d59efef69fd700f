//! Error types for the coordination core.
//!
//! Only transport, protocol and configuration failures are errors. Booking
//! failures ("ride not found", "no driver available") travel back to callers as
//! structured [`RpcResponse`](crate::protocol::RpcResponse) values instead.

use crate::NodeId;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Peer or replica could not be reached (refused, reset, unknown address).
    #[error("transport error talking to {target}: {reason}")]
    Transport { target: String, reason: String },

    /// A bounded cross-node call ran out of time.
    #[error("call to {0} timed out")]
    Timeout(String),

    /// A frame could not be decoded, or the peer answered with the wrong reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid startup configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Every replica behind the balancer is marked down.
    #[error("no servers available")]
    NoServersAvailable,

    /// A forwarded write reached a node that does not hold leadership.
    #[error("node {0} is not the leader")]
    NotLeader(NodeId),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn transport(target: impl ToString, reason: impl ToString) -> Self {
        Error::Transport {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for failures that say something about the remote end's liveness
    /// (refused, reset, timed out, garbled). These flip replicas to `Down`.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Timeout(_) | Error::Protocol(_) | Error::Io(_) | Error::Json(_)
        )
    }
}
