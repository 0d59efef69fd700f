//! Coordination layer for a replicated ride-booking service.
//!
//! A fixed roster of nodes elects a leader by passing messages around a ring,
//! watches it with heartbeats, and has it replicate every accepted write to
//! the others stamped with Lamport and vector clocks. A least-connections
//! balancer sits in front of the replicas.

pub mod balancer;
pub mod booking;
pub mod clock;
pub mod config;
pub mod election;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod memory;
pub mod node;
pub mod protocol;
pub mod replication;
pub mod telemetry;
pub mod transport;

/// Cluster member id. Positive, unique, totally ordered.
pub type NodeId = u32;

pub use error::{Error, Result};
