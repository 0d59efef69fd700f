//! Typed configuration for nodes and the balancer.
//!
//! Defaults mirror the deployment the cluster was first run with: three
//! replicas on localhost, client RPC on `5000 + id`, peer traffic on
//! `6000 + id`, balancer on port 5000.

use crate::error::{Error, Result};
use crate::NodeId;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const RPC_BASE_PORT: u16 = 5000;
pub const PEER_BASE_PORT: u16 = 6000;
pub const BALANCER_PORT: u16 = RPC_BASE_PORT;
pub const DEFAULT_CLUSTER_SIZE: u32 = 3;

/// The two addresses every cluster member listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAddrs {
    /// Election / replication / heartbeat channel.
    pub peer: SocketAddr,
    /// Client-facing RPC surface.
    pub rpc: SocketAddr,
}

impl MemberAddrs {
    /// Ports derived from the node id: `6000 + id` and `5000 + id`.
    pub fn derived(host: IpAddr, id: NodeId) -> Result<Self> {
        let offset = u16::try_from(id)
            .ok()
            .filter(|o| *o < u16::MAX - PEER_BASE_PORT)
            .ok_or_else(|| Error::Config(format!("node id {id} does not map to a port")))?;
        Ok(Self {
            peer: SocketAddr::new(host, PEER_BASE_PORT + offset),
            rpc: SocketAddr::new(host, RPC_BASE_PORT + offset),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Wait for every peer to acknowledge or fail before answering the client.
    #[default]
    Synchronous,
    /// Answer right after the local apply; peers are fed in the background.
    Asynchronous,
}

/// Acknowledgement target reported for each write. Recorded, never enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    One,
    #[default]
    Quorum,
    All,
}

impl ConsistencyLevel {
    /// Copies (leader included) needed for a cluster of `cluster_size`.
    pub fn required(self, cluster_size: usize) -> usize {
        match self {
            ConsistencyLevel::One => 1,
            ConsistencyLevel::Quorum => cluster_size / 2 + 1,
            ConsistencyLevel::All => cluster_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Probes attempted per round before the leader is declared unreachable.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            retries: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            jitter_min: Duration::from_millis(150),
            jitter_max: Duration::from_millis(600),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplicationConfig {
    pub mode: ReplicationMode,
    pub consistency: ConsistencyLevel,
}

#[derive(Debug, Clone)]
pub struct FareConfig {
    pub base_fare: f64,
    pub per_km_rate: f64,
    pub surge_factor: f64,
}

impl Default for FareConfig {
    fn default() -> Self {
        Self {
            base_fare: 50.0,
            per_km_rate: 12.0,
            surge_factor: 1.0,
        }
    }
}

/// Everything one cluster member needs to start.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    /// Every member, this node included.
    pub roster: BTreeMap<NodeId, MemberAddrs>,
    /// Upper bound on any single cross-node call.
    pub call_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    pub election: ElectionConfig,
    pub replication: ReplicationConfig,
    pub fares: FareConfig,
    /// Load the demo riders and drivers at start-up. Every member loads the
    /// same set, so nothing is replicated.
    pub sample_data: bool,
}

impl ClusterConfig {
    pub fn new(node_id: NodeId, roster: BTreeMap<NodeId, MemberAddrs>) -> Self {
        Self {
            node_id,
            roster,
            call_timeout: Duration::from_secs(2),
            heartbeat: HeartbeatConfig::default(),
            election: ElectionConfig::default(),
            replication: ReplicationConfig::default(),
            fares: FareConfig::default(),
            sample_data: false,
        }
    }

    /// Members `1..=cluster_size` on `host` with port-derived addresses.
    pub fn local(node_id: NodeId, cluster_size: u32, host: IpAddr) -> Result<Self> {
        let roster = (1..=cluster_size)
            .map(|id| MemberAddrs::derived(host, id).map(|addrs| (id, addrs)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let config = Self::new(node_id, roster);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.roster.is_empty() {
            return Err(Error::Config("cluster roster is empty".into()));
        }
        if !self.roster.contains_key(&self.node_id) {
            return Err(Error::Config(format!(
                "node {} is not part of the roster {:?}",
                self.node_id,
                self.roster.keys().collect::<Vec<_>>()
            )));
        }
        if self.roster.contains_key(&0) {
            return Err(Error::Config("node ids must be positive".into()));
        }
        if self.election.jitter_min > self.election.jitter_max {
            return Err(Error::Config(format!(
                "election jitter range inverted: {:?} > {:?}",
                self.election.jitter_min, self.election.jitter_max
            )));
        }
        if self.heartbeat.retries == 0 {
            return Err(Error::Config("heartbeat retries must be at least 1".into()));
        }
        Ok(())
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.roster
            .keys()
            .copied()
            .filter(|id| *id != self.node_id)
            .collect()
    }

    pub fn addrs(&self) -> Option<MemberAddrs> {
        self.roster.get(&self.node_id).copied()
    }
}

/// Parses `id=peer_addr/rpc_addr` pairs, e.g.
/// `1=127.0.0.1:6001/127.0.0.1:5001,2=127.0.0.1:6002/127.0.0.1:5002`.
/// A bare `id` derives both addresses from the default ports.
pub fn parse_roster(list: &str, host: IpAddr) -> Result<BTreeMap<NodeId, MemberAddrs>> {
    let mut roster = BTreeMap::new();
    for pair in list.split(',') {
        let p = pair.trim();
        if p.is_empty() {
            continue;
        }
        let (id_s, addrs) = match p.split_once('=') {
            Some((id, rest)) => (id, Some(rest)),
            None => (p, None),
        };
        let id: NodeId = id_s
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("bad node id in '{p}'")))?;
        let member = match addrs {
            None => MemberAddrs::derived(host, id)?,
            Some(rest) => {
                let (peer, rpc) = rest
                    .split_once('/')
                    .ok_or_else(|| Error::Config(format!("expected peer/rpc addresses in '{p}'")))?;
                MemberAddrs {
                    peer: peer
                        .trim()
                        .parse()
                        .map_err(|e| Error::Config(format!("bad peer address in '{p}': {e}")))?,
                    rpc: rpc
                        .trim()
                        .parse()
                        .map_err(|e| Error::Config(format!("bad rpc address in '{p}': {e}")))?,
                }
            }
        };
        if roster.insert(id, member).is_some() {
            return Err(Error::Config(format!("node id {id} listed twice")));
        }
    }
    Ok(roster)
}

/// Settings for the least-connections front end.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub listen: SocketAddr,
    /// Replica id and client RPC address.
    pub replicas: BTreeMap<NodeId, SocketAddr>,
    pub health_interval: Duration,
    pub call_timeout: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        let replicas = (1..=DEFAULT_CLUSTER_SIZE)
            .map(|id| (id, SocketAddr::new(DEFAULT_HOST, RPC_BASE_PORT + id as u16)))
            .collect();
        Self {
            listen: SocketAddr::new(DEFAULT_HOST, BALANCER_PORT),
            replicas,
            health_interval: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.replicas.is_empty() {
            return Err(Error::Config("balancer needs at least one replica".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_roster_derives_ports_from_ids() {
        let cfg = ClusterConfig::local(2, 3, DEFAULT_HOST).unwrap();
        assert_eq!(cfg.peer_ids(), vec![1, 3]);
        let me = cfg.addrs().unwrap();
        assert_eq!(me.peer.port(), 6002);
        assert_eq!(me.rpc.port(), 5002);
    }

    #[test]
    fn self_must_be_in_roster() {
        let err = ClusterConfig::local(4, 3, DEFAULT_HOST).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn inverted_jitter_is_rejected() {
        let mut cfg = ClusterConfig::local(1, 3, DEFAULT_HOST).unwrap();
        cfg.election.jitter_min = Duration::from_secs(2);
        cfg.election.jitter_max = Duration::from_secs(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roster_parses_explicit_and_derived_members() {
        let roster = parse_roster("1=127.0.0.1:7001/127.0.0.1:7101, 2", DEFAULT_HOST).unwrap();
        assert_eq!(roster[&1].peer.port(), 7001);
        assert_eq!(roster[&1].rpc.port(), 7101);
        assert_eq!(roster[&2].peer.port(), 6002);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        assert!(parse_roster("1,2,1", DEFAULT_HOST).is_err());
    }

    #[test]
    fn consistency_levels_count_the_leader() {
        assert_eq!(ConsistencyLevel::One.required(5), 1);
        assert_eq!(ConsistencyLevel::Quorum.required(5), 3);
        assert_eq!(ConsistencyLevel::Quorum.required(4), 3);
        assert_eq!(ConsistencyLevel::All.required(3), 3);
    }
}
