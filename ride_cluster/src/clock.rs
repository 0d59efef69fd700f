//! Logical clocks.
//!
//! [`LamportClock`] orders every request/response pair handled by a node and
//! [`VectorClock`] tracks causality of replicated commands. Both are shared
//! between request tasks, so every read hands back a copy.
//!
//! A [`VectorStamp`] is a JSON object keyed by node id. JSON keys are strings,
//! and inside tagged envelopes serde hands them back as strings, so decoding
//! parses them explicitly.

use crate::NodeId;
use parking_lot::Mutex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Scalar Lamport clock.
#[derive(Debug, Default)]
pub struct LamportClock {
    time: AtomicU64,
}

impl LamportClock {
    pub fn new(initial: u64) -> Self {
        Self {
            time: AtomicU64::new(initial),
        }
    }

    /// Current value without ticking.
    pub fn time(&self) -> u64 {
        self.time.load(Ordering::Acquire)
    }

    /// Local event: `local + 1`.
    pub fn increment(&self) -> u64 {
        self.time.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Message receipt: `max(local, remote) + 1`. A missing remote value counts as 0.
    pub fn observe(&self, remote: Option<u64>) -> u64 {
        let remote = remote.unwrap_or(0);
        loop {
            let prev = self.time.load(Ordering::Acquire);
            let next = prev.max(remote) + 1;
            match self
                .time
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(_) => continue,
            }
        }
    }
}

/// Immutable copy of a vector clock, as carried on replicated commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VectorStamp(BTreeMap<NodeId, u64>);

impl<'de> Deserialize<'de> for VectorStamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        BTreeMap::<String, u64>::deserialize(deserializer)?
            .into_iter()
            .map(|(node, count)| {
                node.trim()
                    .parse::<NodeId>()
                    .map(|id| (id, count))
                    .map_err(|_| D::Error::custom(format!("bad node id {node:?} in vector stamp")))
            })
            .collect()
    }
}

impl VectorStamp {
    pub fn get(&self, node: NodeId) -> u64 {
        self.0.get(&node).copied().unwrap_or(0)
    }

    pub fn entries(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// `self -> other`: no entry of `self` exceeds `other`, at least one is smaller.
    pub fn happens_before(&self, other: &VectorStamp) -> bool {
        let mut strictly_less = false;
        for node in self.keys_with(other) {
            let (mine, theirs) = (self.get(node), other.get(node));
            if mine > theirs {
                return false;
            }
            if mine < theirs {
                strictly_less = true;
            }
        }
        strictly_less
    }

    /// Neither stamp precedes the other and they differ in both directions.
    pub fn concurrent_with(&self, other: &VectorStamp) -> bool {
        let mut ahead = false;
        let mut behind = false;
        for node in self.keys_with(other) {
            let (mine, theirs) = (self.get(node), other.get(node));
            ahead |= mine > theirs;
            behind |= mine < theirs;
        }
        ahead && behind
    }

    fn keys_with<'a>(&'a self, other: &'a VectorStamp) -> impl Iterator<Item = NodeId> + 'a {
        let mut keys: Vec<NodeId> = self.0.keys().chain(other.0.keys()).copied().collect();
        keys.sort_unstable();
        keys.dedup();
        keys.into_iter()
    }
}

impl FromIterator<(NodeId, u64)> for VectorStamp {
    fn from_iter<I: IntoIterator<Item = (NodeId, u64)>>(iter: I) -> Self {
        VectorStamp(iter.into_iter().collect())
    }
}

/// Per-node vector clock owned by one node.
#[derive(Debug)]
pub struct VectorClock {
    owner: NodeId,
    entries: Mutex<BTreeMap<NodeId, u64>>,
}

impl VectorClock {
    pub fn new(owner: NodeId) -> Self {
        Self {
            owner,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn snapshot(&self) -> VectorStamp {
        VectorStamp(self.entries.lock().clone())
    }

    /// Local event.
    pub fn tick(&self) -> VectorStamp {
        let mut entries = self.entries.lock();
        *entries.entry(self.owner).or_insert(0) += 1;
        VectorStamp(entries.clone())
    }

    /// Pointwise max with `remote`, then tick the owner's entry.
    pub fn merge(&self, remote: &VectorStamp) -> VectorStamp {
        let mut entries = self.entries.lock();
        for (node, value) in remote.entries() {
            let slot = entries.entry(node).or_insert(0);
            *slot = (*slot).max(value);
        }
        *entries.entry(self.owner).or_insert(0) += 1;
        VectorStamp(entries.clone())
    }
}
