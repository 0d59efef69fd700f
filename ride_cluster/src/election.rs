//! Ring-based leader election.
//!
//! Members form a ring ordered by id. An election message collects candidate
//! ids as it travels the ring; when it comes back to its initiator the largest
//! candidate wins and a `leader` message goes around once more so everyone
//! learns the result. Unreachable members are skipped.
//!
//! Every round carries an epoch one above anything the initiator has seen.
//! Messages from older epochs are dropped, and two rounds that finish with the
//! same epoch settle on the larger leader id.

use crate::config::ElectionConfig;
use crate::health::{HealthChecker, PeerProbe};
use crate::protocol::{PeerMessage, PeerReply};
use crate::transport::PeerTransport;
use crate::NodeId;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ElectionState {
    pub role: Role,
    pub known_leader: NodeId,
    /// Highest round seen.
    pub epoch: u64,
    /// Round in which `known_leader` was chosen.
    pub leader_epoch: u64,
}

impl ElectionState {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn election_in_progress(&self) -> bool {
        self.role == Role::Candidate
    }
}

pub struct ElectionCoordinator {
    id: NodeId,
    ring: Vec<NodeId>,
    transport: Arc<dyn PeerTransport>,
    health: Arc<HealthChecker<PeerProbe>>,
    config: ElectionConfig,
    state: Mutex<ElectionState>,
    pending: Mutex<Option<AbortHandle>>,
}

impl ElectionCoordinator {
    /// The smallest id in the roster starts as leader.
    pub fn new(
        id: NodeId,
        roster: impl IntoIterator<Item = NodeId>,
        transport: Arc<dyn PeerTransport>,
        health: Arc<HealthChecker<PeerProbe>>,
        config: ElectionConfig,
    ) -> Arc<Self> {
        let mut ring: Vec<NodeId> = roster.into_iter().chain(std::iter::once(id)).collect();
        ring.sort_unstable();
        ring.dedup();
        let first = ring[0];
        let state = ElectionState {
            role: if first == id { Role::Leader } else { Role::Follower },
            known_leader: first,
            epoch: 0,
            leader_epoch: 0,
        };
        Arc::new(Self {
            id,
            ring,
            transport,
            health,
            config,
            state: Mutex::new(state),
            pending: Mutex::new(None),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> ElectionState {
        *self.state.lock()
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().is_leader()
    }

    pub fn known_leader(&self) -> NodeId {
        self.state.lock().known_leader
    }

    pub fn health(&self) -> &Arc<HealthChecker<PeerProbe>> {
        &self.health
    }

    /// Next member after this one.
    pub fn neighbor(&self) -> NodeId {
        self.ring_after(self.id).first().copied().unwrap_or(self.id)
    }

    /// Members after `from` in ring order, `from` itself excluded.
    pub fn ring_after(&self, from: NodeId) -> Vec<NodeId> {
        let split = self.ring.partition_point(|&n| n <= from);
        self.ring[split..]
            .iter()
            .chain(&self.ring[..split])
            .copied()
            .filter(|&n| n != from)
            .collect()
    }

    /// Whether this node should start an election for a dead `failed` leader:
    /// only the first live member after it in the ring does.
    pub async fn should_initiate(&self, failed: NodeId) -> bool {
        let closer: Vec<NodeId> = self
            .ring_after(failed)
            .into_iter()
            .take_while(|&n| n != self.id)
            .collect();
        for n in closer {
            if self.health.is_alive(&n).await {
                debug!("[{}] {} is alive and follows {} first, leaving the election to it", self.id, n, failed);
                return false;
            }
        }
        true
    }

    fn jitter(&self) -> Duration {
        let lo = self.config.jitter_min.as_millis() as u64;
        let hi = self.config.jitter_max.as_millis() as u64;
        Duration::from_millis(lo + rand::random::<u64>() % (hi.saturating_sub(lo) + 1))
    }

    /// Enter `Candidate` and schedule a round after a random delay. The
    /// pending round is dropped if a leader is learned before it fires.
    pub fn start_election(self: &Arc<Self>) {
        let epoch = {
            let mut st = self.state.lock();
            if st.role == Role::Candidate {
                debug!("[{}] election round {} already in progress", self.id, st.epoch);
                return;
            }
            st.role = Role::Candidate;
            st.epoch += 1;
            st.epoch
        };
        let delay = self.jitter();
        info!("[{}] -> Candidate, round {} starts in {:?}", self.id, epoch, delay);

        let mut pending = self.pending.lock();
        let me = self.clone();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            me.pending.lock().take();
            me.run_round(epoch).await;
        });
        *pending = Some(task.abort_handle());
    }

    fn cancel_pending(&self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }

    async fn run_round(self: &Arc<Self>, epoch: u64) {
        {
            let st = self.state.lock();
            if st.role != Role::Candidate || st.epoch != epoch {
                info!("[{}] abandoning election round {}: no longer a candidate", self.id, epoch);
                return;
            }
        }
        self.pass_election(self.id, vec![self.id], epoch).await;
    }

    /// Inbound `election` message.
    pub async fn handle_election(self: &Arc<Self>, initiator: NodeId, mut candidates: Vec<NodeId>, epoch: u64) {
        {
            let mut st = self.state.lock();
            if epoch < st.epoch {
                debug!("[{}] dropping stale election round {} (at {})", self.id, epoch, st.epoch);
                return;
            }
            if epoch > st.epoch {
                st.epoch = epoch;
                if st.role == Role::Candidate {
                    info!("[{}] own round superseded by round {} from {}", self.id, epoch, initiator);
                    st.role = Role::Follower;
                    drop(st);
                    self.cancel_pending();
                }
            }
        }

        if initiator == self.id {
            let leader = candidates.iter().copied().max().unwrap_or(self.id);
            info!(
                "[{}] election round {} went around the ring, candidates {:?}, leader {}",
                self.id, epoch, candidates, leader
            );
            if let Some(chosen) = self.adopt(leader, epoch) {
                self.announce(chosen, candidates, self.id, epoch).await;
            }
            return;
        }

        if candidates.contains(&self.id) {
            warn!("[{}] election round {} looped without reaching {}, dropping", self.id, epoch, initiator);
            return;
        }
        candidates.push(self.id);
        self.pass_election(initiator, candidates, epoch).await;
    }

    /// Inbound `leader` message.
    pub async fn handle_leader(
        self: &Arc<Self>,
        leader_id: NodeId,
        candidates: Vec<NodeId>,
        initiator: NodeId,
        epoch: u64,
    ) {
        let Some(chosen) = self.adopt(leader_id, epoch) else {
            return;
        };
        if initiator == self.id {
            debug!("[{}] leader {} for round {} announced around the ring", self.id, chosen, epoch);
            return;
        }
        self.announce(chosen, candidates, initiator, epoch).await;
    }

    /// A leader reported outside a round (heartbeat acks, start-up
    /// discovery). Taken only if it comes from a later round than ours.
    pub fn offer(&self, leader_id: NodeId, leader_epoch: u64) -> bool {
        if leader_epoch <= self.state.lock().leader_epoch {
            return false;
        }
        self.adopt(leader_id, leader_epoch).is_some()
    }

    /// Record `leader` for round `epoch`. Returns the leader actually
    /// adopted, or `None` when the round is stale.
    fn adopt(&self, leader: NodeId, epoch: u64) -> Option<NodeId> {
        let mut st = self.state.lock();
        if epoch < st.epoch || epoch < st.leader_epoch {
            debug!("[{}] ignoring leader {} from stale round {} (at {})", self.id, leader, epoch, st.epoch);
            return None;
        }
        let chosen = if epoch == st.leader_epoch && st.role != Role::Candidate {
            leader.max(st.known_leader)
        } else {
            leader
        };
        let before = (st.role, st.known_leader);
        st.known_leader = chosen;
        st.leader_epoch = epoch;
        st.epoch = st.epoch.max(epoch);
        st.role = if chosen == self.id { Role::Leader } else { Role::Follower };
        let after = (st.role, st.known_leader);
        drop(st);

        self.cancel_pending();
        if before != after {
            info!("[{}] -> {:?}, leader is {} (round {})", self.id, after.0, chosen, epoch);
        }
        Some(chosen)
    }

    async fn pass_election(self: &Arc<Self>, initiator: NodeId, candidates: Vec<NodeId>, epoch: u64) {
        let route: Vec<NodeId> = self
            .ring_after(self.id)
            .into_iter()
            .filter(|n| *n == initiator || !candidates.contains(n))
            .collect();
        let msg = PeerMessage::Election {
            initiator,
            candidates: candidates.clone(),
            epoch,
        };
        if let Some(next) = self.forward_around_ring(&route, msg).await {
            debug!("[{}] election round {} passed to {}", self.id, epoch, next);
            return;
        }

        let highest = self.ring.last().copied().unwrap_or(self.id);
        if self.id == highest {
            warn!("[{}] no member reachable for round {}, taking leadership as highest id", self.id, epoch);
            if let Some(chosen) = self.adopt(self.id, epoch) {
                self.announce(chosen, candidates, self.id, epoch).await;
            }
        } else {
            warn!("[{}] election round {} stalled: no member reachable", self.id, epoch);
            let mut st = self.state.lock();
            if st.role == Role::Candidate && st.epoch == epoch {
                st.role = Role::Follower;
            }
        }
    }

    /// Carry the result onward, stopping once the initiator has it.
    async fn announce(&self, leader_id: NodeId, candidates: Vec<NodeId>, initiator: NodeId, epoch: u64) {
        let mut route = Vec::new();
        for n in self.ring_after(self.id) {
            route.push(n);
            if n == initiator {
                break;
            }
        }
        let msg = PeerMessage::Leader {
            leader_id,
            candidates,
            initiator,
            epoch,
        };
        if self.forward_around_ring(&route, msg).await.is_none() && !route.is_empty() {
            debug!("[{}] nobody left to tell about leader {}", self.id, leader_id);
        }
    }

    /// Try each member of `route` in turn until one accepts `msg`.
    async fn forward_around_ring(&self, route: &[NodeId], msg: PeerMessage) -> Option<NodeId> {
        for &next in route {
            match self.transport.send(next, msg.clone()).await {
                Ok(PeerReply::Ack { .. }) => return Some(next),
                Ok(other) => debug!("[{}] {} refused {}: {:?}", self.id, next, msg.kind(), other),
                Err(e) => debug!("[{}] {} unreachable for {}: {}, trying next", self.id, next, msg.kind(), e),
            }
        }
        None
    }
}
