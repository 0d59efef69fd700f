//! Leader failure detection.
//!
//! Followers ping the leader they know about on a fixed period. A round that
//! fails every retry hands over to the election coordinator, which decides
//! whether this node is the one that should start a new round.

use crate::election::{ElectionCoordinator, Role};
use crate::NodeId;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// What one heartbeat round did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Leader or candidate; nothing to watch.
    Idle,
    Alive(NodeId),
    /// Leader unreachable; this node started an election.
    Elected(NodeId),
    /// Leader unreachable; a node closer to it in the ring should act.
    Deferred(NodeId),
}

pub struct HeartbeatMonitor {
    election: Arc<ElectionCoordinator>,
    interval: Duration,
    failures: AtomicU32,
}

impl HeartbeatMonitor {
    pub fn new(election: Arc<ElectionCoordinator>, interval: Duration) -> Self {
        Self {
            election,
            interval,
            failures: AtomicU32::new(0),
        }
    }

    /// Consecutive failed rounds against the current leader.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub async fn run(self: Arc<Self>) {
        let id = self.election.id();
        info!("[{}] heartbeat monitor running every {:?}", id, self.interval);
        loop {
            sleep(self.interval).await;
            let beat = self.tick().await;
            debug!("[{}] heartbeat: {:?}", id, beat);
        }
    }

    pub async fn tick(&self) -> Beat {
        let id = self.election.id();
        let st = self.election.state();
        if st.role != Role::Follower || st.known_leader == id {
            self.failures.store(0, Ordering::Relaxed);
            return Beat::Idle;
        }
        let leader = st.known_leader;
        let health = self.election.health();

        if health.is_alive_with_retry(&leader).await {
            self.failures.store(0, Ordering::Relaxed);
            if let Some(view) = health.probe_ref().last_view(leader) {
                if self.election.offer(view.leader_id, view.epoch) {
                    info!("[{}] leader {} points at newer leader {}", id, leader, view.leader_id);
                }
            }
            return Beat::Alive(leader);
        }

        let failed = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("[{}] leader {} unreachable (round {})", id, leader, failed);
        if self.election.known_leader() != leader {
            return Beat::Idle;
        }
        if self.election.should_initiate(leader).await {
            self.election.start_election();
            Beat::Elected(leader)
        } else {
            Beat::Deferred(leader)
        }
    }
}
