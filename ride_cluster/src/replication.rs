//! Leader-to-follower dissemination of accepted writes.
//!
//! The leader stamps each accepted [`Operation`] with both clocks, applies it
//! locally and queues it for every peer in one step, so commands reach a given
//! follower in the order they were stamped. Each peer has one long-lived
//! outbound worker fed by a channel. Synchronous mode waits for every worker to
//! report; asynchronous mode returns right after the local apply.
//!
//! Delivery is at-least-once and best effort: a failed push is logged and not
//! retried, and the local write is never rolled back.
//!
//! Followers keep the stamp of the last command applied from each origin. A
//! command from the same incarnation whose stamp does not come after that one
//! is a replay and is skipped. Incarnations grow across restarts, so a
//! restarted leader whose vector clock starts again from zero is not taken for
//! a replayer. A stamp concurrent with the last write from another origin means
//! two leaders accepted writes without seeing each other's; it is applied and
//! counted.

use crate::booking::{Applied, ReplicaStore};
use crate::clock::{LamportClock, VectorClock, VectorStamp};
use crate::config::{ConsistencyLevel, ReplicationConfig, ReplicationMode};
use crate::error::{Error, Result};
use crate::protocol::{Operation, PeerMessage, PeerReply, ReplicatedCommand};
use crate::transport::PeerTransport;
use crate::NodeId;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Result of pushing one command out to the cluster.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub command: ReplicatedCommand,
    pub applied: Applied,
    pub mode: ReplicationMode,
    pub consistency: ConsistencyLevel,
    /// Copies known to hold the command, the leader's own included.
    pub acknowledged: usize,
    pub required: usize,
    pub failed: Vec<NodeId>,
}

impl Proposal {
    pub fn consistency_met(&self) -> bool {
        self.acknowledged >= self.required
    }
}

/// A command applied locally and queued for every peer, not yet settled.
#[derive(Debug)]
pub struct Dispatch {
    command: ReplicatedCommand,
    applied: Applied,
    waits: Vec<(NodeId, oneshot::Receiver<bool>)>,
    failed: Vec<NodeId>,
}

impl Dispatch {
    pub fn command(&self) -> &ReplicatedCommand {
        &self.command
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReplicationStats {
    pub proposed: u64,
    pub replicated: u64,
    pub duplicates: u64,
    pub concurrent: u64,
    pub failed_deliveries: u64,
}

struct Delivery {
    command: ReplicatedCommand,
    ack: Option<oneshot::Sender<bool>>,
}

#[derive(Default)]
struct Counters {
    proposed: AtomicU64,
    replicated: AtomicU64,
    duplicates: AtomicU64,
    concurrent: AtomicU64,
    failed_deliveries: AtomicU64,
}

/// Last command applied from one origin.
struct OriginMark {
    incarnation: u64,
    stamp: VectorStamp,
}

impl OriginMark {
    fn of(command: &ReplicatedCommand) -> Self {
        Self {
            incarnation: command.incarnation,
            stamp: command.vector_stamp.clone(),
        }
    }

    /// `command` was already applied, or comes from an older incarnation.
    fn covers(&self, command: &ReplicatedCommand) -> bool {
        if command.incarnation != self.incarnation {
            return command.incarnation < self.incarnation;
        }
        !self.stamp.happens_before(&command.vector_stamp)
    }
}

/// Start-up time in microseconds, bumped so no two managers in one process
/// share a value.
fn next_incarnation() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
    let mut prev = LAST.load(Ordering::Acquire);
    loop {
        let next = now.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return next,
            Err(seen) => prev = seen,
        }
    }
}

pub struct ReplicationManager {
    node_id: NodeId,
    incarnation: u64,
    config: ReplicationConfig,
    cluster_size: usize,
    lamport: Arc<LamportClock>,
    vector: Arc<VectorClock>,
    store: Arc<dyn ReplicaStore>,
    outbound: BTreeMap<NodeId, mpsc::UnboundedSender<Delivery>>,
    /// Held from stamping until the command sits on every peer channel.
    sequencer: Mutex<()>,
    marks: Mutex<HashMap<NodeId, OriginMark>>,
    counters: Arc<Counters>,
}

impl ReplicationManager {
    /// Spawns one outbound worker per peer; must be called inside a runtime.
    pub fn new(
        node_id: NodeId,
        peers: &[NodeId],
        config: ReplicationConfig,
        lamport: Arc<LamportClock>,
        vector: Arc<VectorClock>,
        store: Arc<dyn ReplicaStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let outbound = peers
            .iter()
            .filter(|p| **p != node_id)
            .map(|&peer| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(outbound_worker(node_id, peer, transport.clone(), rx, counters.clone()));
                (peer, tx)
            })
            .collect::<BTreeMap<_, _>>();

        Self {
            node_id,
            incarnation: next_incarnation(),
            config,
            cluster_size: outbound.len() + 1,
            lamport,
            vector,
            store,
            outbound,
            sequencer: Mutex::new(()),
            marks: Mutex::new(HashMap::new()),
            counters,
        }
    }

    pub fn mode(&self) -> ReplicationMode {
        self.config.mode
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Stamp and apply locally without queueing for peers.
    pub fn apply_local(&self, operation: Operation) -> (ReplicatedCommand, Applied) {
        let _order = self.sequencer.lock();
        self.stamp_and_apply(operation)
    }

    /// Stamp, apply locally and queue for every peer. Ordering on each peer
    /// channel matches stamp order even when called from many tasks.
    pub fn stage(&self, operation: Operation) -> Dispatch {
        let _order = self.sequencer.lock();
        let (command, applied) = self.stamp_and_apply(operation);
        let synchronous = self.config.mode == ReplicationMode::Synchronous;

        let mut waits = Vec::new();
        let mut failed = Vec::new();
        for (&peer, tx) in &self.outbound {
            let (ack, wait) = if synchronous {
                let (ack_tx, ack_rx) = oneshot::channel();
                (Some(ack_tx), Some(ack_rx))
            } else {
                (None, None)
            };
            let delivery = Delivery {
                command: command.clone(),
                ack,
            };
            match (tx.send(delivery), wait) {
                (Err(_), _) => failed.push(peer),
                (Ok(()), Some(ack_rx)) => waits.push((peer, ack_rx)),
                (Ok(()), None) => {}
            }
        }
        Dispatch {
            command,
            applied,
            waits,
            failed,
        }
    }

    /// Wait for peer acknowledgements (synchronous mode) and report.
    pub async fn settle(&self, dispatch: Dispatch) -> Proposal {
        let Dispatch {
            command,
            applied,
            waits,
            mut failed,
        } = dispatch;
        let required = self.config.consistency.required(self.cluster_size);
        let mut acknowledged = 1;

        let outcomes = join_all(
            waits
                .into_iter()
                .map(|(peer, ack_rx)| async move { (peer, ack_rx.await.unwrap_or(false)) }),
        )
        .await;
        for (peer, ok) in outcomes {
            if ok {
                acknowledged += 1;
            } else {
                failed.push(peer);
            }
        }
        if self.config.mode == ReplicationMode::Synchronous && acknowledged < required {
            warn!(
                "[{}] {} at L{} reached {}/{} copies, below {:?}; keeping local write",
                self.node_id,
                command.operation.name(),
                command.lamport_stamp,
                acknowledged,
                self.cluster_size,
                self.config.consistency
            );
        }

        Proposal {
            command,
            applied,
            mode: self.config.mode,
            consistency: self.config.consistency,
            acknowledged,
            required,
            failed,
        }
    }

    /// Leader-side write: local apply, then dissemination.
    pub async fn propose(&self, operation: Operation) -> Proposal {
        let dispatch = self.stage(operation);
        self.settle(dispatch).await
    }

    fn stamp_and_apply(&self, operation: Operation) -> (ReplicatedCommand, Applied) {
        let lamport_stamp = self.lamport.increment();
        let vector_stamp = self.vector.tick();
        let command = ReplicatedCommand {
            origin: self.node_id,
            incarnation: self.incarnation,
            operation,
            lamport_stamp,
            vector_stamp,
        };
        self.marks.lock().insert(self.node_id, OriginMark::of(&command));
        let applied = self.store.apply(&command.operation);
        self.counters.proposed.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[{}] applied {} locally at L{} ({:?})",
            self.node_id,
            command.operation.name(),
            lamport_stamp,
            applied
        );
        (command, applied)
    }

    /// Follower-side apply of a command pushed by a leader.
    pub fn replicate(&self, command: &ReplicatedCommand) -> Applied {
        self.lamport.observe(Some(command.lamport_stamp));
        self.vector.merge(&command.vector_stamp);

        let concurrent: Vec<NodeId> = {
            let mut marks = self.marks.lock();
            if marks.get(&command.origin).is_some_and(|mark| mark.covers(command)) {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "[{}] ignoring replayed {} from {} at L{}",
                    self.node_id,
                    command.operation.name(),
                    command.origin,
                    command.lamport_stamp
                );
                return Applied::Unchanged;
            }
            let concurrent = marks
                .iter()
                .filter(|(origin, mark)| **origin != command.origin && mark.stamp.concurrent_with(&command.vector_stamp))
                .map(|(origin, _)| *origin)
                .collect();
            marks.insert(command.origin, OriginMark::of(command));
            concurrent
        };
        if !concurrent.is_empty() {
            self.counters.concurrent.fetch_add(1, Ordering::Relaxed);
            warn!(
                "[{}] {} from {} at L{} is concurrent with writes from {:?}",
                self.node_id,
                command.operation.name(),
                command.origin,
                command.lamport_stamp,
                concurrent
            );
        }

        let applied = self.store.apply(&command.operation);
        self.counters.replicated.fetch_add(1, Ordering::Relaxed);
        info!(
            "[{}] replicated {} from {} at L{} ({:?})",
            self.node_id,
            command.operation.name(),
            command.origin,
            command.lamport_stamp,
            applied
        );
        applied
    }

    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            proposed: self.counters.proposed.load(Ordering::Relaxed),
            replicated: self.counters.replicated.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            concurrent: self.counters.concurrent.load(Ordering::Relaxed),
            failed_deliveries: self.counters.failed_deliveries.load(Ordering::Relaxed),
        }
    }
}

async fn push(transport: &dyn PeerTransport, peer: NodeId, command: ReplicatedCommand) -> Result<()> {
    match transport.send(peer, PeerMessage::Update { command }).await? {
        PeerReply::Ack { .. } => Ok(()),
        PeerReply::Rejected { reason } => Err(Error::Protocol(reason)),
        other => Err(Error::Protocol(format!("unexpected reply to update: {other:?}"))),
    }
}

async fn outbound_worker(
    node_id: NodeId,
    peer: NodeId,
    transport: Arc<dyn PeerTransport>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    counters: Arc<Counters>,
) {
    while let Some(Delivery { command, ack }) = rx.recv().await {
        let name = command.operation.name();
        let stamp = command.lamport_stamp;
        let ok = match push(transport.as_ref(), peer, command).await {
            Ok(()) => true,
            Err(e) => {
                counters.failed_deliveries.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] replication of {} L{} to {} failed: {}", node_id, name, stamp, peer, e);
                false
            }
        };
        if let Some(ack) = ack {
            let _ = ack.send(ok);
        }
    }
    debug!("[{}] outbound worker for {} stopped", node_id, peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::BookingStore;
    use crate::config::FareConfig;
    use crate::protocol::UserType;
    use async_trait::async_trait;

    /// Records every update it is handed; optionally refuses everything.
    struct Recorder {
        sent: Mutex<Vec<(NodeId, u64)>>,
        down: Vec<NodeId>,
    }

    #[async_trait]
    impl PeerTransport for Recorder {
        async fn send(&self, target: NodeId, message: PeerMessage) -> Result<PeerReply> {
            if self.down.contains(&target) {
                return Err(Error::transport(target, "refused"));
            }
            if let PeerMessage::Update { command } = message {
                self.sent.lock().push((target, command.lamport_stamp));
            }
            Ok(PeerReply::Ack {
                from: target,
                clock: 0,
                leader_id: 1,
                epoch: 0,
            })
        }
    }

    fn manager(
        id: NodeId,
        mode: ReplicationMode,
        consistency: ConsistencyLevel,
        down: Vec<NodeId>,
    ) -> (ReplicationManager, Arc<Recorder>, Arc<BookingStore>) {
        let transport = Arc::new(Recorder {
            sent: Mutex::new(Vec::new()),
            down,
        });
        let store = Arc::new(BookingStore::new(FareConfig::default()));
        let mgr = ReplicationManager::new(
            id,
            &[1, 2, 3],
            ReplicationConfig { mode, consistency },
            Arc::new(LamportClock::default()),
            Arc::new(VectorClock::new(id)),
            store.clone(),
            transport.clone(),
        );
        (mgr, transport, store)
    }

    fn register(name: &str) -> Operation {
        Operation::RegisterUser(name.into(), "digest".into(), UserType::Rider, None, None, None)
    }

    #[tokio::test]
    async fn synchronous_proposal_waits_for_every_peer() {
        let (mgr, transport, store) = manager(1, ReplicationMode::Synchronous, ConsistencyLevel::All, vec![]);
        let proposal = mgr.propose(register("alice")).await;

        assert_eq!(proposal.applied, Applied::Changed);
        assert_eq!(proposal.acknowledged, 3);
        assert!(proposal.consistency_met());
        assert!(store.user("alice").is_some());
        let mut sent = transport.sent.lock().clone();
        sent.sort();
        assert_eq!(sent, vec![(2, 1), (3, 1)]);
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_roll_back_the_local_write() {
        let (mgr, _, store) = manager(1, ReplicationMode::Synchronous, ConsistencyLevel::All, vec![3]);
        let proposal = mgr.propose(register("alice")).await;

        assert_eq!(proposal.failed, vec![3]);
        assert_eq!(proposal.acknowledged, 2);
        assert!(!proposal.consistency_met());
        assert!(store.user("alice").is_some());
        assert_eq!(mgr.stats().failed_deliveries, 1);
    }

    #[tokio::test]
    async fn asynchronous_proposal_reports_only_the_leader_copy() {
        let (mgr, transport, _) = manager(1, ReplicationMode::Asynchronous, ConsistencyLevel::One, vec![]);
        let proposal = mgr.propose(register("alice")).await;
        assert_eq!(proposal.acknowledged, 1);
        assert!(proposal.consistency_met());

        for _ in 0..50 {
            if transport.sent.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(transport.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn commands_reach_each_peer_in_order() {
        let (mgr, transport, _) = manager(1, ReplicationMode::Asynchronous, ConsistencyLevel::One, vec![]);
        for i in 0..20 {
            mgr.propose(register(&format!("user{i}"))).await;
        }
        for _ in 0..100 {
            if transport.sent.lock().len() == 40 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let sent = transport.sent.lock().clone();
        let to_two: Vec<u64> = sent.iter().filter(|(p, _)| *p == 2).map(|(_, s)| *s).collect();
        assert_eq!(to_two, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn replayed_command_is_a_noop_but_still_advances_the_clock() {
        let (leader, _, _) = manager(1, ReplicationMode::Synchronous, ConsistencyLevel::One, vec![]);
        let (follower, _, store) = manager(2, ReplicationMode::Synchronous, ConsistencyLevel::One, vec![]);

        let (command, _) = leader.apply_local(register("alice"));
        assert_eq!(follower.replicate(&command), Applied::Changed);
        let after_first = follower.lamport.time();
        assert_eq!(follower.replicate(&command), Applied::Unchanged);
        assert!(follower.lamport.time() > after_first);
        assert_eq!(store.stats().riders, 1);
        assert_eq!(follower.stats().duplicates, 1);
        assert_eq!(follower.vector.snapshot().get(1), 1);
    }

    #[tokio::test]
    async fn restarted_origin_is_not_mistaken_for_a_replay() {
        let (before, _, _) = manager(1, ReplicationMode::Synchronous, ConsistencyLevel::One, vec![]);
        let (follower, _, store) = manager(2, ReplicationMode::Synchronous, ConsistencyLevel::One, vec![]);
        let old: Vec<_> = ["alice", "bob", "carol"]
            .into_iter()
            .map(|name| before.apply_local(register(name)).0)
            .collect();
        for command in &old {
            assert_eq!(follower.replicate(command), Applied::Changed);
        }

        // same id, fresh process: its vector clock starts over
        let (after, _, _) = manager(1, ReplicationMode::Synchronous, ConsistencyLevel::One, vec![]);
        assert!(after.incarnation() > before.incarnation());
        let (fresh, _) = after.apply_local(register("dave"));
        assert_eq!(fresh.vector_stamp.get(1), 1);
        assert_eq!(follower.replicate(&fresh), Applied::Changed);
        assert!(store.user("dave").is_some());

        // a late frame from the old process stays dropped
        assert_eq!(follower.replicate(&old[2]), Applied::Unchanged);
        assert_eq!(follower.stats().duplicates, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrently_staged_commands_leave_in_stamp_order() {
        let (mgr, transport, _) = manager(1, ReplicationMode::Synchronous, ConsistencyLevel::All, vec![]);
        let mgr = Arc::new(mgr);
        let tasks: Vec<_> = (0..8)
            .map(|t| {
                let mgr = mgr.clone();
                tokio::spawn(async move {
                    for i in 0..25 {
                        mgr.propose(register(&format!("user{t}-{i}"))).await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let sent = transport.sent.lock().clone();
        for peer in [2, 3] {
            let stamps: Vec<u64> = sent.iter().filter(|(p, _)| *p == peer).map(|(_, s)| *s).collect();
            assert_eq!(stamps.len(), 200);
            assert!(stamps.windows(2).all(|w| w[0] < w[1]), "peer {peer} saw {stamps:?}");
        }
    }

    #[tokio::test]
    async fn writes_from_leaders_that_never_met_are_counted() {
        let (first, _, _) = manager(1, ReplicationMode::Synchronous, ConsistencyLevel::One, vec![]);
        let (second, _, _) = manager(3, ReplicationMode::Synchronous, ConsistencyLevel::One, vec![]);
        let (follower, _, store) = manager(2, ReplicationMode::Synchronous, ConsistencyLevel::One, vec![]);

        let (a, _) = first.apply_local(register("alice"));
        follower.replicate(&a);
        // a successor that saw alice is causally after her
        second.replicate(&a);
        let (b, _) = second.apply_local(register("bob"));
        follower.replicate(&b);
        assert_eq!(follower.stats().concurrent, 0);

        let (c, _) = first.apply_local(register("carol"));
        assert!(c.vector_stamp.concurrent_with(&b.vector_stamp));
        assert_eq!(follower.replicate(&c), Applied::Changed);
        assert_eq!(follower.stats().concurrent, 1);
        assert_eq!(store.stats().riders, 3);
    }
}
