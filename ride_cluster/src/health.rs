//! Liveness probing shared by the balancer and the heartbeat monitor.

use crate::clock::LamportClock;
use crate::error::{Error, Result};
use crate::protocol::{PeerMessage, PeerReply};
use crate::transport::PeerTransport;
use crate::NodeId;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// A side-effect-free liveness call against one target.
#[async_trait]
pub trait Probe: Send + Sync {
    type Target: Send + Sync + std::fmt::Debug;

    async fn probe(&self, target: &Self::Target) -> Result<()>;
}

pub struct HealthChecker<P: Probe> {
    probe: P,
    retries: u32,
    backoff: Duration,
}

impl<P: Probe> HealthChecker<P> {
    pub fn new(probe: P, retries: u32, backoff: Duration) -> Self {
        Self {
            probe,
            retries: retries.max(1),
            backoff,
        }
    }

    pub fn probe_ref(&self) -> &P {
        &self.probe
    }

    /// Single attempt.
    pub async fn is_alive(&self, target: &P::Target) -> bool {
        self.probe.probe(target).await.is_ok()
    }

    /// Up to `retries` attempts with a fixed backoff in between.
    pub async fn is_alive_with_retry(&self, target: &P::Target) -> bool {
        for attempt in 1..=self.retries {
            match self.probe.probe(target).await {
                Ok(()) => return true,
                Err(e) => {
                    debug!("probe {:?} attempt {}/{} failed: {}", target, attempt, self.retries, e);
                    if attempt < self.retries {
                        sleep(self.backoff).await;
                    }
                }
            }
        }
        false
    }

    /// Probes every target concurrently, one attempt each, results in input order.
    pub async fn sweep<'a, I>(&self, targets: I) -> Vec<Result<()>>
    where
        I: IntoIterator<Item = &'a P::Target>,
        P::Target: 'a,
    {
        join_all(targets.into_iter().map(|t| self.probe.probe(t))).await
    }
}

/// What a peer reported in its last heartbeat acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerView {
    pub leader_id: NodeId,
    pub epoch: u64,
}

/// Heartbeat over the peer channel. Acks are folded into the local Lamport
/// clock and remembered per peer.
pub struct PeerProbe {
    from: NodeId,
    transport: Arc<dyn PeerTransport>,
    clock: Arc<LamportClock>,
    views: Mutex<HashMap<NodeId, PeerView>>,
}

impl PeerProbe {
    pub fn new(from: NodeId, transport: Arc<dyn PeerTransport>, clock: Arc<LamportClock>) -> Self {
        Self {
            from,
            transport,
            clock,
            views: Mutex::new(HashMap::new()),
        }
    }

    pub fn last_view(&self, peer: NodeId) -> Option<PeerView> {
        self.views.lock().get(&peer).copied()
    }

    pub async fn heartbeat(&self, peer: NodeId) -> Result<PeerView> {
        let msg = PeerMessage::Heartbeat {
            sender: self.from,
            clock: self.clock.time(),
        };
        match self.transport.send(peer, msg).await? {
            PeerReply::Ack {
                clock,
                leader_id,
                epoch,
                ..
            } => {
                self.clock.observe(Some(clock));
                let view = PeerView { leader_id, epoch };
                self.views.lock().insert(peer, view);
                Ok(view)
            }
            other => Err(Error::Protocol(format!("heartbeat to {peer} answered with {other:?}"))),
        }
    }
}

#[async_trait]
impl Probe for PeerProbe {
    type Target = NodeId;

    async fn probe(&self, target: &NodeId) -> Result<()> {
        self.heartbeat(*target).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fails each target a scripted number of times before succeeding.
    struct Flaky {
        failures_left: Mutex<HashMap<u32, u32>>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Probe for Flaky {
        type Target = u32;

        async fn probe(&self, target: &u32) -> Result<()> {
            *self.calls.lock() += 1;
            let mut left = self.failures_left.lock();
            match left.get_mut(target) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    Err(Error::transport(target, "refused"))
                }
                _ => Ok(()),
            }
        }
    }

    fn flaky(pairs: &[(u32, u32)]) -> Flaky {
        Flaky {
            failures_left: Mutex::new(pairs.iter().copied().collect()),
            calls: Mutex::new(0),
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let checker = HealthChecker::new(flaky(&[(1, 2)]), 3, Duration::from_millis(1));
        assert!(checker.is_alive_with_retry(&1).await);
        assert_eq!(*checker.probe_ref().calls.lock(), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_the_budget() {
        let checker = HealthChecker::new(flaky(&[(1, 5)]), 3, Duration::from_millis(1));
        assert!(!checker.is_alive_with_retry(&1).await);
        assert_eq!(*checker.probe_ref().calls.lock(), 3);
    }

    #[tokio::test]
    async fn sweep_keeps_input_order() {
        let checker = HealthChecker::new(flaky(&[(2, 1)]), 1, Duration::ZERO);
        let results = checker.sweep(&[1, 2, 3]).await;
        let up: Vec<bool> = results.iter().map(|r| r.is_ok()).collect();
        assert_eq!(up, vec![true, false, true]);
    }
}
