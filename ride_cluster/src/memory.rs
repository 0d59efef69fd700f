//! In-process peer network.
//!
//! Stands in for the TCP peer channel so whole clusters can run inside one
//! process: the simulation binary and the integration tests use it. Messages
//! are pushed through JSON on the way so they exercise the real wire shape.
//! Nodes can be taken down and brought back.

use crate::error::{Error, Result};
use crate::protocol::{PeerMessage, PeerReply};
use crate::transport::{PeerHandler, PeerTransport};
use crate::NodeId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

#[derive(Default)]
pub struct MemoryNetwork {
    handlers: RwLock<HashMap<NodeId, Weak<dyn PeerHandler>>>,
    down: RwLock<HashSet<NodeId>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport used by `node` to reach everyone else.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<dyn PeerTransport> {
        Arc::new(MemoryTransport {
            from: node,
            network: self.clone(),
        })
    }

    pub fn register(&self, node: NodeId, handler: Arc<dyn PeerHandler>) {
        self.handlers.write().insert(node, Arc::downgrade(&handler));
    }

    /// A down node neither receives nor sends.
    pub fn kill(&self, node: NodeId) {
        self.down.write().insert(node);
    }

    pub fn revive(&self, node: NodeId) {
        self.down.write().remove(&node);
    }

    pub fn is_down(&self, node: NodeId) -> bool {
        self.down.read().contains(&node)
    }

    async fn deliver(&self, from: NodeId, target: NodeId, message: PeerMessage) -> Result<PeerReply> {
        if self.is_down(from) {
            return Err(Error::transport(format!("node {target}"), format!("sender {from} is down")));
        }
        if self.is_down(target) {
            return Err(Error::transport(format!("node {target}"), "connection refused"));
        }
        let handler = self
            .handlers
            .read()
            .get(&target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::transport(format!("node {target}"), "no such node"))?;

        let wire = serde_json::to_vec(&message)?;
        let message: PeerMessage = serde_json::from_slice(&wire)
            .map_err(|e| Error::Protocol(format!("undecodable frame: {e}")))?;
        Ok(handler.handle_peer(message).await)
    }
}

struct MemoryTransport {
    from: NodeId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn send(&self, target: NodeId, message: PeerMessage) -> Result<PeerReply> {
        self.network.deliver(self.from, target, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(NodeId);

    #[async_trait]
    impl PeerHandler for Echo {
        async fn handle_peer(&self, _message: PeerMessage) -> PeerReply {
            PeerReply::Ack {
                from: self.0,
                clock: 0,
                leader_id: self.0,
                epoch: 0,
            }
        }
    }

    #[tokio::test]
    async fn killed_nodes_refuse_and_cannot_send() {
        let net = MemoryNetwork::new();
        let a: Arc<dyn PeerHandler> = Arc::new(Echo(1));
        let b: Arc<dyn PeerHandler> = Arc::new(Echo(2));
        net.register(1, a.clone());
        net.register(2, b.clone());
        let hb = PeerMessage::Heartbeat { sender: 1, clock: 1 };

        let t1 = net.transport(1);
        assert!(t1.send(2, hb.clone()).await.is_ok());

        net.kill(2);
        assert!(t1.send(2, hb.clone()).await.is_err());
        net.revive(2);
        assert!(t1.send(2, hb.clone()).await.is_ok());

        net.kill(1);
        assert!(t1.send(2, hb.clone()).await.is_err());
        assert!(t1.send(9, hb).await.is_err());
    }
}
