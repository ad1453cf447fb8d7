//! Transport seam between paired devices.
//!
//! The transport client is constructed explicitly and injected into the
//! sync bridge; it must be `init`ialized before use and `shutdown` when the
//! owner is done. `MemoryNetwork` links in-process endpoints for the CLI and
//! tests and can make nodes unreachable or failing.

use crate::wire::WireFrame;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identity of a paired device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A frame received from another node
#[derive(Clone, Debug)]
pub struct InboundFrame {
    pub from: NodeId,
    pub frame: WireFrame,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn local_id(&self) -> NodeId;
    async fn init(&self) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
    /// Paired nodes that can currently be reached
    async fn reachable_nodes(&self) -> Result<Vec<NodeId>>;
    /// Single attempt, no acknowledgement
    async fn send(&self, node: &NodeId, frame: &WireFrame) -> Result<()>;
}

// ============================================================================
// In-memory network
// ============================================================================

struct NodeSlot {
    inbox: mpsc::UnboundedSender<InboundFrame>,
    reachable: bool,
    failing: bool,
}

#[derive(Default)]
pub struct MemoryNetwork {
    nodes: Mutex<HashMap<NodeId, NodeSlot>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, NodeSlot>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a node; returns its transport and the receiving end of its inbox
    pub fn join(self: &Arc<Self>) -> (MemoryTransport, mpsc::UnboundedReceiver<InboundFrame>) {
        let id = NodeId::random();
        let (inbox, rx) = mpsc::unbounded_channel();
        self.lock().insert(
            id,
            NodeSlot {
                inbox,
                reachable: true,
                failing: false,
            },
        );
        let transport = MemoryTransport {
            id,
            network: Arc::clone(self),
            initialized: AtomicBool::new(false),
        };
        (transport, rx)
    }

    /// Unreachable nodes are not listed and reject sends
    pub fn set_reachable(&self, node: &NodeId, reachable: bool) {
        if let Some(slot) = self.lock().get_mut(node) {
            slot.reachable = reachable;
        }
    }

    /// Remove a node; its inbox closes once queued frames are read
    pub fn leave(&self, node: &NodeId) {
        if self.lock().remove(node).is_some() {
            tracing::debug!("Node {} left the network", node);
        }
    }

    /// Failing nodes are listed but every send to them errors
    pub fn set_failing(&self, node: &NodeId, failing: bool) {
        if let Some(slot) = self.lock().get_mut(node) {
            slot.failing = failing;
        }
    }
}

pub struct MemoryTransport {
    id: NodeId,
    network: Arc<MemoryNetwork>,
    initialized: AtomicBool,
}

impl MemoryTransport {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Delivery("transport not initialized".into()))
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> NodeId {
        self.id
    }

    async fn init(&self) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        tracing::debug!("Transport {} initialized", self.id);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.initialized.store(false, Ordering::Release);
        tracing::debug!("Transport {} shut down", self.id);
        Ok(())
    }

    async fn reachable_nodes(&self) -> Result<Vec<NodeId>> {
        self.ensure_initialized()?;
        Ok(self
            .network
            .lock()
            .iter()
            .filter(|(id, slot)| **id != self.id && slot.reachable)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn send(&self, node: &NodeId, frame: &WireFrame) -> Result<()> {
        self.ensure_initialized()?;
        let nodes = self.network.lock();
        let slot = nodes
            .get(node)
            .ok_or_else(|| Error::Delivery(format!("unknown node {}", node)))?;
        if !slot.reachable {
            return Err(Error::Delivery(format!("node {} unreachable", node)));
        }
        if slot.failing {
            return Err(Error::Delivery(format!("node {} rejected '{}'", node, frame.path)));
        }
        slot.inbox
            .send(InboundFrame {
                from: self.id,
                frame: frame.clone(),
            })
            .map_err(|_| Error::Delivery(format!("node {} stopped listening", node)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> WireFrame {
        WireFrame {
            path: "session".into(),
            payload: br#"{"tag":"START"}"#.to_vec(),
            urgent: true,
        }
    }

    #[tokio::test]
    async fn test_send_requires_init() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.join();
        let (b, _b_rx) = network.join();

        assert!(a.reachable_nodes().await.is_err());
        assert!(a.send(&b.local_id(), &frame()).await.is_err());

        a.init().await.unwrap();
        assert_eq!(a.reachable_nodes().await.unwrap(), vec![b.local_id()]);

        a.shutdown().await.unwrap();
        assert!(a.send(&b.local_id(), &frame()).await.is_err());
    }

    #[tokio::test]
    async fn test_delivery_reaches_inbox() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.join();
        let (b, mut b_rx) = network.join();
        a.init().await.unwrap();

        a.send(&b.local_id(), &frame()).await.unwrap();
        let inbound = b_rx.recv().await.unwrap();
        assert_eq!(inbound.from, a.local_id());
        assert_eq!(inbound.frame, frame());
    }

    #[tokio::test]
    async fn test_unreachable_node_hidden() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.join();
        let (b, _b_rx) = network.join();
        a.init().await.unwrap();

        network.set_reachable(&b.local_id(), false);
        assert!(a.reachable_nodes().await.unwrap().is_empty());
        assert!(a.send(&b.local_id(), &frame()).await.is_err());
    }

    #[tokio::test]
    async fn test_leave_closes_inbox_after_backlog() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.join();
        let (b, mut b_rx) = network.join();
        a.init().await.unwrap();

        a.send(&b.local_id(), &frame()).await.unwrap();
        network.leave(&b.local_id());

        assert!(a.reachable_nodes().await.unwrap().is_empty());
        assert!(a.send(&b.local_id(), &frame()).await.is_err());
        assert_eq!(b_rx.recv().await.unwrap().frame, frame());
        assert!(b_rx.recv().await.is_none());
    }
}
