//! The in-memory directory of known overlay peers.
//!
//! The router owns every peer record; other components hold [`NodeRef`]
//! handles whose validity coincides with the record's presence here. All
//! mutation happens synchronously on the event-loop thread and emits a
//! [`RouterEvent`] that the link layer drains and acts on.

mod node;

use std::{collections::VecDeque, net::SocketAddr, rc::Rc};

use rand::{seq::SliceRandom, CryptoRng, Rng};
use sparkle_crypto::OverlayMac;

pub use node::{NegotiationPhase, NodeError, NodeRef, SparkleNode};

/// A change notification, in emission order.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    NodeAdded(NodeRef),
    NodeUpdated(NodeRef),
    NodeRemoved(NodeRef),
}

#[derive(Default)]
pub struct Router {
    self_node: Option<NodeRef>,
    nodes: Vec<NodeRef>,
    events: VecDeque<RouterEvent>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Designate the local node. Must be called exactly once, before any
    /// other operation.
    pub fn set_self(&mut self, node: NodeRef) {
        assert!(
            self.self_node.is_none(),
            "set_self must be called exactly once"
        );

        self.nodes.push(Rc::clone(&node));
        self.self_node = Some(node);
    }

    /// The local node.
    pub fn self_node(&self) -> NodeRef {
        Rc::clone(
            self.self_node
                .as_ref()
                .expect("set_self must be called at startup"),
        )
    }

    fn is_self(&self, node: &NodeRef) -> bool {
        self.self_node
            .as_ref()
            .is_some_and(|own| Rc::ptr_eq(own, node))
    }

    /// Insert a node, or report an update of an already-known one.
    pub fn update(&mut self, node: NodeRef) {
        let known = self.nodes.iter().any(|n| Rc::ptr_eq(n, &node));

        if known {
            self.events.push_back(RouterEvent::NodeUpdated(node));
        } else {
            log::debug!("router: new node {:?}", node.borrow());
            self.nodes.push(Rc::clone(&node));
            self.events.push_back(RouterEvent::NodeAdded(node));
        }
    }

    /// Report an in-place mutation of a known node.
    pub fn notify_updated(&mut self, node: &NodeRef) {
        if self.nodes.iter().any(|n| Rc::ptr_eq(n, node)) {
            self.events
                .push_back(RouterEvent::NodeUpdated(Rc::clone(node)));
        }
    }

    /// Remove a node. Idempotent; the self node is never removed.
    pub fn remove(&mut self, node: &NodeRef) {
        if self.is_self(node) {
            return;
        }

        let before = self.nodes.len();
        self.nodes.retain(|n| !Rc::ptr_eq(n, node));

        if self.nodes.len() != before {
            log::debug!("router: removed node {:?}", node.borrow());
            self.events
                .push_back(RouterEvent::NodeRemoved(Rc::clone(node)));
        }
    }

    /// Remove all non-self nodes.
    pub fn clear(&mut self) {
        let own = self.self_node.clone();
        let mut removed = Vec::new();

        self.nodes.retain(|n| {
            if own.as_ref().is_some_and(|o| Rc::ptr_eq(o, n)) {
                true
            } else {
                removed.push(Rc::clone(n));
                false
            }
        });

        for node in removed {
            self.events.push_back(RouterEvent::NodeRemoved(node));
        }
    }

    pub fn find_by_endpoint(&self, addr: SocketAddr) -> Option<NodeRef> {
        self.nodes
            .iter()
            .find(|n| n.borrow().addr() == addr)
            .cloned()
    }

    pub fn find_by_mac(&self, mac: OverlayMac) -> Option<NodeRef> {
        self.nodes
            .iter()
            .find(|n| n.borrow().mac() == Some(mac))
            .cloned()
    }

    /// All known nodes, including self.
    pub fn nodes(&self) -> Vec<NodeRef> {
        self.nodes.clone()
    }

    /// All known nodes except self.
    pub fn other_nodes(&self) -> Vec<NodeRef> {
        self.nodes
            .iter()
            .filter(|n| !self.is_self(n))
            .cloned()
            .collect()
    }

    /// All masters, including self when self is a master.
    pub fn masters(&self) -> Vec<NodeRef> {
        self.nodes
            .iter()
            .filter(|n| n.borrow().is_master())
            .cloned()
            .collect()
    }

    /// All masters except self.
    pub fn other_masters(&self) -> Vec<NodeRef> {
        self.nodes
            .iter()
            .filter(|n| n.borrow().is_master() && !self.is_self(n))
            .cloned()
            .collect()
    }

    /// Pick a master uniformly at random.
    ///
    /// The draw must come from a cryptographic RNG so master choice cannot
    /// be predictably biased by an observer.
    pub fn select_master<R: Rng + CryptoRng>(&self, rng: &mut R) -> Option<NodeRef> {
        self.masters().choose(rng).cloned()
    }

    /// Pick a publicly reachable slave uniformly at random.
    pub fn select_white_slave<R: Rng + CryptoRng>(&self, rng: &mut R) -> Option<NodeRef> {
        let slaves: Vec<NodeRef> = self
            .nodes
            .iter()
            .filter(|n| {
                let node = n.borrow();
                !node.is_master() && node.is_white()
            })
            .cloned()
            .collect();

        slaves.choose(rng).cloned()
    }

    /// Drain the next change notification, if any.
    pub fn poll_event(&mut self) -> Option<RouterEvent> {
        self.events.pop_front()
    }
}
