use std::{cell::RefCell, collections::VecDeque, fmt, net::SocketAddr, rc::Rc};

use sparkle_crypto::{OverlayMac, RemoteKey, SessionKey};
use thiserror::Error;

/// A shared handle to a router-owned peer record.
///
/// The router is the ownership root; holders must treat a handle as
/// invalidated once the router reports the node removed. All access happens
/// on the event-loop thread.
pub type NodeRef = Rc<RefCell<SparkleNode>>;

/// The local view of a peer's key-negotiation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// First contact; nothing sent or received yet.
    New,
    /// We probed the peer's protocol version and await the reply.
    VersionSent,
    /// We sent our public key (and our key offer, once the peer's key is
    /// known) and await the peer's key material.
    KeySent,
    /// Both directional keys are installed; our ack is out, theirs pending.
    KeysExchanged,
    /// Negotiation finished; traffic flows.
    Established,
}

/// One record per known remote peer (and one for the local node).
pub struct SparkleNode {
    addr: SocketAddr,
    public_key: Option<RemoteKey>,
    mac: Option<OverlayMac>,
    send_key: Option<SessionKey>,
    recv_key: Option<SessionKey>,
    queue: VecDeque<Vec<u8>>,
    phase: NegotiationPhase,
    epoch: u64,
    master: bool,
    white: bool,
}

impl SparkleNode {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            public_key: None,
            mac: None,
            send_key: None,
            recv_key: None,
            queue: VecDeque::new(),
            phase: NegotiationPhase::New,
            epoch: 0,
            master: false,
            white: false,
        }
    }

    /// Convenience constructor for a router-owned record.
    pub fn new_ref(addr: SocketAddr) -> NodeRef {
        Rc::new(RefCell::new(Self::new(addr)))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The overlay address; `None` until the public key is known or a
    /// routing announcement supplied a provisional binding.
    pub fn mac(&self) -> Option<OverlayMac> {
        self.mac
    }

    /// Provisionally bind an overlay address learned from a routing
    /// announcement. Ignored once the authentic key-derived address is
    /// known; the key exchange replaces the hint either way.
    pub fn set_mac_hint(&mut self, mac: OverlayMac) {
        if self.public_key.is_none() {
            self.mac = Some(mac);
        }
    }

    pub fn public_key(&self) -> Option<&RemoteKey> {
        self.public_key.as_ref()
    }

    /// Install the peer's public key and derive its overlay address.
    ///
    /// The key is immutable once set: setting the same bytes again is a
    /// no-op, different bytes are an error.
    pub fn set_public_key(&mut self, der: &[u8]) -> Result<(), NodeError> {
        if let Some(existing) = &self.public_key {
            if existing.as_der() == der {
                return Ok(());
            }
            return Err(NodeError::KeyChanged);
        }

        let key = RemoteKey::from_der(der).map_err(|_| NodeError::MalformedKey)?;
        self.mac = Some(key.overlay_mac());
        self.public_key = Some(key);
        Ok(())
    }

    pub fn send_key(&self) -> Option<&SessionKey> {
        self.send_key.as_ref()
    }

    pub fn recv_key(&self) -> Option<&SessionKey> {
        self.recv_key.as_ref()
    }

    pub fn set_send_key(&mut self, key: SessionKey) {
        self.send_key = Some(key);
    }

    pub fn set_recv_key(&mut self, key: SessionKey) {
        self.recv_key = Some(key);
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: NegotiationPhase) {
        self.phase = phase;
    }

    /// Whether the handshake has terminated successfully.
    pub fn negotiation_done(&self) -> bool {
        self.phase == NegotiationPhase::Established
    }

    /// Monotonic counter distinguishing negotiation attempts, so stale
    /// timers for an abandoned attempt can be recognized and dropped.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Abandon the current negotiation: back to `New`, keys discarded
    /// (zeroized on drop), hold queue preserved.
    pub fn reset_negotiation(&mut self) {
        self.phase = NegotiationPhase::New;
        self.epoch += 1;
        self.send_key = None;
        self.recv_key = None;
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn set_master(&mut self, master: bool) {
        self.master = master;
    }

    /// Whether this node's endpoint is publicly reachable.
    pub fn is_white(&self) -> bool {
        self.white
    }

    pub fn set_white(&mut self, white: bool) {
        self.white = white;
    }

    pub fn append_queue(&mut self, packet: Vec<u8>) {
        self.queue.push_back(packet);
    }

    pub fn pop_queue(&mut self) -> Option<Vec<u8>> {
        self.queue.pop_front()
    }

    pub fn queue_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Discard the hold queue, returning its contents for failure
    /// reporting.
    pub fn drop_queue(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }
}

impl fmt::Debug for SparkleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparkleNode")
            .field("addr", &self.addr)
            .field("mac", &self.mac)
            .field("phase", &self.phase)
            .field("master", &self.master)
            .field("white", &self.white)
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("malformed public key")]
    MalformedKey,

    #[error("public key differs from the one already bound to this peer")]
    KeyChanged,
}
