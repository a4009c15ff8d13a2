//! The Sparkle link layer, implemented as a pure state machine.
//!
//! Performs no I/O and never reads the wall clock: every input is a method
//! call stamped with `now`, and every output (datagrams to the transport,
//! frames to the upper layer, notifications) is drained with
//! [`LinkLayer::poll`]. The surrounding event loop owns the UDP socket and
//! the TAP device and is responsible for calling [`LinkLayer::next_timer`]
//! to learn when to wake up.

mod handshake;
mod join;
mod route;

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    net::SocketAddr,
    rc::Rc,
    time::{Duration, SystemTime},
};

use rand::{CryptoRng, Rng};
use thiserror::Error;

use sparkle_crypto::{OverlayMac, RsaKeyPair};
use sparkle_proto::{
    data::DataPacket,
    envelope::{self, MessageKind},
};
use sparkle_router::{NodeRef, Router, RouterEvent, SparkleNode};

pub use join::Role;

/// Tunables of the link layer. The defaults match the protocol's
/// documented behavior.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How long a key negotiation may take before the peer is returned to
    /// `New` and its hold queue dropped.
    pub negotiation_timeout: Duration,

    /// Offsets (from the start of a negotiation) at which the current
    /// handshake message is retransmitted, in case the datagram was lost.
    pub retransmit_schedule: [Duration; 2],

    /// How many decrypt failures within `decrypt_failure_window` tear an
    /// established session down.
    pub decrypt_failure_threshold: usize,
    pub decrypt_failure_window: Duration,

    /// Target ratio of nodes per master; a registrar promotes joiners while
    /// `masters < ceil(nodes / master_ratio)`.
    pub master_ratio: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(10),
            retransmit_schedule: [Duration::from_secs(2), Duration::from_secs(4)],
            decrypt_failure_threshold: 3,
            decrypt_failure_window: Duration::from_secs(10),
            master_ratio: 10,
        }
    }
}

/// A datagram to hand to the transport.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub to: SocketAddr,
    pub bytes: Vec<u8>,
}

/// A decrypted overlay frame for the upper layer, tagged with the overlay
/// address of the peer it arrived from.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub source: OverlayMac,
    pub frame: Vec<u8>,
}

/// An asynchronous notification to the upper layers.
#[derive(Debug)]
pub enum Notice {
    /// The join flow started by `join_network` finished.
    JoinFinished(Result<Role, JoinError>),

    /// A key negotiation reached `Established`.
    SessionEstablished { addr: SocketAddr, mac: OverlayMac },

    /// An established session was torn down (repeated decrypt failures or
    /// an explicit cancel).
    SessionLost { addr: SocketAddr },

    /// A frame accepted by `send_frame` was dropped before delivery to the
    /// transport.
    SendFailed { dest: OverlayMac, frame: Vec<u8> },

    NodeAdded { addr: SocketAddr },
    NodeUpdated { addr: SocketAddr },
    NodeRemoved { addr: SocketAddr },
}

/// Why a join attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("handshake with {addr} timed out")]
    HandshakeTimeout { addr: SocketAddr },

    #[error("peer {addr} speaks incompatible protocol version {version}")]
    IncompatiblePeer { addr: SocketAddr, version: u16 },

    #[error("no master-list reply from the bootstrap node")]
    MasterReplyTimeout,

    #[error("no registration reply from the assigned master")]
    RegisterTimeout,

    #[error("malformed reply during join")]
    MalformedReply,
}

/// The outputs accumulated since the last poll.
#[derive(Debug, Default)]
pub struct Events {
    pub datagrams: Vec<Datagram>,
    pub frames: Vec<InboundFrame>,
    pub notices: Vec<Notice>,
}

/// An action to be taken when a timer expires.
///
/// Timers are never cancelled eagerly; each action re-checks the state it
/// was scheduled against (the negotiation epoch, the join stage sequence)
/// and does nothing when stale.
#[derive(Debug, Clone)]
enum TimerAction {
    Retransmit { addr: SocketAddr, epoch: u64 },
    NegotiationTimeout { addr: SocketAddr, epoch: u64 },
    JoinStageTimeout { seq: u64 },
    RouteResolveTimeout { mac: OverlayMac },
}

pub struct LinkLayer<R: Rng + CryptoRng> {
    keypair: RsaKeyPair,
    router: Router,
    rng: R,
    config: LinkConfig,

    join: Option<join::JoinFlow>,

    /// Frames waiting for an overlay address to be resolved via a master.
    pending_routes: HashMap<OverlayMac, route::PendingRoute>,

    /// Recent decrypt failures per endpoint, pruned to the config window.
    decrypt_failures: HashMap<SocketAddr, VecDeque<SystemTime>>,

    /// Endpoints whose next router event originates from a received
    /// `RouteUpdate` and must not be broadcast back to the master set.
    skip_broadcast: VecDeque<SocketAddr>,

    timers: BTreeMap<SystemTime, Vec<TimerAction>>,

    datagrams: Vec<Datagram>,
    frames: Vec<InboundFrame>,
    notices: Vec<Notice>,
}

impl<R: Rng + CryptoRng> LinkLayer<R> {
    /// Create a link layer for a node reachable at `local_endpoint`.
    ///
    /// Installs the self record in the router; the node is neither master
    /// nor joined until `create_network` or `join_network` is called.
    pub fn new(keypair: RsaKeyPair, local_endpoint: SocketAddr, rng: R) -> Self {
        Self::with_config(keypair, local_endpoint, rng, LinkConfig::default())
    }

    pub fn with_config(
        keypair: RsaKeyPair,
        local_endpoint: SocketAddr,
        rng: R,
        config: LinkConfig,
    ) -> Self {
        let mut router = Router::new();

        let self_node = SparkleNode::new_ref(local_endpoint);
        self_node
            .borrow_mut()
            .set_public_key(keypair.public_key_der())
            .expect("our own public key round-trips through DER");
        router.set_self(self_node);

        Self {
            keypair,
            router,
            rng,
            config,
            join: None,
            pending_routes: HashMap::new(),
            decrypt_failures: HashMap::new(),
            skip_broadcast: VecDeque::new(),
            timers: BTreeMap::new(),
            datagrams: Vec::new(),
            frames: Vec::new(),
            notices: Vec::new(),
        }
    }

    /// Read-only view of the peer directory.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The local overlay address.
    pub fn overlay_mac(&self) -> OverlayMac {
        self.router
            .self_node()
            .borrow()
            .mac()
            .expect("the self record always has a key")
    }

    /// Whether the local node is currently a master.
    pub fn is_master(&self) -> bool {
        self.router.self_node().borrow().is_master()
    }

    /// Found a new network: become its first master. The node is
    /// immediately operational and can bootstrap further members.
    pub fn create_network(&mut self, _now: SystemTime) {
        let self_node = self.router.self_node();
        self_node.borrow_mut().set_master(true);
        self.router.notify_updated(&self_node);

        log::info!(
            "created network as master {} at {}",
            self.overlay_mac(),
            self_node.borrow().addr()
        );
    }

    /// Begin joining the network through a bootstrap peer. The flow
    /// completes (or fails) asynchronously with a
    /// [`Notice::JoinFinished`].
    pub fn join_network(&mut self, now: SystemTime, bootstrap: SocketAddr) {
        if self.join.is_some() {
            log::warn!("join already in flight; restarting against {bootstrap}");
        }

        log::info!("joining network via {bootstrap}");

        let node = self.node_for_endpoint(bootstrap);
        self.join = Some(join::JoinFlow::new(bootstrap));
        self.schedule_join_timeout(now, 0);

        if !node.borrow().negotiation_done() {
            self.initiate_handshake(now, &node);
        } else {
            self.join_peer_established(now, &node);
        }
    }

    /// Abort any negotiation with `addr`, returning the peer to `New` and
    /// reporting its held frames as failed.
    pub fn cancel(&mut self, _now: SystemTime, addr: SocketAddr) {
        let Some(node) = self.router.find_by_endpoint(addr) else {
            return;
        };

        log::debug!("cancelling negotiation with {addr}");
        let was_established = node.borrow().negotiation_done();
        self.abort_negotiation(&node);

        if was_established {
            self.notices.push(Notice::SessionLost { addr });
        }
    }

    /// Feed a received datagram into the state machine.
    pub fn handle_datagram(&mut self, now: SystemTime, from: SocketAddr, bytes: &[u8]) {
        let envelope = match envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                log::debug!("dropping malformed datagram from {from}: {error}");
                return;
            }
        };

        if envelope.kind.requires_session() {
            let Some(node) = self.router.find_by_endpoint(from) else {
                log::debug!(
                    "dropping encrypted {:?} from unknown peer {from}",
                    envelope.kind
                );
                return;
            };

            let plaintext = {
                let borrowed = node.borrow();
                let Some(key) = borrowed.recv_key() else {
                    log::debug!(
                        "dropping {:?} from {from}: no session key installed",
                        envelope.kind
                    );
                    return;
                };

                key.decrypt(envelope.payload, envelope.plaintext_len)
            };

            match plaintext {
                Some(plaintext) => {
                    self.dispatch_encrypted(now, &node, envelope.kind, plaintext)
                }
                None => {
                    log::debug!("failed to decrypt {:?} from {from}", envelope.kind);
                    self.register_decrypt_failure(now, &node);
                }
            }
        } else {
            let node = self.node_for_endpoint(from);
            self.dispatch_plain(now, &node, envelope.kind, envelope.payload);
        }
    }

    /// Process due timers and drain accumulated outputs.
    #[must_use]
    pub fn poll(&mut self, now: SystemTime) -> Events {
        self.run_timers(now);
        self.drain_router_events(now);

        Events {
            datagrams: std::mem::take(&mut self.datagrams),
            frames: std::mem::take(&mut self.frames),
            notices: std::mem::take(&mut self.notices),
        }
    }

    /// How long the event loop may sleep before the next timer is due.
    pub fn next_timer(&self, now: SystemTime) -> Option<Duration> {
        let (&at, _) = self.timers.first_key_value()?;
        Some(at.duration_since(now).unwrap_or(Duration::ZERO))
    }

    // -- internals shared by the protocol modules --

    fn node_for_endpoint(&mut self, addr: SocketAddr) -> NodeRef {
        if let Some(node) = self.router.find_by_endpoint(addr) {
            return node;
        }

        let node = SparkleNode::new_ref(addr);
        self.router.update(Rc::clone(&node));
        node
    }

    fn push_plain(&mut self, to: SocketAddr, kind: MessageKind, payload: &[u8]) {
        self.datagrams.push(Datagram {
            to,
            bytes: envelope::encode(kind, payload),
        });
    }

    fn push_encrypted(&mut self, node: &NodeRef, kind: MessageKind, plaintext: &[u8]) {
        let (to, ciphertext) = {
            let borrowed = node.borrow();
            let Some(key) = borrowed.send_key() else {
                log::debug!(
                    "not sending {kind:?} to {}: no send key installed",
                    borrowed.addr()
                );
                return;
            };

            (borrowed.addr(), key.encrypt(plaintext))
        };

        self.datagrams.push(Datagram {
            to,
            bytes: envelope::encode_padded(kind, plaintext.len(), &ciphertext),
        });
    }

    fn schedule(&mut self, at: SystemTime, action: TimerAction) {
        self.timers.entry(at).or_default().push(action);
    }

    fn schedule_join_timeout(&mut self, now: SystemTime, seq: u64) {
        self.schedule(
            now + self.config.negotiation_timeout,
            TimerAction::JoinStageTimeout { seq },
        );
    }

    fn run_timers(&mut self, now: SystemTime) {
        while let Some((&at, _)) = self.timers.first_key_value() {
            if at > now {
                break;
            }

            let (_, actions) = self
                .timers
                .pop_first()
                .expect("a first key was just observed");
            for action in actions {
                self.handle_timer(now, action);
            }
        }
    }

    fn handle_timer(&mut self, now: SystemTime, action: TimerAction) {
        match action {
            TimerAction::Retransmit { addr, epoch } => {
                let Some(node) = self.router.find_by_endpoint(addr) else {
                    return;
                };
                if node.borrow().epoch() != epoch || node.borrow().negotiation_done() {
                    return;
                }

                self.retransmit(&node);
            }
            TimerAction::NegotiationTimeout { addr, epoch } => {
                let Some(node) = self.router.find_by_endpoint(addr) else {
                    return;
                };
                if node.borrow().epoch() != epoch || node.borrow().negotiation_done() {
                    return;
                }

                log::warn!("key negotiation with {addr} timed out");
                self.abort_negotiation(&node);
                self.join_peer_failed(now, addr, JoinError::HandshakeTimeout { addr });
            }
            TimerAction::JoinStageTimeout { seq } => self.join_stage_timed_out(now, seq),
            TimerAction::RouteResolveTimeout { mac } => self.route_resolve_timed_out(mac),
        }
    }

    /// Return a peer to `New`, discarding keys and reporting every held
    /// frame as failed.
    fn abort_negotiation(&mut self, node: &NodeRef) {
        let dropped = {
            let mut borrowed = node.borrow_mut();
            let dropped = borrowed.drop_queue();
            borrowed.reset_negotiation();
            dropped
        };

        for packet in dropped {
            self.report_packet_failed(packet);
        }
    }

    /// Report a queued data-packet body (destination prefix + frame) as
    /// undeliverable.
    fn report_packet_failed(&mut self, packet: Vec<u8>) {
        match DataPacket::from_buffer(packet.as_slice()) {
            Ok(parsed) => {
                let dest = parsed.dest();
                let frame = parsed.frame().to_vec();
                self.notices.push(Notice::SendFailed { dest, frame });
            }
            Err(_) => log::debug!("dropping unparseable held packet"),
        }
    }

    fn register_decrypt_failure(&mut self, now: SystemTime, node: &NodeRef) {
        let addr = node.borrow().addr();
        let window = self.config.decrypt_failure_window;

        let failures = self.decrypt_failures.entry(addr).or_default();
        failures.push_back(now);
        while failures
            .front()
            .is_some_and(|&first| first + window < now)
        {
            failures.pop_front();
        }

        if failures.len() >= self.config.decrypt_failure_threshold {
            log::warn!(
                "{} decrypt failures from {addr} within {window:?}; resetting session",
                failures.len()
            );
            self.decrypt_failures.remove(&addr);

            let was_established = node.borrow().negotiation_done();
            node.borrow_mut().reset_negotiation();
            if was_established {
                self.notices.push(Notice::SessionLost { addr });
            }
        }
    }

    fn dispatch_plain(
        &mut self,
        now: SystemTime,
        node: &NodeRef,
        kind: MessageKind,
        payload: &[u8],
    ) {
        match kind {
            MessageKind::ProtocolVersion => self.handle_version_probe(now, node, payload),
            MessageKind::PublicKeyExchange => self.handle_public_key(now, node, payload),
            MessageKind::SessionKeyOffer => self.handle_key_offer(now, node, payload),
            _ => unreachable!("kind {kind:?} requires a session"),
        }
    }

    fn dispatch_encrypted(
        &mut self,
        now: SystemTime,
        node: &NodeRef,
        kind: MessageKind,
        plaintext: Vec<u8>,
    ) {
        match kind {
            MessageKind::SessionKeyAck => self.handle_key_ack(now, node, &plaintext),
            MessageKind::MasterNodeRequest => self.handle_master_node_request(node),
            MessageKind::MasterNodeReply => self.handle_master_node_reply(now, node, &plaintext),
            MessageKind::RegisterRequest => self.handle_register_request(node),
            MessageKind::RegisterReply => self.handle_register_reply(now, node, &plaintext),
            MessageKind::RouteRequest => self.handle_route_request(now, node, &plaintext),
            MessageKind::RouteUpdate => self.handle_route_update(now, node, &plaintext),
            MessageKind::RouteMissing => self.handle_route_missing(now, node, &plaintext),
            MessageKind::DataPacket => self.handle_data_packet(now, node, plaintext),
            _ => unreachable!("kind {kind:?} never travels encrypted"),
        }
    }

    /// Drain router change notifications: surface them to upper layers and,
    /// when self is a master, broadcast route updates to the other masters.
    fn drain_router_events(&mut self, _now: SystemTime) {
        while let Some(event) = self.router.poll_event() {
            match event {
                RouterEvent::NodeAdded(node) => {
                    let addr = node.borrow().addr();
                    self.notices.push(Notice::NodeAdded { addr });
                    self.maybe_broadcast(addr, &node);
                }
                RouterEvent::NodeUpdated(node) => {
                    let addr = node.borrow().addr();
                    self.notices.push(Notice::NodeUpdated { addr });
                    self.maybe_broadcast(addr, &node);
                }
                RouterEvent::NodeRemoved(node) => {
                    let addr = node.borrow().addr();
                    self.notices.push(Notice::NodeRemoved { addr });
                }
            }
        }
    }

    /// Broadcast a route update for `node` unless the change itself came
    /// from a received `RouteUpdate` (which would bounce between masters
    /// forever).
    fn maybe_broadcast(&mut self, addr: SocketAddr, node: &NodeRef) {
        let suppressed = match self.skip_broadcast.iter().position(|&a| a == addr) {
            Some(idx) => {
                self.skip_broadcast.remove(idx);
                true
            }
            None => false,
        };

        if !suppressed {
            self.broadcast_route_update(node);
        }
    }
}
