//! Key negotiation between two overlay members.
//!
//! The wire exchange is: a protocol-version probe, the public keys in the
//! clear, one RSA-transported session-key offer per direction that wants
//! its own key, and an encrypted ack. An offer installs the offerer's
//! send-key on the receiving side as the receive-key; whichever direction
//! has no key yet mirrors the offered bytes, so a plain responder shares
//! one key both ways while simultaneous initiators end up with distinct
//! directional keys.

use std::time::SystemTime;

use base64::prelude::*;
use rand::{CryptoRng, Rng};

use sparkle_crypto::{OverlayMac, SessionKey, SESSION_KEY_LEN};
use sparkle_proto::{
    envelope::{MessageKind, PROTOCOL_VERSION},
    message::{self, VersionProbe, SESSION_ACK_BODY},
};
use sparkle_router::{NegotiationPhase, NodeRef};

use crate::{JoinError, LinkLayer, Notice, TimerAction};

impl<R: Rng + CryptoRng> LinkLayer<R> {
    /// Start negotiating with a peer: probe its protocol version and arm
    /// the retransmit and timeout timers.
    pub(crate) fn initiate_handshake(&mut self, now: SystemTime, node: &NodeRef) {
        {
            let mut borrowed = node.borrow_mut();
            if borrowed.phase() != NegotiationPhase::New {
                return;
            }
            borrowed.set_phase(NegotiationPhase::VersionSent);
        }

        let addr = node.borrow().addr();
        log::debug!("initiating key negotiation with {addr}");

        self.send_version_probe(addr, false);
        self.arm_negotiation_timers(now, node);
    }

    fn arm_negotiation_timers(&mut self, now: SystemTime, node: &NodeRef) {
        let (addr, epoch) = {
            let borrowed = node.borrow();
            (borrowed.addr(), borrowed.epoch())
        };

        for offset in self.config.retransmit_schedule {
            self.schedule(now + offset, TimerAction::Retransmit { addr, epoch });
        }
        self.schedule(
            now + self.config.negotiation_timeout,
            TimerAction::NegotiationTimeout { addr, epoch },
        );
    }

    fn send_version_probe(&mut self, addr: std::net::SocketAddr, reply: bool) {
        let body = message::encode_body(&VersionProbe {
            version: PROTOCOL_VERSION,
            reply,
        });
        self.push_plain(addr, MessageKind::ProtocolVersion, &body);
    }

    /// Resend whichever handshake message the negotiation is waiting on.
    pub(crate) fn retransmit(&mut self, node: &NodeRef) {
        let (addr, phase) = {
            let borrowed = node.borrow();
            (borrowed.addr(), borrowed.phase())
        };

        log::debug!("retransmitting handshake state {phase:?} to {addr}");
        match phase {
            NegotiationPhase::VersionSent => self.send_version_probe(addr, false),
            NegotiationPhase::KeySent => self.send_our_keys(node),
            NegotiationPhase::KeysExchanged => {
                self.push_encrypted(node, MessageKind::SessionKeyAck, &SESSION_ACK_BODY)
            }
            NegotiationPhase::New | NegotiationPhase::Established => {}
        }
    }

    pub(crate) fn handle_version_probe(
        &mut self,
        now: SystemTime,
        node: &NodeRef,
        payload: &[u8],
    ) {
        let probe: VersionProbe = match message::decode_body(payload) {
            Ok(probe) => probe,
            Err(error) => {
                log::debug!("dropping malformed version probe: {error}");
                return;
            }
        };

        let addr = node.borrow().addr();

        if !probe.reply {
            // Always answer with our version; the prober decides whether to
            // continue the dialogue.
            self.send_version_probe(addr, true);
            return;
        }

        if node.borrow().phase() != NegotiationPhase::VersionSent {
            return;
        }

        if probe.version != PROTOCOL_VERSION {
            log::warn!(
                "peer {addr} speaks protocol version {}, we speak {PROTOCOL_VERSION}; closing",
                probe.version
            );
            self.abort_negotiation(node);
            self.join_peer_failed(
                now,
                addr,
                JoinError::IncompatiblePeer {
                    addr,
                    version: probe.version,
                },
            );
            return;
        }

        {
            let mut borrowed = node.borrow_mut();
            borrowed.set_phase(NegotiationPhase::KeySent);
        }
        self.send_our_keys(node);
    }

    pub(crate) fn handle_public_key(&mut self, now: SystemTime, node: &NodeRef, payload: &[u8]) {
        let addr = node.borrow().addr();
        let mac = OverlayMac::derive(payload);

        // The address derived from the key must not already be bound to a
        // different endpoint.
        if let Some(existing) = self.router.find_by_mac(mac) {
            if !std::rc::Rc::ptr_eq(&existing, node) {
                log::warn!(
                    "rejecting peer {addr}: overlay address {mac} already bound to {}",
                    existing.borrow().addr()
                );
                self.reject_peer(node);
                return;
            }
        }

        if let Err(error) = node.borrow_mut().set_public_key(payload) {
            log::warn!("rejecting peer {addr}: {error}");
            self.reject_peer(node);
            return;
        }

        log::debug!(
            "peer {addr} identifies as {mac} (key {})",
            BASE64_STANDARD.encode(&payload[..payload.len().min(12)])
        );
        self.router.notify_updated(node);

        let phase = node.borrow().phase();
        match phase {
            NegotiationPhase::New | NegotiationPhase::VersionSent => {
                // Responder path (or simultaneous initiation): answer with
                // our own key material.
                if phase == NegotiationPhase::New {
                    self.arm_negotiation_timers(now, node);
                }
                node.borrow_mut().set_phase(NegotiationPhase::KeySent);
                self.send_our_keys(node);
            }
            NegotiationPhase::KeySent => {
                // We sent our key before theirs was known; the offer can go
                // out now.
                self.send_our_keys(node);
            }
            NegotiationPhase::KeysExchanged | NegotiationPhase::Established => {}
        }

        self.flush_pending_to_node(now, node);
        self.maybe_keys_exchanged(now, node);
    }

    /// Send our public key, and our session-key offer once the peer's key
    /// is known to encrypt it under.
    pub(crate) fn send_our_keys(&mut self, node: &NodeRef) {
        let addr = node.borrow().addr();

        let our_key = self.keypair.public_key_der().to_vec();
        self.push_plain(addr, MessageKind::PublicKeyExchange, &our_key);

        let offer = {
            let mut borrowed = node.borrow_mut();
            let Some(remote) = borrowed.public_key().cloned() else {
                return;
            };

            if borrowed.send_key().is_none() {
                let key = SessionKey::generate(&mut self.rng);
                if borrowed.recv_key().is_none() {
                    borrowed.set_recv_key(key.clone());
                }
                borrowed.set_send_key(key);
            }

            let bytes = borrowed
                .send_key()
                .expect("send key was just installed")
                .bytes()
                .to_vec();
            remote.encrypt(&mut self.rng, &bytes)
        };

        match offer {
            Ok(sealed) => self.push_plain(addr, MessageKind::SessionKeyOffer, &sealed),
            Err(error) => log::warn!("failed to seal session key for {addr}: {error}"),
        }
    }

    pub(crate) fn handle_key_offer(&mut self, now: SystemTime, node: &NodeRef, payload: &[u8]) {
        let addr = node.borrow().addr();

        let bytes = match self.keypair.decrypt(payload) {
            Ok(bytes) => bytes,
            Err(error) => {
                log::debug!("dropping session-key offer from {addr}: {error}");
                return;
            }
        };

        if bytes.len() != SESSION_KEY_LEN {
            log::debug!(
                "dropping session-key offer from {addr}: {} bytes of key material",
                bytes.len()
            );
            return;
        }
        let key = SessionKey::from_bytes(&bytes).expect("length was just checked");

        let was_established = node.borrow().negotiation_done();
        {
            let mut borrowed = node.borrow_mut();
            if borrowed.send_key().is_none() {
                borrowed.set_send_key(key.clone());
            }
            borrowed.set_recv_key(key);
        }

        if was_established {
            // Rekey: the replacement is atomic, and packets encrypted under
            // the old key that are still in flight will simply fail to
            // decrypt and be dropped.
            log::debug!("peer {addr} rekeyed its sending direction");
            return;
        }

        self.maybe_keys_exchanged(now, node);
    }

    /// Once both directional keys are installed and our key material is
    /// out, prove we could read the peer's offer by acking under the new
    /// session.
    fn maybe_keys_exchanged(&mut self, _now: SystemTime, node: &NodeRef) {
        {
            let borrowed = node.borrow();
            if borrowed.phase() != NegotiationPhase::KeySent
                || borrowed.send_key().is_none()
                || borrowed.recv_key().is_none()
                || borrowed.public_key().is_none()
            {
                return;
            }
        }

        node.borrow_mut().set_phase(NegotiationPhase::KeysExchanged);
        self.push_encrypted(node, MessageKind::SessionKeyAck, &SESSION_ACK_BODY);
    }

    pub(crate) fn handle_key_ack(&mut self, now: SystemTime, node: &NodeRef, plaintext: &[u8]) {
        let addr = node.borrow().addr();

        if plaintext != &SESSION_ACK_BODY[..] {
            log::debug!("session ack from {addr} did not verify");
            self.register_decrypt_failure(now, node);
            return;
        }

        match node.borrow().phase() {
            NegotiationPhase::KeysExchanged => self.establish(now, node),
            NegotiationPhase::Established => {}
            phase => log::debug!("ignoring session ack from {addr} in phase {phase:?}"),
        }
    }

    /// Terminal success: mark the negotiation complete, flush the hold
    /// queue FIFO through the encrypted path, and let the join flow and
    /// route resolution make progress.
    pub(crate) fn establish(&mut self, now: SystemTime, node: &NodeRef) {
        let (addr, mac) = {
            let mut borrowed = node.borrow_mut();
            borrowed.set_phase(NegotiationPhase::Established);
            (
                borrowed.addr(),
                borrowed.mac().expect("established peers have a key"),
            )
        };

        log::info!("session with {mac} at {addr} established");

        while let Some(packet) = {
            let mut borrowed = node.borrow_mut();
            borrowed.pop_queue()
        } {
            self.push_encrypted(node, MessageKind::DataPacket, &packet);
        }

        self.notices.push(Notice::SessionEstablished { addr, mac });
        self.router.notify_updated(node);

        if node.borrow().is_master() {
            self.flush_route_requests(now);
        }
        self.join_peer_established(now, node);
    }

    /// Drop a peer that failed key validation out of the router entirely.
    fn reject_peer(&mut self, node: &NodeRef) {
        self.abort_negotiation(node);
        self.router.remove(node);
    }
}
