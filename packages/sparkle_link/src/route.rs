//! Overlay forwarding: the data path, resolution of unknown overlay
//! addresses through a master, and route-update propagation across the
//! master backbone.

use std::{rc::Rc, time::SystemTime};

use rand::{seq::SliceRandom, CryptoRng, Rng};

use sparkle_crypto::OverlayMac;
use sparkle_proto::{
    data::{self, DataPacket},
    envelope::MessageKind,
    message::{self, RouteMissing, RouteRequest, RouteUpdate},
};
use sparkle_router::{NegotiationPhase, NodeRef, SparkleNode};

use crate::{InboundFrame, LinkLayer, Notice, TimerAction};

/// Frames held while an overlay address is being resolved via a master.
#[derive(Debug, Default)]
pub(crate) struct PendingRoute {
    pub packets: Vec<Vec<u8>>,
    /// Whether a `RouteRequest` has actually been sent for this address
    /// (it may still be waiting for a master session to come up).
    pub requested: bool,
}

impl<R: Rng + CryptoRng> LinkLayer<R> {
    /// Accept a frame from the upper layer for the given overlay
    /// destination.
    pub fn send_frame(&mut self, now: SystemTime, dest: OverlayMac, frame: &[u8]) {
        if dest == self.overlay_mac() {
            log::trace!("dropping frame addressed to ourselves");
            return;
        }

        let packet = data::assemble(dest, frame);

        if let Some(node) = self.router.find_by_mac(dest) {
            if node.borrow().negotiation_done() {
                self.push_encrypted(&node, MessageKind::DataPacket, &packet);
            } else {
                node.borrow_mut().append_queue(packet);
                if node.borrow().phase() == NegotiationPhase::New {
                    self.initiate_handshake(now, &node);
                }
            }
            return;
        }

        // Unknown destination: a master resolves from its own directory
        // (which just failed), anyone else asks a master.
        if self.is_master() {
            log::debug!("no route to {dest}");
            self.notices.push(Notice::SendFailed {
                dest,
                frame: frame.to_vec(),
            });
            return;
        }

        let joining = self.join.is_some();
        if !self.pending_routes.contains_key(&dest) {
            let master = self.router.select_master(&mut self.rng);
            if master.is_none() && !joining {
                log::debug!("no master available to resolve {dest}");
                self.notices.push(Notice::SendFailed {
                    dest,
                    frame: frame.to_vec(),
                });
                return;
            }

            self.pending_routes.insert(dest, PendingRoute::default());
            self.schedule(
                now + self.config.negotiation_timeout,
                TimerAction::RouteResolveTimeout { mac: dest },
            );

            if let Some(master) = master {
                if master.borrow().negotiation_done() {
                    self.push_encrypted(
                        &master,
                        MessageKind::RouteRequest,
                        &message::encode_body(&RouteRequest { mac: dest }),
                    );
                    self.pending_routes
                        .get_mut(&dest)
                        .expect("entry was just inserted")
                        .requested = true;
                } else if master.borrow().phase() == NegotiationPhase::New {
                    self.initiate_handshake(now, &master);
                }
            }
        }

        self.pending_routes
            .get_mut(&dest)
            .expect("entry exists by now")
            .packets
            .push(packet);
    }

    /// Send the `RouteRequest`s that were waiting for an established
    /// master session.
    pub(crate) fn flush_route_requests(&mut self, _now: SystemTime) {
        let waiting: Vec<OverlayMac> = self
            .pending_routes
            .iter()
            .filter(|(_, pending)| !pending.requested)
            .map(|(&mac, _)| mac)
            .collect();
        if waiting.is_empty() {
            return;
        }

        let Some(master) = self.established_master() else {
            return;
        };

        for mac in waiting {
            self.push_encrypted(
                &master,
                MessageKind::RouteRequest,
                &message::encode_body(&RouteRequest { mac }),
            );
            self.pending_routes
                .get_mut(&mac)
                .expect("key taken from the map")
                .requested = true;
        }
    }

    fn established_master(&mut self) -> Option<NodeRef> {
        let established: Vec<NodeRef> = self
            .router
            .other_masters()
            .into_iter()
            .filter(|m| m.borrow().negotiation_done())
            .collect();

        established.choose(&mut self.rng).cloned()
    }

    /// A peer's overlay address just became known (or its session came
    /// up): move any frames parked for that address onto the peer itself.
    pub(crate) fn flush_pending_to_node(&mut self, _now: SystemTime, node: &NodeRef) {
        let Some(mac) = node.borrow().mac() else {
            return;
        };
        let Some(pending) = self.pending_routes.remove(&mac) else {
            return;
        };

        log::debug!(
            "{} held frame(s) for {mac} attached to peer {}",
            pending.packets.len(),
            node.borrow().addr()
        );

        let established = node.borrow().negotiation_done();
        for packet in pending.packets {
            if established {
                self.push_encrypted(node, MessageKind::DataPacket, &packet);
            } else {
                node.borrow_mut().append_queue(packet);
            }
        }

        if !established && node.borrow().phase() == NegotiationPhase::New {
            self.initiate_handshake(_now, node);
        }
    }

    pub(crate) fn route_resolve_timed_out(&mut self, mac: OverlayMac) {
        let Some(pending) = self.pending_routes.remove(&mac) else {
            return;
        };

        log::debug!("resolution of {mac} timed out");
        for packet in pending.packets {
            self.report_packet_failed(packet);
        }
    }

    /// Serve a slave's resolution request from our directory (master
    /// only).
    pub(crate) fn handle_route_request(
        &mut self,
        _now: SystemTime,
        node: &NodeRef,
        plaintext: &[u8],
    ) {
        let addr = node.borrow().addr();

        if !self.is_master() {
            log::warn!("ignoring route request from {addr}: we are not a master");
            return;
        }

        let request: RouteRequest = match message::decode_body(plaintext) {
            Ok(request) => request,
            Err(error) => {
                log::debug!("malformed route request from {addr}: {error}");
                return;
            }
        };

        match self.router.find_by_mac(request.mac) {
            Some(target) => {
                let update = {
                    let borrowed = target.borrow();
                    RouteUpdate {
                        addr: borrowed.addr(),
                        mac: request.mac,
                        master: borrowed.is_master(),
                    }
                };
                log::debug!("resolving {} to {} for {addr}", request.mac, update.addr);
                self.push_encrypted(
                    node,
                    MessageKind::RouteUpdate,
                    &message::encode_body(&update),
                );
            }
            None => {
                log::debug!("no route to {} for {addr}", request.mac);
                self.push_encrypted(
                    node,
                    MessageKind::RouteMissing,
                    &message::encode_body(&RouteMissing { mac: request.mac }),
                );
            }
        }
    }

    /// Apply an announced peer record, from a master's broadcast or as the
    /// answer to one of our resolution requests.
    pub(crate) fn handle_route_update(
        &mut self,
        now: SystemTime,
        node: &NodeRef,
        plaintext: &[u8],
    ) {
        let from = node.borrow().addr();

        if !node.borrow().is_master() {
            log::debug!("ignoring route update from non-master {from}");
            return;
        }

        let update: RouteUpdate = match message::decode_body(plaintext) {
            Ok(update) => update,
            Err(error) => {
                log::debug!("malformed route update from {from}: {error}");
                return;
            }
        };

        let self_node = self.router.self_node();
        if update.addr == self_node.borrow().addr() || Some(update.mac) == self_node.borrow().mac()
        {
            return;
        }

        // An address already bound to a different endpoint is a conflict;
        // keep the existing binding.
        if let Some(existing) = self.router.find_by_mac(update.mac) {
            if existing.borrow().addr() != update.addr {
                log::warn!(
                    "route update from {from} rebinds {} from {} to {}; ignoring",
                    update.mac,
                    existing.borrow().addr(),
                    update.addr
                );
                return;
            }
        }

        let target = match self.router.find_by_endpoint(update.addr) {
            Some(existing) => {
                {
                    let mut borrowed = existing.borrow_mut();
                    borrowed.set_master(update.master);
                    if borrowed.mac().is_none() {
                        borrowed.set_mac_hint(update.mac);
                    }
                }
                self.skip_broadcast.push_back(update.addr);
                self.router.notify_updated(&existing);
                existing
            }
            None => {
                let target = SparkleNode::new_ref(update.addr);
                {
                    let mut borrowed = target.borrow_mut();
                    borrowed.set_master(update.master);
                    borrowed.set_mac_hint(update.mac);
                }
                self.skip_broadcast.push_back(update.addr);
                self.router.update(Rc::clone(&target));
                target
            }
        };

        self.flush_pending_to_node(now, &target);
    }

    pub(crate) fn handle_route_missing(
        &mut self,
        _now: SystemTime,
        node: &NodeRef,
        plaintext: &[u8],
    ) {
        let from = node.borrow().addr();

        let missing: RouteMissing = match message::decode_body(plaintext) {
            Ok(missing) => missing,
            Err(error) => {
                log::debug!("malformed route-missing from {from}: {error}");
                return;
            }
        };

        let Some(pending) = self.pending_routes.remove(&missing.mac) else {
            return;
        };

        log::debug!("master {from} has no route to {}", missing.mac);
        for packet in pending.packets {
            self.report_packet_failed(packet);
        }
    }

    /// Deliver (or, as a master, relay) a decrypted overlay packet.
    pub(crate) fn handle_data_packet(
        &mut self,
        now: SystemTime,
        node: &NodeRef,
        plaintext: Vec<u8>,
    ) {
        let packet = match DataPacket::from_buffer(plaintext) {
            Ok(packet) => packet,
            Err(_) => {
                log::debug!(
                    "undersized data packet from {}",
                    node.borrow().addr()
                );
                self.register_decrypt_failure(now, node);
                return;
            }
        };

        let dest = packet.dest();

        if dest == self.overlay_mac() {
            let Some(source) = node.borrow().mac() else {
                log::debug!("data packet from a peer with no known overlay address");
                return;
            };

            self.frames.push(InboundFrame {
                source,
                frame: packet.frame().to_vec(),
            });
            return;
        }

        if !self.is_master() {
            log::debug!("dropping transit data packet for {dest}: we are not a master");
            return;
        }

        // Single-hop relay for our slaves.
        match self.router.find_by_mac(dest) {
            Some(target) => {
                let body = packet.into_buffer();
                if target.borrow().negotiation_done() {
                    self.push_encrypted(&target, MessageKind::DataPacket, &body);
                } else {
                    target.borrow_mut().append_queue(body);
                    if target.borrow().phase() == NegotiationPhase::New {
                        self.initiate_handshake(now, &target);
                    }
                }
            }
            None => log::debug!("dropping transit data packet for unknown {dest}"),
        }
    }

    /// Announce a changed peer record to the other masters (master only;
    /// slaves never broadcast routing updates).
    pub(crate) fn broadcast_route_update(&mut self, node: &NodeRef) {
        if !self.is_master() {
            return;
        }

        let update = {
            let borrowed = node.borrow();
            let Some(mac) = borrowed.mac() else {
                return;
            };
            RouteUpdate {
                addr: borrowed.addr(),
                mac,
                master: borrowed.is_master(),
            }
        };

        if Some(update.mac) == self.router.self_node().borrow().mac() {
            return;
        }

        let peers: Vec<NodeRef> = self
            .router
            .other_masters()
            .into_iter()
            .filter(|m| m.borrow().negotiation_done() && m.borrow().addr() != update.addr)
            .collect();

        for master in peers {
            self.push_encrypted(
                &master,
                MessageKind::RouteUpdate,
                &message::encode_body(&update),
            );
        }
    }
}
