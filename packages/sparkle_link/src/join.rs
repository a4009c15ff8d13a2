//! The join/bootstrap flow and its server side.
//!
//! A joiner handshakes with the bootstrap master, asks it for the master
//! set and an assignment, handshakes with the assigned master if that is a
//! different node, and registers there to receive its role. The serving
//! master assigns uniformly at random among the current masters and
//! promotes registrants while the master set is below one master per ten
//! nodes.

use std::{
    net::{IpAddr, SocketAddr},
    rc::Rc,
    time::SystemTime,
};

use rand::{CryptoRng, Rng};

use sparkle_proto::{
    envelope::MessageKind,
    message::{self, MasterNodeReply, RegisterReply},
};
use sparkle_router::{NodeRef, SparkleNode};

use crate::{JoinError, LinkLayer, Notice};

/// The role a node holds in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// Progress of an in-flight join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinStage {
    /// Handshaking with the bootstrap node.
    BootstrapHandshake,
    /// Waiting for the master list and our assignment.
    AwaitingMasterReply,
    /// Handshaking with the assigned master.
    AssignedHandshake,
    /// Waiting for our role.
    AwaitingRegisterReply,
}

#[derive(Debug)]
pub(crate) struct JoinFlow {
    pub bootstrap: SocketAddr,
    pub assigned: Option<SocketAddr>,
    pub stage: JoinStage,
    /// Bumped on every stage change so stale stage timers can tell they
    /// are stale.
    pub seq: u64,
    /// Master endpoints advertised by the bootstrap, installed into the
    /// router once registration succeeds.
    pub masters: Vec<SocketAddr>,
}

impl JoinFlow {
    pub fn new(bootstrap: SocketAddr) -> Self {
        Self {
            bootstrap,
            assigned: None,
            stage: JoinStage::BootstrapHandshake,
            seq: 0,
            masters: Vec::new(),
        }
    }

    /// The endpoint the current stage is waiting on.
    fn current_target(&self) -> SocketAddr {
        match self.stage {
            JoinStage::BootstrapHandshake | JoinStage::AwaitingMasterReply => self.bootstrap,
            JoinStage::AssignedHandshake | JoinStage::AwaitingRegisterReply => {
                self.assigned.unwrap_or(self.bootstrap)
            }
        }
    }
}

impl<R: Rng + CryptoRng> LinkLayer<R> {
    fn advance_join_stage(&mut self, now: SystemTime, stage: JoinStage) {
        let seq = {
            let flow = self.join.as_mut().expect("a join flow is active");
            flow.stage = stage;
            flow.seq += 1;
            flow.seq
        };
        self.schedule_join_timeout(now, seq);
    }

    /// A session reached `Established`; let the join flow take its next
    /// step if it was waiting on this peer.
    pub(crate) fn join_peer_established(&mut self, now: SystemTime, node: &NodeRef) {
        let addr = node.borrow().addr();
        let (stage, bootstrap, assigned) = match &self.join {
            Some(flow) => (flow.stage, flow.bootstrap, flow.assigned),
            None => return,
        };

        match stage {
            JoinStage::BootstrapHandshake if addr == bootstrap => {
                log::debug!("bootstrap handshake done; requesting master list");
                self.advance_join_stage(now, JoinStage::AwaitingMasterReply);
                self.push_encrypted(node, MessageKind::MasterNodeRequest, &[]);
            }
            JoinStage::AssignedHandshake if Some(addr) == assigned => {
                log::debug!("assigned-master handshake done; registering");
                self.advance_join_stage(now, JoinStage::AwaitingRegisterReply);
                self.push_encrypted(node, MessageKind::RegisterRequest, &[]);
            }
            _ => {}
        }
    }

    /// A negotiation failed; fail the join if it was waiting on that peer.
    pub(crate) fn join_peer_failed(&mut self, now: SystemTime, addr: SocketAddr, error: JoinError) {
        let waiting = self
            .join
            .as_ref()
            .is_some_and(|flow| flow.current_target() == addr);

        if waiting {
            self.join_failed(now, error);
        }
    }

    pub(crate) fn join_stage_timed_out(&mut self, now: SystemTime, seq: u64) {
        let Some(flow) = &self.join else {
            return;
        };
        if flow.seq != seq {
            return;
        }

        let error = match flow.stage {
            JoinStage::BootstrapHandshake | JoinStage::AssignedHandshake => {
                JoinError::HandshakeTimeout {
                    addr: flow.current_target(),
                }
            }
            JoinStage::AwaitingMasterReply => JoinError::MasterReplyTimeout,
            JoinStage::AwaitingRegisterReply => JoinError::RegisterTimeout,
        };

        self.join_failed(now, error);
    }

    fn join_failed(&mut self, _now: SystemTime, error: JoinError) {
        log::warn!("join failed: {error}");
        self.join = None;
        self.notices.push(Notice::JoinFinished(Err(error)));
    }

    /// Serve a joiner's request for the master set (we must be a master).
    pub(crate) fn handle_master_node_request(&mut self, node: &NodeRef) {
        let addr = node.borrow().addr();

        if !self.is_master() {
            log::warn!("ignoring master-node request from {addr}: we are not a master");
            return;
        }

        let assigned = self
            .router
            .select_master(&mut self.rng)
            .expect("a master node always has at least itself");

        let reply = MasterNodeReply {
            assigned: assigned.borrow().addr(),
            masters: self
                .router
                .masters()
                .iter()
                .map(|master| master.borrow().addr())
                .collect(),
        };

        log::debug!(
            "assigning joiner {addr} to master {} of {}",
            reply.assigned,
            reply.masters.len()
        );
        self.push_encrypted(node, MessageKind::MasterNodeReply, &message::encode_body(&reply));
    }

    pub(crate) fn handle_master_node_reply(
        &mut self,
        now: SystemTime,
        node: &NodeRef,
        plaintext: &[u8],
    ) {
        let addr = node.borrow().addr();

        let expecting = self.join.as_ref().is_some_and(|flow| {
            flow.stage == JoinStage::AwaitingMasterReply && flow.bootstrap == addr
        });
        if !expecting {
            log::debug!("ignoring unexpected master-node reply from {addr}");
            return;
        }

        let reply: MasterNodeReply = match message::decode_body(plaintext) {
            Ok(reply) => reply,
            Err(error) => {
                log::warn!("malformed master-node reply from {addr}: {error}");
                self.join_failed(now, JoinError::MalformedReply);
                return;
            }
        };

        // The bootstrap answered a master request, so it is a master.
        node.borrow_mut().set_master(true);

        {
            let flow = self.join.as_mut().expect("join flow checked above");
            flow.assigned = Some(reply.assigned);
            flow.masters = reply.masters;
        }

        let assigned_node = self.node_for_endpoint(reply.assigned);
        assigned_node.borrow_mut().set_master(true);

        if assigned_node.borrow().negotiation_done() {
            log::debug!("assigned master {} already reachable; registering", reply.assigned);
            self.advance_join_stage(now, JoinStage::AwaitingRegisterReply);
            self.push_encrypted(&assigned_node, MessageKind::RegisterRequest, &[]);
        } else {
            log::debug!("handshaking with assigned master {}", reply.assigned);
            self.advance_join_stage(now, JoinStage::AssignedHandshake);
            self.initiate_handshake(now, &assigned_node);
        }

        self.flush_route_requests(now);
    }

    /// Serve a registration (we must be a master): decide the joiner's
    /// role, record reachability, and announce the newcomer.
    pub(crate) fn handle_register_request(&mut self, node: &NodeRef) {
        let addr = node.borrow().addr();

        if !self.is_master() {
            log::warn!("ignoring register request from {addr}: we are not a master");
            return;
        }

        let total = self.router.nodes().len();
        let masters = self.router.masters().len();
        let promote = masters < total.div_ceil(self.config.master_ratio);

        {
            let mut borrowed = node.borrow_mut();
            borrowed.set_master(promote);
            if !promote {
                borrowed.set_white(is_globally_routable(addr.ip()));
            }
        }

        log::info!(
            "registered {addr} as {} ({masters} masters / {total} nodes)",
            if promote { "master" } else { "slave" }
        );

        self.push_encrypted(
            node,
            MessageKind::RegisterReply,
            &message::encode_body(&RegisterReply { master: promote }),
        );
        self.router.notify_updated(node);
    }

    pub(crate) fn handle_register_reply(
        &mut self,
        now: SystemTime,
        node: &NodeRef,
        plaintext: &[u8],
    ) {
        let addr = node.borrow().addr();

        let expecting = self.join.as_ref().is_some_and(|flow| {
            flow.stage == JoinStage::AwaitingRegisterReply && flow.current_target() == addr
        });
        if !expecting {
            log::debug!("ignoring unexpected register reply from {addr}");
            return;
        }

        let reply: RegisterReply = match message::decode_body(plaintext) {
            Ok(reply) => reply,
            Err(error) => {
                log::warn!("malformed register reply from {addr}: {error}");
                self.join_failed(now, JoinError::MalformedReply);
                return;
            }
        };

        let flow = self.join.take().expect("join flow checked above");

        // Populate the router with the advertised master set. Entries are
        // contacted lazily, on first use.
        let self_addr = self.router.self_node().borrow().addr();
        for master_addr in flow.masters {
            if master_addr == self_addr {
                continue;
            }

            let master = match self.router.find_by_endpoint(master_addr) {
                Some(existing) => existing,
                None => {
                    let node = SparkleNode::new_ref(master_addr);
                    self.skip_broadcast.push_back(master_addr);
                    self.router.update(Rc::clone(&node));
                    node
                }
            };
            master.borrow_mut().set_master(true);
        }

        let role = if reply.master {
            Role::Master
        } else {
            Role::Slave
        };
        self.router.self_node().borrow_mut().set_master(reply.master);

        log::info!("joined the network as {role:?}");
        self.notices.push(Notice::JoinFinished(Ok(role)));
        self.flush_route_requests(now);
    }
}

/// Whether an address is plausibly reachable from the open internet,
/// making its owner eligible for the white-slave pool.
fn is_globally_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => {
            // Unique-local (fc00::/7) and link-local (fe80::/10) prefixes.
            let first = v6.octets()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe) == 0xfc
                || (first == 0xfe && (v6.octets()[1] & 0xc0) == 0x80))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routability_classification() {
        assert!(!is_globally_routable("127.0.0.1".parse().unwrap()));
        assert!(!is_globally_routable("10.1.2.3".parse().unwrap()));
        assert!(!is_globally_routable("192.168.0.1".parse().unwrap()));
        assert!(is_globally_routable("198.51.101.7".parse().unwrap()));

        assert!(!is_globally_routable("::1".parse().unwrap()));
        assert!(!is_globally_routable("fe80::1".parse().unwrap()));
        assert!(!is_globally_routable("fd00::1".parse().unwrap()));
        assert!(is_globally_routable("2001:4860::8888".parse().unwrap()));
    }
}
