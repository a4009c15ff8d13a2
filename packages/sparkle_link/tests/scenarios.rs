//! End-to-end protocol scenarios, driven entirely in memory: link layers
//! are wired to each other by delivering every polled datagram to the node
//! whose endpoint it addresses, under a stepped test clock.

use std::{
    net::SocketAddr,
    time::{Duration, SystemTime},
};

use rand::SeedableRng;
use rand_chacha::ChaChaRng;

use sparkle_crypto::{OverlayMac, RemoteKey, RsaKeyPair, SessionKey};
use sparkle_link::{InboundFrame, JoinError, LinkLayer, Notice, Role};
use sparkle_proto::{data, envelope, envelope::MessageKind};
use sparkle_router::NegotiationPhase;

#[derive(Debug)]
struct TestClock {
    now: SystemTime,
}

impl TestClock {
    fn new() -> Self {
        Self {
            now: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        }
    }

    fn now(&self) -> SystemTime {
        self.now
    }

    fn increment(&mut self, duration: Duration) {
        self.now += duration;
    }
}

struct TestNode {
    link: LinkLayer<ChaChaRng>,
    addr: SocketAddr,
    mac: OverlayMac,
    public_key_der: Vec<u8>,
    frames: Vec<InboundFrame>,
    notices: Vec<Notice>,
}

fn test_node(seed: u8, addr: SocketAddr) -> TestNode {
    let mut rng = ChaChaRng::from_seed([seed; 32]);
    let keypair = RsaKeyPair::generate(&mut rng, 1024).expect("key generation should succeed");
    let public_key_der = keypair.public_key_der().to_vec();

    let link = LinkLayer::new(keypair, addr, rng);
    let mac = link.overlay_mac();

    TestNode {
        link,
        addr,
        mac,
        public_key_der,
        frames: Vec::new(),
        notices: Vec::new(),
    }
}

fn addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, last], port))
}

/// Poll every node and deliver the produced datagrams to their addressees,
/// repeating until the network is quiescent. Datagrams addressed to an
/// endpoint no node holds are dropped, like any lost UDP packet.
fn pump(clock: &TestClock, nodes: &mut [TestNode]) {
    loop {
        let mut in_flight = Vec::new();

        for node in nodes.iter_mut() {
            let events = node.link.poll(clock.now());
            node.frames.extend(events.frames);
            node.notices.extend(events.notices);
            in_flight.extend(events.datagrams.into_iter().map(|d| (node.addr, d)));
        }

        if in_flight.is_empty() {
            break;
        }

        for (from, datagram) in in_flight {
            if let Some(dest) = nodes.iter_mut().find(|n| n.addr == datagram.to) {
                dest.link.handle_datagram(clock.now(), from, &datagram.bytes);
            }
        }
    }
}

fn join_role(notices: &[Notice]) -> Option<&Result<Role, JoinError>> {
    notices.iter().find_map(|notice| match notice {
        Notice::JoinFinished(result) => Some(result),
        _ => None,
    })
}

fn send_failures(notices: &[Notice]) -> Vec<(OverlayMac, usize)> {
    notices
        .iter()
        .filter_map(|notice| match notice {
            Notice::SendFailed { dest, frame } => Some((*dest, frame.len())),
            _ => None,
        })
        .collect()
}

/// Build the two-node network of the basic scenario: `a` creates, `b`
/// joins through it.
fn two_node_network(clock: &mut TestClock) -> Vec<TestNode> {
    let mut a = test_node(1, addr(1, 1801));
    let mut b = test_node(2, addr(1, 1802));

    a.link.create_network(clock.now());
    b.link.join_network(clock.now(), a.addr);

    let mut nodes = vec![a, b];
    pump(clock, &mut nodes);
    nodes
}

#[test]
fn create_and_join() {
    let mut clock = TestClock::new();
    let nodes = two_node_network(&mut clock);
    let (a, b) = (&nodes[0], &nodes[1]);

    assert_eq!(
        join_role(&b.notices),
        Some(&Ok(Role::Slave)),
        "the second node of a fresh network should be assigned the slave role"
    );

    assert!(a.link.is_master());
    assert!(!b.link.is_master());
    assert_ne!(a.mac, b.mac, "distinct keys must derive distinct addresses");

    assert_eq!(a.link.router().nodes().len(), 2);
    assert_eq!(b.link.router().nodes().len(), 2);

    let b_at_a = a
        .link
        .router()
        .find_by_mac(b.mac)
        .expect("the master should know the joiner by overlay address");
    assert!(b_at_a.borrow().negotiation_done());
    assert!(!b_at_a.borrow().is_master());

    let a_at_b = b
        .link
        .router()
        .find_by_endpoint(a.addr)
        .expect("the joiner should know the bootstrap master");
    assert!(a_at_b.borrow().is_master());
    assert_eq!(b.link.router().masters().len(), 1);
}

#[test]
fn established_records_satisfy_key_invariants() {
    let mut clock = TestClock::new();
    let nodes = two_node_network(&mut clock);

    for node in &nodes {
        for peer in node.link.router().other_nodes() {
            let peer = peer.borrow();
            if peer.negotiation_done() {
                assert!(
                    peer.send_key().is_some() && peer.recv_key().is_some(),
                    "negotiation-complete implies both session keys installed"
                );
                assert!(
                    peer.public_key().is_some(),
                    "negotiation-complete implies the public key is set"
                );
                assert!(peer.queue_empty(), "the hold queue drains on establishment");
            }
        }
    }
}

#[test]
fn frame_delivery_after_handshake() {
    let mut clock = TestClock::new();
    let mut nodes = two_node_network(&mut clock);

    let a_mac = nodes[0].mac;
    let b_mac = nodes[1].mac;
    let frame = [0x42u8; 100];

    clock.increment(Duration::from_millis(5));
    nodes[1].link.send_frame(clock.now(), a_mac, &frame);
    pump(&clock, &mut nodes);

    let received = &nodes[0].frames;
    assert_eq!(received.len(), 1, "exactly one frame must arrive");
    assert_eq!(received[0].frame, frame);
    assert_eq!(received[0].source, b_mac);
}

#[test]
fn frames_queued_before_join_are_delivered_once() {
    let mut clock = TestClock::new();
    let mut a = test_node(1, addr(1, 1801));
    let mut b = test_node(2, addr(1, 1802));

    a.link.create_network(clock.now());

    // The upper layer races the join: the frame is handed over before any
    // handshake datagram has even left the node.
    b.link.join_network(clock.now(), a.addr);
    b.link.send_frame(clock.now(), a.mac, b"early frame");

    let mut nodes = vec![a, b];
    pump(&clock, &mut nodes);

    assert_eq!(
        nodes[0]
            .frames
            .iter()
            .filter(|f| f.frame == b"early frame")
            .count(),
        1,
        "the queued frame must be delivered exactly once"
    );
    assert!(
        send_failures(&nodes[1].notices).is_empty(),
        "nothing may be reported failed on the successful path"
    );
}

#[test]
fn join_times_out_against_a_dead_endpoint() {
    let mut clock = TestClock::new();
    let mut b = test_node(2, addr(1, 1802));

    let dead = addr(9, 1801);
    b.link.join_network(clock.now(), dead);

    // A frame for an unresolvable destination is parked while the join is
    // in flight.
    let never_mac = OverlayMac::from_octets([0x02, 9, 9, 9, 9, 9]);
    b.link.send_frame(clock.now(), never_mac, b"doomed");

    let mut nodes = vec![b];

    // Walk through the retransmission schedule; the probes go nowhere.
    for _ in 0..5 {
        clock.increment(Duration::from_secs(2));
        pump(&clock, &mut nodes);
    }

    match join_role(&nodes[0].notices) {
        Some(Err(JoinError::HandshakeTimeout { addr })) => assert_eq!(*addr, dead),
        other => panic!("expected a handshake timeout, got {other:?}"),
    }

    assert_eq!(
        send_failures(&nodes[0].notices),
        vec![(never_mac, b"doomed".len())],
        "parked frames must be reported failed when the join dies"
    );
}

#[test]
fn corrupted_packet_is_dropped_silently() {
    let mut clock = TestClock::new();
    let mut nodes = two_node_network(&mut clock);
    let a_mac = nodes[0].mac;
    let b_mac = nodes[1].mac;

    // Capture a legitimate encrypted data packet from b and corrupt it.
    nodes[1].link.send_frame(clock.now(), a_mac, &[7u8; 64]);
    let events = nodes[1].link.poll(clock.now());
    assert_eq!(events.datagrams.len(), 1);
    let mut wire = events.datagrams.into_iter().next().unwrap().bytes;
    let payload_start = envelope::HEADER_LEN;
    wire[payload_start] ^= 0xff;

    let b_addr = nodes[1].addr;
    nodes[0].link.handle_datagram(clock.now(), b_addr, &wire);
    pump(&clock, &mut nodes);

    assert!(
        nodes[0].frames.is_empty(),
        "a corrupted packet must not reach the upper layer"
    );
    assert!(
        !nodes[0]
            .notices
            .iter()
            .any(|n| matches!(n, Notice::SessionLost { .. })),
        "a single bad packet must not tear the session down"
    );

    // The session still works.
    nodes[1].link.send_frame(clock.now(), a_mac, b"still fine");
    pump(&clock, &mut nodes);
    assert_eq!(nodes[0].frames.len(), 1);
    assert_eq!(nodes[0].frames[0].source, b_mac);
}

#[test]
fn repeated_decrypt_failures_reset_the_session() {
    let mut clock = TestClock::new();
    let mut nodes = two_node_network(&mut clock);
    let b_addr = nodes[1].addr;

    // Misaligned ciphertext counts as a decrypt failure each time.
    let junk = envelope::encode_padded(MessageKind::DataPacket, 3, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let mut broken = junk.clone();
    broken.truncate(broken.len() - 1);

    for _ in 0..3 {
        clock.increment(Duration::from_millis(10));
        nodes[0]
            .link
            .handle_datagram(clock.now(), b_addr, &broken);
    }
    pump(&clock, &mut nodes);

    assert!(
        nodes[0]
            .notices
            .iter()
            .any(|n| matches!(n, Notice::SessionLost { addr } if *addr == b_addr)),
        "three failures in the window must reset the peer"
    );

    let b_at_a = nodes[0].link.router().find_by_endpoint(b_addr).unwrap();
    assert_eq!(b_at_a.borrow().phase(), NegotiationPhase::New);
}

#[test]
fn duplicate_key_from_second_endpoint_is_rejected() {
    let mut clock = TestClock::new();
    let mut a = test_node(1, addr(1, 1801));
    let b = test_node(2, addr(1, 1802));
    // Same seed as b: a clone carrying identical key bytes.
    let clone = test_node(2, addr(1, 1803));

    a.link.create_network(clock.now());
    let mut nodes = vec![a, b];
    nodes[1].link.join_network(clock.now(), addr(1, 1801));
    pump(&clock, &mut nodes);
    assert!(matches!(join_role(&nodes[1].notices), Some(&Ok(_))));

    let mut with_clone = nodes;
    with_clone.push(clone);
    let clone_addr = addr(1, 1803);
    with_clone[2].link.join_network(clock.now(), addr(1, 1801));
    pump(&clock, &mut with_clone);

    assert!(
        with_clone[0]
            .link
            .router()
            .find_by_endpoint(clone_addr)
            .is_none(),
        "a key already bound to another endpoint must not enter the router"
    );
    assert_eq!(with_clone[0].link.router().nodes().len(), 2);
}

#[test]
fn rekey_replaces_the_receive_key() {
    let mut clock = TestClock::new();
    let mut nodes = two_node_network(&mut clock);
    let a_mac = nodes[0].mac;
    let b_addr = nodes[1].addr;
    let a_der = nodes[0].public_key_der.clone();

    // b announces a fresh sending key out of band, as a rekey.
    let mut rng = ChaChaRng::from_seed([77; 32]);
    let fresh = SessionKey::generate(&mut rng);
    let remote = RemoteKey::from_der(&a_der).unwrap();
    let sealed = remote.encrypt(&mut rng, fresh.bytes()).unwrap();
    let offer = envelope::encode(MessageKind::SessionKeyOffer, &sealed);
    nodes[0].link.handle_datagram(clock.now(), b_addr, &offer);

    // Traffic under the old key is now undecipherable and silently lost...
    nodes[1].link.send_frame(clock.now(), a_mac, b"stale key");
    pump(&clock, &mut nodes);
    assert!(nodes[0].frames.is_empty());

    // ...while traffic under the fresh key flows.
    let packet = data::assemble(a_mac, b"rekeyed frame");
    let ciphertext = fresh.encrypt(&packet);
    let wire = envelope::encode_padded(MessageKind::DataPacket, packet.len(), &ciphertext);
    nodes[0].link.handle_datagram(clock.now(), b_addr, &wire);
    pump(&clock, &mut nodes);

    assert_eq!(nodes[0].frames.len(), 1);
    assert_eq!(nodes[0].frames[0].frame, b"rekeyed frame");
}

#[test]
fn unknown_destination_with_no_master_fails_immediately() {
    let mut clock = TestClock::new();
    let mut lone = test_node(5, addr(1, 1805));

    let nowhere = OverlayMac::from_octets([0x02, 1, 1, 1, 1, 1]);
    lone.link.send_frame(clock.now(), nowhere, b"void");

    let mut nodes = vec![lone];
    pump(&clock, &mut nodes);

    assert_eq!(send_failures(&nodes[0].notices), vec![(nowhere, 4)]);
}

#[test]
fn route_resolution_through_the_master() {
    let mut clock = TestClock::new();
    let mut a = test_node(1, addr(1, 1801));
    let b = test_node(2, addr(1, 1802));
    let c = test_node(3, addr(1, 1803));

    a.link.create_network(clock.now());
    let mut nodes = vec![a, b, c];

    nodes[1].link.join_network(clock.now(), addr(1, 1801));
    pump(&clock, &mut nodes);
    clock.increment(Duration::from_millis(10));
    nodes[2].link.join_network(clock.now(), addr(1, 1801));
    pump(&clock, &mut nodes);

    assert!(matches!(join_role(&nodes[1].notices), Some(&Ok(Role::Slave))));
    assert!(matches!(join_role(&nodes[2].notices), Some(&Ok(Role::Slave))));

    // b has never heard of c; the master resolves, then b and c handshake
    // directly and the frame flows end to end.
    let c_mac = nodes[2].mac;
    let b_mac = nodes[1].mac;
    clock.increment(Duration::from_millis(10));
    nodes[1].link.send_frame(clock.now(), c_mac, b"via lookup");
    pump(&clock, &mut nodes);

    assert_eq!(nodes[2].frames.len(), 1);
    assert_eq!(nodes[2].frames[0].frame, b"via lookup");
    assert_eq!(nodes[2].frames[0].source, b_mac);
    assert!(
        send_failures(&nodes[1].notices).is_empty(),
        "resolution must not fail any frames"
    );
}

#[test]
fn master_relays_transit_packets() {
    let mut clock = TestClock::new();
    let mut a = test_node(1, addr(1, 1801));
    let b = test_node(2, addr(1, 1802));
    let c = test_node(3, addr(1, 1803));

    a.link.create_network(clock.now());
    let mut nodes = vec![a, b, c];
    nodes[1].link.join_network(clock.now(), addr(1, 1801));
    pump(&clock, &mut nodes);
    nodes[2].link.join_network(clock.now(), addr(1, 1801));
    pump(&clock, &mut nodes);

    // Hand-craft a data packet from b addressed to c but sent to the
    // master, which relays it over its own session with c.
    let c_mac = nodes[2].mac;
    let a_mac = nodes[0].mac;
    let a_addr = nodes[0].addr;
    let b_addr = nodes[1].addr;

    let packet = data::assemble(c_mac, b"relayed");
    let wire = {
        let a_at_b = nodes[1].link.router().find_by_endpoint(a_addr).unwrap();
        let borrowed = a_at_b.borrow();
        let key = borrowed.send_key().expect("established session has a key");
        envelope::encode_padded(MessageKind::DataPacket, packet.len(), &key.encrypt(&packet))
    };

    nodes[0].link.handle_datagram(clock.now(), b_addr, &wire);
    pump(&clock, &mut nodes);

    assert_eq!(nodes[2].frames.len(), 1);
    assert_eq!(nodes[2].frames[0].frame, b"relayed");
    assert_eq!(
        nodes[2].frames[0].source, a_mac,
        "a relayed frame arrives from the relaying master"
    );
}

#[test]
fn cancel_drops_the_hold_queue() {
    let mut clock = TestClock::new();
    let a = test_node(1, addr(1, 1801));
    let mut b = test_node(2, addr(1, 1802));

    // b starts the handshake, but none of its datagrams ever leave; only
    // a's public key arrives, so a frame sent now parks on the peer record.
    b.link.join_network(clock.now(), a.addr);
    let _ = b.link.poll(clock.now());

    let pubkey = envelope::encode(MessageKind::PublicKeyExchange, &a.public_key_der);
    b.link.handle_datagram(clock.now(), a.addr, &pubkey);
    b.link.send_frame(clock.now(), a.mac, b"never sent");

    {
        let a_at_b = b.link.router().find_by_endpoint(a.addr).unwrap();
        assert!(
            !a_at_b.borrow().queue_empty(),
            "the frame must be parked on the peer while keys are pending"
        );
    }

    b.link.cancel(clock.now(), a.addr);
    let events = b.link.poll(clock.now());
    b.notices.extend(events.notices);

    assert_eq!(
        send_failures(&b.notices),
        vec![(a.mac, b"never sent".len())],
        "cancel must fail every held frame exactly once"
    );

    let a_at_b = b.link.router().find_by_endpoint(a.addr).unwrap();
    assert_eq!(a_at_b.borrow().phase(), NegotiationPhase::New);
}
