//! The Sparkle daemon: binds the UDP underlay socket, optionally bridges a
//! TAP device, and pumps the link-layer state machine from a
//! single-threaded readiness loop. All protocol state lives in
//! [`sparkle_link`]; this binary only moves bytes.

mod args;
mod profile;
mod tap;

use std::{
    error::Error as _,
    io,
    net::SocketAddr,
    process,
    time::{Duration, SystemTime},
};

use clap::Parser;
use mio::{net::UdpSocket, Events, Interest, Poll, Token};
use rand::rngs::OsRng;
use thiserror::Error;

use sparkle_crypto::KeyError;
use sparkle_link::{JoinError, LinkLayer, Notice};

use args::{parse_endpoint, Args, DEFAULT_PORT};
use tap::Tap;

const UDP_TOKEN: Token = Token(0);
const RECV_BUFFER_SIZE: usize = 65536;

/// Poll granularity while a TAP reader thread is feeding the frame
/// channel; without one the loop sleeps until the next protocol timer.
const TAP_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn main() {
    pretty_env_logger::init();

    let args = Args::parse();
    if let Err(error) = run(args) {
        eprintln!("sparkled: {error}");
        let mut source = error.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}

#[derive(Debug, Error)]
enum FatalError {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Profile(#[from] profile::ProfileError),

    #[error("cannot serialize the public key")]
    Pubkey(#[source] KeyError),

    #[error("cannot bind UDP endpoint {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot create TAP interface")]
    Tap(#[source] io::Error),

    #[error("cannot join network")]
    Join(#[source] JoinError),

    #[error("transport failure")]
    Transport(#[source] io::Error),
}

fn run(args: Args) -> Result<(), FatalError> {
    let dir = profile::profile_dir(&args.profile)?;

    if args.get_pubkey {
        let pair = profile::load_keypair(&dir)?;
        print!("{}", pair.public_key_pem().map_err(FatalError::Pubkey)?);
        return Ok(());
    }

    if args.create == args.join.is_some() {
        return Err(FatalError::Usage(
            "specify exactly one of --create and --join".into(),
        ));
    }

    let bind_addr = match &args.bind {
        Some(spec) => parse_endpoint(spec, DEFAULT_PORT).map_err(FatalError::Usage)?,
        None => SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
    };

    if args.create && bind_addr.ip().is_unspecified() {
        return Err(FatalError::Usage(
            "you need to specify a local endpoint to create a network".into(),
        ));
    }

    let join_addr = args
        .join
        .as_deref()
        .map(|spec| parse_endpoint(spec, DEFAULT_PORT))
        .transpose()
        .map_err(FatalError::Usage)?;

    let keypair = profile::load_or_generate(&dir, args.generate_key)?;

    let mut socket = UdpSocket::bind(bind_addr).map_err(|source| FatalError::Bind {
        addr: bind_addr,
        source,
    })?;
    let local_addr = socket.local_addr().map_err(FatalError::Transport)?;
    log::info!("listening on {local_addr}");

    let mut link = LinkLayer::new(keypair, local_addr, OsRng);
    log::info!("our overlay address is {}", link.overlay_mac());

    let tap = if args.no_tap {
        log::debug!("tap: no interface created");
        None
    } else {
        Some(Tap::open(link.overlay_mac()).map_err(FatalError::Tap)?)
    };

    let now = SystemTime::now();
    match join_addr {
        None => link.create_network(now),
        Some(addr) => link.join_network(now, addr),
    }

    event_loop(&mut link, &mut socket, tap)
}

fn event_loop(
    link: &mut LinkLayer<OsRng>,
    socket: &mut UdpSocket,
    tap: Option<Tap>,
) -> Result<(), FatalError> {
    let mut poll = Poll::new().map_err(FatalError::Transport)?;
    poll.registry()
        .register(socket, UDP_TOKEN, Interest::READABLE)
        .map_err(FatalError::Transport)?;

    let mut events = Events::with_capacity(64);
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    loop {
        flush_link(link, socket, tap.as_ref())?;

        let now = SystemTime::now();
        let mut timeout = link.next_timer(now);
        if tap.is_some() {
            timeout = Some(timeout.map_or(TAP_POLL_INTERVAL, |t| t.min(TAP_POLL_INTERVAL)));
        }

        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(FatalError::Transport(error)),
        }

        let now = SystemTime::now();

        loop {
            match socket.recv_from(&mut buffer) {
                Ok((len, from)) => link.handle_datagram(now, from, &buffer[..len]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) => return Err(FatalError::Transport(error)),
            }
        }

        if let Some(tap) = &tap {
            while let Some(frame) = tap.try_recv() {
                match tap::unicast_dest(&frame) {
                    Some(dest) => link.send_frame(now, dest, &frame),
                    None => log::trace!("tap: skipping non-unicast frame"),
                }
            }
        }
    }
}

/// Drain the state machine's outputs to the socket, the TAP device, and
/// the log. A failed join is fatal.
fn flush_link(
    link: &mut LinkLayer<OsRng>,
    socket: &UdpSocket,
    tap: Option<&Tap>,
) -> Result<(), FatalError> {
    let events = link.poll(SystemTime::now());

    for datagram in events.datagrams {
        if let Err(error) = socket.send_to(&datagram.bytes, datagram.to) {
            log::debug!("send to {} failed: {error}", datagram.to);
        }
    }

    for inbound in events.frames {
        match tap {
            Some(tap) => {
                if let Err(error) = tap.write(&inbound.frame) {
                    log::warn!("tap: write failed: {error}");
                }
            }
            None => log::trace!(
                "discarding {}-byte frame from {} (no TAP)",
                inbound.frame.len(),
                inbound.source
            ),
        }
    }

    for notice in events.notices {
        match notice {
            Notice::JoinFinished(Ok(role)) => log::info!("joined the network as a {role:?}"),
            Notice::JoinFinished(Err(error)) => return Err(FatalError::Join(error)),
            other => log::debug!("{other:?}"),
        }
    }

    Ok(())
}
