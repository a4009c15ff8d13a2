//! CLI argument parsing for the Sparkle daemon.

use std::net::{SocketAddr, ToSocketAddrs};

use clap::Parser;

pub const DEFAULT_PORT: u16 = 1801;

#[derive(Parser, Debug)]
#[command(
    name = "sparkled",
    version,
    about = "Zero-configuration fully distributed self-organizing encrypting overlay network"
)]
pub struct Args {
    /// Create a new network.
    #[arg(short = 'c', long, conflicts_with = "join")]
    pub create: bool,

    /// Join an existing network; PORT defaults to 1801.
    #[arg(short = 'j', long, value_name = "HOST[:PORT]")]
    pub join: Option<String>,

    /// Bind to a local UDP endpoint; defaults to *:1801.
    #[arg(short = 'b', long, value_name = "HOST[:PORT]")]
    pub bind: Option<String>,

    /// Use the given profile.
    #[arg(long, default_value = "default", value_name = "PROFILE")]
    pub profile: String,

    /// Generate a new RSA key pair with the given modulus length.
    #[arg(long, value_name = "BITS")]
    pub generate_key: Option<usize>,

    /// Print our public key and exit.
    #[arg(long)]
    pub get_pubkey: bool,

    /// Do not bridge a TAP interface (headless mode).
    #[arg(long)]
    pub no_tap: bool,
}

/// Resolve a `HOST[:PORT]` endpoint. `*` binds the wildcard address. When
/// a hostname resolves to several addresses the first is used, with a
/// warning.
pub fn parse_endpoint(spec: &str, default_port: u16) -> Result<SocketAddr, String> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let (host, port) = match spec.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| format!("invalid port in endpoint {spec}"))?;
            (host, port)
        }
        _ => (spec, default_port),
    };

    if host == "*" {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| format!("cannot lookup address for host {host}"))?
        .collect();

    match addrs.as_slice() {
        [] => Err(format!("no addresses for host {host}")),
        [only] => Ok(*only),
        [first, ..] => {
            log::warn!("there are several addresses for host {host}, using first ({first})");
            Ok(*first)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_endpoint_forms() {
        assert_eq!(
            parse_endpoint("192.0.2.1:2000", DEFAULT_PORT).unwrap(),
            "192.0.2.1:2000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_endpoint("192.0.2.1", DEFAULT_PORT).unwrap(),
            "192.0.2.1:1801".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_endpoint("*", DEFAULT_PORT).unwrap(),
            "0.0.0.0:1801".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_endpoint("*:2001", DEFAULT_PORT).unwrap(),
            "0.0.0.0:2001".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn bad_port_is_rejected() {
        assert!(parse_endpoint("192.0.2.1:notaport", DEFAULT_PORT).is_err());
    }
}
