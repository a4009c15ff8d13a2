//! Control message bodies.
//!
//! Bodies are bincode-serialized structs carried in the envelope payload.
//! The raw-bytes kinds (`PublicKeyExchange`, `SessionKeyOffer`) have no
//! body type; their payload is the key material itself.

use std::net::SocketAddr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sparkle_crypto::OverlayMac;
use thiserror::Error;

/// Body of a `ProtocolVersion` probe or its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionProbe {
    pub version: u16,
    pub reply: bool,
}

/// Body of a `MasterNodeReply`: the current master set and the master the
/// joiner is assigned to register with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterNodeReply {
    pub assigned: SocketAddr,
    pub masters: Vec<SocketAddr>,
}

/// Body of a `RegisterReply`: the role assigned to the registering node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub master: bool,
}

/// Body of a `RouteRequest`: ask a master to resolve an overlay address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub mac: OverlayMac,
}

/// Body of a `RouteUpdate`: announce a peer record to another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUpdate {
    pub addr: SocketAddr,
    pub mac: OverlayMac,
    pub master: bool,
}

/// Body of a `RouteMissing`: a master's negative answer to a `RouteRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMissing {
    pub mac: OverlayMac,
}

/// The fixed body of a `SessionKeyAck`.
///
/// Opaque and non-empty; arriving intact under the freshly installed key is
/// what proves the sender decrypted the RSA-transported key offer.
pub const SESSION_ACK_BODY: [u8; 8] = *b"sparkle\0";

/// Serialize a message body.
pub fn encode_body<T: Serialize>(body: &T) -> Vec<u8> {
    bincode::serialize(body).expect("message bodies have no unserializable states")
}

/// Deserialize a message body.
pub fn decode_body<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BodyError> {
    bincode::deserialize(payload).map_err(BodyError::Deserialize)
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("failed to deserialize message body")]
    Deserialize(#[source] bincode::Error),
}
