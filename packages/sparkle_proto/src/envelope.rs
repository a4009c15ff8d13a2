use std::ops::{Range, RangeFrom};

use thiserror::Error;

/// The fixed wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

// Ranges of the envelope header.
const VERSION_RANGE: Range<usize> = 0..2;
const KIND_RANGE: Range<usize> = 2..4;
const LEN_RANGE: Range<usize> = 4..8;
const PAYLOAD_RANGE: RangeFrom<usize> = 8..;

/// Length of the envelope header in bytes.
pub const HEADER_LEN: usize = 8;

/// The kind of a message, as carried in the envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    ProtocolVersion = 1,
    PublicKeyExchange = 2,
    SessionKeyOffer = 3,
    SessionKeyAck = 4,
    MasterNodeRequest = 5,
    MasterNodeReply = 6,
    RegisterRequest = 7,
    RegisterReply = 8,
    RouteRequest = 9,
    RouteUpdate = 10,
    RouteMissing = 11,
    DataPacket = 12,
}

impl MessageKind {
    /// Whether this kind may only travel inside an established session.
    ///
    /// The three handshake-bootstrapping kinds are sent in the clear;
    /// everything else must be encrypted with the sender's send-key.
    pub fn requires_session(&self) -> bool {
        !matches!(
            self,
            MessageKind::ProtocolVersion
                | MessageKind::PublicKeyExchange
                | MessageKind::SessionKeyOffer
        )
    }
}

impl TryFrom<u16> for MessageKind {
    type Error = u16;

    fn try_from(raw: u16) -> Result<Self, u16> {
        Ok(match raw {
            1 => MessageKind::ProtocolVersion,
            2 => MessageKind::PublicKeyExchange,
            3 => MessageKind::SessionKeyOffer,
            4 => MessageKind::SessionKeyAck,
            5 => MessageKind::MasterNodeRequest,
            6 => MessageKind::MasterNodeReply,
            7 => MessageKind::RegisterRequest,
            8 => MessageKind::RegisterReply,
            9 => MessageKind::RouteRequest,
            10 => MessageKind::RouteUpdate,
            11 => MessageKind::RouteMissing,
            12 => MessageKind::DataPacket,
            raw => return Err(raw),
        })
    }
}

/// A decoded envelope, borrowing the datagram it was parsed from.
///
/// `plaintext_len` is the payload length before block padding; for
/// unencrypted kinds it always equals `payload.len()`, for encrypted kinds
/// `payload` may carry up to a block of trailing pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub kind: MessageKind,
    pub plaintext_len: usize,
    pub payload: &'a [u8],
}

/// Frame an unencrypted payload.
pub fn encode(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    encode_padded(kind, payload.len(), payload)
}

/// Frame a padded (encrypted) payload whose pre-padding length is
/// `plaintext_len`.
pub fn encode_padded(kind: MessageKind, plaintext_len: usize, payload: &[u8]) -> Vec<u8> {
    debug_assert!(plaintext_len <= payload.len());

    let mut buffer = vec![0; HEADER_LEN + payload.len()];
    buffer[VERSION_RANGE].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    buffer[KIND_RANGE].copy_from_slice(&(kind as u16).to_be_bytes());
    buffer[LEN_RANGE].copy_from_slice(&(plaintext_len as u32).to_be_bytes());
    buffer[PAYLOAD_RANGE].copy_from_slice(payload);
    buffer
}

/// Parse an envelope out of a datagram.
pub fn decode(buffer: &[u8]) -> Result<Envelope<'_>, EnvelopeError> {
    if buffer.len() < HEADER_LEN {
        return Err(EnvelopeError::TooShort);
    }

    let version = u16::from_be_bytes(buffer[VERSION_RANGE].try_into().unwrap());
    if version != PROTOCOL_VERSION {
        return Err(EnvelopeError::VersionMismatch(version));
    }

    let kind = u16::from_be_bytes(buffer[KIND_RANGE].try_into().unwrap())
        .try_into()
        .map_err(EnvelopeError::UnknownKind)?;

    let plaintext_len = u32::from_be_bytes(buffer[LEN_RANGE].try_into().unwrap()) as usize;
    let payload = &buffer[PAYLOAD_RANGE];
    if plaintext_len > payload.len() {
        return Err(EnvelopeError::LengthMismatch {
            declared: plaintext_len,
            actual: payload.len(),
        });
    }

    Ok(Envelope {
        kind,
        plaintext_len,
        payload,
    })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("datagram shorter than the envelope header")]
    TooShort,

    #[error("unsupported protocol version {0}")]
    VersionMismatch(u16),

    #[error("unknown message kind {0}")]
    UnknownKind(u16),

    #[error("declared payload length {declared} exceeds the {actual} bytes present")]
    LengthMismatch { declared: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for (kind, payload) in [
            (MessageKind::ProtocolVersion, &b""[..]),
            (MessageKind::PublicKeyExchange, &b"some key bytes"[..]),
            (MessageKind::DataPacket, &[0u8; 1500][..]),
        ] {
            let wire = encode(kind, payload);
            let envelope = decode(&wire).expect("encoded envelope should decode");

            assert_eq!(envelope.kind, kind);
            assert_eq!(envelope.plaintext_len, payload.len());
            assert_eq!(envelope.payload, payload);
        }
    }

    #[test]
    fn padded_payload_keeps_plaintext_len() {
        let padded = [1, 2, 3, 0, 0, 0, 0, 0];
        let wire = encode_padded(MessageKind::SessionKeyAck, 3, &padded);

        let envelope = decode(&wire).unwrap();
        assert_eq!(envelope.plaintext_len, 3);
        assert_eq!(envelope.payload, padded);
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert_eq!(decode(&[0; 7]), Err(EnvelopeError::TooShort));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut wire = encode(MessageKind::ProtocolVersion, b"");
        wire[0] = 0xff;

        assert!(matches!(
            decode(&wire),
            Err(EnvelopeError::VersionMismatch(_))
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut wire = encode(MessageKind::ProtocolVersion, b"");
        wire[2..4].copy_from_slice(&999u16.to_be_bytes());

        assert_eq!(decode(&wire), Err(EnvelopeError::UnknownKind(999)));
    }

    #[test]
    fn overlong_declared_length_is_rejected() {
        let mut wire = encode(MessageKind::DataPacket, b"abc");
        wire[4..8].copy_from_slice(&100u32.to_be_bytes());

        assert_eq!(
            decode(&wire),
            Err(EnvelopeError::LengthMismatch {
                declared: 100,
                actual: 3
            })
        );
    }

    #[test]
    fn session_requirements() {
        assert!(!MessageKind::ProtocolVersion.requires_session());
        assert!(!MessageKind::PublicKeyExchange.requires_session());
        assert!(!MessageKind::SessionKeyOffer.requires_session());
        assert!(MessageKind::SessionKeyAck.requires_session());
        assert!(MessageKind::DataPacket.requires_session());
        assert!(MessageKind::RouteUpdate.requires_session());
    }
}
