//! On-wire message formats for the Sparkle overlay network.
//!
//! Every datagram is one [`envelope`]: a fixed header naming the protocol
//! version, the message kind, and the pre-padding payload length. Control
//! message bodies are defined in [`message`]; overlay data packets are
//! framed in [`data`].

pub mod data;
pub mod envelope;
pub mod message;

pub use data::DataPacket;
pub use envelope::{Envelope, EnvelopeError, MessageKind, HEADER_LEN, PROTOCOL_VERSION};
