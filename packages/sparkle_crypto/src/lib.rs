//! Cryptographic primitives for the Sparkle overlay network.
//!
//! Three concerns live here: the node's RSA identity (key pair file I/O and
//! the transport encryption used to move session keys), the Blowfish session
//! keys that encrypt overlay traffic, and the derivation of a node's overlay
//! MAC address from its public key.

pub mod keypair;
pub mod mac;
pub mod session;

pub use keypair::{KeyError, RemoteKey, RsaKeyPair};
pub use mac::OverlayMac;
pub use session::{SessionKey, BLOCK_LEN, SESSION_KEY_LEN};
