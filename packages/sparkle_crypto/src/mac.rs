use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 6-byte overlay Ethernet address, derived from a node's public key.
///
/// Derivation is a pure function of the serialized key: two nodes holding
/// the same key bytes derive the same address, so key collisions surface as
/// address collisions and are treated as misconfiguration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OverlayMac([u8; 6]);

impl OverlayMac {
    pub const LEN: usize = 6;

    /// Derive the overlay address from a DER-serialized public key.
    ///
    /// Takes the first 6 bytes of the SHA-256 digest, clears the multicast
    /// bit and sets the locally-administered bit, as for any synthetic MAC.
    pub fn derive(public_key_der: &[u8]) -> Self {
        let digest = Sha256::digest(public_key_der);

        let mut octets = [0u8; 6];
        octets.copy_from_slice(&digest[..6]);
        octets[0] = (octets[0] & !0x01) | 0x02;

        Self(octets)
    }

    pub fn from_octets(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for OverlayMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for OverlayMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayMac({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_pure() {
        let key = b"not actually a key, but any bytes do";

        assert_eq!(OverlayMac::derive(key), OverlayMac::derive(key));
        assert_ne!(
            OverlayMac::derive(key),
            OverlayMac::derive(b"different bytes"),
            "distinct key bytes should derive distinct addresses"
        );
    }

    #[test]
    fn derived_addresses_are_unicast_and_local() {
        for seed in 0u32..64 {
            let mac = OverlayMac::derive(&seed.to_be_bytes());
            let first = mac.octets()[0];

            assert_eq!(first & 0x01, 0, "multicast bit must be cleared");
            assert_eq!(first & 0x02, 0x02, "locally-administered bit must be set");
        }
    }

    #[test]
    fn display_is_colon_separated_hex() {
        let mac = OverlayMac::from_octets([0x02, 0xab, 0x00, 0x12, 0x34, 0xff]);
        assert_eq!(mac.to_string(), "02:ab:00:12:34:ff");
    }
}
