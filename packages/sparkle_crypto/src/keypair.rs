use std::{fs, io, path::Path};

use rand::{CryptoRng, Rng};
use rsa::{
    pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
};
use thiserror::Error;

use crate::mac::OverlayMac;

/// The node's RSA identity.
///
/// Loaded once at startup and kept for the process lifetime. The public key
/// is cached in its DER form so the overlay MAC derivation sees byte-equal
/// input on every call.
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    public_der: Vec<u8>,
}

impl RsaKeyPair {
    /// Generate a fresh key pair of the given modulus length.
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R, bits: usize) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::new(rng, bits).map_err(KeyError::Generate)?;
        Self::from_private(private)
    }

    /// Load the key pair from a PKCS#8 PEM file.
    pub fn read_from_file(path: &Path) -> Result<Self, KeyError> {
        let pem = fs::read_to_string(path).map_err(KeyError::Read)?;
        let private = RsaPrivateKey::from_pkcs8_pem(&pem).map_err(KeyError::ParsePrivate)?;
        Self::from_private(private)
    }

    /// Write the key pair to a PKCS#8 PEM file, readable only by the owner.
    pub fn write_to_file(&self, path: &Path) -> Result<(), KeyError> {
        let pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(KeyError::SerializePrivate)?;

        fs::write(path, pem.as_bytes()).map_err(KeyError::Write)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .map_err(KeyError::Write)?;
        }

        Ok(())
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self, KeyError> {
        let public = private.to_public_key();
        let public_der = public
            .to_pkcs1_der()
            .map_err(KeyError::SerializePublic)?
            .as_bytes()
            .to_vec();

        Ok(Self {
            private,
            public,
            public_der,
        })
    }

    /// The DER serialization of the public key. Deterministic: byte-equal
    /// across calls and across a write/read round-trip.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// The public key as PEM, for display to the operator.
    pub fn public_key_pem(&self) -> Result<String, KeyError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(KeyError::SerializePublicPem)
    }

    /// The overlay address derived from this identity.
    pub fn overlay_mac(&self) -> OverlayMac {
        OverlayMac::derive(&self.public_der)
    }

    /// Decrypt a session-key transport blob addressed to us.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(KeyError::Decrypt)
    }
}

/// A remote node's public key, as received in a key exchange.
#[derive(Clone)]
pub struct RemoteKey {
    key: RsaPublicKey,
    der: Vec<u8>,
}

impl RemoteKey {
    /// Parse a DER-serialized public key received from the wire.
    pub fn from_der(der: &[u8]) -> Result<Self, KeyError> {
        let key = RsaPublicKey::from_pkcs1_der(der).map_err(KeyError::ParsePublic)?;

        Ok(Self {
            key,
            der: der.to_vec(),
        })
    }

    /// Encrypt a session-key transport blob for the key's owner.
    pub fn encrypt<R: Rng + CryptoRng>(
        &self,
        rng: &mut R,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        self.key
            .encrypt(rng, Pkcs1v15Encrypt, plaintext)
            .map_err(KeyError::Encrypt)
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    pub fn overlay_mac(&self) -> OverlayMac {
        OverlayMac::derive(&self.der)
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to generate RSA key pair")]
    Generate(#[source] rsa::Error),

    #[error("failed to read key file")]
    Read(#[source] io::Error),

    #[error("failed to write key file")]
    Write(#[source] io::Error),

    #[error("malformed private key")]
    ParsePrivate(#[source] rsa::pkcs8::Error),

    #[error("malformed public key")]
    ParsePublic(#[source] rsa::pkcs1::Error),

    #[error("failed to serialize private key")]
    SerializePrivate(#[source] rsa::pkcs8::Error),

    #[error("failed to serialize public key")]
    SerializePublic(#[source] rsa::pkcs1::Error),

    #[error("failed to serialize public key as PEM")]
    SerializePublicPem(#[source] rsa::pkcs8::spki::Error),

    #[error("RSA encryption failed")]
    Encrypt(#[source] rsa::Error),

    #[error("RSA decryption failed")]
    Decrypt(#[source] rsa::Error),
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaChaRng;

    use super::*;

    fn test_keypair() -> RsaKeyPair {
        let mut rng = ChaChaRng::from_seed([7; 32]);
        RsaKeyPair::generate(&mut rng, 1024).expect("key generation should succeed")
    }

    #[test]
    fn transport_round_trip() {
        let pair = test_keypair();
        let remote = RemoteKey::from_der(pair.public_key_der()).unwrap();

        let mut rng = ChaChaRng::from_seed([8; 32]);
        let secret = [0x5a; 32];

        let sealed = remote.encrypt(&mut rng, &secret).unwrap();
        assert_ne!(&sealed[..], &secret[..]);

        let opened = pair.decrypt(&sealed).unwrap();
        assert_eq!(opened, secret);
    }

    #[test]
    fn remote_key_preserves_der_and_mac() {
        let pair = test_keypair();
        let remote = RemoteKey::from_der(pair.public_key_der()).unwrap();

        assert_eq!(remote.as_der(), pair.public_key_der());
        assert_eq!(remote.overlay_mac(), pair.overlay_mac());
    }

    #[test]
    fn malformed_public_key_is_rejected() {
        assert!(matches!(
            RemoteKey::from_der(b"junk"),
            Err(KeyError::ParsePublic(_))
        ));
    }

    #[test]
    fn file_round_trip() {
        let dir = std::env::temp_dir().join("sparkle-keypair-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rsa_key");

        let pair = test_keypair();
        pair.write_to_file(&path).unwrap();

        let reloaded = RsaKeyPair::read_from_file(&path).unwrap();
        assert_eq!(
            reloaded.public_key_der(),
            pair.public_key_der(),
            "public key DER must survive the file round-trip byte-for-byte"
        );
        assert_eq!(reloaded.overlay_mac(), pair.overlay_mac());

        fs::remove_dir_all(&dir).unwrap();
    }
}
