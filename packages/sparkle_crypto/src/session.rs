use std::fmt;

use blowfish::{
    cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit},
    Blowfish,
};
use rand::{CryptoRng, Rng};
use zeroize::Zeroize;

/// Session key length in bytes (256-bit Blowfish key).
pub const SESSION_KEY_LEN: usize = 32;

/// Blowfish block length in bytes.
pub const BLOCK_LEN: usize = 8;

/// A per-direction symmetric session key.
///
/// Payloads are zero-padded to the block boundary and processed in ECB mode
/// for wire compatibility with existing Sparkle nodes. ECB leaks plaintext
/// block repetition; the envelope carries the pre-padding length so the
/// receiver can strip the pad, but confidentiality of repeated blocks is
/// limited. A future protocol revision should move to an AEAD.
pub struct SessionKey {
    raw: [u8; SESSION_KEY_LEN],
    cipher: Blowfish,
}

impl SessionKey {
    /// Generate a fresh key from a cryptographic RNG.
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut raw = [0u8; SESSION_KEY_LEN];
        rng.fill(&mut raw[..]);
        Self::install(raw)
    }

    /// Install key bytes received from a peer. `None` unless exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; SESSION_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self::install(raw))
    }

    fn install(raw: [u8; SESSION_KEY_LEN]) -> Self {
        let cipher = Blowfish::new_from_slice(&raw)
            .expect("a 32-byte key is within Blowfish's accepted range");
        Self { raw, cipher }
    }

    /// The raw key bytes, for transport under the peer's RSA key.
    pub fn bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.raw
    }

    /// Encrypt a payload, zero-padding it up to a whole number of blocks.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut padded = plaintext.to_vec();
        padded.resize(plaintext.len().div_ceil(BLOCK_LEN) * BLOCK_LEN, 0);

        for chunk in padded.chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(chunk));
        }

        padded
    }

    /// Decrypt a padded payload and strip the pad down to `plaintext_len`.
    ///
    /// `None` when the ciphertext is not block-aligned or too short to hold
    /// the claimed plaintext.
    pub fn decrypt(&self, ciphertext: &[u8], plaintext_len: usize) -> Option<Vec<u8>> {
        if ciphertext.len() % BLOCK_LEN != 0 || plaintext_len > ciphertext.len() {
            return None;
        }

        let mut plain = ciphertext.to_vec();
        for chunk in plain.chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(chunk));
        }

        plain.truncate(plaintext_len);
        Some(plain)
    }
}

impl Clone for SessionKey {
    fn clone(&self) -> Self {
        Self::install(self.raw)
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.raw.zeroize();
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}
