//! ChaCha20-Poly1305 sealing with deterministic nonce derivation.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::TransformError;

/// AEAD nonce size (IETF ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size appended to ciphertext.
pub const AEAD_TAG_SIZE: usize = 16;

/// Static symmetric session key.
///
/// Configured out of band on both peers; the engine derives per-message
/// nonces from it rather than rotating the key itself.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StaticKey([u8; 32]);

impl StaticKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("StaticKey(..)")
    }
}

/// Derive the per-message nonce: the first 12 bytes of
/// `HMAC-SHA256(static_key, msg_id_le || channel_id_le)`.
///
/// Message ids are strictly monotonic per connection, so each (key, msg_id,
/// channel) triple yields a unique nonce; retransmissions intentionally
/// reuse it and produce byte-identical frames.
#[must_use]
pub fn derive_nonce(key: &StaticKey, msg_id: u64, channel_id: u32) -> [u8; NONCE_SIZE] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(&msg_id.to_le_bytes());
    mac.update(&channel_id.to_le_bytes());
    let digest = mac.finalize().into_bytes();

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    nonce
}

/// Encrypt, returning ciphertext with the 16-byte tag appended.
#[must_use]
pub fn seal(key: &StaticKey, nonce: &[u8; NONCE_SIZE], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let Ok(ciphertext) =
        cipher.encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

/// Decrypt and authenticate.
///
/// # Errors
///
/// - `TransformError::DecryptFailed` if the tag, key, nonce, or AAD do not
///   match.
pub fn open(
    key: &StaticKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, TransformError> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| TransformError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StaticKey {
        StaticKey::new([7u8; 32])
    }

    #[test]
    fn seal_open_round_trip() {
        let nonce = derive_nonce(&key(), 42, 1);
        let ciphertext = seal(&key(), &nonce, b"", b"secret payload");
        assert_eq!(ciphertext.len(), 14 + AEAD_TAG_SIZE);

        let plaintext = open(&key(), &nonce, b"", &ciphertext).unwrap();
        assert_eq!(plaintext, b"secret payload");
    }

    #[test]
    fn nonce_is_deterministic_and_message_unique() {
        let a = derive_nonce(&key(), 1, 0);
        let b = derive_nonce(&key(), 1, 0);
        let c = derive_nonce(&key(), 2, 0);
        let d = derive_nonce(&key(), 1, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let nonce = derive_nonce(&key(), 3, 0);
        let mut ciphertext = seal(&key(), &nonce, b"", b"payload");
        ciphertext[0] ^= 0x01;

        assert_eq!(open(&key(), &nonce, b"", &ciphertext), Err(TransformError::DecryptFailed));
    }

    #[test]
    fn wrong_key_rejected() {
        let nonce = derive_nonce(&key(), 4, 0);
        let ciphertext = seal(&key(), &nonce, b"", b"payload");

        let other = StaticKey::new([8u8; 32]);
        assert!(open(&other, &nonce, b"", &ciphertext).is_err());
    }

    #[test]
    fn aad_mismatch_rejected() {
        let nonce = derive_nonce(&key(), 5, 0);
        let ciphertext = seal(&key(), &nonce, b"context-a", b"payload");
        assert!(open(&key(), &nonce, b"context-b", &ciphertext).is_err());
    }

    #[test]
    fn retry_produces_identical_ciphertext() {
        let nonce = derive_nonce(&key(), 6, 2);
        let first = seal(&key(), &nonce, b"", b"same bytes");
        let second = seal(&key(), &nonce, b"", b"same bytes");
        assert_eq!(first, second);
    }
}
