//! Payload transforms for XCP frames.
//!
//! Two optional transforms sit between codec output and the frame payload:
//! zstd compression (the COMP flag) and ChaCha20-Poly1305 AEAD (the CRYPT
//! flag). On send the order is compress → encrypt; receive inverts it. The
//! frame CRC always covers the transformed bytes, so integrity checking
//! needs no key material.
//!
//! All functions are pure. The AEAD nonce is derived deterministically from
//! the message and channel ids under the static session key, so a given
//! message encrypts identically on retry and the nonce is never reused
//! across messages (message ids are strictly monotonic per connection).
//!
//! # Security
//!
//! - Key material is zeroized on drop.
//! - Failed authentication tags reject the payload before any plaintext is
//!   surfaced.
//! - Decompression is bounded by a caller-supplied cap to keep hostile
//!   frames from ballooning memory.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod aead;
mod compress;

pub use aead::{AEAD_TAG_SIZE, NONCE_SIZE, StaticKey, derive_nonce, open, seal};
pub use compress::{compress, decompress};

use thiserror::Error;

/// Errors from the transform pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// Authentication tag or key mismatch; the payload was tampered with or
    /// the peers disagree on the key.
    #[error("decryption failed: bad key or tampered ciphertext")]
    DecryptFailed,

    /// Compressed payload did not decompress.
    #[error("decompression failed: {reason}")]
    DecompressFailed {
        /// Underlying zstd error text
        reason: String,
    },

    /// Decompressed size would exceed the configured cap.
    #[error("decompressed payload exceeds cap of {max} bytes")]
    DecompressTooLarge {
        /// The configured cap
        max: usize,
    },

    /// Compression itself failed (allocation or internal zstd error).
    #[error("compression failed: {reason}")]
    CompressFailed {
        /// Underlying zstd error text
        reason: String,
    },
}
