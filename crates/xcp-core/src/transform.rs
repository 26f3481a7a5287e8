//! Payload transform pipeline.
//!
//! Send: encode → compress (COMP) → encrypt (CRYPT) → CRC. Receive inverts.
//! Transforms run once over a message's whole encoded body before chunking;
//! the derived nonce is a function of (msg_id, channel_id) and must be used
//! exactly once per key, which per-chunk encryption would violate.

use bytes::Bytes;
use xcp_crypto::{StaticKey, TransformError};
use xcp_proto::FrameFlags;

use crate::error::{Result, SessionError};

/// Transform configuration derived from the session config.
#[derive(Clone, Default)]
pub struct Transforms {
    /// Apply zstd compression on send.
    pub compression: bool,
    /// Encrypt with this static key on send; required to decrypt CRYPT
    /// frames on receive.
    pub key: Option<StaticKey>,
}

impl Transforms {
    /// Apply outbound transforms, returning the wire bytes and the flag bits
    /// to set on every chunk of the message.
    ///
    /// # Errors
    ///
    /// - `SessionError::Transform` on a compression failure.
    pub fn apply(&self, body: Bytes, msg_id: u64, channel_id: u32) -> Result<(Bytes, FrameFlags)> {
        let mut flags = FrameFlags::new();
        let mut bytes = body;

        if self.compression {
            bytes = Bytes::from(xcp_crypto::compress(&bytes)?);
            flags = flags.with_comp();
        }
        if let Some(key) = &self.key {
            let nonce = xcp_crypto::derive_nonce(key, msg_id, channel_id);
            bytes = Bytes::from(xcp_crypto::seal(key, &nonce, &[], &bytes));
            flags = flags.with_crypt();
        }

        Ok((bytes, flags))
    }

    /// Reverse inbound transforms according to the frame's flags.
    ///
    /// # Errors
    ///
    /// - `SessionError::Transform` if decryption or decompression fails, or
    ///   a CRYPT frame arrives with no key configured.
    pub fn reverse(
        &self,
        payload: Bytes,
        flags: FrameFlags,
        msg_id: u64,
        channel_id: u32,
        max_decompressed: u64,
    ) -> Result<Bytes> {
        let mut bytes = payload;

        if flags.is_crypt() {
            let key = self.key.as_ref().ok_or(SessionError::Transform(
                TransformError::DecryptFailed,
            ))?;
            let nonce = xcp_crypto::derive_nonce(key, msg_id, channel_id);
            bytes = Bytes::from(xcp_crypto::open(key, &nonce, &[], &bytes)?);
        }
        if flags.is_comp() {
            let cap = usize::try_from(max_decompressed).unwrap_or(usize::MAX);
            bytes = Bytes::from(xcp_crypto::decompress(&bytes, cap)?);
        }

        Ok(bytes)
    }
}
