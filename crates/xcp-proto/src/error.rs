//! Error types for wire-level parsing and validation.
//!
//! Errors are split by recovery scope: everything in [`ProtocolError`] except
//! the tensor variants is connection-fatal for a live session (the session
//! engine closes the connection after draining), while tensor-header errors
//! surface as per-message decode failures.

use thiserror::Error;

/// Convenience result alias for wire-level operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while packing or parsing frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// First four bytes were not the XCP magic number.
    #[error("bad magic: found {found:#010x}, expected {:#010x}", crate::MAGIC)]
    BadMagic {
        /// Value found at offset 0
        found: u32,
    },

    /// Peer speaks a different protocol major version.
    #[error("unsupported protocol version byte {version:#04x} (local major {})", crate::version_major(crate::VERSION))]
    UnsupportedVersion {
        /// Raw version byte from the wire
        version: u8,
    },

    /// Fewer header bytes available than the preamble's HLEN claims.
    #[error("header truncated: expected {expected} bytes, got {actual}")]
    HeaderTruncated {
        /// Header length claimed by HLEN
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Header block present but not decodable as a well-formed header.
    #[error("header malformed: {reason}")]
    HeaderMalformed {
        /// What failed to decode
        reason: String,
    },

    /// Fewer payload bytes available than PLEN claims.
    #[error("payload truncated: expected {expected} bytes, got {actual}")]
    PayloadTruncated {
        /// Payload length claimed by PLEN
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// CRC32C trailer did not match the payload bytes as read.
    #[error("crc mismatch: trailer {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch {
        /// CRC value carried in the trailer
        expected: u32,
        /// CRC computed over the received payload
        actual: u32,
    },

    /// PLEN exceeds the negotiated maximum frame size.
    #[error("frame too large: payload {size} bytes exceeds limit {max}")]
    FrameTooLarge {
        /// Payload size claimed by PLEN
        size: u64,
        /// Negotiated maximum
        max: u64,
    },

    /// Tensor header failed validation.
    #[error("tensor header invalid: {reason}")]
    TensorMalformed {
        /// What failed to validate
        reason: String,
    },
}

impl ProtocolError {
    /// Returns true if this error must tear down the connection.
    ///
    /// Per-message errors (tensor decode) are recoverable with a NACK; all
    /// framing errors indicate a corrupt or hostile stream where resync is
    /// impossible.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, Self::TensorMalformed { .. })
    }
}
