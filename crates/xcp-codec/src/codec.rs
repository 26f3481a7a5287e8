//! Codec contract and error taxonomy.

use bytes::Bytes;
use thiserror::Error;

use crate::ether::Ether;

/// Convenience result alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors from envelope encoding, decoding, and registry dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Envelope violates its own structural invariants.
    #[error("invalid ether: {reason}")]
    InvalidEther {
        /// What failed validation
        reason: String,
    },

    /// This codec cannot represent the given envelope.
    #[error("ether not representable by codec {codec}: {reason}")]
    Unrepresentable {
        /// Codec registry name
        codec: &'static str,
        /// Why the envelope is out of the codec's domain
        reason: String,
    },

    /// Bytes do not decode under this codec.
    #[error("malformed {codec} body: {reason}")]
    Malformed {
        /// Codec registry name
        codec: &'static str,
        /// What failed to parse
        reason: String,
    },

    /// No codec registered under this id.
    #[error("unknown codec id {id:#06x}")]
    UnknownCodec {
        /// The unregistered id
        id: u16,
    },

    /// No codec registered under this name.
    #[error("unknown codec name {name:?}")]
    UnknownCodecName {
        /// The unregistered name
        name: String,
    },

    /// Registration attempted after the registry froze.
    #[error("codec registry is frozen; register codecs before opening a session")]
    RegistryFrozen,

    /// An id was re-registered with a different implementation.
    #[error("codec id {id:#06x} already registered as {existing:?}, refusing {new:?}")]
    DuplicateCodec {
        /// Contested id
        id: u16,
        /// Name already registered
        existing: &'static str,
        /// Name of the rejected registration
        new: &'static str,
    },
}

impl From<xcp_proto::ProtocolError> for CodecError {
    fn from(err: xcp_proto::ProtocolError) -> Self {
        Self::Malformed { codec: "tensor", reason: err.to_string() }
    }
}

/// An algorithm encoding an [`Ether`] to bytes and back, identified by a
/// u16 id from the wire tables.
///
/// Implementations must be pure: `decode(encode(e)) == e` for every `e` the
/// codec can represent, and `encode` must fail with
/// [`CodecError::Unrepresentable`] rather than drop information.
pub trait EtherCodec: Send + Sync {
    /// Numeric codec id carried in frame headers.
    fn id(&self) -> u16;

    /// Stable registry name.
    fn name(&self) -> &'static str;

    /// True for binary (non-human-readable) encodings.
    fn is_binary(&self) -> bool;

    /// Encode an envelope.
    ///
    /// # Errors
    ///
    /// - `CodecError::InvalidEther` if the envelope fails validation
    /// - `CodecError::Unrepresentable` if the codec cannot express it
    fn encode(&self, ether: &Ether) -> Result<Bytes>;

    /// Decode an envelope.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` if the bytes are not a valid body
    fn decode(&self, bytes: &[u8]) -> Result<Ether>;
}
