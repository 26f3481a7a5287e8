//! Session-level error taxonomy.
//!
//! Three scopes: connection-fatal (wire corruption, protocol violations -
//! the session closes), per-message (NACKed and dropped, the session
//! continues), and per-call (timeouts surfaced to one caller only).

use std::{io, time::Duration};

use thiserror::Error;

use crate::session::SessionState;

/// Convenience result alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by the session engine and its drivers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not valid in the current state.
    #[error("invalid state: cannot {operation} while {state:?}")]
    InvalidState {
        /// State when the operation was attempted
        state: SessionState,
        /// The attempted operation
        operation: &'static str,
    },

    /// Peer violated the protocol (bad handshake order, malformed control
    /// body, chunk inconsistency). Connection-fatal.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Capability negotiation produced an empty codec intersection.
    #[error("negotiation failed: {reason}")]
    NegotiationFailed {
        /// Why negotiation failed
        reason: String,
    },

    /// No usable codec for this envelope under the negotiated set and
    /// policy.
    #[error("no negotiated codec can represent this envelope: {reason}")]
    CodecUnavailable {
        /// Why selection failed
        reason: String,
    },

    /// Wire-level error from frame parsing. Connection-fatal.
    #[error("wire error: {0}")]
    Wire(#[from] xcp_proto::ProtocolError),

    /// Envelope codec error.
    #[error("codec error: {0}")]
    Codec(#[from] xcp_codec::CodecError),

    /// Transform pipeline error.
    #[error("transform error: {0}")]
    Transform(#[from] xcp_crypto::TransformError),

    /// The peer rejected a message.
    #[error("peer nacked msg {msg_id} with code {error_code:?}")]
    Nacked {
        /// The rejected message
        msg_id: u64,
        /// Peer-reported error code
        error_code: xcp_proto::ErrorCode,
        /// Retry hint, if any
        retry_after_ms: Option<u64>,
    },

    /// Automatic retries exhausted.
    #[error("delivery failed for msg {msg_id} after {attempts} attempts")]
    DeliveryFailed {
        /// The undeliverable message
        msg_id: u64,
        /// Attempts made
        attempts: u32,
    },

    /// The session closed; pending callers are failed with this.
    #[error("session closed")]
    SessionClosed,

    /// A per-call deadline elapsed. Local only; no NACK is emitted.
    #[error("timed out after {elapsed:?}")]
    Timeout {
        /// How long the caller waited
        elapsed: Duration,
    },

    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    /// True if the error must tear down the connection.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::Protocol(_) | Self::NegotiationFailed { .. } | Self::Transport(_) => true,
            Self::Wire(err) => err.is_connection_fatal(),
            Self::InvalidState { .. }
            | Self::CodecUnavailable { .. }
            | Self::Codec(_)
            | Self::Transform(_)
            | Self::Nacked { .. }
            | Self::DeliveryFailed { .. }
            | Self::SessionClosed
            | Self::Timeout { .. } => false,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Boundary conversion for async I/O APIs.
impl From<SessionError> for io::Error {
    fn from(err: SessionError) -> Self {
        let kind = match &err {
            SessionError::Timeout { .. } => io::ErrorKind::TimedOut,
            SessionError::SessionClosed => io::ErrorKind::ConnectionAborted,
            SessionError::Transport(_) => io::ErrorKind::Other,
            _ => io::ErrorKind::InvalidData,
        };
        Self::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_split() {
        assert!(SessionError::Protocol("handshake order".to_string()).is_connection_fatal());
        assert!(
            SessionError::Wire(xcp_proto::ProtocolError::CrcMismatch { expected: 1, actual: 2 })
                .is_connection_fatal()
        );
        assert!(!SessionError::SessionClosed.is_connection_fatal());
        assert!(
            !SessionError::Timeout { elapsed: Duration::from_secs(1) }.is_connection_fatal()
        );
        assert!(
            !SessionError::Nacked {
                msg_id: 1,
                error_code: xcp_proto::ErrorCode::SchemaUnknown,
                retry_after_ms: None,
            }
            .is_connection_fatal()
        );
    }
}
