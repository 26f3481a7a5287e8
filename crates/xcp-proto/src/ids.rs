//! Registered codec identifiers and protocol error codes.

/// JSON envelope codec. Mandatory; the control-frame fallback every peer
/// must support.
pub const CODEC_JSON: u16 = 0x0001;

/// Raw F32 tensor codec (32-byte tensor header + little-endian body).
pub const CODEC_TENSOR_F32: u16 = 0x0002;

/// Raw F16 tensor codec.
pub const CODEC_TENSOR_F16: u16 = 0x0003;

/// Raw INT8 tensor codec.
pub const CODEC_TENSOR_INT8: u16 = 0x0004;

/// Compact binary struct codec. Mandatory.
pub const CODEC_BINARY_STRUCT: u16 = 0x0008;

/// Mixed-subtype latent pack: varuint count, then per tensor
/// `<subtype u8, varuint len, bytes>`.
pub const CODEC_MIXED_LATENT: u16 = 0x0010;

/// Self-contained columnar stream. Id reserved; the columnar engine binding
/// is an external collaborator.
pub const CODEC_ARROW_IPC: u16 = 0x0020;

/// Tensor header + opaque capsule bytes. Receiver copies before ACK.
pub const CODEC_DLPACK: u16 = 0x0021;

/// Numeric error codes carried in NACK bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// No error.
    Ok = 0x0000,
    /// Schema key unknown or message unintelligible after an intact CRC.
    SchemaUnknown = 0x0001,
    /// Body codec not in the negotiated set.
    CodecUnsupported = 0x0002,
    /// Reassembled message exceeded limits, or assembly capacity/deadline
    /// was exhausted.
    MessageTooLarge = 0x0003,
    /// Ether kind does not match what the codec or handler expects.
    KindMismatch = 0x0004,
}

impl ErrorCode {
    /// Numeric wire value.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire value. `None` if unassigned.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Ok),
            0x0001 => Some(Self::SchemaUnknown),
            0x0002 => Some(Self::CodecUnsupported),
            0x0003 => Some(Self::MessageTooLarge),
            0x0004 => Some(Self::KindMismatch),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::SchemaUnknown,
            ErrorCode::CodecUnsupported,
            ErrorCode::MessageTooLarge,
            ErrorCode::KindMismatch,
        ] {
            assert_eq!(ErrorCode::from_u16(code.to_u16()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(0x00FF), None);
    }
}
