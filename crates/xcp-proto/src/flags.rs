//! Frame flags bitfield.

use crate::error::{ProtocolError, Result};

/// Per-frame flags carried in byte 5 of the preamble.
///
/// COMP and CRYPT describe transforms already applied to the payload bytes on
/// the wire. MORE marks a non-final chunk of a multi-frame message. LARGE
/// widens PLEN from 4 to 8 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is zstd-compressed.
    pub const COMP: u8 = 0x01;
    /// Payload is AEAD-encrypted.
    pub const CRYPT: u8 = 0x02;
    /// More chunks of this message follow.
    pub const MORE: u8 = 0x04;
    /// PLEN is 8 bytes instead of 4.
    pub const LARGE: u8 = 0x08;

    /// Flag bits defined for protocol version 0.2.
    const VALID_MASK: u8 = 0x0F;

    /// Empty flag set.
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Set COMP.
    #[must_use]
    pub fn with_comp(mut self) -> Self {
        self.0 |= Self::COMP;
        self
    }

    /// Set CRYPT.
    #[must_use]
    pub fn with_crypt(mut self) -> Self {
        self.0 |= Self::CRYPT;
        self
    }

    /// Set MORE.
    #[must_use]
    pub fn with_more(mut self) -> Self {
        self.0 |= Self::MORE;
        self
    }

    /// Set LARGE.
    #[must_use]
    pub fn with_large(mut self) -> Self {
        self.0 |= Self::LARGE;
        self
    }

    /// True if the payload is compressed.
    #[must_use]
    pub fn is_comp(self) -> bool {
        self.0 & Self::COMP != 0
    }

    /// True if the payload is encrypted.
    #[must_use]
    pub fn is_crypt(self) -> bool {
        self.0 & Self::CRYPT != 0
    }

    /// True if more chunks follow.
    #[must_use]
    pub fn is_more(self) -> bool {
        self.0 & Self::MORE != 0
    }

    /// True if PLEN is 8 bytes wide.
    #[must_use]
    pub fn is_large(self) -> bool {
        self.0 & Self::LARGE != 0
    }

    /// Width in bytes of the PLEN field for this flag set.
    #[must_use]
    pub fn plen_width(self) -> usize {
        if self.is_large() { 8 } else { 4 }
    }

    /// Raw flag byte.
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Parse a flag byte.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::HeaderMalformed` if bits outside the version 0.2 set
    ///   are present. Unknown flags would change framing (transforms, PLEN
    ///   width), so they cannot be ignored.
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::VALID_MASK != 0 {
            return Err(ProtocolError::HeaderMalformed {
                reason: format!("unknown flag bits {bits:#04x}"),
            });
        }
        Ok(Self(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_bits() {
        let flags = FrameFlags::new().with_comp().with_large();
        assert!(flags.is_comp());
        assert!(!flags.is_crypt());
        assert!(flags.is_large());
        assert_eq!(flags.bits(), 0x09);
        assert_eq!(flags.plen_width(), 8);
    }

    #[test]
    fn reject_unknown_bits() {
        assert!(FrameFlags::from_bits(0x10).is_err());
        assert!(FrameFlags::from_bits(0xF0).is_err());
        assert_eq!(FrameFlags::from_bits(0x0F).map(FrameFlags::bits), Ok(0x0F));
    }
}
