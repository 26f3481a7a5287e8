//! Frame pack/parse: the smallest unit on the wire.
//!
//! Layout:
//!
//! ```text
//! +-------+---------+-------+------+----------+------------+---------+--------+
//! | magic | version | flags | HLEN | header   | PLEN       | payload | CRC32C |
//! | 4 B   | 1 B     | 1 B   | 2 B  | HLEN B   | 4 B (8 if  | PLEN B  | 4 B    |
//! |       |         |       |      |          | LARGE)     |         |        |
//! +-------+---------+-------+------+----------+------------+---------+--------+
//! ```
//!
//! All fixed integers little-endian. The CRC covers the payload bytes exactly
//! as written - after any compression or encryption. Packing does not apply
//! transforms and parsing does not reverse them; that is the session engine's
//! job.

use bytes::{Buf, BufMut, Bytes};

use crate::{
    FrameFlags, FrameHeader, MAGIC, VERSION,
    error::{ProtocolError, Result},
    version_major,
};

/// Which header form to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderForm {
    /// Compact binary struct (normative).
    #[default]
    Binary,
    /// JSON object (interop fallback).
    Json,
}

/// The fixed 8-byte frame preamble: magic, version, flags, HLEN.
///
/// Async drivers read exactly [`Preamble::LEN`] bytes, parse this, and then
/// know how many header bytes to read next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// Version byte (major nibble | minor nibble).
    pub version: u8,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Byte length of the header block that follows.
    pub header_len: u16,
}

impl Preamble {
    /// Serialized preamble length.
    pub const LEN: usize = 8;

    /// Parse the preamble from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::HeaderTruncated` if fewer than 8 bytes are available
    /// - `ProtocolError::BadMagic` if the first 4 bytes are wrong (decided
    ///   from those 4 bytes alone)
    /// - `ProtocolError::UnsupportedVersion` if the major version differs
    /// - `ProtocolError::HeaderMalformed` on unknown flag bits
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() >= 4 {
            let mut magic_bytes = &bytes[..4];
            let found = magic_bytes.get_u32_le();
            if found != MAGIC {
                return Err(ProtocolError::BadMagic { found });
            }
        }
        if bytes.len() < Self::LEN {
            return Err(ProtocolError::HeaderTruncated {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        let _magic = buf.get_u32_le();
        let version = buf.get_u8();
        if version_major(version) != version_major(VERSION) {
            return Err(ProtocolError::UnsupportedVersion { version });
        }
        let flags = FrameFlags::from_bits(buf.get_u8())?;
        let header_len = buf.get_u16_le();

        Ok(Self { version, flags, header_len })
    }
}

/// Complete protocol frame.
///
/// # Invariants
///
/// - The payload holds post-transform bytes; COMP/CRYPT flags describe what
///   was applied.
/// - LARGE is set whenever the payload exceeds `u32::MAX` bytes
///   ([`Frame::new`] enforces this; `encode` verifies it).
/// - The emitted CRC32C always matches the emitted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Version byte to emit; parsers accept any minor under the local major.
    pub version: u8,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Which header form this frame was built or parsed with.
    pub header_form: HeaderForm,
    /// Semantic header.
    pub header: FrameHeader,
    /// Payload bytes as they appear on the wire.
    pub payload: Bytes,
}

impl Frame {
    /// Byte length of the CRC32C trailer.
    pub const CRC_LEN: usize = 4;

    /// Create a frame, setting LARGE automatically for oversized payloads.
    #[must_use]
    pub fn new(header: FrameHeader, payload: impl Into<Bytes>, flags: FrameFlags) -> Self {
        let payload = payload.into();
        let flags =
            if payload.len() as u64 > u64::from(u32::MAX) { flags.with_large() } else { flags };
        Self { version: VERSION, flags, header_form: HeaderForm::Binary, header, payload }
    }

    /// Total encoded length with the given header form.
    #[must_use]
    pub fn encoded_len(&self, form: HeaderForm) -> usize {
        let header_len = match form {
            HeaderForm::Binary => self.header.binary_len(),
            // JSON length is not knowable without serializing; callers that
            // need exact sizing use the binary form.
            HeaderForm::Json => self.header.binary_len(),
        };
        Preamble::LEN + header_len + self.flags.plen_width() + self.payload.len() + Self::CRC_LEN
    }

    /// Pack with the frame's own header form (binary unless parsed from a
    /// JSON-headered frame).
    ///
    /// # Errors
    ///
    /// See [`Frame::encode_with`].
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        self.encode_with(dst, self.header_form)
    }

    /// Pack the frame: preamble, header, PLEN, payload, CRC32C.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::HeaderMalformed` if the header does not fit HLEN's
    ///   u16 or fails to serialize
    /// - `ProtocolError::FrameTooLarge` if the payload needs LARGE but the
    ///   flag is unset
    pub fn encode_with(&self, dst: &mut impl BufMut, form: HeaderForm) -> Result<()> {
        let mut header_buf = Vec::with_capacity(self.header.binary_len());
        match form {
            HeaderForm::Binary => self.header.encode_binary(&mut header_buf)?,
            HeaderForm::Json => self.header.encode_json(&mut header_buf)?,
        }
        let header_len = u16::try_from(header_buf.len()).map_err(|_| {
            ProtocolError::HeaderMalformed {
                reason: format!("header too large: {} bytes", header_buf.len()),
            }
        })?;

        let payload_len = self.payload.len() as u64;
        if payload_len > u64::from(u32::MAX) && !self.flags.is_large() {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: u64::from(u32::MAX),
            });
        }

        dst.put_u32_le(MAGIC);
        dst.put_u8(self.version);
        dst.put_u8(self.flags.bits());
        dst.put_u16_le(header_len);
        dst.put_slice(&header_buf);

        if self.flags.is_large() {
            dst.put_u64_le(payload_len);
        } else {
            dst.put_u32_le(payload_len as u32);
        }

        dst.put_slice(&self.payload);
        dst.put_u32_le(crc32c::crc32c(&self.payload));

        Ok(())
    }

    /// Parse one frame from the start of `bytes` with no payload bound.
    ///
    /// Returns the frame and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// See [`Frame::decode_bounded`].
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        Self::decode_bounded(bytes, u64::MAX)
    }

    /// Parse one frame, rejecting payloads larger than `max_payload_bytes`.
    ///
    /// Validation happens strictly before the payload is copied: magic, then
    /// version, then flags, then header, then PLEN against the bound, then
    /// payload presence, then CRC.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::BadMagic` / `UnsupportedVersion` /
    ///   `HeaderTruncated` / `HeaderMalformed` as in [`Preamble::decode`]
    ///   and [`FrameHeader::decode`]
    /// - `ProtocolError::FrameTooLarge` if PLEN exceeds the bound
    /// - `ProtocolError::PayloadTruncated` if the payload or trailer is
    ///   short
    /// - `ProtocolError::CrcMismatch` if the trailer does not match
    pub fn decode_bounded(bytes: &[u8], max_payload_bytes: u64) -> Result<(Self, usize)> {
        let preamble = Preamble::decode(bytes)?;
        let mut offset = Preamble::LEN;

        let header_len = preamble.header_len as usize;
        let available = bytes.len().saturating_sub(offset);
        if available < header_len {
            return Err(ProtocolError::HeaderTruncated {
                expected: header_len,
                actual: available,
            });
        }
        let header_block = &bytes[offset..offset + header_len];
        let header_form = if header_block.first() == Some(&b'{') {
            HeaderForm::Json
        } else {
            HeaderForm::Binary
        };
        let header = FrameHeader::decode(header_block)?;
        offset += header_len;

        let plen_width = preamble.flags.plen_width();
        let available = bytes.len().saturating_sub(offset);
        if available < plen_width {
            return Err(ProtocolError::PayloadTruncated {
                expected: plen_width,
                actual: available,
            });
        }
        let mut plen_bytes = &bytes[offset..offset + plen_width];
        let payload_len_u64 = if preamble.flags.is_large() {
            plen_bytes.get_u64_le()
        } else {
            u64::from(plen_bytes.get_u32_le())
        };
        offset += plen_width;

        if payload_len_u64 > max_payload_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len_u64,
                max: max_payload_bytes,
            });
        }
        let payload_len = usize::try_from(payload_len_u64).map_err(|_| {
            ProtocolError::FrameTooLarge { size: payload_len_u64, max: usize::MAX as u64 }
        })?;

        let needed = payload_len + Self::CRC_LEN;
        let available = bytes.len().saturating_sub(offset);
        if available < needed {
            return Err(ProtocolError::PayloadTruncated { expected: needed, actual: available });
        }

        let payload = Bytes::copy_from_slice(&bytes[offset..offset + payload_len]);
        offset += payload_len;

        let mut crc_bytes = &bytes[offset..offset + Self::CRC_LEN];
        let expected = crc_bytes.get_u32_le();
        offset += Self::CRC_LEN;

        let actual = crc32c::crc32c(&payload);
        if expected != actual {
            return Err(ProtocolError::CrcMismatch { expected, actual });
        }

        Ok((
            Self {
                version: preamble.version,
                flags: preamble.flags,
                header_form,
                header,
                payload,
            },
            offset,
        ))
    }
}
