//! Frame header: semantic routing fields in binary or JSON form.
//!
//! The binary form is normative: a leading tag byte [`FrameHeader::BINARY_TAG`]
//! followed by fixed little-endian fields and a tag-length-value list. The
//! JSON fallback (first byte `{`) exists for interop with peers that cannot
//! emit the binary form; implementations may refuse it under a binary-only
//! policy. Parsers dispatch on the first byte, which is why the binary tag
//! must differ from `{` (0x7B).

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::{
    MsgType, SchemaKey,
    error::{ProtocolError, Result},
};

/// Semantic header of a frame.
///
/// `msg_type` below `0x0100` is control; control frames carry the zero
/// schema key. `msg_id` 0 is reserved for "unset" and never allocated by a
/// session. `in_reply_to` 0 means "not a reply".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Independent ordered substream within the connection.
    pub channel_id: u32,
    /// Message type (see [`MsgType`]).
    pub msg_type: u16,
    /// Codec id used to encode the payload body.
    pub body_codec: u16,
    /// Schema identity of the body; zero for control frames.
    pub schema_key: SchemaKey,
    /// Sender-allocated message id, strictly monotonic per connection.
    pub msg_id: u64,
    /// Message id this frame responds to; 0 = none.
    pub in_reply_to: u64,
    /// Ordered application tags.
    #[serde(default)]
    pub tags: Vec<(String, String)>,
}

impl FrameHeader {
    /// Leading byte of the binary header form. Must stay distinct from `{`.
    pub const BINARY_TAG: u8 = 0xB1;

    /// Byte length of the fixed binary fields (tag through tag count).
    ///
    /// 1 (tag) + 4 (channel) + 2 (msg_type) + 2 (codec) + 28 (schema key)
    /// + 8 (msg_id) + 8 (in_reply_to) + 2 (tag count).
    pub const BINARY_FIXED_LEN: usize = 55;

    /// Control header: zero schema key, given codec for the body.
    #[must_use]
    pub fn control(msg_type: MsgType, body_codec: u16) -> Self {
        debug_assert!(msg_type.is_control());
        Self {
            channel_id: 0,
            msg_type: msg_type.to_u16(),
            body_codec,
            schema_key: SchemaKey::ZERO,
            msg_id: 0,
            in_reply_to: 0,
            tags: Vec::new(),
        }
    }

    /// Data header on a channel.
    #[must_use]
    pub fn data(channel_id: u32, msg_type: u16, body_codec: u16, schema_key: SchemaKey) -> Self {
        debug_assert!(msg_type >= MsgType::DATA_MIN);
        Self {
            channel_id,
            msg_type,
            body_codec,
            schema_key,
            msg_id: 0,
            in_reply_to: 0,
            tags: Vec::new(),
        }
    }

    /// Message type as enum. `None` for reserved control values.
    #[must_use]
    pub fn msg_type_enum(&self) -> Option<MsgType> {
        MsgType::from_u16(self.msg_type)
    }

    /// True for the control range.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.msg_type < MsgType::DATA_MIN
    }

    /// Encoded length of the binary form.
    #[must_use]
    pub fn binary_len(&self) -> usize {
        let mut len = Self::BINARY_FIXED_LEN;
        for (key, value) in &self.tags {
            len += 4 + key.len() + value.len();
        }
        len
    }

    /// Emit the binary form.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::HeaderMalformed` if a tag key/value exceeds the u16
    ///   length prefix, or the tag list exceeds the u16 count.
    pub fn encode_binary(&self, dst: &mut impl BufMut) -> Result<()> {
        let tag_count = u16::try_from(self.tags.len()).map_err(|_| {
            ProtocolError::HeaderMalformed { reason: "too many tags".to_string() }
        })?;

        dst.put_u8(Self::BINARY_TAG);
        dst.put_u32_le(self.channel_id);
        dst.put_u16_le(self.msg_type);
        dst.put_u16_le(self.body_codec);
        dst.put_u32_le(self.schema_key.ns_hash);
        dst.put_u32_le(self.schema_key.kind_id);
        dst.put_u16_le(self.schema_key.major);
        dst.put_u16_le(self.schema_key.minor);
        dst.put_slice(&self.schema_key.hash128);
        dst.put_u64_le(self.msg_id);
        dst.put_u64_le(self.in_reply_to);
        dst.put_u16_le(tag_count);

        for (key, value) in &self.tags {
            let klen = u16::try_from(key.len()).map_err(|_| ProtocolError::HeaderMalformed {
                reason: format!("tag key too long: {} bytes", key.len()),
            })?;
            let vlen = u16::try_from(value.len()).map_err(|_| {
                ProtocolError::HeaderMalformed {
                    reason: format!("tag value too long: {} bytes", value.len()),
                }
            })?;
            dst.put_u16_le(klen);
            dst.put_slice(key.as_bytes());
            dst.put_u16_le(vlen);
            dst.put_slice(value.as_bytes());
        }

        Ok(())
    }

    /// Emit the JSON fallback form.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::HeaderMalformed` if serialization fails.
    pub fn encode_json(&self, dst: &mut impl BufMut) -> Result<()> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ProtocolError::HeaderMalformed { reason: e.to_string() })?;
        dst.put_slice(&json);
        Ok(())
    }

    /// Parse a header block, dispatching on the leading byte.
    ///
    /// The caller passes exactly the HLEN bytes from the frame; trailing
    /// garbage inside the block is an error.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::HeaderMalformed` on an empty block, an unknown
    ///   leading byte, short fields, non-UTF-8 tags, trailing bytes, or
    ///   invalid JSON.
    pub fn decode(block: &[u8]) -> Result<Self> {
        match block.first() {
            None => Err(ProtocolError::HeaderMalformed { reason: "empty header".to_string() }),
            Some(&Self::BINARY_TAG) => Self::decode_binary(block),
            Some(b'{') => serde_json::from_slice(block)
                .map_err(|e| ProtocolError::HeaderMalformed { reason: e.to_string() }),
            Some(&other) => Err(ProtocolError::HeaderMalformed {
                reason: format!("unknown header form, leading byte {other:#04x}"),
            }),
        }
    }

    fn decode_binary(block: &[u8]) -> Result<Self> {
        if block.len() < Self::BINARY_FIXED_LEN {
            return Err(ProtocolError::HeaderMalformed {
                reason: format!(
                    "binary header needs {} bytes, got {}",
                    Self::BINARY_FIXED_LEN,
                    block.len()
                ),
            });
        }

        let mut buf = block;
        let _tag = buf.get_u8();
        let channel_id = buf.get_u32_le();
        let msg_type = buf.get_u16_le();
        let body_codec = buf.get_u16_le();

        let ns_hash = buf.get_u32_le();
        let kind_id = buf.get_u32_le();
        let major = buf.get_u16_le();
        let minor = buf.get_u16_le();
        let mut hash128 = [0u8; 16];
        buf.copy_to_slice(&mut hash128);
        let schema_key = SchemaKey { ns_hash, kind_id, major, minor, hash128 };

        let msg_id = buf.get_u64_le();
        let in_reply_to = buf.get_u64_le();
        let tag_count = buf.get_u16_le() as usize;

        let mut tags = Vec::with_capacity(tag_count.min(64));
        for _ in 0..tag_count {
            let key = read_tag_string(&mut buf)?;
            let value = read_tag_string(&mut buf)?;
            tags.push((key, value));
        }

        if buf.has_remaining() {
            return Err(ProtocolError::HeaderMalformed {
                reason: format!("{} trailing bytes after header", buf.remaining()),
            });
        }

        Ok(Self { channel_id, msg_type, body_codec, schema_key, msg_id, in_reply_to, tags })
    }
}

/// Read one u16-length-prefixed UTF-8 string of a tag pair.
fn read_tag_string(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::HeaderMalformed {
            reason: "tag length prefix truncated".to_string(),
        });
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::HeaderMalformed {
            reason: format!("tag body truncated: need {len}, have {}", buf.remaining()),
        });
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw)
        .map_err(|_| ProtocolError::HeaderMalformed { reason: "tag is not UTF-8".to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FrameHeader {
        let mut header = FrameHeader::data(
            7,
            0x0100,
            crate::CODEC_BINARY_STRUCT,
            SchemaKey::derive("agents", "embedding", 1, 2, "{}"),
        );
        header.msg_id = 42;
        header.in_reply_to = 17;
        header.tags.push(("trace".to_string(), "abc123".to_string()));
        header
    }

    #[test]
    fn binary_round_trip() {
        let header = sample_header();
        let mut buf = Vec::new();
        header.encode_binary(&mut buf).unwrap();
        assert_eq!(buf.len(), header.binary_len());
        assert_eq!(buf[0], FrameHeader::BINARY_TAG);

        let decoded = FrameHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn json_round_trip() {
        let header = sample_header();
        let mut buf = Vec::new();
        header.encode_json(&mut buf).unwrap();
        assert_eq!(buf[0], b'{');

        let decoded = FrameHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn binary_tag_is_not_brace() {
        assert_ne!(FrameHeader::BINARY_TAG, b'{');
    }

    #[test]
    fn reject_unknown_leading_byte() {
        let result = FrameHeader::decode(&[0x00, 0x01, 0x02]);
        assert!(matches!(result, Err(ProtocolError::HeaderMalformed { .. })));
    }

    #[test]
    fn reject_trailing_bytes() {
        let header = FrameHeader::control(MsgType::Ping, crate::CODEC_JSON);
        let mut buf = Vec::new();
        header.encode_binary(&mut buf).unwrap();
        buf.push(0xFF);

        let result = FrameHeader::decode(&buf);
        assert!(matches!(result, Err(ProtocolError::HeaderMalformed { .. })));
    }

    #[test]
    fn reject_truncated_tag() {
        let header = sample_header();
        let mut buf = Vec::new();
        header.encode_binary(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);

        let result = FrameHeader::decode(&buf);
        assert!(matches!(result, Err(ProtocolError::HeaderMalformed { .. })));
    }

    #[test]
    fn control_header_has_zero_schema() {
        let header = FrameHeader::control(MsgType::Ack, crate::CODEC_JSON);
        assert!(header.is_control());
        assert!(header.schema_key.is_zero());
        assert_eq!(header.msg_type_enum(), Some(MsgType::Ack));
    }
}
