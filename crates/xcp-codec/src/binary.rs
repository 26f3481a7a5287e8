//! Compact binary struct codec (`0x0008`).
//!
//! Tag-length-value encoding of the envelope for control bodies and small
//! data. Layout: a format byte, then `kind` / `schema_version` / `payload` /
//! `metadata` / optional `extra_fields` / attachment list, all little-endian
//! with LEB128 varuint lengths. Bytes are raw - never base64.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    codec::{CodecError, EtherCodec, Result},
    ether::{Attachment, AttachmentSource, Ether},
    value::{Value, ValueMap},
};

/// Format marker emitted as the first body byte.
const FORMAT_V1: u8 = 0x01;

// Value tags.
const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_I64: u8 = 0x03;
const TAG_U64: u8 = 0x04;
const TAG_F64: u8 = 0x05;
const TAG_STR: u8 = 0x06;
const TAG_BYTES: u8 = 0x07;
const TAG_LIST: u8 = 0x08;
const TAG_MAP: u8 = 0x09;

// Attachment source tags.
const SOURCE_URI: u8 = 0x00;
const SOURCE_INLINE: u8 = 0x01;

/// The mandatory binary struct codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryStructCodec;

impl EtherCodec for BinaryStructCodec {
    fn id(&self) -> u16 {
        xcp_proto::CODEC_BINARY_STRUCT
    }

    fn name(&self) -> &'static str {
        "binary_struct"
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn encode(&self, ether: &Ether) -> Result<Bytes> {
        ether.validate()?;

        let mut dst = BytesMut::with_capacity(64 + ether.kind.len());
        dst.put_u8(FORMAT_V1);
        put_str(&mut dst, &ether.kind);
        dst.put_u32_le(ether.schema_version);
        put_map_body(&mut dst, &ether.payload);
        put_map_body(&mut dst, &ether.metadata);
        match &ether.extra_fields {
            None => dst.put_u8(0),
            Some(extra) => {
                dst.put_u8(1);
                put_map_body(&mut dst, extra);
            },
        }
        put_varuint(&mut dst, ether.attachments.len() as u64);
        for attachment in &ether.attachments {
            put_attachment(&mut dst, attachment);
        }

        Ok(dst.freeze())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ether> {
        let mut buf = bytes;

        let format = get_u8(&mut buf)?;
        if format != FORMAT_V1 {
            return Err(malformed(format!("unknown format byte {format:#04x}")));
        }

        let kind = get_str(&mut buf)?;
        let schema_version = get_u32(&mut buf)?;
        let payload = get_map_body(&mut buf)?;
        let metadata = get_map_body(&mut buf)?;
        let extra_fields = match get_u8(&mut buf)? {
            0 => None,
            1 => Some(get_map_body(&mut buf)?),
            other => return Err(malformed(format!("bad extra_fields marker {other}"))),
        };

        let attachment_count = get_varuint(&mut buf)? as usize;
        let mut attachments = Vec::with_capacity(attachment_count.min(64));
        for _ in 0..attachment_count {
            attachments.push(get_attachment(&mut buf)?);
        }

        if buf.has_remaining() {
            return Err(malformed(format!("{} trailing bytes", buf.remaining())));
        }

        let ether =
            Ether { kind, schema_version, payload, metadata, extra_fields, attachments };
        ether.validate()?;
        Ok(ether)
    }
}

fn malformed(reason: String) -> CodecError {
    CodecError::Malformed { codec: "binary_struct", reason }
}

/// LEB128 unsigned varint, as in protobuf.
pub(crate) fn put_varuint(dst: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Read a LEB128 varuint; at most 10 bytes.
pub(crate) fn get_varuint(buf: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = get_u8(buf)?;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            if shift == 63 && byte > 1 {
                return Err(malformed("varuint overflows u64".to_string()));
            }
            return Ok(value);
        }
    }
    Err(malformed("varuint longer than 10 bytes".to_string()))
}

pub(crate) fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.is_empty() {
        return Err(malformed("unexpected end of body".to_string()));
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(malformed("unexpected end of body".to_string()));
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(malformed("unexpected end of body".to_string()));
    }
    Ok(buf.get_u64_le())
}

pub(crate) fn get_exact(buf: &mut &[u8], len: usize) -> Result<Bytes> {
    if buf.remaining() < len {
        return Err(malformed(format!("need {len} bytes, have {}", buf.remaining())));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(Bytes::from(out))
}

fn put_str(dst: &mut impl BufMut, text: &str) {
    put_varuint(dst, text.len() as u64);
    dst.put_slice(text.as_bytes());
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    let len = get_varuint(buf)? as usize;
    let raw = get_exact(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| malformed("string is not UTF-8".to_string()))
}

fn put_value(dst: &mut impl BufMut, value: &Value) {
    match value {
        Value::Null => dst.put_u8(TAG_NULL),
        Value::Bool(false) => dst.put_u8(TAG_FALSE),
        Value::Bool(true) => dst.put_u8(TAG_TRUE),
        Value::I64(v) => {
            dst.put_u8(TAG_I64);
            dst.put_i64_le(*v);
        },
        Value::U64(v) => {
            dst.put_u8(TAG_U64);
            dst.put_u64_le(*v);
        },
        Value::F64(v) => {
            dst.put_u8(TAG_F64);
            dst.put_f64_le(*v);
        },
        Value::Str(s) => {
            dst.put_u8(TAG_STR);
            put_str(dst, s);
        },
        Value::Bytes(b) => {
            dst.put_u8(TAG_BYTES);
            put_varuint(dst, b.len() as u64);
            dst.put_slice(b);
        },
        Value::List(items) => {
            dst.put_u8(TAG_LIST);
            put_varuint(dst, items.len() as u64);
            for item in items {
                put_value(dst, item);
            }
        },
        Value::Map(map) => {
            dst.put_u8(TAG_MAP);
            put_map_body(dst, map);
        },
    }
}

fn get_value(buf: &mut &[u8]) -> Result<Value> {
    Ok(match get_u8(buf)? {
        TAG_NULL => Value::Null,
        TAG_FALSE => Value::Bool(false),
        TAG_TRUE => Value::Bool(true),
        TAG_I64 => {
            if buf.remaining() < 8 {
                return Err(malformed("unexpected end of body".to_string()));
            }
            Value::I64(buf.get_i64_le())
        },
        TAG_U64 => Value::U64(get_u64(buf)?),
        TAG_F64 => {
            if buf.remaining() < 8 {
                return Err(malformed("unexpected end of body".to_string()));
            }
            Value::F64(buf.get_f64_le())
        },
        TAG_STR => Value::Str(get_str(buf)?),
        TAG_BYTES => {
            let len = get_varuint(buf)? as usize;
            Value::Bytes(get_exact(buf, len)?)
        },
        TAG_LIST => {
            let count = get_varuint(buf)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(get_value(buf)?);
            }
            Value::List(items)
        },
        TAG_MAP => Value::Map(get_map_body(buf)?),
        tag => return Err(malformed(format!("unknown value tag {tag:#04x}"))),
    })
}

fn put_map_body(dst: &mut impl BufMut, map: &ValueMap) {
    put_varuint(dst, map.len() as u64);
    for (key, value) in map {
        put_str(dst, key);
        put_value(dst, value);
    }
}

fn get_map_body(buf: &mut &[u8]) -> Result<ValueMap> {
    let count = get_varuint(buf)? as usize;
    let mut map = ValueMap::new();
    for _ in 0..count {
        let key = get_str(buf)?;
        let value = get_value(buf)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn put_attachment(dst: &mut impl BufMut, attachment: &Attachment) {
    put_str(dst, &attachment.id);
    match &attachment.source {
        AttachmentSource::Uri(uri) => {
            dst.put_u8(SOURCE_URI);
            put_str(dst, uri);
        },
        AttachmentSource::Inline(data) => {
            dst.put_u8(SOURCE_INLINE);
            put_varuint(dst, data.len() as u64);
            dst.put_slice(data);
        },
    }
    put_str(dst, &attachment.media_type);
    put_str(dst, &attachment.codec);
    put_varuint(dst, attachment.shape.len() as u64);
    for dim in &attachment.shape {
        dst.put_u32_le(*dim);
    }
    put_str(dst, &attachment.dtype);
    dst.put_u64_le(attachment.size_bytes);
}

fn get_attachment(buf: &mut &[u8]) -> Result<Attachment> {
    let id = get_str(buf)?;
    let source = match get_u8(buf)? {
        SOURCE_URI => AttachmentSource::Uri(get_str(buf)?),
        SOURCE_INLINE => {
            let len = get_varuint(buf)? as usize;
            AttachmentSource::Inline(get_exact(buf, len)?)
        },
        tag => return Err(malformed(format!("unknown attachment source tag {tag:#04x}"))),
    };
    let media_type = get_str(buf)?;
    let codec = get_str(buf)?;

    let shape_len = get_varuint(buf)? as usize;
    let mut shape = Vec::with_capacity(shape_len.min(64));
    for _ in 0..shape_len {
        shape.push(get_u32(buf)?);
    }

    let dtype = get_str(buf)?;
    let size_bytes = get_u64(buf)?;

    Ok(Attachment { id, source, media_type, codec, shape, dtype, size_bytes })
}
