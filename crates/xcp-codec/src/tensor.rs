//! Tensor codecs: raw bodies prefixed by the fixed tensor header.
//!
//! These codecs cover exactly the canonical single-tensor envelope form
//! (see below) and refuse anything else as unrepresentable - the header has
//! nowhere to put arbitrary metadata, and silently dropping it would break
//! round-trips.
//!
//! Canonical form for `tensor.f32` / `tensor.f16` / `tensor.int8`:
//!
//! - `kind` = the codec's tensor kind, `schema_version` = 1
//! - `payload["data"]` raw element bytes, `payload["shape"]` list of dims
//! - optional `payload["scale"]` (f32-exact), `payload["row_quantized"]`,
//!   `payload["col_major"]` (present only when true)
//! - empty metadata, no extra fields, no attachments

use bytes::{BufMut, Bytes, BytesMut};
use xcp_proto::{
    DType, TENSOR_FLAG_COL_MAJOR, TENSOR_FLAG_ROW_QUANTIZED, TensorHeader,
};

use crate::{
    binary::{get_exact, get_u8, get_varuint, put_varuint},
    codec::{CodecError, EtherCodec, Result},
    ether::Ether,
    value::{Value, ValueMap},
};

/// Raw tensor codec, one instance per element type.
#[derive(Debug, Clone, Copy)]
pub struct TensorCodec {
    dtype: DType,
}

impl TensorCodec {
    /// F32 tensor codec (`0x0002`).
    pub const F32: Self = Self { dtype: DType::F32 };
    /// F16 tensor codec (`0x0003`).
    pub const F16: Self = Self { dtype: DType::F16 };
    /// INT8 tensor codec (`0x0004`).
    pub const INT8: Self = Self { dtype: DType::Int8 };

    /// The envelope kind this codec represents.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.dtype {
            DType::F32 => "tensor.f32",
            DType::F16 => "tensor.f16",
            DType::Int8 => "tensor.int8",
        }
    }
}

impl EtherCodec for TensorCodec {
    fn id(&self) -> u16 {
        match self.dtype {
            DType::F32 => xcp_proto::CODEC_TENSOR_F32,
            DType::F16 => xcp_proto::CODEC_TENSOR_F16,
            DType::Int8 => xcp_proto::CODEC_TENSOR_INT8,
        }
    }

    fn name(&self) -> &'static str {
        match self.dtype {
            DType::F32 => "tensor_f32",
            DType::F16 => "tensor_f16",
            DType::Int8 => "tensor_int8",
        }
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn encode(&self, ether: &Ether) -> Result<Bytes> {
        ether.validate()?;
        let parts = TensorParts::from_ether(ether, self.name(), self.kind())?;

        let expected = parts
            .element_count()
            .and_then(|n| n.checked_mul(self.dtype.element_size() as u64));
        if expected != Some(parts.data.len() as u64) {
            return Err(CodecError::Unrepresentable {
                codec: self.name(),
                reason: format!(
                    "data length {} does not match shape {:?} for {:?}",
                    parts.data.len(),
                    parts.shape,
                    self.dtype
                ),
            });
        }

        let header = TensorHeader::new(self.dtype, &parts.shape, parts.flags, parts.scale)?;

        let mut dst = BytesMut::with_capacity(TensorHeader::SIZE + parts.data.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&parts.data);
        Ok(dst.freeze())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ether> {
        let (header, body) = TensorHeader::parse(bytes)?;
        if header.dtype() != self.dtype {
            return Err(CodecError::Malformed {
                codec: self.name(),
                reason: format!("header dtype {:?}, codec expects {:?}", header.dtype(), self.dtype),
            });
        }
        if header.body_len() != Some(body.len() as u64) {
            return Err(CodecError::Malformed {
                codec: self.name(),
                reason: format!(
                    "body length {} does not match header shape {:?}",
                    body.len(),
                    header.shape()
                ),
            });
        }

        TensorParts {
            data: Bytes::copy_from_slice(body),
            shape: header.shape(),
            scale: header.scale(),
            flags: header.flags(),
        }
        .into_ether(self.kind())
    }
}

/// The canonical tensor fields shared by [`TensorCodec`] and
/// [`DlpackCodec`].
struct TensorParts {
    data: Bytes,
    shape: Vec<u32>,
    scale: f32,
    flags: u8,
}

impl TensorParts {
    fn element_count(&self) -> Option<u64> {
        self.shape.iter().map(|d| u64::from(*d)).try_fold(1u64, u64::checked_mul)
    }

    fn from_ether(ether: &Ether, codec: &'static str, kind: &'static str) -> Result<Self> {
        let unrepresentable = |reason: String| CodecError::Unrepresentable { codec, reason };

        if ether.kind != kind {
            return Err(unrepresentable(format!("kind {:?}, expected {kind:?}", ether.kind)));
        }
        if ether.schema_version != 1 {
            return Err(unrepresentable("schema_version must be 1".to_string()));
        }
        if !ether.metadata.is_empty()
            || ether.extra_fields.is_some()
            || !ether.attachments.is_empty()
        {
            return Err(unrepresentable(
                "metadata, extra fields, and attachments have no tensor encoding".to_string(),
            ));
        }

        let data = ether
            .payload
            .get("data")
            .and_then(Value::as_bytes)
            .ok_or_else(|| unrepresentable("payload.data (bytes) required".to_string()))?
            .clone();

        let shape = ether
            .payload
            .get("shape")
            .and_then(Value::as_list)
            .ok_or_else(|| unrepresentable("payload.shape (list) required".to_string()))?
            .iter()
            .map(|dim| {
                dim.as_u64()
                    .and_then(|d| u32::try_from(d).ok())
                    .ok_or_else(|| unrepresentable("shape dims must be u32".to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let scale = match ether.payload.get("scale") {
            None => 1.0f32,
            Some(value) => {
                let wide = value
                    .as_f64()
                    .ok_or_else(|| unrepresentable("scale must be numeric".to_string()))?;
                let narrow = wide as f32;
                if f64::from(narrow) != wide {
                    return Err(unrepresentable(format!(
                        "scale {wide} is not exactly representable as f32"
                    )));
                }
                narrow
            },
        };

        let mut flags = 0u8;
        if ether.payload.get("row_quantized").and_then(Value::as_bool) == Some(true) {
            flags |= TENSOR_FLAG_ROW_QUANTIZED;
        }
        if ether.payload.get("col_major").and_then(Value::as_bool) == Some(true) {
            flags |= TENSOR_FLAG_COL_MAJOR;
        }

        for key in ether.payload.keys() {
            if !matches!(key.as_str(), "data" | "shape" | "scale" | "row_quantized" | "col_major")
            {
                return Err(unrepresentable(format!("payload key {key:?} has no encoding")));
            }
        }

        Ok(Self { data, shape, scale, flags })
    }

    fn into_ether(self, kind: &'static str) -> Result<Ether> {
        let mut payload = ValueMap::new();
        payload.insert("data".to_string(), Value::Bytes(self.data));
        payload.insert(
            "shape".to_string(),
            Value::List(self.shape.iter().map(|d| Value::U64(u64::from(*d))).collect()),
        );
        if self.scale != 1.0 {
            payload.insert("scale".to_string(), Value::F64(f64::from(self.scale)));
        }
        if self.flags & TENSOR_FLAG_ROW_QUANTIZED != 0 {
            payload.insert("row_quantized".to_string(), Value::Bool(true));
        }
        if self.flags & TENSOR_FLAG_COL_MAJOR != 0 {
            payload.insert("col_major".to_string(), Value::Bool(true));
        }

        let mut ether = Ether::new(kind, 1)?;
        ether.payload = payload;
        Ok(ether)
    }
}

/// Mixed-subtype latent pack (`0x0010`).
///
/// Body: varuint tensor count, then per tensor `<subtype u8, varuint len,
/// bytes>`. Canonical form: `kind = "tensor.mixed"`, `schema_version` 1,
/// `payload["tensors"]` a list of `{subtype: U64 <= 255, data: Bytes}` maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct MixedLatentCodec;

impl MixedLatentCodec {
    /// The envelope kind this codec represents.
    pub const KIND: &'static str = "tensor.mixed";
}

impl EtherCodec for MixedLatentCodec {
    fn id(&self) -> u16 {
        xcp_proto::CODEC_MIXED_LATENT
    }

    fn name(&self) -> &'static str {
        "mixed_latent"
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn encode(&self, ether: &Ether) -> Result<Bytes> {
        ether.validate()?;
        let unrepresentable =
            |reason: String| CodecError::Unrepresentable { codec: "mixed_latent", reason };

        if ether.kind != Self::KIND {
            return Err(unrepresentable(format!("kind {:?}, expected {:?}", ether.kind, Self::KIND)));
        }
        if ether.schema_version != 1 {
            return Err(unrepresentable("schema_version must be 1".to_string()));
        }
        if !ether.metadata.is_empty()
            || ether.extra_fields.is_some()
            || !ether.attachments.is_empty()
            || ether.payload.len() != 1
        {
            return Err(unrepresentable(
                "canonical form carries only payload.tensors".to_string(),
            ));
        }
        let tensors = ether
            .payload
            .get("tensors")
            .and_then(Value::as_list)
            .ok_or_else(|| unrepresentable("payload.tensors (list) required".to_string()))?;

        let mut dst = BytesMut::new();
        put_varuint(&mut dst, tensors.len() as u64);
        for tensor in tensors {
            let map = tensor
                .as_map()
                .ok_or_else(|| unrepresentable("tensor entry must be a map".to_string()))?;
            let subtype = map
                .get("subtype")
                .and_then(Value::as_u64)
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| unrepresentable("tensor subtype must be a u8".to_string()))?;
            let data = map
                .get("data")
                .and_then(Value::as_bytes)
                .ok_or_else(|| unrepresentable("tensor data must be bytes".to_string()))?;
            if map.len() != 2 {
                return Err(unrepresentable("tensor entry has extra keys".to_string()));
            }

            dst.put_u8(subtype);
            put_varuint(&mut dst, data.len() as u64);
            dst.put_slice(data);
        }

        Ok(dst.freeze())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ether> {
        let mut buf = bytes;
        let count = get_varuint(&mut buf)? as usize;

        let mut tensors = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let subtype = get_u8(&mut buf)?;
            let len = get_varuint(&mut buf)? as usize;
            let data = get_exact(&mut buf, len)?;

            let mut entry = ValueMap::new();
            entry.insert("subtype".to_string(), Value::U64(u64::from(subtype)));
            entry.insert("data".to_string(), Value::Bytes(data));
            tensors.push(Value::Map(entry));
        }

        if !buf.is_empty() {
            return Err(CodecError::Malformed {
                codec: "mixed_latent",
                reason: format!("{} trailing bytes", buf.len()),
            });
        }

        let mut ether = Ether::new(Self::KIND, 1)?;
        ether.payload.insert("tensors".to_string(), Value::List(tensors));
        Ok(ether)
    }
}

/// DLPack capsule codec (`0x0021`).
///
/// Body: tensor header + opaque capsule bytes. Unlike the raw tensor codecs
/// the capsule length is not derivable from the shape, so the body length is
/// not validated against it; receivers must copy or consume the capsule
/// before acknowledging the frame. Canonical form adds `payload["dtype"]`
/// (`"f32"` / `"f16"` / `"int8"`) and names the bytes `payload["capsule"]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DlpackCodec;

impl DlpackCodec {
    /// The envelope kind this codec represents.
    pub const KIND: &'static str = "tensor.dlpack";
}

fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "f32",
        DType::F16 => "f16",
        DType::Int8 => "int8",
    }
}

fn dtype_from_name(name: &str) -> Option<DType> {
    match name {
        "f32" => Some(DType::F32),
        "f16" => Some(DType::F16),
        "int8" => Some(DType::Int8),
        _ => None,
    }
}

impl EtherCodec for DlpackCodec {
    fn id(&self) -> u16 {
        xcp_proto::CODEC_DLPACK
    }

    fn name(&self) -> &'static str {
        "dlpack"
    }

    fn is_binary(&self) -> bool {
        true
    }

    fn encode(&self, ether: &Ether) -> Result<Bytes> {
        ether.validate()?;
        let unrepresentable =
            |reason: String| CodecError::Unrepresentable { codec: "dlpack", reason };

        if ether.kind != Self::KIND {
            return Err(unrepresentable(format!("kind {:?}, expected {:?}", ether.kind, Self::KIND)));
        }
        if ether.schema_version != 1 {
            return Err(unrepresentable("schema_version must be 1".to_string()));
        }
        if !ether.metadata.is_empty()
            || ether.extra_fields.is_some()
            || !ether.attachments.is_empty()
        {
            return Err(unrepresentable(
                "metadata, extra fields, and attachments have no dlpack encoding".to_string(),
            ));
        }

        let capsule = ether
            .payload
            .get("capsule")
            .and_then(Value::as_bytes)
            .ok_or_else(|| unrepresentable("payload.capsule (bytes) required".to_string()))?;
        let dtype = ether
            .payload
            .get("dtype")
            .and_then(Value::as_str)
            .and_then(dtype_from_name)
            .ok_or_else(|| unrepresentable("payload.dtype must be f32|f16|int8".to_string()))?;
        let shape = ether
            .payload
            .get("shape")
            .and_then(Value::as_list)
            .ok_or_else(|| unrepresentable("payload.shape (list) required".to_string()))?
            .iter()
            .map(|dim| {
                dim.as_u64()
                    .and_then(|d| u32::try_from(d).ok())
                    .ok_or_else(|| unrepresentable("shape dims must be u32".to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        for key in ether.payload.keys() {
            if !matches!(key.as_str(), "capsule" | "dtype" | "shape") {
                return Err(unrepresentable(format!("payload key {key:?} has no encoding")));
            }
        }

        let header = TensorHeader::new(dtype, &shape, 0, 1.0)?;
        let mut dst = BytesMut::with_capacity(TensorHeader::SIZE + capsule.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(capsule);
        Ok(dst.freeze())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ether> {
        let (header, body) = TensorHeader::parse(bytes)?;

        let mut ether = Ether::new(Self::KIND, 1)?;
        ether.payload.insert("capsule".to_string(), Value::Bytes(Bytes::copy_from_slice(body)));
        ether.payload.insert(
            "shape".to_string(),
            Value::List(header.shape().iter().map(|d| Value::U64(u64::from(*d))).collect()),
        );
        ether
            .payload
            .insert("dtype".to_string(), Value::Str(dtype_name(header.dtype()).to_string()));
        Ok(ether)
    }
}
