//! Fixed tensor header prefixed to raw little-endian tensor bodies.
//!
//! The header is a flat byte struct so it can be cast from untrusted input
//! without copying; every bit pattern is memory-safe and validation happens
//! explicitly afterwards.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{ProtocolError, Result};

/// Tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    /// 32-bit IEEE float.
    F32 = 0,
    /// 16-bit IEEE float.
    F16 = 1,
    /// Signed 8-bit integer.
    Int8 = 2,
}

impl DType {
    /// Parse the wire value. `None` if unassigned.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::F32),
            1 => Some(Self::F16),
            2 => Some(Self::Int8),
            _ => None,
        }
    }

    /// Bytes per element.
    #[must_use]
    pub fn element_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Int8 => 1,
        }
    }
}

/// Maximum tensor rank.
pub const MAX_NDIM: usize = 8;

/// Tensor layout flag: per-row quantization scales apply.
pub const TENSOR_FLAG_ROW_QUANTIZED: u8 = 0x01;
/// Tensor layout flag: column-major element order.
pub const TENSOR_FLAG_COL_MAJOR: u8 = 0x02;

const TENSOR_FLAG_MASK: u8 = TENSOR_FLAG_ROW_QUANTIZED | TENSOR_FLAG_COL_MAJOR;

/// Fixed header prefixed to a raw tensor body.
///
/// Fields are raw little-endian byte arrays to keep the struct free of
/// padding and alignment requirements; accessors convert. Unused shape
/// slots are zero.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TensorHeader {
    ndim: u8,
    dtype: u8,
    flags: u8,
    _pad: u8,
    shape: [[u8; 4]; MAX_NDIM],
    scale: [u8; 4],
}

impl TensorHeader {
    /// Serialized header size.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Build a header for the given shape.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TensorMalformed` if the rank is 0 or exceeds
    ///   [`MAX_NDIM`], or flags carry unknown bits.
    pub fn new(dtype: DType, shape: &[u32], flags: u8, scale: f32) -> Result<Self> {
        if shape.is_empty() || shape.len() > MAX_NDIM {
            return Err(ProtocolError::TensorMalformed {
                reason: format!("rank {} out of range 1..={MAX_NDIM}", shape.len()),
            });
        }
        if flags & !TENSOR_FLAG_MASK != 0 {
            return Err(ProtocolError::TensorMalformed {
                reason: format!("unknown tensor flag bits {flags:#04x}"),
            });
        }

        let mut shape_bytes = [[0u8; 4]; MAX_NDIM];
        for (slot, dim) in shape_bytes.iter_mut().zip(shape) {
            *slot = dim.to_le_bytes();
        }

        Ok(Self {
            ndim: shape.len() as u8,
            dtype: dtype as u8,
            flags,
            _pad: 0,
            shape: shape_bytes,
            scale: scale.to_le_bytes(),
        })
    }

    /// Parse and validate a header from the start of `bytes`.
    ///
    /// Returns the header and the remaining body bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TensorMalformed` if fewer than [`Self::SIZE`] bytes
    ///   are available or validation fails.
    pub fn parse(bytes: &[u8]) -> Result<(&Self, &[u8])> {
        let (header, body) = Self::ref_from_prefix(bytes).map_err(|_| {
            ProtocolError::TensorMalformed {
                reason: format!("need {} header bytes, got {}", Self::SIZE, bytes.len()),
            }
        })?;
        header.validate()?;
        Ok((header, body))
    }

    /// Validate rank, dtype, flags, and unused shape slots.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TensorMalformed` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let ndim = self.ndim as usize;
        if ndim == 0 || ndim > MAX_NDIM {
            return Err(ProtocolError::TensorMalformed {
                reason: format!("rank {ndim} out of range 1..={MAX_NDIM}"),
            });
        }
        if DType::from_u8(self.dtype).is_none() {
            return Err(ProtocolError::TensorMalformed {
                reason: format!("unknown dtype {}", self.dtype),
            });
        }
        if self.flags & !TENSOR_FLAG_MASK != 0 {
            return Err(ProtocolError::TensorMalformed {
                reason: format!("unknown tensor flag bits {:#04x}", self.flags),
            });
        }
        for slot in &self.shape[ndim..] {
            if *slot != [0u8; 4] {
                return Err(ProtocolError::TensorMalformed {
                    reason: "unused shape slot is nonzero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Tensor rank.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.ndim as usize
    }

    /// Element type.
    ///
    /// Only meaningful after [`Self::validate`]; falls back to F32 for raw
    /// unvalidated bytes.
    #[must_use]
    pub fn dtype(&self) -> DType {
        DType::from_u8(self.dtype).unwrap_or(DType::F32)
    }

    /// Raw flag byte.
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// True if per-row quantization scales apply.
    #[must_use]
    pub fn is_row_quantized(&self) -> bool {
        self.flags & TENSOR_FLAG_ROW_QUANTIZED != 0
    }

    /// True for column-major element order.
    #[must_use]
    pub fn is_col_major(&self) -> bool {
        self.flags & TENSOR_FLAG_COL_MAJOR != 0
    }

    /// Active shape dimensions.
    #[must_use]
    pub fn shape(&self) -> Vec<u32> {
        let ndim = self.ndim().min(MAX_NDIM);
        self.shape[..ndim].iter().map(|b| u32::from_le_bytes(*b)).collect()
    }

    /// Quantization scale.
    #[must_use]
    pub fn scale(&self) -> f32 {
        f32::from_le_bytes(self.scale)
    }

    /// Total element count, or `None` on overflow.
    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.shape[..self.ndim().min(MAX_NDIM)]
            .iter()
            .map(|b| u64::from(u32::from_le_bytes(*b)))
            .try_fold(1u64, u64::checked_mul)
    }

    /// Expected body length in bytes, or `None` on overflow.
    #[must_use]
    pub fn body_len(&self) -> Option<u64> {
        self.element_count()?.checked_mul(self.dtype().element_size() as u64)
    }

    /// Serialize to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(IntoBytes::as_bytes(self));
        out
    }
}

impl std::fmt::Debug for TensorHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorHeader")
            .field("ndim", &self.ndim())
            .field("dtype", &self.dtype())
            .field("flags", &format!("{:#04x}", self.flags))
            .field("shape", &self.shape())
            .field("scale", &self.scale())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_stable() {
        // 4 fixed bytes + 8 * 4 shape + 4 scale.
        assert_eq!(TensorHeader::SIZE, 40);
    }

    #[test]
    fn round_trip() {
        let header = TensorHeader::new(DType::F16, &[3, 224, 224], 0, 1.0).unwrap();
        let bytes = header.to_bytes();

        let (parsed, body) = TensorHeader::parse(&bytes).unwrap();
        assert!(body.is_empty());
        assert_eq!(parsed.ndim(), 3);
        assert_eq!(parsed.dtype(), DType::F16);
        assert_eq!(parsed.shape(), vec![3, 224, 224]);
        assert_eq!(parsed.element_count(), Some(3 * 224 * 224));
        assert_eq!(parsed.body_len(), Some(3 * 224 * 224 * 2));
    }

    #[test]
    fn parse_returns_body() {
        let header = TensorHeader::new(DType::Int8, &[4], TENSOR_FLAG_ROW_QUANTIZED, 0.02).unwrap();
        let mut wire = header.to_bytes().to_vec();
        wire.extend_from_slice(&[1, 2, 3, 4]);

        let (parsed, body) = TensorHeader::parse(&wire).unwrap();
        assert!(parsed.is_row_quantized());
        assert!((parsed.scale() - 0.02).abs() < f32::EPSILON);
        assert_eq!(body, &[1, 2, 3, 4]);
    }

    #[test]
    fn reject_zero_rank() {
        assert!(TensorHeader::new(DType::F32, &[], 0, 1.0).is_err());

        let mut bytes = TensorHeader::new(DType::F32, &[1], 0, 1.0).unwrap().to_bytes();
        bytes[0] = 0;
        assert!(TensorHeader::parse(&bytes).is_err());
    }

    #[test]
    fn reject_unknown_dtype() {
        let mut bytes = TensorHeader::new(DType::F32, &[2, 2], 0, 1.0).unwrap().to_bytes();
        bytes[1] = 9;
        assert!(TensorHeader::parse(&bytes).is_err());
    }

    #[test]
    fn reject_nonzero_unused_dims() {
        let mut bytes = TensorHeader::new(DType::F32, &[2], 0, 1.0).unwrap().to_bytes();
        bytes[4 + 4] = 1; // shape[1] low byte
        assert!(TensorHeader::parse(&bytes).is_err());
    }

    #[test]
    fn reject_short_input() {
        let bytes = [0u8; TensorHeader::SIZE - 1];
        assert!(TensorHeader::parse(&bytes).is_err());
    }

    #[test]
    fn element_count_overflow_is_none() {
        let header =
            TensorHeader::new(DType::F32, &[u32::MAX, u32::MAX, u32::MAX], 0, 1.0).unwrap();
        assert_eq!(header.element_count(), None);
        assert_eq!(header.body_len(), None);
    }
}
