//! XCP wire format.
//!
//! The lowest layer of the eXtensible Coordination Protocol: frame pack and
//! parse (preamble + variable header + length-prefixed payload + CRC32C
//! trailer), the semantic [`FrameHeader`] in its binary and JSON forms,
//! [`SchemaKey`] identity, the fixed [`TensorHeader`], and the constant
//! tables (codec ids, message types, error codes).
//!
//! This crate is transport-agnostic and does no I/O. Transforms (compression,
//! encryption) are applied above; frames carry their results and flag bits.
//!
//! # Invariants
//!
//! - Every emitted frame starts with [`MAGIC`] and carries a CRC32C over the
//!   exact payload bytes written.
//! - All multibyte integers in fixed headers and tensor headers are unsigned
//!   little-endian.
//! - `HLEN` always equals the header block length; `PLEN` is 8 bytes iff
//!   LARGE, else 4, and always matches the payload byte count.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod flags;
mod frame;
mod header;
mod ids;
mod msg_type;
mod schema;
mod tensor;

pub use error::{ProtocolError, Result};
pub use flags::FrameFlags;
pub use frame::{Frame, HeaderForm, Preamble};
pub use header::FrameHeader;
pub use ids::{
    CODEC_ARROW_IPC, CODEC_BINARY_STRUCT, CODEC_DLPACK, CODEC_JSON, CODEC_MIXED_LATENT,
    CODEC_TENSOR_F16, CODEC_TENSOR_F32, CODEC_TENSOR_INT8, ErrorCode,
};
pub use msg_type::MsgType;
pub use schema::{SchemaKey, fnv1a_32};
pub use tensor::{
    DType, MAX_NDIM, TENSOR_FLAG_COL_MAJOR, TENSOR_FLAG_ROW_QUANTIZED, TensorHeader,
};

/// Frame magic number at offset 0 (little-endian on the wire).
pub const MAGIC: u32 = 0xA9A1_7A10;

/// Current protocol version byte: major 0, minor 2.
pub const VERSION: u8 = 0x02;

/// Major half of a version byte (high nibble).
#[must_use]
pub const fn version_major(version: u8) -> u8 {
    version >> 4
}

/// Minor half of a version byte (low nibble).
#[must_use]
pub const fn version_minor(version: u8) -> u8 {
    version & 0x0F
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_nibbles() {
        assert_eq!(version_major(VERSION), 0);
        assert_eq!(version_minor(VERSION), 2);
        assert_eq!(version_major(0x12), 1);
        assert_eq!(version_minor(0x12), 2);
    }
}
