//! XCP data envelope and codecs.
//!
//! The [`Ether`] is the unit of meaning: a kind, a schema version, tagged
//! payload and metadata maps, and optional binary attachments. Codecs turn
//! envelopes into payload bytes and back, keyed by the u16 ids from
//! `xcp-proto`; the process-wide [`registry`] dispatches them.
//!
//! Built-ins: JSON (`0x0001`), binary struct (`0x0008`), raw tensor codecs
//! (`0x0002`–`0x0004`), mixed latent (`0x0010`), and DLPack (`0x0021`).
//! `ARROW_IPC 0x0020` is a reserved id for an external columnar binding.
//! Control bodies ([`Control`]) are envelopes with reserved `xcp.*` kinds.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod binary;
mod codec;
mod control;
mod ether;
mod json;
pub mod registry;
mod tensor;
mod value;

pub use binary::BinaryStructCodec;
pub use codec::{CodecError, EtherCodec, Result};
pub use control::{Capability, Control, SchemaRange};
pub use ether::{
    Attachment, AttachmentSource, Ether, METADATA_CREATED_AT, METADATA_LINEAGE,
    METADATA_PRODUCER, METADATA_TRACE_ID,
};
pub use json::JsonCodec;
pub use registry::CodecRegistry;
pub use tensor::{DlpackCodec, MixedLatentCodec, TensorCodec};
pub use value::{Value, ValueMap};
