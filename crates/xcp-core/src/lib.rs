//! XCP session engine.
//!
//! The protocol core shared by client and server: capability negotiation,
//! message-id allocation, codec selection, chunking and reassembly,
//! duplicate suppression, retry backoff, and the payload transform
//! pipeline.
//!
//! # Architecture
//!
//! The engine is Sans-IO. [`Session`] is a pure state machine: drivers feed
//! it frames and clock readings and execute the [`SessionAction`]s it
//! returns. Real I/O lives in the thin [`framed`] helpers (exact-size async
//! reads/writes over any `AsyncRead + AsyncWrite`) and in the `xcp-client` /
//! `xcp-server` facades. Time and randomness come from an [`Environment`],
//! so the whole engine runs deterministically under test.
//!
//! # Concurrency model
//!
//! One connection is owned by one session. A single reader and a single
//! writer serialize stream access; per-session tables (duplicate window,
//! assembly table, pending sends) are mutated only by the session's owner.
//! Delivery is in-order per channel and unordered across channels.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod assembly;
pub mod caps;
pub mod config;
pub mod dup;
pub mod env;
pub mod error;
pub mod framed;
pub mod retry;
pub mod shm;
pub mod transform;

mod session;

pub use caps::{Negotiated, local_capability, negotiate};
pub use config::{CodecPolicy, SessionConfig};
pub use env::{Environment, SystemEnv};
pub use error::{Result, SessionError};
pub use session::{Role, SendOptions, Session, SessionAction, SessionState};
pub use shm::{MemoryShmStore, ShmError, ShmStore, ShmUri};
pub use transform::Transforms;

// The facades speak these types constantly; spare them the extra imports.
pub use xcp_codec::{
    Attachment, AttachmentSource, Capability, Control, Ether, EtherCodec, SchemaRange, Value,
    ValueMap, registry,
};
pub use xcp_proto::{
    CODEC_ARROW_IPC, CODEC_BINARY_STRUCT, CODEC_DLPACK, CODEC_JSON, CODEC_MIXED_LATENT,
    CODEC_TENSOR_F16, CODEC_TENSOR_F32, CODEC_TENSOR_INT8, ErrorCode, Frame, FrameFlags,
    FrameHeader, MsgType, SchemaKey,
};
