//! Control message bodies.
//!
//! Control frames carry small envelopes with reserved `xcp.*` kinds. Each
//! variant maps to exactly one message type; the header's `msg_type` selects
//! the decoder, so the body never carries a variant tag of its own. Bodies
//! encode through an [`EtherCodec`] like any other envelope - BINARY_STRUCT
//! once negotiated, JSON for the pre-negotiation HELLO/CAPS exchange.

use std::collections::BTreeSet;

use bytes::Bytes;
use xcp_proto::{ErrorCode, MsgType, SchemaKey};

use crate::{
    codec::{CodecError, EtherCodec, Result},
    ether::Ether,
    value::{Value, ValueMap},
};

/// One accepted or emitted schema range in a capability record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaRange {
    /// FNV-1a hash of the namespace.
    pub ns_hash: u32,
    /// FNV-1a hash of the kind.
    pub kind_id: u32,
    /// Major version; exact match required.
    pub major: u16,
    /// Lowest accepted minor.
    pub min_minor: u16,
    /// Highest accepted minor.
    pub max_minor: u16,
}

impl SchemaRange {
    /// True if `key` falls inside this range.
    #[must_use]
    pub fn contains(&self, key: &SchemaKey) -> bool {
        key.matches_range(self.ns_hash, self.kind_id, self.major, self.min_minor, self.max_minor)
    }

    fn to_value(self) -> Value {
        let mut map = ValueMap::new();
        map.insert("ns_hash".to_string(), Value::U64(u64::from(self.ns_hash)));
        map.insert("kind_id".to_string(), Value::U64(u64::from(self.kind_id)));
        map.insert("major".to_string(), Value::U64(u64::from(self.major)));
        map.insert("min_minor".to_string(), Value::U64(u64::from(self.min_minor)));
        map.insert("max_minor".to_string(), Value::U64(u64::from(self.max_minor)));
        Value::Map(map)
    }

    fn from_value(value: &Value) -> Result<Self> {
        let map = value.as_map().ok_or_else(|| control_malformed("schema range is not a map"))?;
        let get_u32 = |field: &'static str| {
            map.get(field)
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| control_malformed(field))
        };
        let get_u16 = |field: &'static str| {
            map.get(field)
                .and_then(Value::as_u64)
                .and_then(|v| u16::try_from(v).ok())
                .ok_or_else(|| control_malformed(field))
        };
        Ok(Self {
            ns_hash: get_u32("ns_hash")?,
            kind_id: get_u32("kind_id")?,
            major: get_u16("major")?,
            min_minor: get_u16("min_minor")?,
            max_minor: get_u16("max_minor")?,
        })
    }
}

/// Peer-advertised capabilities, exchanged in HELLO and CAPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    /// Codec ids the peer can decode.
    pub codecs: BTreeSet<u16>,
    /// Largest single-frame payload the peer accepts.
    pub max_frame_bytes: u32,
    /// Schema ranges the peer accepts inbound.
    pub accepts: Vec<SchemaRange>,
    /// Schema ranges the peer may emit.
    pub emits: Vec<SchemaRange>,
    /// Whether the peer can fetch `shm://` attachments.
    pub shared_mem: bool,
}

impl Capability {
    fn to_payload(&self) -> ValueMap {
        let mut payload = ValueMap::new();
        payload.insert(
            "codecs".to_string(),
            Value::List(self.codecs.iter().map(|id| Value::U64(u64::from(*id))).collect()),
        );
        payload
            .insert("max_frame_bytes".to_string(), Value::U64(u64::from(self.max_frame_bytes)));
        payload.insert(
            "accepts".to_string(),
            Value::List(self.accepts.iter().map(|r| r.to_value()).collect()),
        );
        payload.insert(
            "emits".to_string(),
            Value::List(self.emits.iter().map(|r| r.to_value()).collect()),
        );
        payload.insert("shared_mem".to_string(), Value::Bool(self.shared_mem));
        payload
    }

    fn from_payload(payload: &ValueMap) -> Result<Self> {
        let codecs = payload
            .get("codecs")
            .and_then(Value::as_list)
            .ok_or_else(|| control_malformed("codecs"))?
            .iter()
            .map(|id| {
                id.as_u64()
                    .and_then(|v| u16::try_from(v).ok())
                    .ok_or_else(|| control_malformed("codec id is not a u16"))
            })
            .collect::<Result<BTreeSet<_>>>()?;
        let max_frame_bytes = payload
            .get("max_frame_bytes")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| control_malformed("max_frame_bytes"))?;
        let ranges = |field: &'static str| -> Result<Vec<SchemaRange>> {
            payload
                .get(field)
                .and_then(Value::as_list)
                .ok_or_else(|| control_malformed(field))?
                .iter()
                .map(SchemaRange::from_value)
                .collect()
        };
        let shared_mem =
            payload.get("shared_mem").and_then(Value::as_bool).unwrap_or_default();

        Ok(Self {
            codecs,
            max_frame_bytes,
            accepts: ranges("accepts")?,
            emits: ranges("emits")?,
            shared_mem,
        })
    }
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Client capability advertisement.
    Hello(Capability),
    /// Server capability advertisement.
    Caps(Capability),
    /// Delivery acknowledgement.
    Ack {
        /// Acknowledged message.
        msg_id: u64,
    },
    /// Negative acknowledgement.
    Nack {
        /// Rejected message.
        msg_id: u64,
        /// Why the message was rejected.
        error_code: ErrorCode,
        /// If set, the sender may retry after this many milliseconds.
        retry_after_ms: Option<u64>,
    },
    /// Liveness probe.
    Ping {
        /// Correlation nonce echoed by PONG.
        nonce: u64,
    },
    /// Liveness reply.
    Pong {
        /// Nonce from the matching PING.
        nonce: u64,
    },
    /// Request for clarification.
    ClarifyReq {
        /// Why clarification is needed.
        reason: String,
        /// Field names in question.
        fields: Vec<String>,
    },
    /// Clarification response.
    ClarifyRes {
        /// Clarified field values.
        fields: ValueMap,
    },
    /// Graceful close.
    Goodbye {
        /// Close reason.
        reason: String,
    },
}

fn control_malformed(reason: &str) -> CodecError {
    CodecError::Malformed { codec: "control", reason: reason.to_string() }
}

impl Control {
    /// Message type corresponding to this body.
    #[must_use]
    pub const fn msg_type(&self) -> MsgType {
        match self {
            Self::Hello(_) => MsgType::Hello,
            Self::Caps(_) => MsgType::Caps,
            Self::Ack { .. } => MsgType::Ack,
            Self::Nack { .. } => MsgType::Nack,
            Self::Ping { .. } => MsgType::Ping,
            Self::Pong { .. } => MsgType::Pong,
            Self::ClarifyReq { .. } => MsgType::ClarifyReq,
            Self::ClarifyRes { .. } => MsgType::ClarifyRes,
            Self::Goodbye { .. } => MsgType::Goodbye,
        }
    }

    /// Reserved envelope kind for a control message type.
    #[must_use]
    pub const fn kind_for(msg_type: MsgType) -> &'static str {
        match msg_type {
            MsgType::Hello => "xcp.hello",
            MsgType::Caps => "xcp.caps",
            MsgType::Ack => "xcp.ack",
            MsgType::Nack => "xcp.nack",
            MsgType::Ping => "xcp.ping",
            MsgType::Pong => "xcp.pong",
            MsgType::ClarifyReq => "xcp.clarify_req",
            MsgType::ClarifyRes => "xcp.clarify_res",
            MsgType::Goodbye => "xcp.goodbye",
            MsgType::Data(_) => "xcp.data",
        }
    }

    /// Render as an envelope with the reserved kind.
    #[must_use]
    pub fn to_ether(&self) -> Ether {
        let mut payload = ValueMap::new();
        match self {
            Self::Hello(caps) | Self::Caps(caps) => payload = caps.to_payload(),
            Self::Ack { msg_id } => {
                payload.insert("msg_id".to_string(), Value::U64(*msg_id));
            },
            Self::Nack { msg_id, error_code, retry_after_ms } => {
                payload.insert("msg_id".to_string(), Value::U64(*msg_id));
                payload.insert(
                    "error_code".to_string(),
                    Value::U64(u64::from(error_code.to_u16())),
                );
                if let Some(ms) = retry_after_ms {
                    payload.insert("retry_after_ms".to_string(), Value::U64(*ms));
                }
            },
            Self::Ping { nonce } | Self::Pong { nonce } => {
                payload.insert("nonce".to_string(), Value::U64(*nonce));
            },
            Self::ClarifyReq { reason, fields } => {
                payload.insert("reason".to_string(), Value::Str(reason.clone()));
                payload.insert(
                    "fields".to_string(),
                    Value::List(fields.iter().map(|f| Value::Str(f.clone())).collect()),
                );
            },
            Self::ClarifyRes { fields } => {
                payload.insert("fields".to_string(), Value::Map(fields.clone()));
            },
            Self::Goodbye { reason } => {
                payload.insert("reason".to_string(), Value::Str(reason.clone()));
            },
        }

        Ether {
            kind: Self::kind_for(self.msg_type()).to_string(),
            schema_version: 1,
            payload,
            metadata: ValueMap::new(),
            extra_fields: None,
            attachments: Vec::new(),
        }
    }

    /// Rebuild from an envelope, selecting the variant by `msg_type`.
    ///
    /// # Errors
    ///
    /// - `CodecError::Malformed` if the envelope kind or fields do not match
    ///   the message type, or the type is not a control type.
    pub fn from_ether(msg_type: MsgType, ether: &Ether) -> Result<Self> {
        if ether.kind != Self::kind_for(msg_type) {
            return Err(control_malformed(&format!(
                "kind {:?} does not match {:?}",
                ether.kind, msg_type
            )));
        }
        let payload = &ether.payload;
        let get_u64 = |field: &'static str| {
            payload.get(field).and_then(Value::as_u64).ok_or_else(|| control_malformed(field))
        };

        Ok(match msg_type {
            MsgType::Hello => Self::Hello(Capability::from_payload(payload)?),
            MsgType::Caps => Self::Caps(Capability::from_payload(payload)?),
            MsgType::Ack => Self::Ack { msg_id: get_u64("msg_id")? },
            MsgType::Nack => {
                let code = get_u64("error_code")?;
                let error_code = u16::try_from(code)
                    .ok()
                    .and_then(ErrorCode::from_u16)
                    .ok_or_else(|| control_malformed("error_code is not assigned"))?;
                Self::Nack {
                    msg_id: get_u64("msg_id")?,
                    error_code,
                    retry_after_ms: payload.get("retry_after_ms").and_then(Value::as_u64),
                }
            },
            MsgType::Ping => Self::Ping { nonce: get_u64("nonce")? },
            MsgType::Pong => Self::Pong { nonce: get_u64("nonce")? },
            MsgType::ClarifyReq => Self::ClarifyReq {
                reason: payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .ok_or_else(|| control_malformed("reason"))?
                    .to_string(),
                fields: payload
                    .get("fields")
                    .and_then(Value::as_list)
                    .ok_or_else(|| control_malformed("fields"))?
                    .iter()
                    .map(|f| {
                        f.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| control_malformed("field name is not a string"))
                    })
                    .collect::<Result<Vec<_>>>()?,
            },
            MsgType::ClarifyRes => Self::ClarifyRes {
                fields: payload
                    .get("fields")
                    .and_then(Value::as_map)
                    .ok_or_else(|| control_malformed("fields"))?
                    .clone(),
            },
            MsgType::Goodbye => Self::Goodbye {
                reason: payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .ok_or_else(|| control_malformed("reason"))?
                    .to_string(),
            },
            MsgType::Data(_) => {
                return Err(control_malformed("data msg_type is not a control message"));
            },
        })
    }

    /// Encode the body with the given codec.
    ///
    /// # Errors
    ///
    /// See [`EtherCodec::encode`].
    pub fn encode(&self, codec: &dyn EtherCodec) -> Result<Bytes> {
        codec.encode(&self.to_ether())
    }

    /// Decode a body with the given codec.
    ///
    /// # Errors
    ///
    /// See [`EtherCodec::decode`] and [`Control::from_ether`].
    pub fn decode(msg_type: MsgType, codec: &dyn EtherCodec, bytes: &[u8]) -> Result<Self> {
        Self::from_ether(msg_type, &codec.decode(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{binary::BinaryStructCodec, json::JsonCodec};

    fn sample_capability() -> Capability {
        Capability {
            codecs: [xcp_proto::CODEC_JSON, xcp_proto::CODEC_BINARY_STRUCT].into_iter().collect(),
            max_frame_bytes: 1024 * 1024,
            accepts: vec![SchemaRange {
                ns_hash: 7,
                kind_id: 9,
                major: 1,
                min_minor: 0,
                max_minor: 4,
            }],
            emits: Vec::new(),
            shared_mem: true,
        }
    }

    #[test]
    fn every_variant_round_trips_both_codecs() {
        let messages = vec![
            Control::Hello(sample_capability()),
            Control::Caps(sample_capability()),
            Control::Ack { msg_id: 12 },
            Control::Nack {
                msg_id: 13,
                error_code: ErrorCode::CodecUnsupported,
                retry_after_ms: Some(250),
            },
            Control::Nack {
                msg_id: 14,
                error_code: ErrorCode::SchemaUnknown,
                retry_after_ms: None,
            },
            Control::Ping { nonce: 0xDEAD_BEEF },
            Control::Pong { nonce: 0xDEAD_BEEF },
            Control::ClarifyReq {
                reason: "ambiguous field".to_string(),
                fields: vec!["target".to_string()],
            },
            Control::ClarifyRes {
                fields: [("target".to_string(), Value::Str("gpu-0".to_string()))]
                    .into_iter()
                    .collect(),
            },
            Control::Goodbye { reason: "shutdown".to_string() },
        ];

        for message in messages {
            for codec in [&JsonCodec as &dyn EtherCodec, &BinaryStructCodec as &dyn EtherCodec] {
                let bytes = message.encode(codec).unwrap();
                let decoded = Control::decode(message.msg_type(), codec, &bytes).unwrap();
                assert_eq!(decoded, message, "via {}", codec.name());
            }
        }
    }

    #[test]
    fn kind_mismatch_rejected() {
        let bytes = Control::Ack { msg_id: 1 }.encode(&JsonCodec).unwrap();
        let result = Control::decode(MsgType::Nack, &JsonCodec, &bytes);
        assert!(result.is_err());
    }

    #[test]
    fn schema_range_contains() {
        let range =
            SchemaRange { ns_hash: 1, kind_id: 2, major: 3, min_minor: 1, max_minor: 5 };
        let key = SchemaKey { ns_hash: 1, kind_id: 2, major: 3, minor: 4, hash128: [0; 16] };
        assert!(range.contains(&key));
        let outside = SchemaKey { minor: 6, ..key };
        assert!(!range.contains(&outside));
    }

    #[test]
    fn unknown_error_code_rejected() {
        let mut ether = Control::Ack { msg_id: 1 }.to_ether();
        ether.kind = Control::kind_for(MsgType::Nack).to_string();
        ether.payload.insert("error_code".to_string(), Value::U64(0x99));
        assert!(Control::from_ether(MsgType::Nack, &ether).is_err());
    }
}
