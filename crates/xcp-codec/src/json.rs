//! Canonical JSON envelope codec (`0x0001`).
//!
//! UTF-8, no BOM. The tagged value model maps onto JSON with one extension:
//! raw bytes encode as `{"$bytes": "<base64>"}` so binary payload values
//! survive the text encoding, and inline attachment bytes are base64. The
//! integer space is JSON's single number line; decoded non-negative integers
//! come back as `U64` (cross-signedness equality in [`Value`] keeps
//! round-trips exact).

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde_json::{Map as JsonMap, Number, Value as Json};

use crate::{
    codec::{CodecError, EtherCodec, Result},
    ether::{Attachment, AttachmentSource, Ether},
    value::{Value, ValueMap},
};

/// Sentinel key for byte values in JSON bodies.
const BYTES_KEY: &str = "$bytes";

/// The mandatory JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EtherCodec for JsonCodec {
    fn id(&self) -> u16 {
        xcp_proto::CODEC_JSON
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn is_binary(&self) -> bool {
        false
    }

    fn encode(&self, ether: &Ether) -> Result<Bytes> {
        ether.validate()?;

        let mut root = JsonMap::new();
        root.insert("kind".to_string(), Json::String(ether.kind.clone()));
        root.insert("schema_version".to_string(), Json::from(ether.schema_version));
        root.insert("payload".to_string(), map_to_json(&ether.payload)?);
        root.insert("metadata".to_string(), map_to_json(&ether.metadata)?);
        if let Some(extra) = &ether.extra_fields {
            root.insert("extra_fields".to_string(), map_to_json(extra)?);
        }
        if !ether.attachments.is_empty() {
            let attachments =
                ether.attachments.iter().map(attachment_to_json).collect::<Vec<_>>();
            root.insert("attachments".to_string(), Json::Array(attachments));
        }

        let bytes = serde_json::to_vec(&Json::Object(root))
            .map_err(|e| CodecError::Malformed { codec: "json", reason: e.to_string() })?;
        Ok(Bytes::from(bytes))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Ether> {
        let root: Json = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::Malformed { codec: "json", reason: e.to_string() })?;
        let Json::Object(root) = root else {
            return Err(CodecError::Malformed {
                codec: "json",
                reason: "body is not an object".to_string(),
            });
        };

        let kind = root
            .get("kind")
            .and_then(Json::as_str)
            .ok_or_else(|| CodecError::Malformed {
                codec: "json",
                reason: "missing or non-string kind".to_string(),
            })?
            .to_string();
        let schema_version = root
            .get("schema_version")
            .and_then(Json::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| CodecError::Malformed {
                codec: "json",
                reason: "missing or invalid schema_version".to_string(),
            })?;
        let payload = required_map(&root, "payload")?;
        let metadata = required_map(&root, "metadata")?;

        let extra_fields = match root.get("extra_fields") {
            None | Some(Json::Null) => None,
            Some(Json::Object(map)) => Some(json_object_to_map(map)?),
            Some(_) => {
                return Err(CodecError::Malformed {
                    codec: "json",
                    reason: "extra_fields is not an object".to_string(),
                });
            },
        };

        let attachments = match root.get("attachments") {
            None => Vec::new(),
            Some(Json::Array(items)) => {
                items.iter().map(attachment_from_json).collect::<Result<Vec<_>>>()?
            },
            Some(_) => {
                return Err(CodecError::Malformed {
                    codec: "json",
                    reason: "attachments is not an array".to_string(),
                });
            },
        };

        let ether =
            Ether { kind, schema_version, payload, metadata, extra_fields, attachments };
        ether.validate()?;
        Ok(ether)
    }
}

fn required_map(root: &JsonMap<String, Json>, field: &'static str) -> Result<ValueMap> {
    match root.get(field) {
        Some(Json::Object(map)) => json_object_to_map(map),
        _ => Err(CodecError::Malformed {
            codec: "json",
            reason: format!("missing or non-object {field}"),
        }),
    }
}

fn map_to_json(map: &ValueMap) -> Result<Json> {
    let mut out = JsonMap::new();
    for (key, value) in map {
        out.insert(key.clone(), value_to_json(value)?);
    }
    Ok(Json::Object(out))
}

fn value_to_json(value: &Value) -> Result<Json> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::I64(v) => Json::from(*v),
        Value::U64(v) => Json::from(*v),
        Value::F64(v) => Json::Number(Number::from_f64(*v).ok_or_else(|| {
            CodecError::Unrepresentable {
                codec: "json",
                reason: "non-finite float".to_string(),
            }
        })?),
        Value::Str(s) => Json::String(s.clone()),
        Value::Bytes(b) => {
            let mut tagged = JsonMap::new();
            tagged.insert(BYTES_KEY.to_string(), Json::String(BASE64.encode(b)));
            Json::Object(tagged)
        },
        Value::List(items) => {
            Json::Array(items.iter().map(value_to_json).collect::<Result<Vec<_>>>()?)
        },
        Value::Map(map) => map_to_json(map)?,
    })
}

fn json_object_to_map(map: &JsonMap<String, Json>) -> Result<ValueMap> {
    let mut out = ValueMap::new();
    for (key, value) in map {
        out.insert(key.clone(), json_to_value(value)?);
    }
    Ok(out)
}

fn json_to_value(json: &Json) -> Result<Value> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(v) = n.as_u64() {
                Value::U64(v)
            } else if let Some(v) = n.as_i64() {
                Value::I64(v)
            } else if let Some(v) = n.as_f64() {
                Value::F64(v)
            } else {
                return Err(CodecError::Malformed {
                    codec: "json",
                    reason: format!("unrepresentable number {n}"),
                });
            }
        },
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => {
            Value::List(items.iter().map(json_to_value).collect::<Result<Vec<_>>>()?)
        },
        Json::Object(map) => {
            if map.len() == 1
                && let Some(Json::String(b64)) = map.get(BYTES_KEY)
            {
                let decoded = BASE64.decode(b64).map_err(|e| CodecError::Malformed {
                    codec: "json",
                    reason: format!("invalid base64 in {BYTES_KEY}: {e}"),
                })?;
                Value::Bytes(Bytes::from(decoded))
            } else {
                Value::Map(json_object_to_map(map)?)
            }
        },
    })
}

fn attachment_to_json(attachment: &Attachment) -> Json {
    let mut out = JsonMap::new();
    out.insert("id".to_string(), Json::String(attachment.id.clone()));
    match &attachment.source {
        AttachmentSource::Uri(uri) => {
            out.insert("uri".to_string(), Json::String(uri.clone()));
        },
        AttachmentSource::Inline(data) => {
            out.insert("uri".to_string(), Json::String("inline".to_string()));
            out.insert("inline_bytes".to_string(), Json::String(BASE64.encode(data)));
        },
    }
    out.insert("media_type".to_string(), Json::String(attachment.media_type.clone()));
    if !attachment.codec.is_empty() {
        out.insert("codec".to_string(), Json::String(attachment.codec.clone()));
    }
    if !attachment.shape.is_empty() {
        let shape = attachment.shape.iter().map(|d| Json::from(*d)).collect();
        out.insert("shape".to_string(), Json::Array(shape));
    }
    if !attachment.dtype.is_empty() {
        out.insert("dtype".to_string(), Json::String(attachment.dtype.clone()));
    }
    out.insert("size_bytes".to_string(), Json::from(attachment.size_bytes));
    Json::Object(out)
}

fn attachment_from_json(json: &Json) -> Result<Attachment> {
    let Json::Object(map) = json else {
        return Err(CodecError::Malformed {
            codec: "json",
            reason: "attachment is not an object".to_string(),
        });
    };

    let field_str = |field: &'static str| -> Result<String> {
        map.get(field).and_then(Json::as_str).map(str::to_string).ok_or_else(|| {
            CodecError::Malformed {
                codec: "json",
                reason: format!("attachment missing {field}"),
            }
        })
    };

    let id = field_str("id")?;
    let media_type = field_str("media_type")?;
    let codec =
        map.get("codec").and_then(Json::as_str).unwrap_or_default().to_string();
    let dtype =
        map.get("dtype").and_then(Json::as_str).unwrap_or_default().to_string();
    let size_bytes = map.get("size_bytes").and_then(Json::as_u64).ok_or_else(|| {
        CodecError::Malformed {
            codec: "json",
            reason: "attachment missing size_bytes".to_string(),
        }
    })?;

    let shape = match map.get("shape") {
        None => Vec::new(),
        Some(Json::Array(dims)) => dims
            .iter()
            .map(|d| {
                d.as_u64().and_then(|v| u32::try_from(v).ok()).ok_or_else(|| {
                    CodecError::Malformed {
                        codec: "json",
                        reason: "attachment shape dim is not a u32".to_string(),
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => {
            return Err(CodecError::Malformed {
                codec: "json",
                reason: "attachment shape is not an array".to_string(),
            });
        },
    };

    let uri = map.get("uri").and_then(Json::as_str);
    let inline_b64 = map.get("inline_bytes").and_then(Json::as_str);
    let source = match (uri, inline_b64) {
        (Some("inline") | None, Some(b64)) => {
            let data = BASE64.decode(b64).map_err(|e| CodecError::Malformed {
                codec: "json",
                reason: format!("invalid base64 inline_bytes: {e}"),
            })?;
            AttachmentSource::Inline(Bytes::from(data))
        },
        (Some(uri), None) => AttachmentSource::Uri(uri.to_string()),
        (Some(_), Some(_)) => {
            return Err(CodecError::Malformed {
                codec: "json",
                reason: "attachment carries both a uri and inline bytes".to_string(),
            });
        },
        (None, None) => {
            return Err(CodecError::Malformed {
                codec: "json",
                reason: "attachment has neither uri nor inline bytes".to_string(),
            });
        },
    };

    Ok(Attachment { id, source, media_type, codec, shape, dtype, size_bytes })
}
