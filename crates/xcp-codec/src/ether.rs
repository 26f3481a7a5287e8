//! The self-describing data envelope.

use bytes::Bytes;

use crate::{
    codec::{CodecError, Result},
    value::{Value, ValueMap},
};

/// Reserved metadata key: distributed trace identifier.
pub const METADATA_TRACE_ID: &str = "trace_id";
/// Reserved metadata key: producing component.
pub const METADATA_PRODUCER: &str = "producer";
/// Reserved metadata key: creation timestamp.
pub const METADATA_CREATED_AT: &str = "created_at";
/// Reserved metadata key: upstream lineage.
pub const METADATA_LINEAGE: &str = "lineage";

/// Where an attachment's bytes live.
///
/// A sum type on purpose: an attachment is either referenced by URI or
/// carried inline, never both. Codecs reject wire forms claiming both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    /// External reference, e.g. `shm://ns/name#offset,size`.
    Uri(String),
    /// Bytes carried in the envelope itself.
    Inline(Bytes),
}

/// Binary blob referenced by an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Attachment identifier, unique within the envelope.
    pub id: String,
    /// URI reference or inline bytes.
    pub source: AttachmentSource,
    /// MIME-style media type.
    pub media_type: String,
    /// Registry name of the codec that encoded the blob.
    pub codec: String,
    /// Tensor shape, empty when not applicable.
    pub shape: Vec<u32>,
    /// Element type name, empty when not applicable.
    pub dtype: String,
    /// Size of the referenced bytes.
    pub size_bytes: u64,
}

impl Attachment {
    /// Inline attachment with `size_bytes` derived from the data.
    #[must_use]
    pub fn inline(id: impl Into<String>, media_type: impl Into<String>, data: Bytes) -> Self {
        let size_bytes = data.len() as u64;
        Self {
            id: id.into(),
            source: AttachmentSource::Inline(data),
            media_type: media_type.into(),
            codec: String::new(),
            shape: Vec::new(),
            dtype: String::new(),
            size_bytes,
        }
    }

    /// URI-referenced attachment.
    #[must_use]
    pub fn by_uri(
        id: impl Into<String>,
        media_type: impl Into<String>,
        uri: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: id.into(),
            source: AttachmentSource::Uri(uri.into()),
            media_type: media_type.into(),
            codec: String::new(),
            shape: Vec::new(),
            dtype: String::new(),
            size_bytes,
        }
    }
}

/// Self-describing data envelope.
///
/// Codec-agnostic: any registered codec can encode an Ether it can
/// represent. `payload` and `metadata` are always present (possibly empty);
/// `extra_fields` and `attachments` are optional extensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Ether {
    /// Semantic kind, e.g. `"text"` or `"embedding"`. Never empty.
    pub kind: String,
    /// Application schema version, `>= 1`.
    pub schema_version: u32,
    /// Primary content.
    pub payload: ValueMap,
    /// Out-of-band context; see the reserved `METADATA_*` keys.
    pub metadata: ValueMap,
    /// Forward-compatibility spillover for unknown fields.
    pub extra_fields: Option<ValueMap>,
    /// Ordered binary attachments.
    pub attachments: Vec<Attachment>,
}

impl Ether {
    /// Create an envelope with empty payload and metadata.
    ///
    /// # Errors
    ///
    /// - `CodecError::InvalidEther` if `kind` is empty or `schema_version`
    ///   is 0.
    pub fn new(kind: impl Into<String>, schema_version: u32) -> Result<Self> {
        let ether = Self {
            kind: kind.into(),
            schema_version,
            payload: ValueMap::new(),
            metadata: ValueMap::new(),
            extra_fields: None,
            attachments: Vec::new(),
        };
        ether.validate()?;
        Ok(ether)
    }

    /// Add a payload entry (builder style).
    #[must_use]
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Add a metadata entry (builder style).
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add an attachment (builder style).
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Check structural invariants.
    ///
    /// # Errors
    ///
    /// - `CodecError::InvalidEther` if `kind` is empty, `schema_version` is
    ///   0, or an attachment id repeats.
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(CodecError::InvalidEther { reason: "kind must not be empty".to_string() });
        }
        if self.schema_version == 0 {
            return Err(CodecError::InvalidEther {
                reason: "schema_version must be >= 1".to_string(),
            });
        }
        for (i, attachment) in self.attachments.iter().enumerate() {
            if self.attachments[..i].iter().any(|a| a.id == attachment.id) {
                return Err(CodecError::InvalidEther {
                    reason: format!("duplicate attachment id {:?}", attachment.id),
                });
            }
        }
        Ok(())
    }
}
