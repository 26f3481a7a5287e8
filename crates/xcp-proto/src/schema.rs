//! Composite schema identity.
//!
//! A [`SchemaKey`] names a semantic schema without carrying it: two FNV-1a
//! hashes locate the namespace and kind, the major/minor pair versions it,
//! and the truncated SHA-256 of the canonical schema JSON pins the exact
//! definition. Equality uses all five fields; compatibility ignores
//! `hash128` and compares `minor` by ordering.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over a byte string.
#[must_use]
pub const fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Composite identity of a semantic schema.
///
/// The all-zero key is reserved for control frames, which carry no schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaKey {
    /// FNV-1a hash of the namespace string.
    pub ns_hash: u32,
    /// FNV-1a hash of the kind string.
    pub kind_id: u32,
    /// Major schema version; incompatible across values.
    pub major: u16,
    /// Minor schema version; compatible within a range.
    pub minor: u16,
    /// First 128 bits of SHA-256 over the canonical schema JSON.
    #[serde(with = "hash128_hex")]
    pub hash128: [u8; 16],
}

impl SchemaKey {
    /// Byte length of the schema key on the wire (4 + 4 + 2 + 2 + 16).
    pub const WIRE_LEN: usize = 28;

    /// The zero key used by control frames.
    pub const ZERO: Self =
        Self { ns_hash: 0, kind_id: 0, major: 0, minor: 0, hash128: [0u8; 16] };

    /// Derive a key from schema identity strings and its canonical JSON.
    #[must_use]
    pub fn derive(
        namespace: &str,
        kind: &str,
        major: u16,
        minor: u16,
        canonical_schema_json: &str,
    ) -> Self {
        let digest = Sha256::digest(canonical_schema_json.as_bytes());
        let mut hash128 = [0u8; 16];
        hash128.copy_from_slice(&digest[..16]);

        Self {
            ns_hash: fnv1a_32(namespace.as_bytes()),
            kind_id: fnv1a_32(kind.as_bytes()),
            major,
            minor,
            hash128,
        }
    }

    /// True for the reserved control-frame key.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Same schema lineage: namespace, kind, and major version agree.
    #[must_use]
    pub fn same_lineage(&self, other: &Self) -> bool {
        self.ns_hash == other.ns_hash
            && self.kind_id == other.kind_id
            && self.major == other.major
    }

    /// True if this key falls in an accepted range.
    ///
    /// Ranges are the `(ns_hash, kind_id, major, min_minor, max_minor)`
    /// tuples peers advertise in capability records.
    #[must_use]
    pub fn matches_range(
        &self,
        ns_hash: u32,
        kind_id: u32,
        major: u16,
        min_minor: u16,
        max_minor: u16,
    ) -> bool {
        self.ns_hash == ns_hash
            && self.kind_id == kind_id
            && self.major == major
            && self.minor >= min_minor
            && self.minor <= max_minor
    }
}

/// Serde helper: `hash128` as lowercase hex in the JSON header form.
mod hash128_hex {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 16], D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        bytes.try_into().map_err(|_| D::Error::custom("hash128 must be 16 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a_32(b""), 0x811C_9DC5);
        assert_eq!(fnv1a_32(b"a"), 0xE40C_292C);
        assert_eq!(fnv1a_32(b"foobar"), 0xBF9C_F968);
    }

    #[test]
    fn derive_is_deterministic() {
        let a = SchemaKey::derive("agents", "embedding", 1, 2, "{\"fields\":[]}");
        let b = SchemaKey::derive("agents", "embedding", 1, 2, "{\"fields\":[]}");
        assert_eq!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn equality_uses_hash128() {
        let a = SchemaKey::derive("agents", "embedding", 1, 2, "{}");
        let b = SchemaKey::derive("agents", "embedding", 1, 2, "{\"x\":1}");
        assert_ne!(a, b);
        assert!(a.same_lineage(&b));
    }

    #[test]
    fn lineage_breaks_on_major() {
        let a = SchemaKey::derive("agents", "embedding", 1, 0, "{}");
        let b = SchemaKey::derive("agents", "embedding", 2, 0, "{}");
        assert!(!a.same_lineage(&b));
    }

    #[test]
    fn range_matching() {
        let key = SchemaKey::derive("agents", "embedding", 1, 3, "{}");
        assert!(key.matches_range(key.ns_hash, key.kind_id, 1, 1, 5));
        assert!(!key.matches_range(key.ns_hash, key.kind_id, 1, 4, 5));
        assert!(!key.matches_range(key.ns_hash, key.kind_id, 2, 0, 9));
    }

    #[test]
    fn json_round_trip_hex_hash() {
        let key = SchemaKey::derive("agents", "embedding", 1, 3, "{}");
        let json = serde_json::to_string(&key).unwrap();
        assert!(json.contains("hash128"));
        let back: SchemaKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
