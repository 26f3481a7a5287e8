//! Shared-memory attachment contract.
//!
//! Large attachments can ride outside the frame as
//! `shm://<namespace>/<name>#<offset>,<size>` references. The backing store
//! is a collaborator behind [`ShmStore`]; the in-memory implementation backs
//! tests and single-process hosts. Ownership: the sender keeps a published
//! region alive until the frame referencing it is ACKed; a receiver must not
//! touch the region after sending ACK unless it copied out.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use bytes::Bytes;
use thiserror::Error;

/// Errors from shared-memory publish/fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShmError {
    /// URI does not match `shm://<ns>/<name>#<offset>,<size>`.
    #[error("invalid shm uri {uri:?}: {reason}")]
    InvalidUri {
        /// The offending URI
        uri: String,
        /// What failed to parse
        reason: &'static str,
    },

    /// No live region under this URI.
    #[error("shm region not found: {uri}")]
    NotFound {
        /// The dangling URI
        uri: String,
    },
}

/// A parsed `shm://` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmUri {
    /// Namespace segment.
    pub namespace: String,
    /// Region name.
    pub name: String,
    /// Byte offset into the region.
    pub offset: u64,
    /// Byte count to read.
    pub size: u64,
}

impl ShmUri {
    /// Parse `shm://<namespace>/<name>#<offset>,<size>`.
    ///
    /// # Errors
    ///
    /// - `ShmError::InvalidUri` on any structural mismatch.
    pub fn parse(uri: &str) -> Result<Self, ShmError> {
        let invalid =
            |reason: &'static str| ShmError::InvalidUri { uri: uri.to_string(), reason };

        let rest = uri.strip_prefix("shm://").ok_or_else(|| invalid("missing shm:// scheme"))?;
        let (path, fragment) = rest.split_once('#').ok_or_else(|| invalid("missing #fragment"))?;
        let (namespace, name) =
            path.split_once('/').ok_or_else(|| invalid("missing namespace/name split"))?;
        if namespace.is_empty() || name.is_empty() {
            return Err(invalid("empty namespace or name"));
        }
        let (offset, size) =
            fragment.split_once(',').ok_or_else(|| invalid("fragment is not offset,size"))?;
        let offset = offset.parse::<u64>().map_err(|_| invalid("offset is not decimal"))?;
        let size = size.parse::<u64>().map_err(|_| invalid("size is not decimal"))?;

        Ok(Self { namespace: namespace.to_string(), name: name.to_string(), offset, size })
    }
}

impl std::fmt::Display for ShmUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shm://{}/{}#{},{}", self.namespace, self.name, self.offset, self.size)
    }
}

/// Shared-memory backing store contract.
pub trait ShmStore: Send + Sync {
    /// Publish bytes, returning the URI to reference them by.
    ///
    /// # Errors
    ///
    /// - `ShmError` on store-specific failures.
    fn publish(&self, bytes: Bytes, ttl: Duration) -> Result<String, ShmError>;

    /// Fetch the bytes a URI references.
    ///
    /// # Errors
    ///
    /// - `ShmError::InvalidUri` / `ShmError::NotFound`.
    fn fetch(&self, uri: &str) -> Result<Bytes, ShmError>;

    /// Release a published region. Unknown URIs are ignored.
    fn release(&self, uri: &str);
}

/// Process-local store for tests and single-process hosts.
pub struct MemoryShmStore {
    namespace: String,
    regions: Mutex<HashMap<String, Region>>,
    next_name: Mutex<u64>,
}

struct Region {
    bytes: Bytes,
    expires_at: Instant,
}

impl MemoryShmStore {
    /// Empty store publishing under the given namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            regions: Mutex::new(HashMap::new()),
            next_name: Mutex::new(0),
        }
    }

    /// Number of live (unexpired) regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when no regions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[allow(clippy::disallowed_methods)]
    fn now() -> Instant {
        Instant::now()
    }
}

impl ShmStore for MemoryShmStore {
    fn publish(&self, bytes: Bytes, ttl: Duration) -> Result<String, ShmError> {
        let name = {
            let mut counter = self.next_name.lock().unwrap_or_else(PoisonError::into_inner);
            *counter += 1;
            format!("region-{counter}")
        };
        let uri = ShmUri {
            namespace: self.namespace.clone(),
            name: name.clone(),
            offset: 0,
            size: bytes.len() as u64,
        }
        .to_string();

        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Region { bytes, expires_at: Self::now() + ttl });
        Ok(uri)
    }

    fn fetch(&self, uri: &str) -> Result<Bytes, ShmError> {
        let parsed = ShmUri::parse(uri)?;
        let regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
        let region = regions
            .get(&parsed.name)
            .filter(|r| r.expires_at > Self::now())
            .ok_or_else(|| ShmError::NotFound { uri: uri.to_string() })?;

        let offset = usize::try_from(parsed.offset)
            .map_err(|_| ShmError::NotFound { uri: uri.to_string() })?;
        let end = offset
            .checked_add(usize::try_from(parsed.size).unwrap_or(usize::MAX))
            .filter(|end| *end <= region.bytes.len())
            .ok_or_else(|| ShmError::NotFound { uri: uri.to_string() })?;

        Ok(region.bytes.slice(offset..end))
    }

    fn release(&self, uri: &str) {
        if let Ok(parsed) = ShmUri::parse(uri) {
            self.regions.lock().unwrap_or_else(PoisonError::into_inner).remove(&parsed.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_round_trip() {
        let uri = ShmUri::parse("shm://agents/embeddings#128,4096").unwrap();
        assert_eq!(uri.namespace, "agents");
        assert_eq!(uri.name, "embeddings");
        assert_eq!(uri.offset, 128);
        assert_eq!(uri.size, 4096);
        assert_eq!(uri.to_string(), "shm://agents/embeddings#128,4096");
    }

    #[test]
    fn malformed_uris_rejected() {
        for bad in [
            "http://agents/x#0,1",
            "shm://agents#0,1",
            "shm://agents/x",
            "shm://agents/x#0",
            "shm://agents/x#a,b",
            "shm:///x#0,1",
        ] {
            assert!(ShmUri::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn publish_fetch_release() {
        let store = MemoryShmStore::new("test");
        let uri = store.publish(Bytes::from_static(b"0123456789"), Duration::from_secs(60)).unwrap();

        assert_eq!(store.fetch(&uri).unwrap(), Bytes::from_static(b"0123456789"));

        // Sub-range fetch through a rewritten fragment.
        let parsed = ShmUri::parse(&uri).unwrap();
        let sub = ShmUri { offset: 2, size: 3, ..parsed };
        assert_eq!(store.fetch(&sub.to_string()).unwrap(), Bytes::from_static(b"234"));

        store.release(&uri);
        assert!(store.fetch(&uri).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn expired_regions_unfetchable() {
        let store = MemoryShmStore::new("test");
        let uri = store.publish(Bytes::from_static(b"x"), Duration::ZERO).unwrap();
        assert!(matches!(store.fetch(&uri), Err(ShmError::NotFound { .. })));
    }

    #[test]
    fn out_of_range_fetch_rejected() {
        let store = MemoryShmStore::new("test");
        let uri = store.publish(Bytes::from_static(b"abc"), Duration::from_secs(60)).unwrap();
        let parsed = ShmUri::parse(&uri).unwrap();
        let oversize = ShmUri { offset: 1, size: 10, ..parsed };
        assert!(store.fetch(&oversize.to_string()).is_err());
    }
}
