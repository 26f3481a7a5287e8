//! Capability negotiation.
//!
//! Both sides run the same pure function over the two advertisements, so
//! they reach the same result independently: codec set = intersection of
//! the peer's advertised set with the locally registered set, frame limit =
//! the smaller of the two.

use std::collections::BTreeSet;

use xcp_codec::{Capability, registry};

use crate::{
    config::SessionConfig,
    error::{Result, SessionError},
};

/// The agreement both peers converge on after HELLO/CAPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Codec ids both sides can use for data frames.
    pub codecs: BTreeSet<u16>,
    /// min(local, peer) payload limit per frame.
    pub max_frame_bytes: u32,
    /// The peer's full advertisement, for schema-range checks.
    pub peer: Capability,
}

/// Build this side's advertisement from config and the codec registry.
#[must_use]
pub fn local_capability(config: &SessionConfig) -> Capability {
    let registered = registry::registered_ids();
    let codecs = match &config.advertised_codecs {
        None => registered,
        Some(restricted) => restricted.intersection(&registered).copied().collect(),
    };
    Capability {
        codecs,
        max_frame_bytes: config.max_frame_bytes,
        accepts: config.accept_schemas.clone(),
        emits: config.emit_schemas.clone(),
        shared_mem: config.shared_mem,
    }
}

/// Intersect capabilities.
///
/// # Errors
///
/// - `SessionError::NegotiationFailed` if no codec is shared.
pub fn negotiate(local: &Capability, peer: &Capability) -> Result<Negotiated> {
    let codecs: BTreeSet<u16> = local.codecs.intersection(&peer.codecs).copied().collect();
    if codecs.is_empty() {
        return Err(SessionError::NegotiationFailed {
            reason: format!(
                "no shared codec: local {:?}, peer {:?}",
                local.codecs, peer.codecs
            ),
        });
    }

    Ok(Negotiated {
        codecs,
        max_frame_bytes: local.max_frame_bytes.min(peer.max_frame_bytes),
        peer: peer.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(codecs: &[u16], max_frame_bytes: u32) -> Capability {
        Capability {
            codecs: codecs.iter().copied().collect(),
            max_frame_bytes,
            accepts: Vec::new(),
            emits: Vec::new(),
            shared_mem: false,
        }
    }

    #[test]
    fn intersection_and_min() {
        let local = capability(&[0x0001, 0x0008, 0x0002], 1 << 20);
        let peer = capability(&[0x0001, 0x0002, 0x0020], 1 << 16);

        let negotiated = negotiate(&local, &peer).unwrap();
        assert_eq!(
            negotiated.codecs,
            [0x0001, 0x0002].into_iter().collect::<BTreeSet<u16>>()
        );
        assert_eq!(negotiated.max_frame_bytes, 1 << 16);
    }

    #[test]
    fn negotiated_set_is_subset_of_both() {
        let local = capability(&[0x0001, 0x0008], 100);
        let peer = capability(&[0x0008, 0x0010], 200);

        let negotiated = negotiate(&local, &peer).unwrap();
        assert!(negotiated.codecs.is_subset(&local.codecs));
        assert!(negotiated.codecs.is_subset(&peer.codecs));
        assert_eq!(negotiated.max_frame_bytes, 100);
    }

    #[test]
    fn empty_intersection_fails() {
        let local = capability(&[0x0001, 0x0020], 100);
        let peer = capability(&[0x0008], 100);
        assert!(matches!(
            negotiate(&local, &peer),
            Err(SessionError::NegotiationFailed { .. })
        ));
    }

    #[test]
    fn local_capability_reflects_registry_and_config() {
        let config = SessionConfig { max_frame_bytes: 12345, ..SessionConfig::default() };
        let capability = local_capability(&config);
        assert!(capability.codecs.contains(&xcp_proto::CODEC_JSON));
        assert!(capability.codecs.contains(&xcp_proto::CODEC_BINARY_STRUCT));
        assert_eq!(capability.max_frame_bytes, 12345);
    }
}
