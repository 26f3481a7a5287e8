//! Session configuration.

use std::{collections::BTreeSet, time::Duration};

use xcp_codec::SchemaRange;
use xcp_crypto::StaticKey;

/// Default upper bound on a single frame's payload (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Default upper bound on a reassembled message (256 MiB).
pub const DEFAULT_MAX_ASSEMBLED_BYTES: u64 = 256 * 1024 * 1024;

/// Default expiry for stalled reassemblies.
pub const DEFAULT_ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default duplicate-suppression window size.
pub const DEFAULT_DUP_WINDOW_SIZE: usize = 4096;

/// Default cap on concurrent inbound reassemblies.
pub const DEFAULT_MAX_INFLIGHT_ASSEMBLIES: usize = 1024;

/// Default retry backoff base.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(50);

/// Default maximum automatic retries per message.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Default PING response deadline.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Default deadline for completing the HELLO/CAPS exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sender-side codec selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecPolicy {
    /// Pick the smallest-overhead negotiated codec for the envelope: tensor
    /// codecs for tensor kinds, JSON for small bodies, binary struct above.
    #[default]
    Auto,
    /// Always encode data frames as JSON.
    JsonOnly,
    /// Never pick JSON for data frames, and refuse JSON frame headers.
    BinaryRequired,
}

/// Per-session tunables, advertised and negotiated at handshake.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest single-frame payload accepted; advertised in HELLO/CAPS and
    /// negotiated down to the peers' minimum.
    pub max_frame_bytes: u32,
    /// Largest reassembled message accepted.
    pub max_assembled_bytes: u64,
    /// Expiry for reassemblies with no new chunk.
    pub assembly_timeout: Duration,
    /// Duplicate-suppression window size.
    pub dup_window_size: usize,
    /// Sender-side codec selection policy.
    pub codec_policy: CodecPolicy,
    /// Cap on concurrent inbound reassemblies.
    pub max_inflight_assemblies: usize,
    /// Retry backoff base; jitter is `rand(0, base * 2^attempt)`.
    pub retry_base: Duration,
    /// Maximum automatic retries per message.
    pub retry_max_attempts: u32,
    /// Apply zstd compression (the COMP flag) to outbound data.
    pub compression: bool,
    /// Enable ChaCha20-Poly1305 (the CRYPT flag) with this static key.
    pub aead_static_key: Option<StaticKey>,
    /// PING deadline; exceeding it is a local `Timeout`, never a NACK.
    pub ping_timeout: Duration,
    /// Deadline for the HELLO/CAPS exchange.
    pub handshake_timeout: Duration,
    /// Codec ids to advertise. `None` advertises every registered codec;
    /// `Some` restricts the advertisement (the set is still intersected
    /// with the registry, since unregistered ids cannot be decoded).
    pub advertised_codecs: Option<BTreeSet<u16>>,
    /// Schema ranges accepted inbound. Empty accepts everything.
    pub accept_schemas: Vec<SchemaRange>,
    /// Schema ranges this side may emit.
    pub emit_schemas: Vec<SchemaRange>,
    /// Advertise the ability to fetch `shm://` attachments.
    pub shared_mem: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_assembled_bytes: DEFAULT_MAX_ASSEMBLED_BYTES,
            assembly_timeout: DEFAULT_ASSEMBLY_TIMEOUT,
            dup_window_size: DEFAULT_DUP_WINDOW_SIZE,
            codec_policy: CodecPolicy::default(),
            max_inflight_assemblies: DEFAULT_MAX_INFLIGHT_ASSEMBLIES,
            retry_base: DEFAULT_RETRY_BASE,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            compression: false,
            aead_static_key: None,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            advertised_codecs: None,
            accept_schemas: Vec::new(),
            emit_schemas: Vec::new(),
            shared_mem: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = SessionConfig::default();
        assert_eq!(config.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.max_assembled_bytes, 256 * 1024 * 1024);
        assert_eq!(config.assembly_timeout, Duration::from_secs(30));
        assert_eq!(config.dup_window_size, 4096);
        assert_eq!(config.max_inflight_assemblies, 1024);
        assert_eq!(config.retry_base, Duration::from_millis(50));
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.ping_timeout, Duration::from_secs(1));
        assert_eq!(config.codec_policy, CodecPolicy::Auto);
        assert!(!config.compression);
        assert!(config.aead_static_key.is_none());
    }
}
