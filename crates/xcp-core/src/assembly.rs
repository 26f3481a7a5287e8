//! Chunk reassembly.
//!
//! Messages larger than the negotiated frame size arrive as chunk sequences
//! sharing a message id; MORE=1 on every chunk but the last. The table
//! buffers chunks per id, enforces the aggregate-size and concurrency caps
//! before allocating, and expires assemblies that stall.
//!
//! # Invariants
//!
//! - At most one assembly per message id.
//! - Chunks of one message agree on codec, schema key, channel, and
//!   transform flags; disagreement drops the assembly.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use xcp_proto::{Frame, FrameFlags, FrameHeader};

/// Why a chunk was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// Too many concurrent assemblies.
    #[error("assembly table full ({max} in flight)")]
    TableFull {
        /// The configured cap
        max: usize,
    },

    /// Aggregate size would exceed the cap.
    #[error("assembled message would exceed {max} bytes")]
    TooLarge {
        /// The configured cap
        max: u64,
    },

    /// Chunk disagrees with the assembly's codec, schema key, channel, or
    /// transform flags.
    #[error("chunk inconsistent with assembly: {reason}")]
    ChunkMismatch {
        /// The disagreeing field
        reason: &'static str,
    },
}

/// One in-progress multi-chunk message.
struct Assembly<I> {
    header: FrameHeader,
    flags: FrameFlags,
    chunks: Vec<Bytes>,
    total: u64,
    last_activity: I,
}

/// A fully reassembled message ready for transform reversal and decode.
pub struct Completed {
    /// Header of the first chunk (identical routing fields across chunks).
    pub header: FrameHeader,
    /// Transform flags shared by the chunks.
    pub flags: FrameFlags,
    /// Concatenated payload bytes.
    pub payload: Bytes,
}

/// Outcome of pushing one chunk.
pub enum PushOutcome {
    /// Message still incomplete; more chunks expected.
    Incomplete,
    /// Final chunk received; the message is complete.
    Complete(Completed),
}

/// Reassembly table keyed by message id.
pub struct AssemblyTable<I> {
    assemblies: HashMap<u64, Assembly<I>>,
    max_inflight: usize,
    max_assembled_bytes: u64,
}

impl<I: Copy + Ord + std::ops::Sub<Output = std::time::Duration>> AssemblyTable<I> {
    /// Empty table with the given caps.
    #[must_use]
    pub fn new(max_inflight: usize, max_assembled_bytes: u64) -> Self {
        Self { assemblies: HashMap::new(), max_inflight, max_assembled_bytes }
    }

    /// Buffer one chunk; completes the message when MORE is clear.
    ///
    /// On error the assembly for this id is dropped - the peer is expected
    /// to see a NACK and either retry or give up.
    ///
    /// # Errors
    ///
    /// - `AssemblyError::TableFull` for a new id at capacity
    /// - `AssemblyError::TooLarge` when the aggregate exceeds the cap
    /// - `AssemblyError::ChunkMismatch` on codec/schema/channel/flag drift
    pub fn push(&mut self, frame: &Frame, now: I) -> Result<PushOutcome, AssemblyError> {
        let msg_id = frame.header.msg_id;
        // MORE and LARGE vary per chunk; COMP/CRYPT must not.
        let transform_flags = frame.flags.bits() & (FrameFlags::COMP | FrameFlags::CRYPT);

        if let Some(assembly) = self.assemblies.get(&msg_id) {
            let mismatch = if assembly.header.body_codec != frame.header.body_codec {
                Some("body_codec")
            } else if assembly.header.schema_key != frame.header.schema_key {
                Some("schema_key")
            } else if assembly.header.channel_id != frame.header.channel_id {
                Some("channel_id")
            } else if assembly.flags.bits() != transform_flags {
                Some("transform flags")
            } else {
                None
            };
            if let Some(reason) = mismatch {
                self.assemblies.remove(&msg_id);
                return Err(AssemblyError::ChunkMismatch { reason });
            }
        } else {
            if self.assemblies.len() >= self.max_inflight {
                return Err(AssemblyError::TableFull { max: self.max_inflight });
            }
            self.assemblies.insert(msg_id, Assembly {
                header: frame.header.clone(),
                flags: FrameFlags::from_bits(transform_flags).unwrap_or_default(),
                chunks: Vec::new(),
                total: 0,
                last_activity: now,
            });
        }

        let assembly = self
            .assemblies
            .get_mut(&msg_id)
            .ok_or(AssemblyError::ChunkMismatch { reason: "assembly vanished" })?;

        let new_total = assembly.total.saturating_add(frame.payload.len() as u64);
        if new_total > self.max_assembled_bytes {
            self.assemblies.remove(&msg_id);
            return Err(AssemblyError::TooLarge { max: self.max_assembled_bytes });
        }

        assembly.total = new_total;
        assembly.last_activity = now;
        assembly.chunks.push(frame.payload.clone());

        if frame.flags.is_more() {
            return Ok(PushOutcome::Incomplete);
        }

        // Final chunk: concatenate and hand the message up.
        let assembly = self.assemblies.remove(&msg_id).ok_or(AssemblyError::ChunkMismatch {
            reason: "assembly vanished",
        })?;
        let mut payload = BytesMut::with_capacity(assembly.total as usize);
        for chunk in &assembly.chunks {
            payload.extend_from_slice(chunk);
        }

        Ok(PushOutcome::Complete(Completed {
            header: assembly.header,
            flags: assembly.flags,
            payload: payload.freeze(),
        }))
    }

    /// Drop assemblies idle past `timeout`; returns their headers for
    /// NACKing.
    pub fn expire(&mut self, now: I, timeout: std::time::Duration) -> Vec<FrameHeader> {
        let expired: Vec<u64> = self
            .assemblies
            .iter()
            .filter(|(_, a)| now - a.last_activity > timeout)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.assemblies.remove(&id))
            .map(|a| a.header)
            .collect()
    }

    /// Drop everything; used at session close.
    pub fn drain(&mut self) -> Vec<FrameHeader> {
        self.assemblies.drain().map(|(_, a)| a.header).collect()
    }

    /// Number of in-flight assemblies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    /// True when no assemblies are in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use xcp_proto::{CODEC_JSON, SchemaKey};

    fn chunk(msg_id: u64, payload: &[u8], more: bool) -> Frame {
        let mut header = FrameHeader::data(1, 0x0100, CODEC_JSON, SchemaKey::ZERO);
        header.msg_id = msg_id;
        let flags = if more { FrameFlags::new().with_more() } else { FrameFlags::new() };
        Frame::new(header, payload.to_vec(), flags)
    }

    #[allow(clippy::disallowed_methods)]
    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn single_chunk_completes_immediately() {
        let mut table: AssemblyTable<Instant> = AssemblyTable::new(4, 1024);
        let outcome = table.push(&chunk(1, b"whole", false), now()).unwrap();
        match outcome {
            PushOutcome::Complete(completed) => {
                assert_eq!(&completed.payload[..], b"whole");
            },
            PushOutcome::Incomplete => panic!("single chunk must complete"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn chunks_concatenate_in_arrival_order() {
        let mut table: AssemblyTable<Instant> = AssemblyTable::new(4, 1024);
        assert!(matches!(
            table.push(&chunk(7, b"abc", true), now()).unwrap(),
            PushOutcome::Incomplete
        ));
        assert!(matches!(
            table.push(&chunk(7, b"def", true), now()).unwrap(),
            PushOutcome::Incomplete
        ));
        let outcome = table.push(&chunk(7, b"ghi", false), now()).unwrap();
        match outcome {
            PushOutcome::Complete(completed) => {
                assert_eq!(&completed.payload[..], b"abcdefghi");
                assert_eq!(completed.header.msg_id, 7);
            },
            PushOutcome::Incomplete => panic!("final chunk must complete"),
        }
    }

    #[test]
    fn aggregate_cap_enforced() {
        let mut table: AssemblyTable<Instant> = AssemblyTable::new(4, 5);
        table.push(&chunk(1, b"abc", true), now()).unwrap();
        let err = table.push(&chunk(1, b"defg", true), now()).unwrap_err();
        assert_eq!(err, AssemblyError::TooLarge { max: 5 });
        assert!(table.is_empty(), "oversize assembly dropped");
    }

    #[test]
    fn inflight_cap_enforced() {
        let mut table: AssemblyTable<Instant> = AssemblyTable::new(2, 1024);
        table.push(&chunk(1, b"a", true), now()).unwrap();
        table.push(&chunk(2, b"b", true), now()).unwrap();
        let err = table.push(&chunk(3, b"c", true), now()).unwrap_err();
        assert_eq!(err, AssemblyError::TableFull { max: 2 });
        // Existing assemblies still progress.
        assert!(matches!(
            table.push(&chunk(1, b"x", false), now()).unwrap(),
            PushOutcome::Complete(_)
        ));
    }

    #[test]
    fn codec_drift_rejected() {
        let mut table: AssemblyTable<Instant> = AssemblyTable::new(4, 1024);
        table.push(&chunk(1, b"a", true), now()).unwrap();

        let mut drifted = chunk(1, b"b", false);
        drifted.header.body_codec = 0x0008;
        let err = table.push(&drifted, now()).unwrap_err();
        assert_eq!(err, AssemblyError::ChunkMismatch { reason: "body_codec" });
        assert!(table.is_empty());
    }

    #[test]
    fn stalled_assemblies_expire() {
        let mut table: AssemblyTable<Instant> = AssemblyTable::new(4, 1024);
        let t0 = now();
        table.push(&chunk(1, b"a", true), t0).unwrap();
        table.push(&chunk(2, b"b", true), t0 + Duration::from_secs(20), ).unwrap();

        let expired = table.expire(t0 + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].msg_id, 1);
        assert_eq!(table.len(), 1);
    }
}
