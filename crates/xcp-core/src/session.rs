//! Session state machine.
//!
//! The engine core: handshake, codec selection, chunking, reassembly,
//! duplicate suppression, and control handling for one connection. Sans-IO:
//! methods take the current time and return [`SessionAction`]s for a driver
//! to execute. Randomness (retry jitter) comes from the [`Environment`], so
//! the whole machine runs deterministically under test.
//!
//! # State machine
//!
//! ```text
//! ┌──────┐ begin (client)   ┌───────────┐    CAPS     ┌──────┐
//! │ Init │─────────────────>│ HelloSent │────────────>│ Open │
//! └──────┘                  └───────────┘             └──────┘
//!     │  HELLO (server)   ┌───────────────┐  CAPS sent    │
//!     └──────────────────>│ HelloReceived │───────────────┘
//!                         └───────────────┘
//!     any fatal error / goodbye ──> Closing ──> Closed
//! ```
//!
//! Control bodies ride untransformed (ACKs and handshakes predate or bypass
//! the negotiated transforms); data bodies go through compress → encrypt
//! once per message before chunking.

use std::collections::HashMap;

use bytes::Bytes;
use xcp_codec::{Control, Ether, EtherCodec, ValueMap, registry};
use xcp_proto::{
    CODEC_BINARY_STRUCT, CODEC_DLPACK, CODEC_JSON, CODEC_MIXED_LATENT, CODEC_TENSOR_F16,
    CODEC_TENSOR_F32, CODEC_TENSOR_INT8, ErrorCode, Frame, FrameFlags, FrameHeader, HeaderForm,
    MsgType, SchemaKey,
};

use crate::{
    assembly::{AssemblyError, AssemblyTable, PushOutcome},
    caps::{Negotiated, local_capability, negotiate},
    config::{CodecPolicy, SessionConfig},
    dup::DupWindow,
    env::Environment,
    error::{Result, SessionError},
    retry,
    transform::Transforms,
};

/// JSON size preference for `CodecPolicy::Auto` (2 KiB).
const AUTO_JSON_LIMIT: usize = 2048;

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake with HELLO.
    Client,
    /// Awaits HELLO, replies CAPS.
    Server,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake traffic yet.
    Init,
    /// Client sent HELLO, awaiting CAPS.
    HelloSent,
    /// Server received HELLO (transient while CAPS is produced).
    HelloReceived,
    /// Handshake complete; data may flow.
    Open,
    /// Teardown in progress.
    Closing,
    /// Fully closed; all pending work released.
    Closed,
}

/// Actions returned by the state machine for the driver to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Write this frame to the stream.
    SendFrame(Frame),
    /// Hand a fully reassembled, decoded message to the host.
    Deliver {
        /// The sender's message id.
        msg_id: u64,
        /// Header of the message (routing fields of its first chunk).
        header: FrameHeader,
        /// The decoded envelope.
        ether: Ether,
    },
    /// Handshake finished; negotiation result attached.
    HandshakeComplete(Negotiated),
    /// Peer acknowledged an outbound message.
    AckReceived {
        /// The acknowledged message.
        msg_id: u64,
    },
    /// Peer rejected an outbound message.
    NackReceived {
        /// The rejected message.
        msg_id: u64,
        /// Peer-reported code.
        error_code: ErrorCode,
        /// Retry hint, if the peer offered one.
        retry_after_ms: Option<u64>,
    },
    /// Peer answered a PING.
    PongReceived {
        /// Echoed nonce.
        nonce: u64,
    },
    /// Peer asks for clarification.
    ClarifyRequested {
        /// The request's message id (reply with `in_reply_to` = this).
        msg_id: u64,
        /// Why clarification is needed.
        reason: String,
        /// Fields in question.
        fields: Vec<String>,
    },
    /// Peer answered a clarification request.
    ClarifyResolved {
        /// The original request's message id.
        in_reply_to: u64,
        /// Clarified values.
        fields: ValueMap,
    },
    /// Peer sent GOODBYE.
    PeerGoodbye {
        /// Peer-supplied reason.
        reason: String,
    },
    /// The connection must be torn down.
    Close {
        /// Why.
        reason: String,
    },
}

/// Per-send parameters.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Channel for in-order delivery. Default 0.
    pub channel_id: u32,
    /// Data message type (`>= 0x0100`).
    pub msg_type: u16,
    /// Message id this send responds to; 0 = not a response.
    pub in_reply_to: u64,
    /// Schema identity of the body; zero = unconstrained.
    pub schema_key: SchemaKey,
    /// Force a specific codec id instead of policy selection.
    pub codec: Option<u16>,
    /// Header tags.
    pub tags: Vec<(String, String)>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            channel_id: 0,
            msg_type: MsgType::DATA_MIN,
            in_reply_to: 0,
            schema_key: SchemaKey::ZERO,
            codec: None,
            tags: Vec::new(),
        }
    }
}

/// An unacknowledged outbound message, kept for retransmission.
struct PendingMessage {
    frames: Vec<Frame>,
    attempts: u32,
}

/// The per-connection protocol engine.
pub struct Session<E: Environment> {
    env: E,
    role: Role,
    config: SessionConfig,
    transforms: Transforms,
    state: SessionState,
    negotiated: Option<Negotiated>,
    next_msg_id: u64,
    dup_window: DupWindow,
    assemblies: AssemblyTable<E::Instant>,
    pending_outbound: HashMap<u64, PendingMessage>,
    started_at: E::Instant,
}

impl<E: Environment> Session<E> {
    /// Create a session. Freezes the process-wide codec registry - sessions
    /// dispatch by id and the table must not change under them.
    #[must_use]
    pub fn new(env: E, role: Role, config: SessionConfig) -> Self {
        registry::freeze();
        let transforms = Transforms {
            compression: config.compression,
            key: config.aead_static_key.clone(),
        };
        let started_at = env.now();
        Self {
            env,
            role,
            dup_window: DupWindow::new(config.dup_window_size),
            assemblies: AssemblyTable::new(
                config.max_inflight_assemblies,
                config.max_assembled_bytes,
            ),
            transforms,
            config,
            state: SessionState::Init,
            negotiated: None,
            next_msg_id: 1,
            pending_outbound: HashMap::new(),
            started_at,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Which side this session is.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Negotiation result; `None` before the handshake completes.
    #[must_use]
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start the handshake.
    ///
    /// Clients emit HELLO and move to `HelloSent`; servers stay in `Init`
    /// awaiting the peer's HELLO.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` if not in `Init`.
    pub fn begin(&mut self) -> Result<Vec<SessionAction>> {
        if self.state != SessionState::Init {
            return Err(SessionError::InvalidState { state: self.state, operation: "begin" });
        }
        match self.role {
            Role::Server => Ok(Vec::new()),
            Role::Client => {
                let hello = Control::Hello(local_capability(&self.config));
                let frame = self.control_frame(&hello)?;
                self.state = SessionState::HelloSent;
                Ok(vec![SessionAction::SendFrame(frame)])
            },
        }
    }

    /// Process one inbound frame.
    ///
    /// Per-message problems (unknown codec, oversize assembly, decode
    /// failure) are answered with NACK actions and do not error. A returned
    /// error is connection-fatal: the driver sends a best-effort GOODBYE
    /// (via [`Session::close`]) and drops the connection.
    ///
    /// # Errors
    ///
    /// - `SessionError::Protocol` on handshake-order violations, reserved
    ///   message types, malformed control bodies, or chunk drift.
    pub fn handle_frame(&mut self, frame: &Frame, now: E::Instant) -> Result<Vec<SessionAction>> {
        match self.state {
            SessionState::Closed | SessionState::Closing => return Ok(Vec::new()),
            _ => {},
        }

        let Some(msg_type) = frame.header.msg_type_enum() else {
            return Err(SessionError::Protocol(format!(
                "reserved msg_type {:#06x}",
                frame.header.msg_type
            )));
        };

        if let MsgType::Data(_) = msg_type {
            self.handle_data(frame, now)
        } else {
            self.handle_control(msg_type, frame)
        }
    }

    /// Periodic maintenance: handshake deadline and assembly expiry.
    pub fn tick(&mut self, now: E::Instant) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        let handshaking = matches!(
            self.state,
            SessionState::Init | SessionState::HelloSent | SessionState::HelloReceived
        );
        if handshaking && now - self.started_at > self.config.handshake_timeout {
            tracing::warn!(state = ?self.state, "handshake timed out");
            actions.extend(self.close("handshake timeout"));
            return actions;
        }

        for header in self.assemblies.expire(now, self.config.assembly_timeout) {
            tracing::debug!(msg_id = header.msg_id, "assembly expired");
            if let Ok(frame) = self.nack_frame(
                header.msg_id,
                ErrorCode::MessageTooLarge,
                None,
            ) {
                actions.push(SessionAction::SendFrame(frame));
            }
        }

        actions
    }

    /// Encode, transform, chunk, and queue an envelope for sending.
    ///
    /// Returns the allocated message id (strictly monotonic, starting at 1)
    /// and the frames to write, in order.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` before the session is `Open`
    /// - `SessionError::Protocol` if `options.msg_type` is in the control
    ///   range
    /// - `SessionError::CodecUnavailable` if no negotiated codec can carry
    ///   the envelope under the policy
    /// - Codec and transform errors pass through
    pub fn send(
        &mut self,
        ether: &Ether,
        options: &SendOptions,
    ) -> Result<(u64, Vec<SessionAction>)> {
        if self.state != SessionState::Open {
            return Err(SessionError::InvalidState { state: self.state, operation: "send" });
        }
        if options.msg_type < MsgType::DATA_MIN {
            return Err(SessionError::Protocol(format!(
                "msg_type {:#06x} is in the control range",
                options.msg_type
            )));
        }

        let (codec, encoded) = self.select_and_encode(ether, options)?;

        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;

        let (wire_body, transform_flags) =
            self.transforms.apply(encoded, msg_id, options.channel_id)?;

        let max_chunk = self
            .negotiated
            .as_ref()
            .map_or(self.config.max_frame_bytes, |n| n.max_frame_bytes)
            as usize;

        let mut frames = Vec::new();
        let total = wire_body.len();
        let chunk_count = total.div_ceil(max_chunk).max(1);
        for index in 0..chunk_count {
            let start = index * max_chunk;
            let end = (start + max_chunk).min(total);
            let chunk = wire_body.slice(start..end);

            let mut header =
                FrameHeader::data(options.channel_id, options.msg_type, codec.id(), options.schema_key);
            header.msg_id = msg_id;
            header.in_reply_to = options.in_reply_to;
            header.tags = options.tags.clone();

            let mut flags = transform_flags;
            if index + 1 < chunk_count {
                flags = flags.with_more();
            }
            frames.push(Frame::new(header, chunk, flags));
        }

        self.pending_outbound.insert(msg_id, PendingMessage { frames: frames.clone(), attempts: 0 });

        tracing::trace!(msg_id, chunks = frames.len(), codec = codec.name(), "queued send");
        Ok((msg_id, frames.into_iter().map(SessionAction::SendFrame).collect()))
    }

    /// Emit an ACK for `msg_id`.
    ///
    /// # Errors
    ///
    /// - Control encoding errors pass through.
    pub fn ack(&self, msg_id: u64) -> Result<Vec<SessionAction>> {
        let frame = self.control_frame(&Control::Ack { msg_id })?;
        Ok(vec![SessionAction::SendFrame(frame)])
    }

    /// Emit a NACK for `msg_id`.
    ///
    /// # Errors
    ///
    /// - Control encoding errors pass through.
    pub fn nack(
        &self,
        msg_id: u64,
        error_code: ErrorCode,
        retry_after_ms: Option<u64>,
    ) -> Result<Vec<SessionAction>> {
        let frame = self.nack_frame(msg_id, error_code, retry_after_ms)?;
        Ok(vec![SessionAction::SendFrame(frame)])
    }

    /// Emit a PING carrying `nonce`.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` before the session is `Open`.
    pub fn ping(&self, nonce: u64) -> Result<Vec<SessionAction>> {
        if self.state != SessionState::Open {
            return Err(SessionError::InvalidState { state: self.state, operation: "ping" });
        }
        let frame = self.control_frame(&Control::Ping { nonce })?;
        Ok(vec![SessionAction::SendFrame(frame)])
    }

    /// Emit a CLARIFY_REQ; returns its message id for correlation.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` before the session is `Open`.
    pub fn clarify_request(
        &mut self,
        reason: impl Into<String>,
        fields: Vec<String>,
    ) -> Result<(u64, Vec<SessionAction>)> {
        if self.state != SessionState::Open {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "clarify_request",
            });
        }
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;

        let control = Control::ClarifyReq { reason: reason.into(), fields };
        let mut frame = self.control_frame(&control)?;
        frame.header.msg_id = msg_id;
        Ok((msg_id, vec![SessionAction::SendFrame(frame)]))
    }

    /// Emit a CLARIFY_RES answering `in_reply_to`.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` before the session is `Open`.
    pub fn clarify_response(
        &mut self,
        in_reply_to: u64,
        fields: ValueMap,
    ) -> Result<Vec<SessionAction>> {
        if self.state != SessionState::Open {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "clarify_response",
            });
        }
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;

        let mut frame = self.control_frame(&Control::ClarifyRes { fields })?;
        frame.header.msg_id = msg_id;
        frame.header.in_reply_to = in_reply_to;
        Ok(vec![SessionAction::SendFrame(frame)])
    }

    /// Close the session. Idempotent.
    ///
    /// Emits a best-effort GOODBYE when the wire is still usable, releases
    /// in-flight assemblies and pending sends, and reports the close.
    pub fn close(&mut self, reason: &str) -> Vec<SessionAction> {
        if matches!(self.state, SessionState::Closed) {
            return Vec::new();
        }
        self.state = SessionState::Closing;

        let mut actions = Vec::new();
        if let Ok(frame) = self.control_frame(&Control::Goodbye { reason: reason.to_string() }) {
            actions.push(SessionAction::SendFrame(frame));
        }

        let dropped = self.assemblies.drain();
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "dropped in-flight assemblies at close");
        }
        self.pending_outbound.clear();
        self.state = SessionState::Closed;

        actions.push(SessionAction::Close { reason: reason.to_string() });
        actions
    }

    /// Compute the delay before retransmitting a NACKed message.
    ///
    /// Counts an attempt. The delay is the peer's `retry_after_ms` plus
    /// jitter drawn from the environment.
    ///
    /// # Errors
    ///
    /// - `SessionError::DeliveryFailed` once attempts are exhausted (the
    ///   message is forgotten)
    /// - `SessionError::Protocol` if the message id is unknown.
    pub fn prepare_retry(
        &mut self,
        msg_id: u64,
        retry_after_ms: u64,
    ) -> Result<std::time::Duration> {
        let pending = self
            .pending_outbound
            .get_mut(&msg_id)
            .ok_or_else(|| SessionError::Protocol(format!("retry for unknown msg {msg_id}")))?;

        if pending.attempts >= self.config.retry_max_attempts {
            let attempts = pending.attempts;
            self.pending_outbound.remove(&msg_id);
            return Err(SessionError::DeliveryFailed { msg_id, attempts });
        }
        pending.attempts += 1;
        let attempt = pending.attempts - 1;

        Ok(retry::retry_delay(
            retry_after_ms,
            self.config.retry_base,
            attempt,
            self.env.random_u64(),
        ))
    }

    /// Re-emit the stored frames of a pending message, same msg_id.
    ///
    /// # Errors
    ///
    /// - `SessionError::Protocol` if the message id is unknown (already
    ///   acknowledged or abandoned).
    pub fn retransmit(&self, msg_id: u64) -> Result<Vec<SessionAction>> {
        let pending = self
            .pending_outbound
            .get(&msg_id)
            .ok_or_else(|| SessionError::Protocol(format!("retransmit of unknown msg {msg_id}")))?;
        Ok(pending.frames.iter().cloned().map(SessionAction::SendFrame).collect())
    }

    /// Forget a pending message (delivery abandoned).
    pub fn abandon(&mut self, msg_id: u64) {
        self.pending_outbound.remove(&msg_id);
    }

    fn handle_control(&mut self, msg_type: MsgType, frame: &Frame) -> Result<Vec<SessionAction>> {
        if !frame.header.schema_key.is_zero() {
            return Err(SessionError::Protocol(
                "control frame carries a nonzero schema key".to_string(),
            ));
        }

        match (self.state, self.role, msg_type) {
            (SessionState::Init, Role::Server, MsgType::Hello) => {
                self.state = SessionState::HelloReceived;
                let Control::Hello(peer_caps) = self.decode_control(msg_type, frame)? else {
                    return Err(SessionError::Protocol("HELLO with non-hello body".to_string()));
                };

                let local = local_capability(&self.config);
                match negotiate(&local, &peer_caps) {
                    Ok(negotiated) => {
                        self.negotiated = Some(negotiated.clone());
                        self.state = SessionState::Open;
                        // CAPS goes back with the universal codec: the peer
                        // may not share our preferred one.
                        let caps = Control::Caps(local);
                        let frame = self.control_frame_with(&caps, CODEC_JSON)?;
                        tracing::debug!(
                            codecs = ?negotiated.codecs,
                            max_frame_bytes = negotiated.max_frame_bytes,
                            "handshake complete"
                        );
                        Ok(vec![
                            SessionAction::SendFrame(frame),
                            SessionAction::HandshakeComplete(negotiated),
                        ])
                    },
                    Err(err) => {
                        tracing::warn!(%err, "capability negotiation failed");
                        let nack =
                            self.nack_frame(0, ErrorCode::CodecUnsupported, None)?;
                        let mut actions = vec![SessionAction::SendFrame(nack)];
                        self.state = SessionState::Closed;
                        self.pending_outbound.clear();
                        actions.push(SessionAction::Close {
                            reason: "no shared codec".to_string(),
                        });
                        Ok(actions)
                    },
                }
            },

            (SessionState::HelloSent, Role::Client, MsgType::Caps) => {
                let Control::Caps(peer_caps) = self.decode_control(msg_type, frame)? else {
                    return Err(SessionError::Protocol("CAPS with non-caps body".to_string()));
                };

                let local = local_capability(&self.config);
                let negotiated = negotiate(&local, &peer_caps)?;
                self.negotiated = Some(negotiated.clone());
                self.state = SessionState::Open;
                tracing::debug!(
                    codecs = ?negotiated.codecs,
                    max_frame_bytes = negotiated.max_frame_bytes,
                    "handshake complete"
                );
                Ok(vec![SessionAction::HandshakeComplete(negotiated)])
            },

            // The server refused our HELLO (e.g. empty codec intersection).
            (SessionState::HelloSent, Role::Client, MsgType::Nack) => {
                let Control::Nack { msg_id, error_code, retry_after_ms } =
                    self.decode_control(msg_type, frame)?
                else {
                    return Err(SessionError::Protocol("NACK with non-nack body".to_string()));
                };
                let mut actions =
                    vec![SessionAction::NackReceived { msg_id, error_code, retry_after_ms }];
                self.state = SessionState::Closed;
                self.pending_outbound.clear();
                actions.push(SessionAction::Close { reason: "handshake refused".to_string() });
                Ok(actions)
            },

            (SessionState::Open, _, MsgType::Ack) => {
                let Control::Ack { msg_id } = self.decode_control(msg_type, frame)? else {
                    return Err(SessionError::Protocol("ACK with non-ack body".to_string()));
                };
                self.pending_outbound.remove(&msg_id);
                Ok(vec![SessionAction::AckReceived { msg_id }])
            },

            (SessionState::Open, _, MsgType::Nack) => {
                let Control::Nack { msg_id, error_code, retry_after_ms } =
                    self.decode_control(msg_type, frame)?
                else {
                    return Err(SessionError::Protocol("NACK with non-nack body".to_string()));
                };
                Ok(vec![SessionAction::NackReceived { msg_id, error_code, retry_after_ms }])
            },

            (SessionState::Open, _, MsgType::Ping) => {
                let Control::Ping { nonce } = self.decode_control(msg_type, frame)? else {
                    return Err(SessionError::Protocol("PING with non-ping body".to_string()));
                };
                let pong = self.control_frame(&Control::Pong { nonce })?;
                Ok(vec![SessionAction::SendFrame(pong)])
            },

            (SessionState::Open, _, MsgType::Pong) => {
                let Control::Pong { nonce } = self.decode_control(msg_type, frame)? else {
                    return Err(SessionError::Protocol("PONG with non-pong body".to_string()));
                };
                Ok(vec![SessionAction::PongReceived { nonce }])
            },

            (SessionState::Open, _, MsgType::ClarifyReq) => {
                if self.dup_window.contains(frame.header.msg_id) {
                    return Ok(Vec::new());
                }
                let Control::ClarifyReq { reason, fields } =
                    self.decode_control(msg_type, frame)?
                else {
                    return Err(SessionError::Protocol(
                        "CLARIFY_REQ with mismatched body".to_string(),
                    ));
                };
                self.dup_window.insert(frame.header.msg_id);
                Ok(vec![SessionAction::ClarifyRequested {
                    msg_id: frame.header.msg_id,
                    reason,
                    fields,
                }])
            },

            (SessionState::Open, _, MsgType::ClarifyRes) => {
                if self.dup_window.contains(frame.header.msg_id) {
                    return Ok(Vec::new());
                }
                let Control::ClarifyRes { fields } = self.decode_control(msg_type, frame)?
                else {
                    return Err(SessionError::Protocol(
                        "CLARIFY_RES with mismatched body".to_string(),
                    ));
                };
                self.dup_window.insert(frame.header.msg_id);
                Ok(vec![SessionAction::ClarifyResolved {
                    in_reply_to: frame.header.in_reply_to,
                    fields,
                }])
            },

            (_, _, MsgType::Goodbye) => {
                let Control::Goodbye { reason } = self.decode_control(msg_type, frame)? else {
                    return Err(SessionError::Protocol("GOODBYE with non-goodbye body".to_string()));
                };
                self.state = SessionState::Closed;
                self.assemblies.drain();
                self.pending_outbound.clear();
                Ok(vec![
                    SessionAction::PeerGoodbye { reason: reason.clone() },
                    SessionAction::Close { reason: format!("peer goodbye: {reason}") },
                ])
            },

            (state, _, other) => Err(SessionError::Protocol(format!(
                "unexpected {other:?} in state {state:?}"
            ))),
        }
    }

    fn handle_data(&mut self, frame: &Frame, now: E::Instant) -> Result<Vec<SessionAction>> {
        if self.state != SessionState::Open {
            // Any data frame before the handshake completes is fatal.
            return Err(SessionError::Protocol(format!(
                "data frame in state {:?}",
                self.state
            )));
        }
        let msg_id = frame.header.msg_id;
        if msg_id == 0 {
            return Err(SessionError::Protocol("data frame with msg_id 0".to_string()));
        }

        // Duplicate: never re-deliver, but do re-ACK so the sender stops.
        if self.dup_window.contains(msg_id) {
            tracing::debug!(msg_id, "duplicate frame suppressed");
            return self.ack(msg_id);
        }

        if self.config.codec_policy == CodecPolicy::BinaryRequired
            && frame.header_form == HeaderForm::Json
        {
            return self.nack(msg_id, ErrorCode::CodecUnsupported, None);
        }

        let in_negotiated_set = self
            .negotiated
            .as_ref()
            .is_some_and(|n| n.codecs.contains(&frame.header.body_codec));
        let codec = match registry::lookup(frame.header.body_codec) {
            Ok(codec) if in_negotiated_set => codec,
            _ => {
                tracing::debug!(codec = frame.header.body_codec, "unsupported body codec");
                return self.nack(msg_id, ErrorCode::CodecUnsupported, None);
            },
        };

        let key = frame.header.schema_key;
        if !key.is_zero()
            && !self.config.accept_schemas.is_empty()
            && !self.config.accept_schemas.iter().any(|range| range.contains(&key))
        {
            tracing::debug!(msg_id, "schema key outside accepted ranges");
            return self.nack(msg_id, ErrorCode::SchemaUnknown, None);
        }

        let completed = match self.assemblies.push(frame, now) {
            Ok(PushOutcome::Incomplete) => return Ok(Vec::new()),
            Ok(PushOutcome::Complete(completed)) => completed,
            Err(AssemblyError::TableFull { .. } | AssemblyError::TooLarge { .. }) => {
                return self.nack(msg_id, ErrorCode::MessageTooLarge, None);
            },
            Err(AssemblyError::ChunkMismatch { reason }) => {
                // Chunks must share codec and schema; drift means a broken
                // or hostile sender.
                return Err(SessionError::Protocol(format!("chunk drift: {reason}")));
            },
        };

        let body = match self.transforms.reverse(
            completed.payload,
            completed.flags,
            msg_id,
            completed.header.channel_id,
            self.config.max_assembled_bytes,
        ) {
            Ok(body) => body,
            Err(err) => {
                // CRC was intact, so the frame arrived correctly but cannot
                // be made intelligible.
                tracing::debug!(msg_id, %err, "transform reversal failed");
                return self.nack(msg_id, ErrorCode::SchemaUnknown, None);
            },
        };

        match codec.decode(&body) {
            Ok(ether) => {
                self.dup_window.insert(msg_id);
                let mut actions = self.ack(msg_id)?;
                actions.push(SessionAction::Deliver {
                    msg_id,
                    header: completed.header,
                    ether,
                });
                Ok(actions)
            },
            Err(err) => {
                tracing::debug!(msg_id, %err, "body decode failed");
                self.nack(msg_id, ErrorCode::SchemaUnknown, None)
            },
        }
    }

    fn select_and_encode(
        &self,
        ether: &Ether,
        options: &SendOptions,
    ) -> Result<(std::sync::Arc<dyn EtherCodec>, Bytes)> {
        let negotiated = self
            .negotiated
            .as_ref()
            .ok_or(SessionError::InvalidState { state: self.state, operation: "send" })?;
        let available = &negotiated.codecs;

        if let Some(id) = options.codec {
            if !available.contains(&id) {
                return Err(SessionError::CodecUnavailable {
                    reason: format!("codec {id:#06x} not in the negotiated set"),
                });
            }
            let codec = registry::lookup(id)?;
            let bytes = codec.encode(ether)?;
            return Ok((codec, bytes));
        }

        if self.config.codec_policy == CodecPolicy::JsonOnly {
            if !available.contains(&CODEC_JSON) {
                return Err(SessionError::CodecUnavailable {
                    reason: "policy is JsonOnly but JSON was not negotiated".to_string(),
                });
            }
            let codec = registry::lookup(CODEC_JSON)?;
            let bytes = codec.encode(ether)?;
            return Ok((codec, bytes));
        }

        // Tensor kinds go to their dedicated codecs when negotiated.
        if let Some(id) = tensor_codec_for_kind(&ether.kind)
            && available.contains(&id)
        {
            let codec = registry::lookup(id)?;
            let bytes = codec.encode(ether)?;
            return Ok((codec, bytes));
        }

        let json_allowed = available.contains(&CODEC_JSON)
            && self.config.codec_policy != CodecPolicy::BinaryRequired;

        if available.contains(&CODEC_BINARY_STRUCT) {
            let binary = registry::lookup(CODEC_BINARY_STRUCT)?;
            let bytes = binary.encode(ether)?;
            if json_allowed && bytes.len() <= AUTO_JSON_LIMIT {
                let json = registry::lookup(CODEC_JSON)?;
                let json_bytes = json.encode(ether)?;
                return Ok((json, json_bytes));
            }
            return Ok((binary, bytes));
        }

        if json_allowed {
            let json = registry::lookup(CODEC_JSON)?;
            let bytes = json.encode(ether)?;
            return Ok((json, bytes));
        }

        Err(SessionError::CodecUnavailable {
            reason: format!("no negotiated codec for kind {:?}", ether.kind),
        })
    }

    /// Codec id for control bodies once the session is open.
    fn control_codec_id(&self) -> u16 {
        match &self.negotiated {
            Some(negotiated) if negotiated.codecs.contains(&CODEC_BINARY_STRUCT) => {
                CODEC_BINARY_STRUCT
            },
            // Pre-negotiation (HELLO) and degenerate sets fall back to the
            // codec every peer must support.
            _ => CODEC_JSON,
        }
    }

    fn control_frame(&self, control: &Control) -> Result<Frame> {
        self.control_frame_with(control, self.control_codec_id())
    }

    fn control_frame_with(&self, control: &Control, codec_id: u16) -> Result<Frame> {
        let codec = registry::lookup(codec_id)?;
        let body = control.encode(codec.as_ref())?;
        let header = FrameHeader::control(control.msg_type(), codec_id);
        Ok(Frame::new(header, body, FrameFlags::new()))
    }

    fn nack_frame(
        &self,
        msg_id: u64,
        error_code: ErrorCode,
        retry_after_ms: Option<u64>,
    ) -> Result<Frame> {
        self.control_frame(&Control::Nack { msg_id, error_code, retry_after_ms })
    }

    fn decode_control(&self, msg_type: MsgType, frame: &Frame) -> Result<Control> {
        let codec_id = frame.header.body_codec;
        if codec_id != CODEC_JSON && codec_id != CODEC_BINARY_STRUCT {
            return Err(SessionError::Protocol(format!(
                "control body uses non-universal codec {codec_id:#06x}"
            )));
        }
        let codec = registry::lookup(codec_id)
            .map_err(|_| SessionError::Protocol("control codec unregistered".to_string()))?;
        Control::decode(msg_type, codec.as_ref(), &frame.payload)
            .map_err(|e| SessionError::Protocol(format!("malformed control body: {e}")))
    }
}

/// Dedicated codec id for a tensor envelope kind, if any.
fn tensor_codec_for_kind(kind: &str) -> Option<u16> {
    match kind {
        "tensor.f32" => Some(CODEC_TENSOR_F32),
        "tensor.f16" => Some(CODEC_TENSOR_F16),
        "tensor.int8" => Some(CODEC_TENSOR_INT8),
        "tensor.mixed" => Some(CODEC_MIXED_LATENT),
        "tensor.dlpack" => Some(CODEC_DLPACK),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::env::test_env::TestEnv;

    fn open_pair() -> (Session<TestEnv>, Session<TestEnv>, TestEnv) {
        open_pair_with(SessionConfig::default(), SessionConfig::default())
    }

    fn open_pair_with(
        client_config: SessionConfig,
        server_config: SessionConfig,
    ) -> (Session<TestEnv>, Session<TestEnv>, TestEnv) {
        let env = TestEnv::new();
        let mut client = Session::new(env.clone(), Role::Client, client_config);
        let mut server = Session::new(env.clone(), Role::Server, server_config);

        let hello = client.begin().unwrap();
        assert_eq!(client.state(), SessionState::HelloSent);
        let SessionAction::SendFrame(hello_frame) = &hello[0] else {
            panic!("expected SendFrame");
        };

        let server_actions = server.handle_frame(hello_frame, env.now()).unwrap();
        assert_eq!(server.state(), SessionState::Open);
        let SessionAction::SendFrame(caps_frame) = &server_actions[0] else {
            panic!("expected CAPS SendFrame");
        };
        assert!(matches!(server_actions[1], SessionAction::HandshakeComplete(_)));

        let client_actions = client.handle_frame(caps_frame, env.now()).unwrap();
        assert_eq!(client.state(), SessionState::Open);
        assert!(matches!(client_actions[0], SessionAction::HandshakeComplete(_)));

        (client, server, env)
    }

    fn text_ether(text: &str) -> Ether {
        Ether::new("text", 1).unwrap().with_payload("text", text)
    }

    /// Feed `actions`' SendFrames into `receiver`, returning its actions.
    fn relay(
        actions: &[SessionAction],
        receiver: &mut Session<TestEnv>,
        env: &TestEnv,
    ) -> Vec<SessionAction> {
        let mut out = Vec::new();
        for action in actions {
            if let SessionAction::SendFrame(frame) = action {
                out.extend(receiver.handle_frame(frame, env.now()).unwrap());
            }
        }
        out
    }

    #[test]
    fn handshake_negotiates_intersection_and_min() {
        let client_config = SessionConfig { max_frame_bytes: 1 << 20, ..Default::default() };
        let server_config = SessionConfig { max_frame_bytes: 1 << 16, ..Default::default() };
        let (client, server, _env) = open_pair_with(client_config, server_config);

        let client_negotiated = client.negotiated().unwrap();
        let server_negotiated = server.negotiated().unwrap();
        assert_eq!(client_negotiated.max_frame_bytes, 1 << 16);
        assert_eq!(server_negotiated.max_frame_bytes, 1 << 16);
        assert_eq!(client_negotiated.codecs, server_negotiated.codecs);
        assert!(client_negotiated.codecs.contains(&CODEC_JSON));
    }

    #[test]
    fn send_and_deliver_round_trip() {
        let (mut client, mut server, env) = open_pair();

        let ether = text_ether("hi");
        let (msg_id, actions) = client.send(&ether, &SendOptions::default()).unwrap();
        assert_eq!(msg_id, 1);

        let server_actions = relay(&actions, &mut server, &env);
        // ACK + Deliver.
        let delivered = server_actions.iter().find_map(|a| match a {
            SessionAction::Deliver { msg_id, ether, .. } => Some((*msg_id, ether.clone())),
            _ => None,
        });
        let (delivered_id, delivered_ether) = delivered.expect("message delivered");
        assert_eq!(delivered_id, 1);
        assert_eq!(delivered_ether, ether);

        // Relay the ACK back to the client.
        let client_actions = relay(&server_actions, &mut client, &env);
        assert!(client_actions.contains(&SessionAction::AckReceived { msg_id: 1 }));
    }

    #[test]
    fn msg_ids_strictly_monotonic() {
        let (mut client, _server, _env) = open_pair();
        let mut last = 0;
        for _ in 0..10 {
            let (msg_id, _) = client.send(&text_ether("x"), &SendOptions::default()).unwrap();
            assert!(msg_id > last);
            last = msg_id;
        }
    }

    #[test]
    fn oversize_message_chunks_and_reassembles() {
        let config = SessionConfig { max_frame_bytes: 64 * 1024, ..Default::default() };
        let (mut client, mut server, env) = open_pair_with(config.clone(), config);

        let big = "x".repeat(150 * 1024);
        let ether = text_ether(&big);
        let (_msg_id, actions) = client.send(&ether, &SendOptions::default()).unwrap();

        let frames: Vec<&Frame> = actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::SendFrame(f) => Some(f),
                _ => None,
            })
            .collect();
        assert!(frames.len() >= 3, "expected >= 3 chunks, got {}", frames.len());
        for frame in &frames[..frames.len() - 1] {
            assert!(frame.flags.is_more());
        }
        assert!(!frames.last().unwrap().flags.is_more());
        // Chunks share msg_id and codec.
        let first = &frames[0].header;
        for frame in &frames {
            assert_eq!(frame.header.msg_id, first.msg_id);
            assert_eq!(frame.header.body_codec, first.body_codec);
        }

        let server_actions = relay(&actions, &mut server, &env);
        let delivered = server_actions.iter().any(|a| matches!(
            a,
            SessionAction::Deliver { ether: e, .. } if *e == ether
        ));
        assert!(delivered, "chunked message reassembled and delivered");
    }

    #[test]
    fn duplicate_frames_reack_without_redelivery() {
        let (mut client, mut server, env) = open_pair();

        let (_msg_id, actions) = client.send(&text_ether("once"), &SendOptions::default()).unwrap();

        let first = relay(&actions, &mut server, &env);
        assert!(first.iter().any(|a| matches!(a, SessionAction::Deliver { .. })));

        // Replay the identical frames.
        let second = relay(&actions, &mut server, &env);
        assert!(
            !second.iter().any(|a| matches!(a, SessionAction::Deliver { .. })),
            "no second delivery"
        );
        assert!(
            second.iter().any(|a| matches!(a, SessionAction::SendFrame(f) if
                f.header.msg_type_enum() == Some(MsgType::Ack))),
            "ACK re-emitted"
        );
    }

    #[test]
    fn replayed_chunk_sequence_delivers_once() {
        let config = SessionConfig { max_frame_bytes: 1024, ..Default::default() };
        let (mut client, mut server, env) = open_pair_with(config.clone(), config);

        let ether = text_ether(&"c".repeat(3000));
        let (_msg_id, actions) = client.send(&ether, &SendOptions::default()).unwrap();

        let first = relay(&actions, &mut server, &env);
        assert_eq!(
            first.iter().filter(|a| matches!(a, SessionAction::Deliver { .. })).count(),
            1
        );

        // The complete chunk sequence again, e.g. a blanket retransmit.
        let second = relay(&actions, &mut server, &env);
        assert_eq!(
            second.iter().filter(|a| matches!(a, SessionAction::Deliver { .. })).count(),
            0,
            "replayed sequence must not deliver again"
        );
        assert_eq!(
            second
                .iter()
                .filter(|a| matches!(
                    a,
                    SessionAction::SendFrame(f) if f.header.msg_type_enum() == Some(MsgType::Ack)
                ))
                .count(),
            actions.len(),
            "each replayed chunk draws a re-ACK once the message is known"
        );
    }

    #[test]
    fn unknown_codec_is_nacked() {
        let (_client, mut server, env) = open_pair();

        let mut header = FrameHeader::data(0, 0x0100, 0x0077, SchemaKey::ZERO);
        header.msg_id = 5;
        let frame = Frame::new(header, b"???".to_vec(), FrameFlags::new());

        let actions = server.handle_frame(&frame, env.now()).unwrap();
        let nacked = actions.iter().any(|a| matches!(
            a,
            SessionAction::SendFrame(f) if f.header.msg_type_enum() == Some(MsgType::Nack)
        ));
        assert!(nacked);
    }

    #[test]
    fn garbage_body_nacked_as_schema_unknown() {
        let (_client, mut server, env) = open_pair();

        let mut header = FrameHeader::data(0, 0x0100, CODEC_JSON, SchemaKey::ZERO);
        header.msg_id = 6;
        let frame = Frame::new(header, b"not json at all".to_vec(), FrameFlags::new());

        let actions = server.handle_frame(&frame, env.now()).unwrap();
        let mut saw_nack = false;
        for action in &actions {
            if let SessionAction::SendFrame(f) = action
                && f.header.msg_type_enum() == Some(MsgType::Nack)
            {
                saw_nack = true;
                let control = Control::decode(
                    MsgType::Nack,
                    registry::lookup(f.header.body_codec).unwrap().as_ref(),
                    &f.payload,
                )
                .unwrap();
                assert!(matches!(
                    control,
                    Control::Nack { error_code: ErrorCode::SchemaUnknown, .. }
                ));
            }
        }
        assert!(saw_nack);
    }

    #[test]
    fn ping_pong_correlates_nonce() {
        let (client, mut server, env) = open_pair();

        let actions = client.ping(0xDEAD_BEEF).unwrap();
        let SessionAction::SendFrame(ping_frame) = &actions[0] else { panic!() };

        let server_actions = server.handle_frame(ping_frame, env.now()).unwrap();
        let SessionAction::SendFrame(pong_frame) = &server_actions[0] else { panic!() };
        assert_eq!(pong_frame.header.msg_type_enum(), Some(MsgType::Pong));

        let mut client2 = client;
        let client_actions = client2.handle_frame(pong_frame, env.now()).unwrap();
        assert_eq!(client_actions, vec![SessionAction::PongReceived { nonce: 0xDEAD_BEEF }]);
    }

    #[test]
    fn data_before_handshake_is_fatal() {
        let env = TestEnv::new();
        let mut server = Session::new(env.clone(), Role::Server, SessionConfig::default());

        let mut header = FrameHeader::data(0, 0x0100, CODEC_JSON, SchemaKey::ZERO);
        header.msg_id = 1;
        let frame = Frame::new(header, b"{}".to_vec(), FrameFlags::new());

        let result = server.handle_frame(&frame, env.now());
        assert!(matches!(result, Err(SessionError::Protocol(_))));
    }

    #[test]
    fn goodbye_closes_and_reports() {
        let (mut client, mut server, env) = open_pair();

        let actions = client.close("done");
        assert_eq!(client.state(), SessionState::Closed);
        // Idempotent.
        assert!(client.close("again").is_empty());

        let server_actions = relay(&actions, &mut server, &env);
        assert_eq!(server.state(), SessionState::Closed);
        assert!(server_actions.iter().any(|a| matches!(a, SessionAction::PeerGoodbye { .. })));
    }

    #[test]
    fn retry_exhaustion_surfaces_delivery_failed() {
        let (mut client, _server, _env) = open_pair();

        let (msg_id, _) = client.send(&text_ether("retry"), &SendOptions::default()).unwrap();

        for _ in 0..3 {
            let delay = client.prepare_retry(msg_id, 100).unwrap();
            assert!(delay >= Duration::from_millis(100));
            assert!(client.retransmit(msg_id).is_ok());
        }
        let result = client.prepare_retry(msg_id, 100);
        assert!(matches!(
            result,
            Err(SessionError::DeliveryFailed { msg_id: m, attempts: 3 }) if m == msg_id
        ));
        // Forgotten after failure.
        assert!(client.retransmit(msg_id).is_err());
    }

    #[test]
    fn negotiation_failure_nacks_and_closes() {
        let env = TestEnv::new();
        // Client only advertises a codec the server will not share.
        let client_config = SessionConfig {
            advertised_codecs: Some([CODEC_JSON].into_iter().collect()),
            ..Default::default()
        };
        let server_config = SessionConfig {
            advertised_codecs: Some([CODEC_BINARY_STRUCT].into_iter().collect()),
            ..Default::default()
        };
        let mut client = Session::new(env.clone(), Role::Client, client_config);
        let mut server = Session::new(env.clone(), Role::Server, server_config);

        let hello = client.begin().unwrap();
        let SessionAction::SendFrame(hello_frame) = &hello[0] else { panic!() };

        let server_actions = server.handle_frame(hello_frame, env.now()).unwrap();
        assert_eq!(server.state(), SessionState::Closed);
        let SessionAction::SendFrame(nack_frame) = &server_actions[0] else { panic!() };
        assert_eq!(nack_frame.header.msg_type_enum(), Some(MsgType::Nack));
        assert!(matches!(server_actions[1], SessionAction::Close { .. }));

        let client_actions = client.handle_frame(nack_frame, env.now()).unwrap();
        assert_eq!(client.state(), SessionState::Closed);
        assert!(client_actions.iter().any(|a| matches!(
            a,
            SessionAction::NackReceived { error_code: ErrorCode::CodecUnsupported, .. }
        )));
    }

    #[test]
    fn assembly_timeout_nacks_on_tick() {
        let config = SessionConfig { max_frame_bytes: 1024, ..Default::default() };
        let (mut client, mut server, env) = open_pair_with(config.clone(), config);

        // Send only the first chunk of a multi-chunk message.
        let big = "y".repeat(4096);
        let (_msg_id, actions) = client.send(&text_ether(&big), &SendOptions::default()).unwrap();
        let SessionAction::SendFrame(first_chunk) = &actions[0] else { panic!() };
        assert!(first_chunk.flags.is_more());

        let out = server.handle_frame(first_chunk, env.now()).unwrap();
        assert!(out.is_empty(), "incomplete assembly produces nothing yet");

        env.advance(Duration::from_secs(31));
        let tick_actions = server.tick(env.now());
        assert!(tick_actions.iter().any(|a| matches!(
            a,
            SessionAction::SendFrame(f) if f.header.msg_type_enum() == Some(MsgType::Nack)
        )));
    }

    #[test]
    fn handshake_timeout_closes() {
        let env = TestEnv::new();
        let mut client = Session::new(env.clone(), Role::Client, SessionConfig::default());
        client.begin().unwrap();

        env.advance(Duration::from_secs(11));
        let actions = client.tick(env.now());
        assert!(actions.iter().any(|a| matches!(a, SessionAction::Close { .. })));
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[test]
    fn transforms_applied_end_to_end() {
        let key = xcp_crypto::StaticKey::new([9u8; 32]);
        let make = |key: xcp_crypto::StaticKey| SessionConfig {
            compression: true,
            aead_static_key: Some(key),
            ..Default::default()
        };
        let (mut client, mut server, env) = open_pair_with(make(key.clone()), make(key));

        let ether = text_ether(&"z".repeat(8 * 1024));
        let (_msg_id, actions) = client.send(&ether, &SendOptions::default()).unwrap();

        // Wire payloads are flagged and not plaintext.
        for action in &actions {
            if let SessionAction::SendFrame(frame) = action {
                assert!(frame.flags.is_comp());
                assert!(frame.flags.is_crypt());
            }
        }

        let server_actions = relay(&actions, &mut server, &env);
        assert!(server_actions.iter().any(|a| matches!(
            a,
            SessionAction::Deliver { ether: e, .. } if *e == ether
        )));
    }
}
