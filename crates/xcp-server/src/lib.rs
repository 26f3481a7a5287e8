//! XCP server.
//!
//! Production glue around the Sans-IO engine: a TCP accept loop, a
//! per-connection driver, and a [`Handler`] trait for application dispatch.
//! [`serve_connection`] works over any `AsyncRead + AsyncWrite` stream, so
//! tests drive it with in-memory duplex pipes and a QUIC stream adapter
//! can slot in unchanged.
//!
//! # Concurrency
//!
//! Each connection runs one driver task: it reads a frame, walks the
//! session's actions, invokes the handler for delivered messages, and
//! writes replies - a single reader and single writer per stream. ACKs are
//! emitted in completion order per channel; the write path is never held
//! across a handler invocation (replies are queued after the handler
//! returns).

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use xcp_core::{
    Environment, Ether, FrameHeader, Result, Role, SendOptions, Session, SessionAction,
    SessionConfig, SessionError, SystemEnv, framed,
};

/// Maintenance cadence for assembly expiry and handshake deadlines.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Application dispatch for inbound data messages.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle a delivered envelope. A returned Ether is sent back as a
    /// data frame with `in_reply_to` set to the inbound message id.
    async fn on_data(&self, header: &FrameHeader, ether: Ether) -> Option<Ether>;
}

/// Handler that echoes every message back to the sender.
///
/// The default for the binary; doubles as the loopback peer in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn on_data(&self, _header: &FrameHeader, ether: Ether) -> Option<Ether> {
        Some(ether)
    }
}

/// TCP server front end.
pub struct Server {
    listener: TcpListener,
    config: SessionConfig,
    handler: Arc<dyn Handler>,
}

impl Server {
    /// Bind a TCP listener.
    ///
    /// # Errors
    ///
    /// - `SessionError::Transport` if the address cannot be bound.
    pub async fn bind(
        addr: &str,
        config: SessionConfig,
        handler: Arc<dyn Handler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SessionError::Transport(format!("bind {addr}: {e}")))?;
        tracing::info!(%addr, "xcp server listening");
        Ok(Self { listener, config, handler })
    }

    /// The bound local address.
    ///
    /// # Errors
    ///
    /// - `SessionError::Transport` if the socket is gone.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| SessionError::Transport(format!("local_addr: {e}")))
    }

    /// Accept connections forever, one driver task per connection.
    ///
    /// # Errors
    ///
    /// - `SessionError::Transport` if accepting fails irrecoverably.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| SessionError::Transport(format!("accept: {e}")))?;
            stream.set_nodelay(true).ok();
            tracing::debug!(%peer, "connection accepted");

            let config = self.config.clone();
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                if let Err(err) = serve_tcp_connection(stream, config, handler).await {
                    tracing::debug!(%peer, %err, "connection ended with error");
                }
            });
        }
    }
}

async fn serve_tcp_connection(
    stream: TcpStream,
    config: SessionConfig,
    handler: Arc<dyn Handler>,
) -> Result<()> {
    serve_connection(stream, config, handler, SystemEnv::new()).await
}

/// Drive one connection to completion over any byte stream.
///
/// Performs the server side of the handshake, dispatches delivered
/// messages to `handler`, sends its replies with `in_reply_to` set, and
/// tears down on fatal errors or peer disconnect.
///
/// # Errors
///
/// - `SessionError::Transport` on stream failure
/// - Fatal protocol errors from the session (after a best-effort GOODBYE).
pub async fn serve_connection<S, E>(
    stream: S,
    config: SessionConfig,
    handler: Arc<dyn Handler>,
    env: E,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
    E: Environment,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut session = Session::new(env.clone(), Role::Server, config);
    // Server side of begin() is a no-op, but keeps the state machine honest.
    for action in session.begin()? {
        if let SessionAction::SendFrame(frame) = action {
            framed::write_frame(&mut writer, &frame).await?;
        }
    }

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let max_payload = session
            .negotiated()
            .map_or(u64::from(u32::MAX), |n| u64::from(n.max_frame_bytes));

        // Keep one read future alive across tick firings: read_frame is not
        // cancel-safe once it has consumed part of a frame.
        let read = framed::read_frame(&mut reader, max_payload);
        tokio::pin!(read);
        let frame = loop {
            tokio::select! {
                frame = &mut read => break frame,
                _ = tick.tick() => {
                    let actions = session.tick(env.now());
                    if execute(&mut session, &mut writer, actions, handler.as_ref()).await? {
                        return Ok(());
                    }
                },
            }
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("peer disconnected");
                session.close("peer disconnected");
                return Ok(());
            },
            Err(err) => {
                // Integrity and framing failures are non-negotiable:
                // best-effort goodbye, then drop the connection.
                tracing::warn!(%err, "read failed; closing");
                let actions = session.close(&format!("read error: {err}"));
                let _ = execute(&mut session, &mut writer, actions, handler.as_ref()).await;
                return Err(err);
            },
        };

        match session.handle_frame(&frame, env.now()) {
            Ok(actions) => {
                if execute(&mut session, &mut writer, actions, handler.as_ref()).await? {
                    return Ok(());
                }
            },
            Err(err) => {
                tracing::warn!(%err, "protocol error; closing");
                let actions = session.close(&format!("protocol error: {err}"));
                let _ = execute(&mut session, &mut writer, actions, handler.as_ref()).await;
                return Err(err);
            },
        }
    }
}

/// Execute session actions on this connection. Returns `true` when the
/// session closed.
async fn execute<E, W>(
    session: &mut Session<E>,
    writer: &mut W,
    actions: Vec<SessionAction>,
    handler: &dyn Handler,
) -> Result<bool>
where
    E: Environment,
    W: AsyncWrite + Unpin + Send,
{
    let mut closed = false;
    let mut queue = std::collections::VecDeque::from(actions);

    while let Some(action) = queue.pop_front() {
        match action {
            SessionAction::SendFrame(frame) => {
                framed::write_frame(writer, &frame).await?;
            },
            SessionAction::Deliver { msg_id, header, ether } => {
                // The write path is free while the handler runs; replies
                // are queued behind it afterwards.
                if let Some(response) = handler.on_data(&header, ether).await {
                    let options = SendOptions {
                        channel_id: header.channel_id,
                        msg_type: header.msg_type,
                        in_reply_to: msg_id,
                        ..SendOptions::default()
                    };
                    match session.send(&response, &options) {
                        Ok((_reply_id, reply_actions)) => queue.extend(reply_actions),
                        Err(err) => {
                            tracing::warn!(msg_id, %err, "failed to queue reply");
                        },
                    }
                }
            },
            SessionAction::ClarifyRequested { msg_id, reason, .. } => {
                // No application hook for clarification on the server
                // facade yet; answer with an empty field map.
                tracing::debug!(msg_id, %reason, "clarification requested");
                let actions = session.clarify_response(msg_id, xcp_core::ValueMap::new())?;
                queue.extend(actions);
            },
            SessionAction::Close { reason } => {
                tracing::debug!(%reason, "session closed");
                closed = true;
            },
            SessionAction::HandshakeComplete(negotiated) => {
                tracing::debug!(
                    codecs = ?negotiated.codecs,
                    max_frame_bytes = negotiated.max_frame_bytes,
                    "handshake complete"
                );
            },
            SessionAction::AckReceived { .. }
            | SessionAction::NackReceived { .. }
            | SessionAction::PongReceived { .. }
            | SessionAction::ClarifyResolved { .. }
            | SessionAction::PeerGoodbye { .. } => {},
        }
    }

    Ok(closed)
}
