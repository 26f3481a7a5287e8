//! Connection driver and client API.
//!
//! The client wraps a Sans-IO [`Session`] with real I/O: one writer task
//! drains an outbound frame channel, one reader task parses frames and
//! executes the session's actions, and a maintenance task drives `tick`.
//! Protocol state is only ever touched under the session lock, which is
//! never held across an await.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use xcp_core::{
    Environment, Ether, Frame, FrameHeader, Negotiated, Result, Role, SendOptions, Session,
    SessionAction, SessionConfig, SessionError, SystemEnv, ValueMap, framed,
};

/// Maintenance cadence for assembly expiry and handshake deadlines.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Outbound channel depth; senders briefly block when the wire backs up.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Events surfaced to the host through [`Client::recv`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A data message that is not a response to an outstanding request.
    Message {
        /// Sender's message id.
        msg_id: u64,
        /// Frame header of the message.
        header: FrameHeader,
        /// Decoded envelope.
        ether: Ether,
    },
    /// The peer acknowledged an outbound message.
    Acked {
        /// The acknowledged message.
        msg_id: u64,
    },
    /// Automatic retries for a message were exhausted.
    DeliveryFailed {
        /// The undeliverable message.
        msg_id: u64,
    },
    /// The peer asked for clarification.
    ClarifyRequested {
        /// Request id to answer with `in_reply_to`.
        msg_id: u64,
        /// Why.
        reason: String,
        /// Fields in question.
        fields: Vec<String>,
    },
    /// The peer answered a clarification request.
    ClarifyResolved {
        /// The original request id.
        in_reply_to: u64,
        /// Clarified values.
        fields: ValueMap,
    },
    /// The peer said goodbye.
    PeerGoodbye {
        /// Peer-supplied reason.
        reason: String,
    },
    /// The connection closed.
    Closed {
        /// Why.
        reason: String,
    },
}

struct Shared<E: Environment> {
    env: E,
    session: Mutex<Session<E>>,
    to_wire: mpsc::Sender<Frame>,
    pending_requests: Mutex<HashMap<u64, oneshot::Sender<Result<Ether>>>>,
    pending_pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    events: mpsc::Sender<ClientEvent>,
}

impl<E: Environment> Shared<E> {
    fn lock_session(&self) -> std::sync::MutexGuard<'_, Session<E>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute session actions: queue frames, resolve waiters, emit events.
    ///
    /// Returns a boxed future (rather than `async fn`) so its type is
    /// concrete, not opaque - `handle_nack` awaits this and this awaits
    /// `handle_nack`, and two mutually-recursive `impl Future` types cannot
    /// be resolved by the compiler.
    fn execute(
        self: &Arc<Self>,
        actions: Vec<SessionAction>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.execute_inner(actions))
    }

    async fn execute_inner(self: &Arc<Self>, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::SendFrame(frame) => {
                    if self.to_wire.send(frame).await.is_err() {
                        tracing::debug!("writer gone; dropping outbound frame");
                    }
                },
                SessionAction::Deliver { msg_id, header, ether } => {
                    let responder = (header.in_reply_to != 0)
                        .then(|| {
                            self.pending_requests
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&header.in_reply_to)
                        })
                        .flatten();
                    match responder {
                        Some(tx) => {
                            let _ = tx.send(Ok(ether));
                        },
                        None => {
                            let _ = self
                                .events
                                .send(ClientEvent::Message { msg_id, header, ether })
                                .await;
                        },
                    }
                },
                SessionAction::AckReceived { msg_id } => {
                    let _ = self.events.send(ClientEvent::Acked { msg_id }).await;
                },
                SessionAction::NackReceived { msg_id, error_code, retry_after_ms } => {
                    self.handle_nack(msg_id, error_code, retry_after_ms).await;
                },
                SessionAction::PongReceived { nonce } => {
                    if let Some(tx) = self
                        .pending_pings
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&nonce)
                    {
                        let _ = tx.send(());
                    }
                },
                SessionAction::ClarifyRequested { msg_id, reason, fields } => {
                    let _ = self
                        .events
                        .send(ClientEvent::ClarifyRequested { msg_id, reason, fields })
                        .await;
                },
                SessionAction::ClarifyResolved { in_reply_to, fields } => {
                    let _ = self
                        .events
                        .send(ClientEvent::ClarifyResolved { in_reply_to, fields })
                        .await;
                },
                SessionAction::PeerGoodbye { reason } => {
                    let _ = self.events.send(ClientEvent::PeerGoodbye { reason }).await;
                },
                SessionAction::Close { reason } => {
                    self.fail_pending(&SessionError::SessionClosed);
                    let _ = self.events.send(ClientEvent::Closed { reason }).await;
                },
                SessionAction::HandshakeComplete(_) => {
                    // Resolved by the connect path via the negotiation watch.
                },
            }
        }
    }

    /// NACK handling: schedule a retransmit when the peer invites one,
    /// otherwise fail the originating call.
    async fn handle_nack(
        self: &Arc<Self>,
        msg_id: u64,
        error_code: xcp_core::ErrorCode,
        retry_after_ms: Option<u64>,
    ) {
        if let Some(retry_after) = retry_after_ms {
            let prepared = {
                let mut session = self.lock_session();
                session.prepare_retry(msg_id, retry_after)
            };
            match prepared {
                Ok(delay) => {
                    tracing::debug!(msg_id, ?delay, "scheduling retry after NACK");
                    let shared = Arc::clone(self);
                    tokio::spawn(async move {
                        shared.env.sleep(delay).await;
                        let frames = shared.lock_session().retransmit(msg_id);
                        if let Ok(actions) = frames {
                            shared.execute(actions).await;
                        }
                    });
                    return;
                },
                Err(err @ SessionError::DeliveryFailed { .. }) => {
                    tracing::warn!(msg_id, %err, "retries exhausted");
                    self.fail_request(msg_id, err);
                    let _ = self.events.send(ClientEvent::DeliveryFailed { msg_id }).await;
                    return;
                },
                Err(err) => {
                    tracing::debug!(msg_id, %err, "retry not possible");
                },
            }
        }

        self.lock_session().abandon(msg_id);
        self.fail_request(
            msg_id,
            SessionError::Nacked { msg_id, error_code, retry_after_ms },
        );
    }

    fn fail_request(&self, msg_id: u64, err: SessionError) {
        if let Some(tx) = self
            .pending_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&msg_id)
        {
            let _ = tx.send(Err(err));
        }
    }

    fn fail_pending(&self, err: &SessionError) {
        let mut requests =
            self.pending_requests.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, tx) in requests.drain() {
            let _ = tx.send(Err(err.clone()));
        }
        self.pending_pings.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Async XCP client.
///
/// Cheap to share behind its own `Arc`; all methods take `&self`. Dropping
/// the client aborts the connection tasks.
pub struct Client<E: Environment = SystemEnv> {
    shared: Arc<Shared<E>>,
    events: tokio::sync::Mutex<mpsc::Receiver<ClientEvent>>,
    negotiated: Negotiated,
    tasks: Vec<tokio::task::AbortHandle>,
}

impl Client<SystemEnv> {
    /// Connect over TCP and complete the handshake.
    ///
    /// # Errors
    ///
    /// - `SessionError::Transport` on connect failure
    /// - Handshake errors from [`Client::from_stream`].
    pub async fn connect(addr: &str, config: SessionConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SessionError::Transport(format!("connect {addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        Self::from_stream(stream, config, SystemEnv::new()).await
    }
}

impl<E: Environment> Client<E> {
    /// Drive the handshake over an established byte stream (TCP, a QUIC
    /// stream adapter, or an in-memory pipe) and spawn the connection
    /// tasks.
    ///
    /// # Errors
    ///
    /// - `SessionError::NegotiationFailed` / `SessionError::Nacked` when
    ///   the peers share no codec
    /// - `SessionError::Timeout` if the handshake misses its deadline
    /// - `SessionError::Transport` on stream failures.
    pub async fn from_stream<S>(stream: S, config: SessionConfig, env: E) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let handshake_timeout = config.handshake_timeout;
        let (reader, writer) = tokio::io::split(stream);

        let (to_wire, wire_rx) = mpsc::channel::<Frame>(WRITE_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel::<ClientEvent>(WRITE_QUEUE_DEPTH);

        let session = Session::new(env.clone(), Role::Client, config);
        let shared = Arc::new(Shared {
            env: env.clone(),
            session: Mutex::new(session),
            to_wire,
            pending_requests: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            events: events_tx,
        });

        let (negotiated_tx, negotiated_rx) = oneshot::channel::<Negotiated>();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(write_loop(wire_rx, writer)).abort_handle());
        tasks.push(
            tokio::spawn(read_loop(Arc::clone(&shared), reader, Some(negotiated_tx)))
                .abort_handle(),
        );
        tasks.push(tokio::spawn(tick_loop(Arc::clone(&shared))).abort_handle());

        // Fire HELLO.
        let hello_actions = shared.lock_session().begin()?;
        shared.execute(hello_actions).await;

        // Await CAPS (or refusal) under the handshake deadline.
        let negotiated = tokio::select! {
            result = negotiated_rx => result.map_err(|_| SessionError::SessionClosed)?,
            () = env.sleep(handshake_timeout) => {
                for task in &tasks {
                    task.abort();
                }
                return Err(SessionError::Timeout { elapsed: handshake_timeout });
            },
        };

        Ok(Self {
            shared,
            events: tokio::sync::Mutex::new(events_rx),
            negotiated,
            tasks,
        })
    }

    /// The handshake's negotiation result.
    #[must_use]
    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    /// Send an envelope; returns its message id without waiting for ACK.
    ///
    /// # Errors
    ///
    /// See [`Session::send`].
    pub async fn send(&self, ether: &Ether, options: SendOptions) -> Result<u64> {
        let (msg_id, actions) = self.shared.lock_session().send(ether, &options)?;
        self.shared.execute(actions).await;
        Ok(msg_id)
    }

    /// Send and await the data frame answering with `in_reply_to`.
    ///
    /// # Errors
    ///
    /// - `SessionError::Nacked` / `SessionError::DeliveryFailed` on
    ///   rejection
    /// - `SessionError::Timeout` if `timeout` elapses (local only)
    /// - `SessionError::SessionClosed` if the connection dies first.
    pub async fn request(
        &self,
        ether: &Ether,
        options: SendOptions,
        timeout: Option<Duration>,
    ) -> Result<Ether> {
        let (response_tx, response_rx) = oneshot::channel();

        let (msg_id, actions) = {
            let mut session = self.shared.lock_session();
            let (msg_id, actions) = session.send(ether, &options)?;
            // Register before any byte hits the wire so a fast responder
            // cannot race the table.
            self.shared
                .pending_requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(msg_id, response_tx);
            (msg_id, actions)
        };
        self.shared.execute(actions).await;

        let wait = async {
            match response_rx.await {
                Ok(result) => result,
                Err(_) => Err(SessionError::SessionClosed),
            }
        };
        match timeout {
            None => wait.await,
            Some(deadline) => {
                tokio::select! {
                    result = wait => result,
                    () = self.shared.env.sleep(deadline) => {
                        // Pure local cancel: drop the waiter, no NACK.
                        self.shared
                            .pending_requests
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&msg_id);
                        Err(SessionError::Timeout { elapsed: deadline })
                    },
                }
            },
        }
    }

    /// Measure round-trip latency with a PING.
    ///
    /// # Errors
    ///
    /// - `SessionError::Timeout` when no PONG arrives within the configured
    ///   `ping_timeout` (local only, no NACK).
    pub async fn ping(&self) -> Result<Duration> {
        let nonce = self.shared.env.random_u64();
        let (pong_tx, pong_rx) = oneshot::channel();
        self.shared
            .pending_pings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(nonce, pong_tx);

        let (actions, ping_timeout) = {
            let session = self.shared.lock_session();
            (session.ping(nonce)?, session.config().ping_timeout)
        };

        let started = self.shared.env.now();
        self.shared.execute(actions).await;

        tokio::select! {
            result = pong_rx => {
                result.map_err(|_| SessionError::SessionClosed)?;
                Ok(self.shared.env.now() - started)
            },
            () = self.shared.env.sleep(ping_timeout) => {
                self.shared
                    .pending_pings
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&nonce);
                Err(SessionError::Timeout { elapsed: ping_timeout })
            },
        }
    }

    /// Ask the peer to clarify fields of a prior message; returns the
    /// request's message id (the peer's answer arrives as
    /// [`ClientEvent::ClarifyResolved`]).
    ///
    /// # Errors
    ///
    /// See [`Session::clarify_request`].
    pub async fn clarify_request(
        &self,
        reason: impl Into<String>,
        fields: Vec<String>,
    ) -> Result<u64> {
        let (msg_id, actions) = self.shared.lock_session().clarify_request(reason, fields)?;
        self.shared.execute(actions).await;
        Ok(msg_id)
    }

    /// Answer a [`ClientEvent::ClarifyRequested`] from the peer.
    ///
    /// # Errors
    ///
    /// See [`Session::clarify_response`].
    pub async fn clarify_response(&self, in_reply_to: u64, fields: ValueMap) -> Result<()> {
        let actions = self.shared.lock_session().clarify_response(in_reply_to, fields)?;
        self.shared.execute(actions).await;
        Ok(())
    }

    /// Next inbound event (non-response messages, ACK notifications,
    /// clarifications, close).
    pub async fn recv(&self) -> Option<ClientEvent> {
        self.events.lock().await.recv().await
    }

    /// Close the connection. Idempotent; outstanding requests fail with
    /// `SessionClosed`.
    pub async fn close(&self) {
        let actions = self.shared.lock_session().close("client close");
        self.shared.execute(actions).await;
    }
}

impl<E: Environment> Drop for Client<E> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Writer task: drain the outbound queue onto the stream.
async fn write_loop<S>(mut wire_rx: mpsc::Receiver<Frame>, mut writer: WriteHalf<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    while let Some(frame) = wire_rx.recv().await {
        if let Err(err) = framed::write_frame(&mut writer, &frame).await {
            tracing::debug!(%err, "write failed; stopping writer");
            break;
        }
    }
}

/// Reader task: parse frames, run them through the session, execute the
/// resulting actions.
async fn read_loop<E, S>(
    shared: Arc<Shared<E>>,
    mut reader: ReadHalf<S>,
    mut negotiated_tx: Option<oneshot::Sender<Negotiated>>,
) where
    E: Environment,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let max_payload = shared
            .lock_session()
            .negotiated()
            .map_or(u64::from(u32::MAX), |n| u64::from(n.max_frame_bytes));

        let frame = match framed::read_frame(&mut reader, max_payload).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let actions = shared.lock_session().close("peer disconnected");
                shared.execute(actions).await;
                return;
            },
            Err(err) => {
                tracing::warn!(%err, "read failed; closing");
                let actions = shared.lock_session().close(&format!("read error: {err}"));
                shared.execute(actions).await;
                return;
            },
        };

        let now = shared.env.now();
        let result = shared.lock_session().handle_frame(&frame, now);
        match result {
            Ok(actions) => {
                for action in &actions {
                    if let SessionAction::HandshakeComplete(negotiated) = action
                        && let Some(tx) = negotiated_tx.take()
                    {
                        let _ = tx.send(negotiated.clone());
                    }
                }
                shared.execute(actions).await;
            },
            Err(err) => {
                tracing::warn!(%err, "protocol error; closing");
                let actions = shared.lock_session().close(&format!("protocol error: {err}"));
                shared.execute(actions).await;
                return;
            },
        }
    }
}

/// Maintenance task: assembly expiry and handshake deadlines.
async fn tick_loop<E: Environment>(shared: Arc<Shared<E>>) {
    loop {
        shared.env.sleep(TICK_INTERVAL).await;
        let now = shared.env.now();
        let actions = shared.lock_session().tick(now);
        if actions.is_empty() {
            continue;
        }
        shared.execute(actions).await;
    }
}
