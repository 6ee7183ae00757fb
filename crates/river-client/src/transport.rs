//! Client WebSocket transport.
//!
//! Owns the peer→session map and the event bus, drives the
//! connect/handshake/reconnect flow, and runs the per-connection read
//! loop that feeds the session's seq/ack bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use river_protocol::codec::CodecAdapter;
use river_protocol::{ControlPayload, PartialTransportMessage, generate_id, handshake_codes};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::budget::{RetryBudget, RetryOptions};
use crate::events::{
    EventBus, EventKind, ListenerId, ProtocolErrorEvent, ProtocolErrorKind, SessionInfo,
    SessionStatusKind, TransportEvent, TransportStatusKind,
};
use crate::session::{Connection, SendError, Session, SessionOptions, SessionState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Open,
    Closed,
}

/// Construction-time knobs for the transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Client endpoint id; generated when not supplied.
    pub client_id: Option<String>,
    /// Peer id connected to when the caller does not name one.
    pub server_id: String,
    pub session: SessionOptions,
    pub retry: RetryOptions,
    /// Opaque metadata attached to every handshake request.
    pub handshake_metadata: Option<Value>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            client_id: None,
            server_id: "SERVER".to_owned(),
            session: SessionOptions::default(),
            retry: RetryOptions::default(),
            handshake_metadata: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConnectError {
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("connection closed during handshake")]
    ConnectionClosed,
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Codec(#[from] river_protocol::codec::CodecError),
    #[error("invalid handshake response: {0}")]
    InvalidHandshake(&'static str),
}

// ---------------------------------------------------------------------------
// ClientTransport
// ---------------------------------------------------------------------------

/// Client-side transport managing WebSocket connections and sessions.
///
/// Cheap to clone; all state lives behind one shared allocation rooted
/// here.
#[derive(Clone)]
pub struct ClientTransport {
    shared: Arc<TransportShared>,
}

pub(crate) struct TransportShared {
    url: String,
    client_id: String,
    server_id: String,
    codec: CodecAdapter,
    options: SessionOptions,
    handshake_metadata: Option<Value>,
    /// Self-handle for spawned tasks and session callbacks.
    weak: Weak<TransportShared>,
    closed: AtomicBool,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    events: EventBus,
    retry_budget: Mutex<RetryBudget>,
    reconnect_on_drop: AtomicBool,
    connect_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ClientTransport {
    pub fn new(url: impl Into<String>, codec: CodecAdapter, options: TransportOptions) -> Self {
        let reconnect = options.session.enable_transparent_reconnects;
        let url = url.into();
        let shared = Arc::new_cyclic(|weak| TransportShared {
            url,
            client_id: options.client_id.unwrap_or_else(generate_id),
            server_id: options.server_id,
            codec,
            options: options.session,
            handshake_metadata: options.handshake_metadata,
            weak: weak.clone(),
            closed: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            events: EventBus::new(),
            retry_budget: Mutex::new(RetryBudget::new(options.retry)),
            reconnect_on_drop: AtomicBool::new(reconnect),
            connect_tasks: Mutex::new(HashMap::new()),
        });
        ClientTransport { shared }
    }

    pub fn status(&self) -> TransportStatus {
        if self.shared.is_closed() {
            TransportStatus::Closed
        } else {
            TransportStatus::Open
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    pub fn add_listener(
        &self,
        kind: EventKind,
        listener: impl Fn(&TransportEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.events.add_listener(kind, listener)
    }

    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) {
        self.shared.events.remove_listener(kind, id);
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.shared.events.listener_count(kind)
    }

    /// Whether connection drops trigger automatic reconnects.
    pub fn reconnect_on_drop(&self) -> bool {
        self.shared.reconnect_on_drop.load(Ordering::SeqCst)
    }

    pub fn set_reconnect_on_drop(&self, value: bool) {
        self.shared.reconnect_on_drop.store(value, Ordering::SeqCst);
    }

    /// Current state of the session to `to`, if one exists.
    pub fn session_state(&self, to: &str) -> Option<SessionState> {
        self.shared.lock_sessions().get(to).map(|s| s.state())
    }

    /// Initiate a connection to the given peer. No-op when the transport
    /// is closed or the session is already connecting/connected.
    pub fn connect(&self, to: &str) {
        self.shared.connect(to);
    }

    /// Close the transport: cancel pending connects, destroy every
    /// session, reset the retry budget.
    pub fn close(&self) {
        self.shared.close();
    }

    /// A send handle scoped to the given session. Sends fail once the
    /// session is gone, destroyed, or replaced by a fresh one.
    pub fn session_bound_sender(&self, to: &str, session_id: &str) -> SessionSender {
        SessionSender {
            shared: Arc::downgrade(&self.shared),
            to: to.to_owned(),
            session_id: session_id.to_owned(),
        }
    }

    pub(crate) fn get_or_create_session(&self, to: &str) -> Arc<Session> {
        self.shared.get_or_create_session(to)
    }
}

// ---------------------------------------------------------------------------
// Session-bound sender
// ---------------------------------------------------------------------------

/// A send handle that self-invalidates when the session it was created
/// for is no longer the current session for its peer.
#[derive(Clone)]
pub struct SessionSender {
    shared: Weak<TransportShared>,
    to: String,
    session_id: String,
}

impl SessionSender {
    pub fn send(&self, partial: PartialTransportMessage) -> Result<String, SendError> {
        let Some(shared) = self.shared.upgrade() else {
            return Err(SendError::SessionScopeEnded("closed"));
        };
        let session = shared.lock_sessions().get(&self.to).cloned();
        let Some(session) = session else {
            return Err(SendError::SessionScopeEnded("closed"));
        };
        if session.id != self.session_id || session.is_destroyed() {
            return Err(SendError::SessionScopeEnded("transition"));
        }
        session.send(partial)
    }
}

// ---------------------------------------------------------------------------
// Shared internals
// ---------------------------------------------------------------------------

impl TransportShared {
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_budget(&self) -> MutexGuard<'_, RetryBudget> {
        self.retry_budget
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_connect_tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.connect_tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn dispatch_protocol_error(
        &self,
        kind: ProtocolErrorKind,
        message: String,
        code: Option<String>,
    ) {
        self.events
            .dispatch(&TransportEvent::ProtocolError(ProtocolErrorEvent {
                kind,
                message,
                code,
            }));
    }

    // -- session management --

    fn get_or_create_session(&self, to: &str) -> Arc<Session> {
        if let Some(session) = self.lock_sessions().get(to) {
            return session.clone();
        }

        let session = Session::new(
            generate_id(),
            self.client_id.clone(),
            to.to_owned(),
            self.codec.clone(),
            self.options.clone(),
        );

        let weak = self.weak.clone();
        let peer = to.to_owned();
        session.set_on_connection_closed(move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_connection_dropped(&peer);
            }
        });
        let weak = self.weak.clone();
        let peer = to.to_owned();
        session.set_on_grace_elapsed(move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_session_grace_elapsed(&peer);
            }
        });

        self.lock_sessions().insert(to.to_owned(), session.clone());
        self.events.dispatch(&TransportEvent::SessionStatus {
            status: SessionStatusKind::Created,
            session: session_info(&session),
        });
        session
    }

    fn delete_session(&self, to: &str) {
        let Some(session) = self.lock_sessions().remove(to) else {
            return;
        };
        self.events.dispatch(&TransportEvent::SessionStatus {
            status: SessionStatusKind::Closing,
            session: session_info(&session),
        });
        session.destroy();
        self.events.dispatch(&TransportEvent::SessionStatus {
            status: SessionStatusKind::Closed,
            session: session_info(&session),
        });
    }

    fn on_session_grace_elapsed(&self, to: &str) {
        debug!(to, "session grace period elapsed");
        self.delete_session(to);
    }

    // -- connection flow --

    fn connect(&self, to: &str) {
        if self.is_closed() {
            return;
        }
        let session = self.get_or_create_session(to);
        if session.state() != SessionState::NoConnection {
            return;
        }

        let backoff_ms = {
            let mut budget = self.lock_budget();
            if !budget.has_budget() {
                drop(budget);
                self.dispatch_protocol_error(
                    ProtocolErrorKind::ConnRetryExceeded,
                    "connection retries exceeded".to_owned(),
                    None,
                );
                return;
            }
            let backoff_ms = budget.backoff_ms();
            budget.consume();
            backoff_ms
        };

        session.set_state(SessionState::BackingOff);

        let Some(shared) = self.weak.upgrade() else {
            return;
        };
        let key = to.to_owned();
        let to = to.to_owned();
        let task = tokio::spawn(async move {
            if backoff_ms > 0 {
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
            if shared.is_closed() || session.is_destroyed() {
                return;
            }

            session.set_state(SessionState::Connecting);
            let connect_timeout = Duration::from_millis(shared.options.connection_timeout_ms);
            let ws = match timeout(connect_timeout, connect_async(shared.url.as_str())).await {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => {
                    debug!(to, error = %e, "connection attempt failed");
                    if !session.is_destroyed() {
                        shared.on_connection_failed(&to);
                    }
                    return;
                }
                Err(_) => {
                    debug!(to, "connection attempt timed out");
                    if !session.is_destroyed() {
                        shared.on_connection_failed(&to);
                    }
                    return;
                }
            };

            if session.is_destroyed() {
                let mut ws = ws;
                let _ = ws.close(None).await;
                return;
            }

            session.set_state(SessionState::Handshaking);
            if let Err(e) = shared.do_handshake(&session, ws, &to).await {
                debug!(to, error = %e, "handshake attempt failed");
                if !session.is_destroyed() {
                    shared.on_connection_failed(&to);
                }
            }
        });
        self.lock_connect_tasks().insert(key, task);
    }

    /// Perform the handshake on a freshly connected socket, then promote
    /// the session to connected and start the read loop.
    async fn do_handshake(
        &self,
        session: &Arc<Session>,
        mut ws: WsStream,
        to: &str,
    ) -> Result<(), ConnectError> {
        let request = session.handshake_request(self.handshake_metadata.clone());
        let frame = self.codec.encode(&request)?;
        ws.send(Message::Binary(frame.into())).await?;

        let handshake_timeout = Duration::from_millis(self.options.handshake_timeout_ms);
        let response = match timeout(handshake_timeout, recv_data_frame(&mut ws)).await {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => {
                let _ = ws.close(None).await;
                return Err(ConnectError::ConnectionClosed);
            }
            Ok(Err(e)) => {
                let _ = ws.close(None).await;
                return Err(ConnectError::Ws(e));
            }
            Err(_) => {
                let _ = ws.close(None).await;
                return Err(ConnectError::HandshakeTimeout);
            }
        };

        let response = match self.codec.decode(&response) {
            Ok(msg) => msg,
            Err(e) => {
                let _ = ws.close(None).await;
                return Err(ConnectError::Codec(e));
            }
        };
        let Some(ControlPayload::HandshakeResponse { status }) =
            ControlPayload::from_value(&response.payload)
        else {
            let _ = ws.close(None).await;
            return Err(ConnectError::InvalidHandshake("not a HANDSHAKE_RESP payload"));
        };

        if !status.ok {
            let code = status.code.unwrap_or_else(|| "UNKNOWN".to_owned());
            let reason = status.reason.unwrap_or_else(|| "unknown reason".to_owned());
            debug!(to, code, reason, "handshake rejected");
            let _ = ws.close(None).await;

            if handshake_codes::is_retriable(&code) {
                // The server lost our session state; retry as a new session.
                self.delete_session(to);
                self.schedule_reconnect(to);
            } else {
                self.dispatch_protocol_error(ProtocolErrorKind::HandshakeFailed, reason, Some(code));
                session.set_state(SessionState::NoConnection);
            }
            return Ok(());
        }

        if status.session_id.as_deref() != Some(session.id.as_str()) {
            // The server answered for a different session; ours is stale.
            debug!(
                to,
                expected = %session.id,
                got = status.session_id.as_deref().unwrap_or(""),
                "handshake session id mismatch"
            );
            let _ = ws.close(None).await;
            self.delete_session(to);
            self.schedule_reconnect(to);
            return Ok(());
        }

        if session.is_destroyed() {
            let _ = ws.close(None).await;
            return Ok(());
        }

        // Handshake successful: split the socket, hand the sink to a
        // writer task, and adopt the connection.
        let (sink, stream) = ws.split();
        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, outbound_rx, cancel.clone()));
        session.set_connected(Connection::new(outbound, cancel.clone(), writer));
        self.events.dispatch(&TransportEvent::SessionTransition {
            state: SessionState::Connected,
            id: session.id.clone(),
        });

        if let Err(e) = session.send_buffered_messages() {
            error!(session_id = %session.id, error = %e, "failed to retransmit buffered messages");
            self.dispatch_protocol_error(
                ProtocolErrorKind::MessageSendFailure,
                e.to_string(),
                None,
            );
            self.delete_session(to);
            return Ok(());
        }

        self.lock_budget().start_restoring();
        self.spawn_read_loop(session.clone(), stream, cancel, to.to_owned());
        Ok(())
    }

    fn spawn_read_loop(
        &self,
        session: Arc<Session>,
        mut stream: SplitStream<WsStream>,
        cancel: CancellationToken,
        to: String,
    ) {
        let Some(shared) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = stream.next() => frame,
                };
                match frame {
                    None => break,
                    Some(Err(e)) => {
                        if !session.is_destroyed() {
                            debug!(session_id = %session.id, error = %e, "websocket read error");
                        }
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        shared.on_message_data(&session, text.as_bytes());
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        shared.on_message_data(&session, bytes.as_ref());
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
                if session.is_destroyed() {
                    break;
                }
            }
            if !session.is_destroyed() {
                shared.on_connection_dropped(&to);
            }
        });
    }

    /// Handle one raw frame from the socket.
    fn on_message_data(&self, session: &Arc<Session>, raw: &[u8]) {
        let msg = match self.codec.decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                self.dispatch_protocol_error(ProtocolErrorKind::InvalidMessage, e.to_string(), None);
                return;
            }
        };

        let expected = session.ack();
        if msg.seq != expected {
            if msg.seq < expected {
                // Duplicate of something we already processed.
                return;
            }
            // A future seq means we missed frames; close the connection to
            // force a re-handshake, which reconciles state.
            debug!(
                session_id = %session.id,
                expected,
                got = msg.seq,
                "seq out of order, closing connection"
            );
            session.close_connection();
            return;
        }

        session.update_bookkeeping(msg.ack, msg.seq);

        if !msg.is_ack() {
            self.events.dispatch(&TransportEvent::Message(msg));
            return;
        }
        // Heartbeat-only envelope: swallow, and echo one back unless this
        // side is the active heartbeater.
        if !session.is_actively_heartbeating() {
            session.send_heartbeat();
        }
    }

    // -- drop / fail / reconnect --

    fn on_connection_dropped(&self, to: &str) {
        let session = self.lock_sessions().get(to).cloned();
        let Some(session) = session else { return };
        if session.is_destroyed() || session.state() != SessionState::Connected {
            return;
        }

        session.set_disconnected();
        self.events.dispatch(&TransportEvent::SessionTransition {
            state: SessionState::NoConnection,
            id: session.id.clone(),
        });

        if self.reconnect_on_drop.load(Ordering::SeqCst) {
            self.schedule_reconnect(to);
        }
    }

    fn on_connection_failed(&self, to: &str) {
        let session = self.lock_sessions().get(to).cloned();
        let Some(session) = session else { return };
        if session.is_destroyed() {
            return;
        }

        session.set_state(SessionState::NoConnection);
        if self.reconnect_on_drop.load(Ordering::SeqCst) {
            self.schedule_reconnect(to);
        }
    }

    /// Re-invoke `connect` from a fresh task, off the current call stack.
    fn schedule_reconnect(&self, to: &str) {
        if self.is_closed() || !self.reconnect_on_drop.load(Ordering::SeqCst) {
            return;
        }
        let Some(shared) = self.weak.upgrade() else {
            return;
        };
        let to = to.to_owned();
        tokio::spawn(async move {
            shared.connect(&to);
        });
    }

    // -- lifecycle --

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<JoinHandle<()>> =
            self.lock_connect_tasks().drain().map(|(_, task)| task).collect();
        for task in tasks {
            task.abort();
        }

        let peers: Vec<String> = self.lock_sessions().keys().cloned().collect();
        for to in peers {
            self.delete_session(&to);
        }

        self.lock_budget().reset();
        self.events.dispatch(&TransportEvent::TransportStatus {
            status: TransportStatusKind::Closed,
        });
    }
}

fn session_info(session: &Session) -> SessionInfo {
    SessionInfo {
        id: session.id.clone(),
        to_id: session.to_id.clone(),
    }
}

// ---------------------------------------------------------------------------
// Socket helpers
// ---------------------------------------------------------------------------

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        match frame {
            None => break,
            Some(bytes) => {
                if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Read the next data frame (text or binary) as bytes.
async fn recv_data_frame(
    ws: &mut WsStream,
) -> Result<Option<Vec<u8>>, tokio_tungstenite::tungstenite::Error> {
    loop {
        match ws.next().await {
            None => return Ok(None),
            Some(Err(e)) => return Err(e),
            Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
            Some(Ok(Message::Binary(bytes))) => return Ok(Some(bytes.to_vec())),
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => {}
        }
    }
}
