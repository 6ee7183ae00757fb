//! Session state machine with seq/ack bookkeeping and send buffering.
//!
//! A session persists across potentially multiple underlying connections,
//! tracking everything needed for transparent reconnection: the next seq
//! to assign, the next seq expected from the peer, and the ordered buffer
//! of envelopes the peer has not yet acknowledged.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use river_protocol::codec::{CodecAdapter, CodecError};
use river_protocol::{
    HANDSHAKE_STREAM_ID, PartialTransportMessage, TransportMessage, generate_id,
    handshake_request_payload, heartbeat_message,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoConnection,
    BackingOff,
    Connecting,
    Handshaking,
    Connected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::NoConnection => "NoConnection",
            SessionState::BackingOff => "BackingOff",
            SessionState::Connecting => "Connecting",
            SessionState::Handshaking => "Handshaking",
            SessionState::Connected => "Connected",
        };
        f.write_str(name)
    }
}

/// Configuration options for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub heartbeat_interval_ms: u64,
    pub heartbeats_until_dead: u32,
    pub session_disconnect_grace_ms: u64,
    pub connection_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub enable_transparent_reconnects: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            heartbeat_interval_ms: 1000,
            heartbeats_until_dead: 2,
            session_disconnect_grace_ms: 5000,
            connection_timeout_ms: 2000,
            handshake_timeout_ms: 1000,
            enable_transparent_reconnects: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The session this sender was bound to is gone or was replaced.
    #[error("session scope ended ({0})")]
    SessionScopeEnded(&'static str),
    #[error(transparent)]
    Serialize(#[from] CodecError),
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// The session's handle on one underlying connection.
///
/// Outbound frames go through an unbounded channel drained by a writer
/// task that owns the socket's sink half; cancelling the token stops both
/// the writer and the read loop.
pub(crate) struct Connection {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    _writer: JoinHandle<()>,
}

impl Connection {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        cancel: CancellationToken,
        writer: JoinHandle<()>,
    ) -> Self {
        Connection {
            outbound,
            cancel,
            _writer: writer,
        }
    }

    fn send(&self, frame: Vec<u8>) {
        // A closed channel means the connection is already going down;
        // the buffered copy will be retransmitted after reconnect.
        let _ = self.outbound.send(frame);
    }

    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionInner {
    seq: u64,
    ack: u64,
    send_buffer: Vec<TransportMessage>,
    state: SessionState,
    connection: Option<Connection>,
    actively_heartbeating: bool,
    heartbeat_task: Option<JoinHandle<()>>,
    heartbeat_miss_task: Option<JoinHandle<()>>,
    grace_task: Option<JoinHandle<()>>,
    destroyed: bool,
}

type SessionCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct SessionCallbacks {
    on_connection_closed: Option<SessionCallback>,
    on_grace_elapsed: Option<SessionCallback>,
}

/// A logical session to one peer, surviving connection drops.
pub struct Session {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    options: SessionOptions,
    codec: CodecAdapter,
    /// Self-handle for the timer tasks; they must not keep the session
    /// alive on their own.
    weak: Weak<Session>,
    inner: Mutex<SessionInner>,
    callbacks: Mutex<SessionCallbacks>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        from_id: String,
        to_id: String,
        codec: CodecAdapter,
        options: SessionOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Session {
            id,
            from_id,
            to_id,
            options,
            codec,
            weak: weak.clone(),
            inner: Mutex::new(SessionInner {
                seq: 0,
                ack: 0,
                send_buffer: Vec::new(),
                state: SessionState::NoConnection,
                connection: None,
                actively_heartbeating: false,
                heartbeat_task: None,
                heartbeat_miss_task: None,
                grace_task: None,
                destroyed: false,
            }),
            callbacks: Mutex::new(SessionCallbacks::default()),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, SessionCallbacks> {
        self.callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn set_on_connection_closed(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lock_callbacks().on_connection_closed = Some(Arc::new(callback));
    }

    pub(crate) fn set_on_grace_elapsed(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.lock_callbacks().on_grace_elapsed = Some(Arc::new(callback));
    }

    // -- bookkeeping --

    pub fn state(&self) -> SessionState {
        self.lock_inner().state
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.lock_inner().state = state;
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock_inner().destroyed
    }

    /// Next seq expected from the peer.
    pub fn ack(&self) -> u64 {
        self.lock_inner().ack
    }

    /// Next seq this side will assign.
    pub fn seq(&self) -> u64 {
        self.lock_inner().seq
    }

    /// The next seq the peer should see from us: the first unacked
    /// buffered seq, or the current seq when the buffer is empty.
    pub fn next_seq(&self) -> u64 {
        let inner = self.lock_inner();
        inner.send_buffer.first().map_or(inner.seq, |m| m.seq)
    }

    pub fn send_buffer_len(&self) -> usize {
        self.lock_inner().send_buffer.len()
    }

    pub fn is_actively_heartbeating(&self) -> bool {
        self.lock_inner().actively_heartbeating
    }

    // -- sending --

    /// Construct and send a message.
    ///
    /// The envelope is stamped with id/from/to/seq/ack and always appended
    /// to the send buffer; when connected it also goes out on the wire
    /// immediately. A serialization failure leaves the envelope buffered.
    pub(crate) fn send(&self, partial: PartialTransportMessage) -> Result<String, SendError> {
        let mut inner = self.lock_inner();
        let msg = TransportMessage {
            id: generate_id(),
            from: self.from_id.clone(),
            to: self.to_id.clone(),
            seq: inner.seq,
            ack: inner.ack,
            payload: partial.payload,
            stream_id: partial.stream_id,
            control_flags: partial.control_flags,
            service_name: partial.service_name,
            procedure_name: partial.procedure_name,
            tracing: partial.tracing,
        };
        inner.seq += 1;
        inner.send_buffer.push(msg.clone());

        if inner.state == SessionState::Connected {
            if let Some(connection) = &inner.connection {
                let frame = self.codec.encode(&msg)?;
                connection.send(frame);
            }
        }
        Ok(msg.id)
    }

    /// Retransmit every buffered envelope over the current connection,
    /// in seq order. Called after a successful reconnection handshake.
    pub(crate) fn send_buffered_messages(&self) -> Result<(), SendError> {
        let inner = self.lock_inner();
        let Some(connection) = &inner.connection else {
            return Ok(());
        };
        for msg in &inner.send_buffer {
            let frame = self.codec.encode(msg)?;
            connection.send(frame);
        }
        Ok(())
    }

    pub(crate) fn send_heartbeat(&self) {
        if let Err(e) = self.send(heartbeat_message()) {
            debug!(session_id = %self.id, error = %e, "heartbeat send failed");
        }
    }

    // -- receiving --

    /// Update seq/ack bookkeeping for an accepted inbound message:
    /// acknowledged envelopes leave the send buffer, our ack advances to
    /// `their_seq + 1`, and the heartbeat-miss timer restarts.
    pub(crate) fn update_bookkeeping(&self, their_ack: u64, their_seq: u64) {
        {
            let mut inner = self.lock_inner();
            inner.send_buffer.retain(|m| m.seq >= their_ack);
            inner.ack = their_seq + 1;
        }
        self.start_heartbeat_miss_timeout();
    }

    // -- timers --

    /// Send heartbeats at the configured interval while connected.
    ///
    /// The client core never drives the cadence itself (the server does);
    /// a session that is actively heartbeating stops echoing inbound
    /// heartbeats.
    pub fn start_active_heartbeat(&self) {
        let interval = Duration::from_millis(self.options.heartbeat_interval_ms);
        let weak = self.weak.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(session) = weak.upgrade() else { return };
                if session.is_destroyed() || session.state() != SessionState::Connected {
                    return;
                }
                session.send_heartbeat();
            }
        });
        let mut inner = self.lock_inner();
        inner.actively_heartbeating = true;
        if let Some(old) = inner.heartbeat_task.replace(task) {
            old.abort();
        }
    }

    /// (Re)start the missing-heartbeat timeout. On expiry the connection
    /// is treated as dropped.
    pub(crate) fn start_heartbeat_miss_timeout(&self) {
        let Some(on_closed) = self.lock_callbacks().on_connection_closed.clone() else {
            return;
        };
        let duration = Duration::from_millis(
            u64::from(self.options.heartbeats_until_dead) * self.options.heartbeat_interval_ms,
        );
        let weak = self.weak.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let Some(session) = weak.upgrade() else { return };
            if session.is_destroyed() {
                return;
            }
            debug!(session_id = %session.id, "heartbeat miss timeout, closing connection");
            on_closed();
        });
        let mut inner = self.lock_inner();
        if let Some(old) = inner.heartbeat_miss_task.replace(task) {
            old.abort();
        }
    }

    pub(crate) fn cancel_heartbeats(&self) {
        let mut inner = self.lock_inner();
        inner.actively_heartbeating = false;
        if let Some(task) = inner.heartbeat_task.take() {
            task.abort();
        }
        if let Some(task) = inner.heartbeat_miss_task.take() {
            task.abort();
        }
    }

    /// Start the disconnect grace period; on expiry the session is
    /// destroyed.
    pub(crate) fn start_grace_period(&self) {
        let Some(on_elapsed) = self.lock_callbacks().on_grace_elapsed.clone() else {
            return;
        };
        let duration = Duration::from_millis(self.options.session_disconnect_grace_ms);
        let weak = self.weak.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let Some(session) = weak.upgrade() else { return };
            if session.is_destroyed() {
                return;
            }
            debug!(session_id = %session.id, "grace period elapsed, destroying session");
            on_elapsed();
        });
        let mut inner = self.lock_inner();
        if let Some(old) = inner.grace_task.replace(task) {
            old.abort();
        }
    }

    pub(crate) fn cancel_grace_period(&self) {
        if let Some(task) = self.lock_inner().grace_task.take() {
            task.abort();
        }
    }

    // -- lifecycle --

    /// Transition to connected: adopt the connection, cancel the grace
    /// period, arm the heartbeat-miss timer.
    pub(crate) fn set_connected(&self, connection: Connection) {
        {
            let mut inner = self.lock_inner();
            inner.state = SessionState::Connected;
            inner.connection = Some(connection);
        }
        self.cancel_grace_period();
        self.start_heartbeat_miss_timeout();
    }

    /// Transition to disconnected: tear down the connection and start the
    /// grace period.
    pub(crate) fn set_disconnected(&self) {
        self.cancel_heartbeats();
        {
            let mut inner = self.lock_inner();
            inner.state = SessionState::NoConnection;
            if let Some(connection) = inner.connection.take() {
                connection.close();
            }
        }
        self.start_grace_period();
    }

    /// Close the current underlying connection without changing session
    /// state; the read loop's exit drives the disconnect path.
    pub(crate) fn close_connection(&self) {
        if let Some(connection) = &self.lock_inner().connection {
            connection.close();
        }
    }

    /// Destroy the session. Terminal: cancels all timers, closes the
    /// connection, and drops the send buffer.
    pub(crate) fn destroy(&self) {
        {
            let mut inner = self.lock_inner();
            inner.destroyed = true;
            inner.actively_heartbeating = false;
            if let Some(task) = inner.heartbeat_task.take() {
                task.abort();
            }
            if let Some(task) = inner.heartbeat_miss_task.take() {
                task.abort();
            }
            if let Some(task) = inner.grace_task.take() {
                task.abort();
            }
            if let Some(connection) = inner.connection.take() {
                connection.close();
            }
            inner.send_buffer.clear();
        }
        let mut callbacks = self.lock_callbacks();
        callbacks.on_connection_closed = None;
        callbacks.on_grace_elapsed = None;
    }

    // -- handshake --

    /// Build the handshake request envelope (seq=0, ack=0, flags=0).
    pub(crate) fn handshake_request(&self, metadata: Option<Value>) -> TransportMessage {
        let (ack, next_seq) = {
            let inner = self.lock_inner();
            let next_seq = inner.send_buffer.first().map_or(inner.seq, |m| m.seq);
            (inner.ack, next_seq)
        };
        TransportMessage {
            id: generate_id(),
            from: self.from_id.clone(),
            to: self.to_id.clone(),
            seq: 0,
            ack: 0,
            payload: handshake_request_payload(&self.id, ack, next_seq, metadata),
            stream_id: HANDSHAKE_STREAM_ID.to_owned(),
            control_flags: 0,
            service_name: None,
            procedure_name: None,
            tracing: None,
        }
    }
}
