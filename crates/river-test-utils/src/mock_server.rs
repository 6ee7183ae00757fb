// mock_server: A mock River server for testing the client core.
//
// Accepts connections on ws://127.0.0.1:<port>, performs the v2.0
// handshake (including session resume and scripted rejections), keeps
// server-side seq/ack bookkeeping per session, sends active heartbeats,
// and dispatches the fixture services the e2e suites exercise.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use river_protocol::codec::{CodecAdapter, JsonCodec};
use river_protocol::{
    ControlPayload, ExpectedSessionState, HEARTBEAT_STREAM_ID, HandshakeStatus, PROTOCOL_VERSION,
    RiverResult, TransportMessage, ack_payload, close_payload, control_flags, error_codes,
    generate_id, handshake_codes,
};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type ServerWs = WebSocketStream<TcpStream>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A scripted handshake rejection.
#[derive(Debug, Clone)]
pub struct HandshakeReject {
    pub code: String,
    pub reason: String,
    /// Reject only the first handshake, then behave normally.
    pub only_once: bool,
}

/// Behavior knobs for the mock server.
#[derive(Clone)]
pub struct MockServerOptions {
    pub codec: CodecAdapter,
    /// Endpoint id the server stamps on outbound envelopes.
    pub server_id: String,
    /// Active heartbeat cadence; 0 disables heartbeats.
    pub heartbeat_interval_ms: u64,
    pub handshake_reject: Option<HandshakeReject>,
}

impl Default for MockServerOptions {
    fn default() -> Self {
        MockServerOptions {
            codec: CodecAdapter::new(JsonCodec),
            server_id: "SERVER".to_owned(),
            heartbeat_interval_ms: 500,
            handshake_reject: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Server-side session state
// ---------------------------------------------------------------------------

struct ServerSessionInner {
    seq: u64,
    ack: u64,
    send_buffer: Vec<TransportMessage>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

struct ServerSession {
    id: String,
    client_id: String,
    inner: Mutex<ServerSessionInner>,
}

impl ServerSession {
    fn new(id: String, client_id: String) -> Self {
        ServerSession {
            id,
            client_id,
            inner: Mutex::new(ServerSessionInner {
                seq: 0,
                ack: 0,
                send_buffer: Vec::new(),
                outbound: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerSessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stamp, buffer, and (when connected) transmit one envelope.
    fn send(&self, state: &ServerState, payload: Value, stream_id: &str, flags: u32) {
        let mut inner = self.lock();
        let msg = TransportMessage {
            id: generate_id(),
            from: state.options.server_id.clone(),
            to: self.client_id.clone(),
            seq: inner.seq,
            ack: inner.ack,
            payload,
            stream_id: stream_id.to_owned(),
            control_flags: flags,
            service_name: None,
            procedure_name: None,
            tracing: None,
        };
        inner.seq += 1;
        inner.send_buffer.push(msg.clone());
        if let Some(outbound) = &inner.outbound {
            if let Ok(frame) = state.options.codec.encode(&msg) {
                let _ = outbound.send(frame);
            }
        }
    }
}

/// Per-stream fixture state.
enum StreamState {
    Echo,
    Upload { sum: i64 },
    Blocking,
}

struct Subscriber {
    session_id: String,
    stream_id: String,
}

struct ServerState {
    options: MockServerOptions,
    received: Mutex<Vec<TransportMessage>>,
    handshake_count: AtomicUsize,
    reject_consumed: AtomicBool,
    sessions: Mutex<HashMap<String, Arc<ServerSession>>>,
    streams: Mutex<HashMap<(String, String), StreamState>>,
    subscribers: Mutex<Vec<Subscriber>>,
    counter: Mutex<i64>,
    conn_tokens: Mutex<Vec<CancellationToken>>,
}

impl ServerState {
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<ServerSession>>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<(String, String), StreamState>> {
        self.streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// MockRiverServer
// ---------------------------------------------------------------------------

/// A mock River server for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound address. Each
/// test can spin up its own isolated server instance.
///
/// # Fixture services
///
/// - `test.add` (rpc): replies `{result: n}`.
/// - `test.echo` (stream): replies `{response: msg}` per request unless
///   `ignore` is set; closes on the client's CLOSE.
/// - `uploadable.cancellableAdd` (upload): sums `n`; cancels the stream
///   with a `CANCEL` error once the sum reaches 10, otherwise replies
///   `{result: sum}` on close.
/// - `subscribable.value` (subscription): emits the current counter and
///   every later change.
/// - `subscribable.add` (rpc): bumps the counter, notifying subscribers.
/// - `cancel.blockingRpc` (rpc): never replies.
pub struct MockRiverServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    _accept_task: JoinHandle<()>,
}

impl MockRiverServer {
    /// Start the mock server with default options on a random port.
    pub async fn start() -> Result<Self, BoxError> {
        Self::start_with(MockServerOptions::default()).await
    }

    pub async fn start_with(options: MockServerOptions) -> Result<Self, BoxError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(ServerState {
            options,
            received: Mutex::new(Vec::new()),
            handshake_count: AtomicUsize::new(0),
            reject_consumed: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            counter: Mutex::new(0),
            conn_tokens: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            accept_loop(listener, accept_state).await;
        });

        Ok(MockRiverServer {
            addr,
            state,
            _accept_task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Every post-handshake envelope received, in arrival order.
    pub fn received(&self) -> Vec<TransportMessage> {
        self.state
            .received
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn handshake_count(&self) -> usize {
        self.state.handshake_count.load(Ordering::SeqCst)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.state.lock_sessions().keys().cloned().collect()
    }

    /// Force-close every live connection, as if the network dropped.
    pub fn drop_connections(&self) {
        let tokens: Vec<CancellationToken> = {
            let mut guard = self
                .state
                .conn_tokens
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for token in tokens {
            token.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    // Connection errors are expected in tests (clients
                    // drop, force-closes); swallow them.
                    let _ = handle_connection(state, stream).await;
                });
            }
            Err(_) => break,
        }
    }
}

async fn handle_connection(state: Arc<ServerState>, stream: TcpStream) -> Result<(), BoxError> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    let codec = state.options.codec.clone();

    // First envelope must be a handshake request.
    let Some(first) = recv_data_frame(&mut ws).await? else {
        return Ok(());
    };
    let request = codec.decode(&first)?;
    state.handshake_count.fetch_add(1, Ordering::SeqCst);

    let Some(ControlPayload::HandshakeRequest {
        protocol_version,
        session_id,
        expected_session_state,
        ..
    }) = ControlPayload::from_value(&request.payload)
    else {
        reject_handshake(
            &state,
            &mut ws,
            &request,
            handshake_codes::MALFORMED_HANDSHAKE,
            "first message must be a handshake request",
        )
        .await?;
        return Ok(());
    };

    if protocol_version != PROTOCOL_VERSION {
        reject_handshake(
            &state,
            &mut ws,
            &request,
            handshake_codes::PROTOCOL_VERSION_MISMATCH,
            "unsupported protocol version",
        )
        .await?;
        return Ok(());
    }

    if let Some(reject) = &state.options.handshake_reject {
        let already_used = reject.only_once && state.reject_consumed.swap(true, Ordering::SeqCst);
        if !already_used {
            reject_handshake(&state, &mut ws, &request, &reject.code, &reject.reason).await?;
            return Ok(());
        }
    }

    // Resume an existing session or create a fresh one.
    let session = match resume_or_create(&state, &session_id, &request.from, &expected_session_state)
    {
        Ok(session) => session,
        Err(reason) => {
            debug!(session_id, reason, "session state mismatch");
            state.lock_sessions().remove(&session_id);
            reject_handshake(
                &state,
                &mut ws,
                &request,
                handshake_codes::SESSION_STATE_MISMATCH,
                reason,
            )
            .await?;
            return Ok(());
        }
    };

    // Accept: wire up the connection before answering so nothing the
    // fixtures send can race ahead of the handshake response.
    let response = TransportMessage {
        id: generate_id(),
        from: state.options.server_id.clone(),
        to: request.from.clone(),
        seq: 0,
        ack: 0,
        payload: ControlPayload::HandshakeResponse {
            status: HandshakeStatus::ok(session.id.clone()),
        }
        .to_value(),
        stream_id: request.stream_id.clone(),
        control_flags: 0,
        service_name: None,
        procedure_name: None,
        tracing: None,
    };
    ws.send(Message::Binary(codec.encode(&response)?.into()))
        .await?;

    let (sink, stream) = ws.split();
    let cancel = CancellationToken::new();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(sink, outbound_rx, cancel.clone()));
    state
        .conn_tokens
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .push(cancel.clone());

    // Retransmit whatever the client has not acknowledged yet.
    {
        let mut inner = session.lock();
        inner.outbound = Some(outbound);
        for msg in &inner.send_buffer {
            if let Ok(frame) = codec.encode(msg) {
                if let Some(out) = &inner.outbound {
                    let _ = out.send(frame);
                }
            }
        }
    }

    if state.options.heartbeat_interval_ms > 0 {
        spawn_heartbeats(state.clone(), session.clone(), cancel.clone());
    }

    read_loop(state, session, stream, cancel).await;
    Ok(())
}

fn resume_or_create(
    state: &Arc<ServerState>,
    session_id: &str,
    client_id: &str,
    expected: &ExpectedSessionState,
) -> Result<Arc<ServerSession>, &'static str> {
    let mut sessions = state.lock_sessions();
    if let Some(session) = sessions.get(session_id) {
        let mut inner = session.lock();
        let first_unacked = inner.send_buffer.first().map_or(inner.seq, |m| m.seq);
        if expected.next_expected_seq < first_unacked || expected.next_expected_seq > inner.seq {
            return Err("client expectations diverge from server send state");
        }
        if expected.next_sent_seq < inner.ack {
            return Err("client would resend below the server ack");
        }
        inner
            .send_buffer
            .retain(|m| m.seq >= expected.next_expected_seq);
        drop(inner);
        return Ok(session.clone());
    }

    if expected.next_expected_seq != 0 {
        return Err("unknown session with non-zero expectations");
    }
    let session = Arc::new(ServerSession::new(
        session_id.to_owned(),
        client_id.to_owned(),
    ));
    sessions.insert(session_id.to_owned(), session.clone());
    Ok(session)
}

async fn reject_handshake(
    state: &Arc<ServerState>,
    ws: &mut ServerWs,
    request: &TransportMessage,
    code: &str,
    reason: &str,
) -> Result<(), BoxError> {
    let response = TransportMessage {
        id: generate_id(),
        from: state.options.server_id.clone(),
        to: request.from.clone(),
        seq: 0,
        ack: 0,
        payload: ControlPayload::HandshakeResponse {
            status: HandshakeStatus::rejected(code, reason),
        }
        .to_value(),
        stream_id: request.stream_id.clone(),
        control_flags: 0,
        service_name: None,
        procedure_name: None,
        tracing: None,
    };
    let frame = state.options.codec.encode(&response)?;
    ws.send(Message::Binary(frame.into())).await?;
    ws.close(None).await?;
    Ok(())
}

fn spawn_heartbeats(state: Arc<ServerState>, session: Arc<ServerSession>, cancel: CancellationToken) {
    let interval = Duration::from_millis(state.options.heartbeat_interval_ms);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }
            session.send(
                &state,
                ack_payload(),
                HEARTBEAT_STREAM_ID,
                control_flags::ACK_BIT,
            );
        }
    });
}

async fn read_loop(
    state: Arc<ServerState>,
    session: Arc<ServerSession>,
    mut stream: SplitStream<ServerWs>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        let raw = match frame {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
            Some(Ok(_)) => continue,
        };
        let Ok(msg) = state.options.codec.decode(&raw) else {
            continue;
        };

        // Server-side seq/ack bookkeeping.
        {
            let mut inner = session.lock();
            if msg.seq < inner.ack {
                continue; // duplicate from a client retransmit
            }
            if msg.seq > inner.ack {
                break; // missed frames; force a re-handshake
            }
            inner.ack = msg.seq + 1;
            let their_ack = msg.ack;
            inner.send_buffer.retain(|m| m.seq >= their_ack);
        }

        state
            .received
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(msg.clone());

        if msg.is_ack() {
            continue; // heartbeat echo; the server drives the cadence
        }
        handle_envelope(&state, &session, &msg);
    }
    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Fixture services
// ---------------------------------------------------------------------------

fn handle_envelope(state: &Arc<ServerState>, session: &Arc<ServerSession>, msg: &TransportMessage) {
    let key = (session.id.clone(), msg.stream_id.clone());

    if msg.is_stream_cancel() {
        state.lock_streams().remove(&key);
        state
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|s| !(s.session_id == key.0 && s.stream_id == key.1));
        return;
    }

    if msg.is_stream_open() {
        open_stream(state, session, msg, &key);
        return;
    }

    continue_stream(state, session, msg, &key);
}

fn open_stream(
    state: &Arc<ServerState>,
    session: &Arc<ServerSession>,
    msg: &TransportMessage,
    key: &(String, String),
) {
    let service = msg.service_name.as_deref().unwrap_or("");
    let procedure = msg.procedure_name.as_deref().unwrap_or("");

    match (service, procedure) {
        ("test", "add") => {
            let n = msg.payload.get("n").and_then(Value::as_i64).unwrap_or(0);
            session.send(
                state,
                RiverResult::ok(serde_json::json!({ "result": n })).to_value(),
                &msg.stream_id,
                control_flags::STREAM_CLOSED_BIT,
            );
        }
        ("test", "echo") => {
            state.lock_streams().insert(key.clone(), StreamState::Echo);
        }
        ("uploadable", "cancellableAdd") => {
            state
                .lock_streams()
                .insert(key.clone(), StreamState::Upload { sum: 0 });
        }
        ("subscribable", "value") => {
            let count = *state
                .counter
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            session.send(
                state,
                RiverResult::ok(serde_json::json!({ "result": count })).to_value(),
                &msg.stream_id,
                0,
            );
            state
                .subscribers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(Subscriber {
                    session_id: key.0.clone(),
                    stream_id: key.1.clone(),
                });
        }
        ("subscribable", "add") => {
            let n = msg.payload.get("n").and_then(Value::as_i64).unwrap_or(0);
            let count = {
                let mut counter = state
                    .counter
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                *counter += n;
                *counter
            };
            notify_subscribers(state, count);
            session.send(
                state,
                RiverResult::ok(serde_json::json!({ "result": count })).to_value(),
                &msg.stream_id,
                control_flags::STREAM_CLOSED_BIT,
            );
        }
        ("cancel", "blockingRpc") => {
            state
                .lock_streams()
                .insert(key.clone(), StreamState::Blocking);
        }
        _ => {
            session.send(
                state,
                RiverResult::err(error_codes::INVALID_REQUEST, "unknown procedure").to_value(),
                &msg.stream_id,
                control_flags::STREAM_CLOSED_BIT,
            );
        }
    }
}

fn continue_stream(
    state: &Arc<ServerState>,
    session: &Arc<ServerSession>,
    msg: &TransportMessage,
    key: &(String, String),
) {
    let close_requested = msg.is_stream_close();
    let mut streams = state.lock_streams();
    match streams.get_mut(key) {
        Some(StreamState::Echo) => {
            if let Some(text) = msg.payload.get("msg").and_then(Value::as_str) {
                let ignore = msg
                    .payload
                    .get("ignore")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !ignore {
                    session.send(
                        state,
                        RiverResult::ok(serde_json::json!({ "response": text })).to_value(),
                        &msg.stream_id,
                        0,
                    );
                }
            }
            if close_requested {
                streams.remove(key);
                session.send(
                    state,
                    close_payload(),
                    &msg.stream_id,
                    control_flags::STREAM_CLOSED_BIT,
                );
            }
        }
        Some(StreamState::Upload { sum }) => {
            if let Some(n) = msg.payload.get("n").and_then(Value::as_i64) {
                *sum += n;
            }
            let total = *sum;
            if total >= 10 {
                streams.remove(key);
                session.send(
                    state,
                    RiverResult::err(error_codes::CANCEL, "cancelled by server").to_value(),
                    &msg.stream_id,
                    control_flags::STREAM_CANCEL_BIT,
                );
                return;
            }
            if close_requested {
                streams.remove(key);
                session.send(
                    state,
                    RiverResult::ok(serde_json::json!({ "result": total })).to_value(),
                    &msg.stream_id,
                    control_flags::STREAM_CLOSED_BIT,
                );
            }
        }
        Some(StreamState::Blocking) | None => {}
    }
}

fn notify_subscribers(state: &Arc<ServerState>, count: i64) {
    let subscribers: Vec<(String, String)> = state
        .subscribers
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .iter()
        .map(|s| (s.session_id.clone(), s.stream_id.clone()))
        .collect();
    for (session_id, stream_id) in subscribers {
        let session = state.lock_sessions().get(&session_id).cloned();
        if let Some(session) = session {
            session.send(
                state,
                RiverResult::ok(serde_json::json!({ "result": count })).to_value(),
                &stream_id,
                0,
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Socket helpers
// ---------------------------------------------------------------------------

async fn write_loop(
    mut sink: SplitSink<ServerWs, Message>,
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
                if sink.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn recv_data_frame(
    ws: &mut ServerWs,
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
