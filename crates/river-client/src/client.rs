//! High-level client for invoking remote procedures.
//!
//! Wires one readable/writable pair per invocation onto the transport's
//! event bus, handles the four procedure shapes, and propagates
//! cancellation from all three origins (client abort, server cancel,
//! session death).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use river_protocol::{
    PartialTransportMessage, RiverResult, TransportMessage, cancel_message, close_stream_message,
    control_flags, error_codes, generate_id,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::{EventKind, ListenerId, SessionInfo, SessionStatusKind, TransportEvent};
use crate::streams::{Readable, Writable};
use crate::transport::{ClientTransport, SessionSender, TransportStatus};

/// The four procedure shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcType {
    Rpc,
    Stream,
    Upload,
    Subscription,
}

impl ProcType {
    /// Shapes that never send further client payloads close the request
    /// side with the init envelope itself.
    fn closes_with_init(self) -> bool {
        matches!(self, ProcType::Rpc | ProcType::Subscription)
    }
}

/// Construction-time knobs for the client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Peer to dispatch against; defaults to the transport's server id.
    pub server_id: Option<String>,
    /// Kick the transport's connect on every invocation.
    pub connect_on_invoke: bool,
    /// Start connecting at construction time.
    pub eagerly_connect: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            server_id: None,
            connect_on_invoke: true,
            eagerly_connect: false,
        }
    }
}

/// An open stream procedure: many-in, many-out.
pub struct StreamHandle {
    pub writable: Writable,
    pub readable: Readable,
}

/// An open upload procedure: many-in, single-out.
pub struct UploadHandle {
    pub writable: Writable,
    readable: Readable,
}

impl UploadHandle {
    /// Await the single response. Ends with `UNEXPECTED_DISCONNECT` if
    /// the stream dies first.
    pub async fn finalize(&self) -> RiverResult {
        match self.readable.next().await {
            Some(result) => result,
            None => RiverResult::err(error_codes::UNEXPECTED_DISCONNECT, "no response received"),
        }
    }
}

/// Client for invoking procedures on a River server.
pub struct RiverClient {
    transport: ClientTransport,
    server_id: String,
    connect_on_invoke: bool,
}

impl RiverClient {
    pub fn new(transport: ClientTransport, options: ClientOptions) -> Self {
        let server_id = options
            .server_id
            .unwrap_or_else(|| transport.server_id().to_owned());
        if options.eagerly_connect {
            transport.connect(&server_id);
        }
        RiverClient {
            transport,
            server_id,
            connect_on_invoke: options.connect_on_invoke,
        }
    }

    pub fn transport(&self) -> &ClientTransport {
        &self.transport
    }

    /// Invoke an rpc procedure: single request, single response.
    pub async fn rpc(
        &self,
        service: &str,
        procedure: &str,
        init: Value,
        abort: Option<CancellationToken>,
    ) -> RiverResult {
        let (readable, _writable) = self.handle_proc(ProcType::Rpc, service, procedure, init, abort);
        match readable.next().await {
            Some(result) => result,
            None => RiverResult::err(error_codes::UNEXPECTED_DISCONNECT, "no response received"),
        }
    }

    /// Open a stream procedure: many requests, many responses.
    pub fn stream(
        &self,
        service: &str,
        procedure: &str,
        init: Value,
        abort: Option<CancellationToken>,
    ) -> StreamHandle {
        let (readable, writable) =
            self.handle_proc(ProcType::Stream, service, procedure, init, abort);
        StreamHandle { writable, readable }
    }

    /// Open an upload procedure: many requests, one response on finalize.
    pub fn upload(
        &self,
        service: &str,
        procedure: &str,
        init: Value,
        abort: Option<CancellationToken>,
    ) -> UploadHandle {
        let (readable, writable) =
            self.handle_proc(ProcType::Upload, service, procedure, init, abort);
        UploadHandle { writable, readable }
    }

    /// Open a subscription procedure: one request, many responses.
    pub fn subscribe(
        &self,
        service: &str,
        procedure: &str,
        init: Value,
        abort: Option<CancellationToken>,
    ) -> Readable {
        let (readable, _writable) =
            self.handle_proc(ProcType::Subscription, service, procedure, init, abort);
        readable
    }

    /// Core dispatch: set up the stream pair, register listeners, send
    /// the init envelope.
    fn handle_proc(
        &self,
        proc_type: ProcType,
        service: &str,
        procedure: &str,
        init: Value,
        abort: Option<CancellationToken>,
    ) -> (Readable, Writable) {
        let to = self.server_id.clone();
        let transport = self.transport.clone();

        if transport.status() != TransportStatus::Open {
            return disconnected_pair("transport is closed".to_owned());
        }

        if self.connect_on_invoke {
            transport.connect(&to);
        }

        let session = transport.get_or_create_session(&to);
        let sender = transport.session_bound_sender(&to, &session.id);
        let stream_id = generate_id();
        let readable = Readable::new();

        let ctx = Arc::new(StreamCtx {
            transport: transport.clone(),
            client_id: transport.client_id().to_owned(),
            to: to.clone(),
            session_id: session.id.clone(),
            stream_id: stream_id.clone(),
            sender,
            readable: readable.clone(),
            writable: OnceLock::new(),
            clean_close: AtomicBool::new(true),
            cleaned_up: AtomicBool::new(false),
            listener_ids: Mutex::new(None),
            closes_with_init: proc_type.closes_with_init(),
            done: CancellationToken::new(),
        });

        let writable = {
            let write_ctx = ctx.clone();
            let close_ctx = ctx.clone();
            Writable::new(
                move |value| {
                    let partial =
                        PartialTransportMessage::new(value, write_ctx.stream_id.clone());
                    if let Err(e) = write_ctx.sender.send(partial) {
                        debug!(stream_id = %write_ctx.stream_id, error = %e, "stream write dropped");
                    }
                },
                Some(Box::new(move || close_ctx.on_writable_close())),
            )
        };
        let _ = ctx.writable.set(writable.clone());

        let message_listener = {
            let ctx = ctx.clone();
            transport.add_listener(EventKind::Message, move |event| {
                if let TransportEvent::Message(msg) = event {
                    ctx.on_message(msg);
                }
            })
        };
        let status_listener = {
            let ctx = ctx.clone();
            transport.add_listener(EventKind::SessionStatus, move |event| {
                if let TransportEvent::SessionStatus { status, session } = event {
                    ctx.on_session_status(*status, session);
                }
            })
        };
        *ctx.lock_listener_ids() = Some((message_listener, status_listener));

        if let Some(abort) = abort {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = ctx.done.cancelled() => {}
                    () = abort.cancelled() => ctx.on_client_cancel(),
                }
            });
        }

        let init_flags = if proc_type.closes_with_init() {
            control_flags::STREAM_OPEN_BIT | control_flags::STREAM_CLOSED_BIT
        } else {
            control_flags::STREAM_OPEN_BIT
        };
        let mut init_msg = PartialTransportMessage::new(init, stream_id).with_flags(init_flags);
        init_msg.service_name = Some(service.to_owned());
        init_msg.procedure_name = Some(procedure.to_owned());

        if let Err(e) = ctx.sender.send(init_msg) {
            // Session died between lookup and send.
            debug!(error = %e, "init send failed");
            let _ = ctx.readable.push(RiverResult::err(
                error_codes::UNEXPECTED_DISCONNECT,
                format!("{to} unexpectedly disconnected"),
            ));
            ctx.readable.close_if_open();
            writable.seal();
            ctx.cleanup();
            return (readable, writable);
        }

        if proc_type.closes_with_init() {
            writable.seal();
        }

        (readable, writable)
    }
}

/// Pre-terminated stream pair for dispatches that cannot reach the
/// network at all.
fn disconnected_pair(message: String) -> (Readable, Writable) {
    let readable = Readable::new();
    let _ = readable.push(RiverResult::err(
        error_codes::UNEXPECTED_DISCONNECT,
        message,
    ));
    readable.close_if_open();
    (readable, Writable::sealed())
}

// ---------------------------------------------------------------------------
// Per-stream context
// ---------------------------------------------------------------------------

/// Shared state for one open stream: the listeners, teardown flags, and
/// both stream ends.
struct StreamCtx {
    transport: ClientTransport,
    client_id: String,
    to: String,
    session_id: String,
    stream_id: String,
    sender: SessionSender,
    readable: Readable,
    writable: OnceLock<Writable>,
    /// False once the stream tore down abnormally; suppresses the clean
    /// CLOSE envelope on writable close.
    clean_close: AtomicBool,
    cleaned_up: AtomicBool,
    listener_ids: Mutex<Option<(ListenerId, ListenerId)>>,
    closes_with_init: bool,
    /// Cancelled at cleanup so the abort watcher task ends with the stream.
    done: CancellationToken,
}

impl StreamCtx {
    fn lock_listener_ids(&self) -> std::sync::MutexGuard<'_, Option<(ListenerId, ListenerId)>> {
        self.listener_ids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn seal_writable(&self) {
        if let Some(writable) = self.writable.get() {
            writable.seal();
        }
    }

    fn writable_closed(&self) -> bool {
        self.writable.get().is_none_or(Writable::is_closed)
    }

    /// `message` listener: route envelopes for this stream.
    fn on_message(&self, msg: &TransportMessage) {
        if msg.stream_id != self.stream_id || msg.to != self.client_id {
            return;
        }

        if msg.is_stream_cancel() {
            self.clean_close.store(false, Ordering::SeqCst);
            let result = RiverResult::from_value(&msg.payload).unwrap_or_else(|| {
                let code = msg
                    .payload
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN");
                RiverResult::err(code, msg.payload.to_string())
            });
            let _ = self.readable.push(result);
            self.seal_writable();
            self.close_readable();
            return;
        }

        if self.readable.is_closed() {
            return;
        }

        // Normal payload: application results only, CLOSE controls are
        // consumed by the close bit below.
        if let Some(obj) = msg.payload.as_object() {
            let is_close_control = obj.get("type").and_then(Value::as_str) == Some("CLOSE");
            if !is_close_control && obj.contains_key("ok") {
                if let Some(result) = RiverResult::from_value(&msg.payload) {
                    let _ = self.readable.push(result);
                }
            }
        }

        if msg.is_stream_close() {
            self.close_readable();
        }
    }

    /// `sessionStatus` listener: the session this stream rode on is dying.
    fn on_session_status(&self, status: SessionStatusKind, session: &SessionInfo) {
        if status != SessionStatusKind::Closing {
            return;
        }
        if session.to_id != self.to || session.id != self.session_id {
            return;
        }

        self.clean_close.store(false, Ordering::SeqCst);
        let _ = self.readable.push(RiverResult::err(
            error_codes::UNEXPECTED_DISCONNECT,
            format!("{} unexpectedly disconnected", self.to),
        ));
        self.seal_writable();
        self.close_readable();
    }

    /// Client-side abort: synthesize the CANCEL locally and tell the
    /// server.
    fn on_client_cancel(&self) {
        self.clean_close.store(false, Ordering::SeqCst);
        let error = RiverResult::err(error_codes::CANCEL, "cancelled by client");
        let _ = self.readable.push(error.clone());
        self.seal_writable();
        self.close_readable();
        if let Err(e) = self.sender.send(cancel_message(self.stream_id.clone(), &error)) {
            debug!(stream_id = %self.stream_id, error = %e, "cancel send dropped");
        }
    }

    /// Writable close callback: emit the clean CLOSE envelope when the
    /// stream is still healthy, then tear down if both ends are done.
    fn on_writable_close(&self) {
        if !self.closes_with_init && self.clean_close.load(Ordering::SeqCst) {
            if let Err(e) = self.sender.send(close_stream_message(self.stream_id.clone())) {
                debug!(stream_id = %self.stream_id, error = %e, "close send dropped");
            }
        }
        if self.readable.is_closed() {
            self.cleanup();
        }
    }

    fn close_readable(&self) {
        self.readable.close_if_open();
        if self.writable_closed() {
            self.cleanup();
        }
    }

    /// Remove listeners from the bus; idempotent.
    fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some((message_listener, status_listener)) = self.lock_listener_ids().take() {
            self.transport
                .remove_listener(EventKind::Message, message_listener);
            self.transport
                .remove_listener(EventKind::SessionStatus, status_listener);
        }
        self.done.cancel();
    }
}
