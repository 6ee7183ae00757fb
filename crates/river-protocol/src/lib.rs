// river-protocol: River v2.0 wire contract.
//
// Everything that crosses the wire is a `TransportMessage` envelope; the
// payload field carries either an application result (`{ok, payload}`) or
// one of the control payloads defined here (handshake, ACK, CLOSE).

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod codec;

/// Protocol version carried in every handshake request.
pub const PROTOCOL_VERSION: &str = "v2.0";

/// Reserved stream id for handshake envelopes.
pub const HANDSHAKE_STREAM_ID: &str = "handshake";

/// Reserved stream id for heartbeat envelopes.
pub const HEARTBEAT_STREAM_ID: &str = "heartbeat";

// ---------------------------------------------------------------------------
// Id generation
// ---------------------------------------------------------------------------

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Length of every generated envelope/stream/session id.
pub const ID_LENGTH: usize = 12;

/// Generate a nanoid-style random id (12 chars, alphanumeric).
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LENGTH)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

// ---------------------------------------------------------------------------
// Control flags
// ---------------------------------------------------------------------------

/// Bit flags for the `controlFlags` envelope field.
pub mod control_flags {
    /// Heartbeat/ack-only envelope.
    pub const ACK_BIT: u32 = 0b0001;
    /// First envelope of a stream; carries `serviceName`/`procedureName`.
    pub const STREAM_OPEN_BIT: u32 = 0b0010;
    /// Abrupt cancel carrying an error result payload.
    pub const STREAM_CANCEL_BIT: u32 = 0b0100;
    /// Last envelope of a stream.
    pub const STREAM_CLOSED_BIT: u32 = 0b1000;
}

pub fn is_ack(flags: u32) -> bool {
    flags & control_flags::ACK_BIT != 0
}

pub fn is_stream_open(flags: u32) -> bool {
    flags & control_flags::STREAM_OPEN_BIT != 0
}

pub fn is_stream_cancel(flags: u32) -> bool {
    flags & control_flags::STREAM_CANCEL_BIT != 0
}

pub fn is_stream_close(flags: u32) -> bool {
    flags & control_flags::STREAM_CLOSED_BIT != 0
}

// ---------------------------------------------------------------------------
// Transport message
// ---------------------------------------------------------------------------

/// The envelope for all messages sent over the wire.
///
/// `seq` is assigned monotonically by the sender per session starting at 0;
/// `ack` is the sender's next-expected `seq` from the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub seq: u64,
    pub ack: u64,
    pub payload: Value,
    #[serde(rename = "streamId")]
    pub stream_id: String,
    #[serde(rename = "controlFlags", default)]
    pub control_flags: u32,
    #[serde(
        rename = "serviceName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub service_name: Option<String>,
    #[serde(
        rename = "procedureName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub procedure_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<HashMap<String, String>>,
}

impl TransportMessage {
    pub fn is_ack(&self) -> bool {
        is_ack(self.control_flags)
    }

    pub fn is_stream_open(&self) -> bool {
        is_stream_open(self.control_flags)
    }

    pub fn is_stream_cancel(&self) -> bool {
        is_stream_cancel(self.control_flags)
    }

    pub fn is_stream_close(&self) -> bool {
        is_stream_close(self.control_flags)
    }
}

/// A transport message missing id/from/to/seq/ack — the session stamps
/// those on send.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialTransportMessage {
    pub payload: Value,
    pub stream_id: String,
    pub control_flags: u32,
    pub service_name: Option<String>,
    pub procedure_name: Option<String>,
    pub tracing: Option<HashMap<String, String>>,
}

impl PartialTransportMessage {
    pub fn new(payload: Value, stream_id: impl Into<String>) -> Self {
        PartialTransportMessage {
            payload,
            stream_id: stream_id.into(),
            control_flags: 0,
            service_name: None,
            procedure_name: None,
            tracing: None,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.control_flags = flags;
        self
    }
}

// ---------------------------------------------------------------------------
// Result payloads
// ---------------------------------------------------------------------------

/// An application result as carried over a stream: `{ok, payload}`.
///
/// On `ok: false` the payload is an error object
/// `{code, message, extras?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiverResult {
    pub ok: bool,
    #[serde(default)]
    pub payload: Value,
}

impl RiverResult {
    pub fn ok(payload: Value) -> Self {
        RiverResult { ok: true, payload }
    }

    pub fn err(code: &str, message: impl Into<String>) -> Self {
        RiverResult {
            ok: false,
            payload: serde_json::json!({ "code": code, "message": message.into() }),
        }
    }

    pub fn err_with_extras(code: &str, message: impl Into<String>, extras: Value) -> Self {
        RiverResult {
            ok: false,
            payload: serde_json::json!({
                "code": code,
                "message": message.into(),
                "extras": extras,
            }),
        }
    }

    /// The error code when this is an error result.
    pub fn error_code(&self) -> Option<&str> {
        if self.ok {
            return None;
        }
        self.payload.get("code").and_then(Value::as_str)
    }

    /// Parse a wire payload into a result if it has the `{ok, ...}` shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_object()?.get("ok")?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Stream-level error codes surfaced to readables.
pub mod error_codes {
    /// The session died or the transport was closed mid-stream.
    pub const UNEXPECTED_DISCONNECT: &str = "UNEXPECTED_DISCONNECT";
    /// Client- or server-initiated cancellation.
    pub const CANCEL: &str = "CANCEL";
    /// The consumer broke the readable mid-stream.
    pub const READABLE_BROKEN: &str = "READABLE_BROKEN";
    /// Server handler raised; routed end-to-end, opaque to the client.
    pub const UNCAUGHT_ERROR: &str = "UNCAUGHT_ERROR";
    /// Server rejected the request; routed end-to-end.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
}

/// Handshake rejection codes.
///
/// | Code                        | Retriable |
/// |-----------------------------|-----------|
/// | SESSION_STATE_MISMATCH      | true      |
/// | MALFORMED_HANDSHAKE_META    | false     |
/// | MALFORMED_HANDSHAKE         | false     |
/// | PROTOCOL_VERSION_MISMATCH   | false     |
/// | REJECTED_BY_CUSTOM_HANDLER  | false     |
/// | REJECTED_UNSUPPORTED_CLIENT | false     |
pub mod handshake_codes {
    pub const SESSION_STATE_MISMATCH: &str = "SESSION_STATE_MISMATCH";
    pub const MALFORMED_HANDSHAKE_META: &str = "MALFORMED_HANDSHAKE_META";
    pub const MALFORMED_HANDSHAKE: &str = "MALFORMED_HANDSHAKE";
    pub const PROTOCOL_VERSION_MISMATCH: &str = "PROTOCOL_VERSION_MISMATCH";
    pub const REJECTED_BY_CUSTOM_HANDLER: &str = "REJECTED_BY_CUSTOM_HANDLER";
    pub const REJECTED_UNSUPPORTED_CLIENT: &str = "REJECTED_UNSUPPORTED_CLIENT";

    /// A retriable rejection destroys the session and retries as a fresh one.
    pub fn is_retriable(code: &str) -> bool {
        code == SESSION_STATE_MISMATCH
    }

    /// A fatal rejection stops the retry loop.
    pub fn is_fatal(code: &str) -> bool {
        matches!(
            code,
            MALFORMED_HANDSHAKE_META
                | MALFORMED_HANDSHAKE
                | PROTOCOL_VERSION_MISMATCH
                | REJECTED_BY_CUSTOM_HANDLER
                | REJECTED_UNSUPPORTED_CLIENT
        )
    }
}

// ---------------------------------------------------------------------------
// Control payloads
// ---------------------------------------------------------------------------

/// Seq state exchanged during the handshake so the server can detect
/// divergence from its own bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedSessionState {
    /// The client's next expected inbound seq (its `ack`).
    #[serde(rename = "nextExpectedSeq")]
    pub next_expected_seq: u64,
    /// The seq of the first unacked buffered envelope, or the next seq to
    /// assign when the buffer is empty.
    #[serde(rename = "nextSentSeq")]
    pub next_sent_seq: u64,
}

/// Handshake response status: `{ok: true, sessionId}` or
/// `{ok: false, code, reason}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeStatus {
    pub ok: bool,
    #[serde(
        rename = "sessionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HandshakeStatus {
    pub fn ok(session_id: impl Into<String>) -> Self {
        HandshakeStatus {
            ok: true,
            session_id: Some(session_id.into()),
            code: None,
            reason: None,
        }
    }

    pub fn rejected(code: impl Into<String>, reason: impl Into<String>) -> Self {
        HandshakeStatus {
            ok: false,
            session_id: None,
            code: Some(code.into()),
            reason: Some(reason.into()),
        }
    }
}

/// The control payloads recognized inside an envelope's `payload` field,
/// discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlPayload {
    #[serde(rename = "HANDSHAKE_REQ")]
    HandshakeRequest {
        #[serde(rename = "protocolVersion")]
        protocol_version: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "expectedSessionState")]
        expected_session_state: ExpectedSessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    #[serde(rename = "HANDSHAKE_RESP")]
    HandshakeResponse { status: HandshakeStatus },
    /// Heartbeat / ack-only payload.
    #[serde(rename = "ACK")]
    Ack,
    /// Clean stream close.
    #[serde(rename = "CLOSE")]
    Close,
}

impl ControlPayload {
    /// Parse a wire payload into a control payload, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Build a handshake request payload.
pub fn handshake_request_payload(
    session_id: &str,
    next_expected_seq: u64,
    next_sent_seq: u64,
    metadata: Option<Value>,
) -> Value {
    ControlPayload::HandshakeRequest {
        protocol_version: PROTOCOL_VERSION.to_owned(),
        session_id: session_id.to_owned(),
        expected_session_state: ExpectedSessionState {
            next_expected_seq,
            next_sent_seq,
        },
        metadata,
    }
    .to_value()
}

/// Heartbeat/ack control payload: `{"type": "ACK"}`.
pub fn ack_payload() -> Value {
    ControlPayload::Ack.to_value()
}

/// Clean stream close control payload: `{"type": "CLOSE"}`.
pub fn close_payload() -> Value {
    ControlPayload::Close.to_value()
}

/// Partial envelope closing a stream cleanly.
pub fn close_stream_message(stream_id: impl Into<String>) -> PartialTransportMessage {
    PartialTransportMessage::new(close_payload(), stream_id)
        .with_flags(control_flags::STREAM_CLOSED_BIT)
}

/// Partial envelope cancelling a stream, carrying the error result.
pub fn cancel_message(stream_id: impl Into<String>, error: &RiverResult) -> PartialTransportMessage {
    PartialTransportMessage::new(error.to_value(), stream_id)
        .with_flags(control_flags::STREAM_CANCEL_BIT)
}

/// Partial heartbeat envelope.
pub fn heartbeat_message() -> PartialTransportMessage {
    PartialTransportMessage::new(ack_payload(), HEARTBEAT_STREAM_ID)
        .with_flags(control_flags::ACK_BIT)
}
