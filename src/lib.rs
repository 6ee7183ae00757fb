// river: Client-side implementation of the River v2.0 RPC protocol.
//
// A durable logical session survives connection drops underneath many
// concurrent procedure streams (rpc, stream, upload, subscription),
// with in-order single delivery per session and coordinated
// cancellation. The facade re-exports the protocol types and the
// client core.

pub use river_client::{
    ClientOptions, ClientTransport, EventBus, EventKind, ListenerId, ProcType,
    ProtocolErrorEvent, ProtocolErrorKind, Readable, ReadableIter, RetryBudget, RetryOptions,
    RiverClient, SendError, SessionInfo, SessionOptions, SessionSender, SessionState,
    SessionStatusKind, StreamError, StreamHandle, TransportEvent, TransportOptions,
    TransportStatus, TransportStatusKind, UploadHandle, Writable,
};
pub use river_protocol::{
    ControlPayload, ExpectedSessionState, HANDSHAKE_STREAM_ID, HEARTBEAT_STREAM_ID,
    HandshakeStatus, PROTOCOL_VERSION, PartialTransportMessage, RiverResult, TransportMessage,
    ack_payload, cancel_message, close_payload, close_stream_message, codec, control_flags,
    error_codes, generate_id, handshake_codes, handshake_request_payload, heartbeat_message,
    is_ack, is_stream_cancel, is_stream_close, is_stream_open,
};
