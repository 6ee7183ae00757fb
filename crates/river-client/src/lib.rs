// river-client: Client core for the River v2.0 protocol.
//
// Layered bottom-up: streams (readable/writable pairs), the retry
// budget, the session state machine, the transport (connections,
// handshakes, read loop, event bus), and procedure dispatch on top.

pub mod budget;
pub mod client;
pub mod events;
pub mod session;
pub mod streams;
pub mod transport;

pub use budget::{RetryBudget, RetryOptions};
pub use client::{ClientOptions, ProcType, RiverClient, StreamHandle, UploadHandle};
pub use events::{
    EventBus, EventKind, ListenerId, ProtocolErrorEvent, ProtocolErrorKind, SessionInfo,
    SessionStatusKind, TransportEvent, TransportStatusKind,
};
pub use session::{SendError, SessionOptions, SessionState};
pub use streams::{Readable, ReadableIter, StreamError, Writable};
pub use transport::{ClientTransport, SessionSender, TransportOptions, TransportStatus};
