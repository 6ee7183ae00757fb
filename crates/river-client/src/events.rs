//! Transport event bus.
//!
//! A name-keyed multi-listener registry. Listeners run synchronously in
//! registration order; dispatch iterates over a snapshot so listeners may
//! add or remove registrations mid-dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use river_protocol::TransportMessage;

use crate::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    SessionStatus,
    SessionTransition,
    ProtocolError,
    TransportStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatusKind {
    Created,
    Closing,
    Closed,
}

/// The fields listeners match sessions on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub to_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    ConnRetryExceeded,
    HandshakeFailed,
    InvalidMessage,
    MessageSendFailure,
}

#[derive(Debug, Clone)]
pub struct ProtocolErrorEvent {
    pub kind: ProtocolErrorKind,
    pub message: String,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatusKind {
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(TransportMessage),
    SessionStatus {
        status: SessionStatusKind,
        session: SessionInfo,
    },
    SessionTransition {
        state: SessionState,
        id: String,
    },
    ProtocolError(ProtocolErrorEvent),
    TransportStatus {
        status: TransportStatusKind,
    },
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Message(_) => EventKind::Message,
            TransportEvent::SessionStatus { .. } => EventKind::SessionStatus,
            TransportEvent::SessionTransition { .. } => EventKind::SessionTransition,
            TransportEvent::ProtocolError(_) => EventKind::ProtocolError,
            TransportEvent::TransportStatus { .. } => EventKind::TransportStatus,
        }
    }
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn add_listener(
        &self,
        kind: EventKind,
        listener: impl Fn(&TransportEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) {
        if let Some(entries) = self.lock().get_mut(&kind) {
            entries.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Dispatch an event to all listeners registered for its kind.
    pub fn dispatch(&self, event: &TransportEvent) {
        let snapshot: Vec<Listener> = self
            .lock()
            .get(&event.kind())
            .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();
        for listener in snapshot {
            listener(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<(ListenerId, Listener)>>> {
        self.listeners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
