//! Synchronous, typed event fan-out for session activity.
//!
//! Listeners are registered per event kind and dispatched inline on emit;
//! they must not block. The lifecycle manager is the main consumer — it
//! derives session metrics from this stream.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::presence::PresenceStatus;

/// Discriminant used to key listener registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)] // names mirror the `SessionEvent` variants
pub enum EventKind {
    OperationApplied,
    OperationRejected,
    ConflictDetected,
    CursorUpdated,
    TypingUpdated,
    StatusChanged,
    ViewportUpdated,
    UserFollow,
    ParticipantJoined,
    ParticipantLeft,
    DocumentSaved,
    SnapshotCreated,
}

/// One observable session event.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// An operation committed and was broadcast.
    OperationApplied {
        session_id: String,
        user_id: String,
        operation_id: String,
    },
    /// An operation was refused; nothing was mutated.
    OperationRejected {
        session_id: String,
        user_id: String,
        reason: String,
    },
    /// A transform left a conflict and the resolver recorded an outcome.
    ConflictDetected {
        session_id: String,
        conflict_id: String,
        confidence: f64,
        resolution_micros: u64,
    },
    /// A cursor moved.
    CursorUpdated { session_id: String, user_id: String },
    /// A typing indicator turned on or off.
    TypingUpdated {
        session_id: String,
        user_id: String,
        is_typing: bool,
    },
    /// A participant's presence status changed.
    StatusChanged {
        session_id: String,
        user_id: String,
        status: PresenceStatus,
    },
    /// A participant scrolled their viewport.
    ViewportUpdated { session_id: String, user_id: String },
    /// A participant started following another participant.
    UserFollow {
        session_id: String,
        user_id: String,
        target: String,
    },
    /// A participant joined (or re-joined).
    ParticipantJoined { session_id: String, user_id: String },
    /// A participant left.
    ParticipantLeft { session_id: String, user_id: String },
    /// The document was persisted by auto-sync or shutdown.
    DocumentSaved { session_id: String, version: u64 },
    /// A snapshot was taken.
    SnapshotCreated { session_id: String, automatic: bool },
}

impl SessionEvent {
    /// The kind listeners subscribe under.
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::OperationApplied { .. } => EventKind::OperationApplied,
            SessionEvent::OperationRejected { .. } => EventKind::OperationRejected,
            SessionEvent::ConflictDetected { .. } => EventKind::ConflictDetected,
            SessionEvent::CursorUpdated { .. } => EventKind::CursorUpdated,
            SessionEvent::TypingUpdated { .. } => EventKind::TypingUpdated,
            SessionEvent::StatusChanged { .. } => EventKind::StatusChanged,
            SessionEvent::ViewportUpdated { .. } => EventKind::ViewportUpdated,
            SessionEvent::UserFollow { .. } => EventKind::UserFollow,
            SessionEvent::ParticipantJoined { .. } => EventKind::ParticipantJoined,
            SessionEvent::ParticipantLeft { .. } => EventKind::ParticipantLeft,
            SessionEvent::DocumentSaved { .. } => EventKind::DocumentSaved,
            SessionEvent::SnapshotCreated { .. } => EventKind::SnapshotCreated,
        }
    }
}

type Listener = Box<dyn Fn(&SessionEvent) + Send + Sync>;

/// Kind-keyed listener registry with synchronous dispatch.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
}

impl EventBus {
    /// Registers `listener` for events of `kind`.
    pub fn subscribe(
        &self,
        kind: EventKind,
        listener: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) {
        self.listeners
            .write()
            .expect("event bus lock poisoned")
            .entry(kind)
            .or_default()
            .push(Box::new(listener));
    }

    /// Dispatches `event` to every listener registered for its kind.
    pub fn emit(&self, event: &SessionEvent) {
        let listeners = self.listeners.read().expect("event bus lock poisoned");
        if let Some(subscribed) = listeners.get(&event.kind()) {
            for listener in subscribed {
                listener(event);
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count: usize = self
            .listeners
            .read()
            .map(|map| map.values().map(Vec::len).sum())
            .unwrap_or(0);
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}
