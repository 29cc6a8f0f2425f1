//! The WebSocket wire protocol.
//!
//! Every frame is a JSON envelope `{ type, from, data, timestamp,
//! messageId }`; the payload enums below carry the `type`/`data` pair and
//! the envelope adds the rest.

use serde::{Deserialize, Serialize};

use crate::ot::operation::Operation;
use crate::presence::{Presence, PresenceStatus, Selection, Viewport};
use crate::session::Participant;
use crate::util;

/// Sender id stamped on server-originated envelopes.
pub const SERVER_SENDER: &str = "server";

/// The outer wire frame. `body` flattens into `type` + `data`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The typed payload.
    #[serde(flatten)]
    pub body: T,
    /// Originating user, or [`SERVER_SENDER`].
    pub from: String,
    /// Wall-clock ms at send time.
    pub timestamp: u64,
    /// Unique frame identifier.
    #[serde(rename = "messageId")]
    pub message_id: String,
}

impl<T> Envelope<T> {
    /// Wraps a payload with a fresh message ID and timestamp.
    pub fn new(body: T, from: impl Into<String>) -> Self {
        Self {
            body,
            from: from.into(),
            timestamp: util::now_millis(),
            message_id: util::message_id(),
        }
    }

    /// Wraps a server-originated payload.
    pub fn server(body: T) -> Self {
        Self::new(body, SERVER_SENDER)
    }
}

/// A cursor update as sent by clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorData {
    /// Character position.
    pub position: u32,
    /// Optional selection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

/// A presence update as sent by clients. Every field is optional so a
/// client can report just what changed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceUpdate {
    /// Self-reported status (`active`, `idle`, or `away`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
    /// Typing indicator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
    /// Visible region.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    /// Participant to follow; empty string clears.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follow: Option<String>,
}

/// Messages accepted from clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit an edit for transformation and application.
    #[serde(rename_all = "camelCase")]
    Operation {
        /// The full operation including metadata.
        operation: Operation,
    },
    /// Throttled cursor move.
    Cursor {
        /// Position and optional selection.
        cursor: CursorData,
    },
    /// Selection change; treated as a cursor update anchored at its end.
    Selection {
        /// The selected range.
        selection: Selection,
    },
    /// Status/typing/viewport update.
    Presence {
        /// The changed fields.
        presence: PresenceUpdate,
    },
    /// Ask for a fresh `document_response`.
    DocumentRequest,
    /// Undo the sender's last operation.
    Undo,
    /// Redo the sender's last undone operation.
    Redo,
}

/// Messages emitted to clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A committed, transformed operation from another participant.
    #[serde(rename_all = "camelCase")]
    Operation {
        /// The applied operation.
        operation: Operation,
    },
    /// Another participant's cursor.
    Cursor {
        /// The cursor with owner and color.
        cursor: crate::presence::CursorPosition,
    },
    /// Another participant's presence.
    Presence {
        /// The full presence record.
        presence: Presence,
    },
    /// Initial or requested session state. Never broadcast.
    #[serde(rename_all = "camelCase")]
    DocumentResponse {
        /// Current document.
        document_state: crate::ot::document::DocumentState,
        /// The most recent history entries.
        operation_history: Vec<crate::history::HistoryNode>,
        /// Current participants.
        participants: Vec<Participant>,
        /// Fresh cursors.
        cursors: Vec<crate::presence::CursorPosition>,
    },
    /// A conflict was recorded against the recipient's operation.
    #[serde(rename_all = "camelCase")]
    ConflictNotification {
        /// Identifier of the recorded resolution.
        conflict_id: String,
        /// Whether a human should review the outcome.
        requires_review: bool,
    },
    /// A failure delivered only to the offending connection.
    Error {
        /// Machine-readable code.
        code: String,
        /// Human-readable description.
        error: String,
    },
    /// A participant joined the session.
    ParticipantJoined {
        /// The new participant.
        participant: Participant,
    },
    /// A participant left the session.
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        /// The departed user.
        user_id: String,
    },
}

impl ServerMessage {
    /// Builds the initial-state payload from a session sync.
    pub fn document_response(sync: crate::session::SessionSync) -> Self {
        ServerMessage::DocumentResponse {
            document_state: sync.document_state,
            operation_history: sync.operation_history,
            participants: sync.participants,
            cursors: sync.cursors,
        }
    }

    /// Builds an error payload from an engine error.
    pub fn error(err: &crate::error::EngineError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            error: err.to_string(),
        }
    }
}
