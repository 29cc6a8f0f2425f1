//! The WebSocket collaboration controller.
//!
//! Binds connections to sessions, routes inbound messages, and owns the
//! per-session operation queue. Operations are drained by at most one
//! processor per session at a time; committed operations broadcast to
//! every connection except the origin, and failures go back to the origin
//! only. Cursor and presence traffic bypasses the queue entirely.

pub mod protocol;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::events::SessionEvent;
use crate::ot::document::DocumentState;
use crate::ot::operation::Operation;
use crate::presence::{PresenceChange, PresenceStatus, Selection};
use crate::session::{ApplySource, Cowrite, Participant, ParticipantPermissions, Role};
use crate::util;
use crate::{Identifier, ServerState};

use protocol::{ClientMessage, CursorData, Envelope, PresenceUpdate, ServerMessage};

/// The authenticated tuple the transport supplies for a joining
/// connection. The controller itself never verifies authentication.
#[derive(Clone, Debug)]
pub struct JoinRequest {
    /// Target session.
    pub session_id: Identifier,
    /// Document bound to the session.
    pub document_id: Identifier,
    /// Authenticated user.
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Granted role.
    pub role: Role,
}

/// Outbound senders for every connection in one session.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    senders: DashMap<u64, mpsc::UnboundedSender<Envelope<ServerMessage>>>,
}

impl ConnectionRegistry {
    /// Registers a connection's outbound channel.
    pub fn register(&self, connection_id: u64, sender: mpsc::UnboundedSender<Envelope<ServerMessage>>) {
        self.senders.insert(connection_id, sender);
    }

    /// Drops a connection's outbound channel.
    pub fn unregister(&self, connection_id: u64) {
        self.senders.remove(&connection_id);
    }

    /// Sends to one connection; silently drops if it is gone.
    pub fn send_to(&self, connection_id: u64, envelope: Envelope<ServerMessage>) {
        if let Some(sender) = self.senders.get(&connection_id) {
            sender.send(envelope).ok();
        }
    }

    /// Sends to every connection except `origin`.
    pub fn broadcast_except(&self, origin: u64, envelope: &Envelope<ServerMessage>) {
        for entry in self.senders.iter() {
            if *entry.key() != origin {
                entry.value().send(envelope.clone()).ok();
            }
        }
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

struct QueuedOp {
    op: Operation,
    origin: u64,
    user_id: String,
    source: ApplySource,
    enqueued_at: Instant,
}

/// Per-session controller state: the fan-out registry and the serialized
/// operation queue with its single-processor guard.
pub struct SessionChannels {
    /// Outbound fan-out for the session's connections.
    pub connections: ConnectionRegistry,
    queue: Mutex<VecDeque<QueuedOp>>,
    processing: AtomicBool,
}

impl SessionChannels {
    fn new() -> Self {
        Self {
            connections: ConnectionRegistry::default(),
            queue: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
        }
    }

    fn queue_len(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    fn push(&self, queued: QueuedOp) {
        self.queue.lock().expect("queue lock poisoned").push_back(queued);
    }

    fn drain_batch(&self, max: usize) -> Vec<QueuedOp> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }
}

/// Controller-wide connection and queue state.
pub struct Controller {
    channels: DashMap<Identifier, Arc<SessionChannels>>,
    next_connection: AtomicU64,
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            channels: DashMap::new(),
            next_connection: AtomicU64::new(0),
        }
    }
}

impl Controller {
    /// Channels for a session, created on first use.
    pub fn channels(&self, session_id: &Identifier) -> Arc<SessionChannels> {
        Arc::clone(
            &self
                .channels
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(SessionChannels::new())),
        )
    }

    /// Channels for a session, if any connection has touched it.
    pub fn existing_channels(&self, session_id: &Identifier) -> Option<Arc<SessionChannels>> {
        self.channels.get(session_id).map(|e| Arc::clone(&e))
    }

    /// Drops a session's channels on teardown.
    pub fn drop_channels(&self, session_id: &Identifier) {
        self.channels.remove(session_id);
    }

    fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }
}

/// Handles one WebSocket connection from upgrade to disconnect.
pub async fn handle_socket(state: Arc<ServerState>, socket: WebSocket, join: JoinRequest) {
    let connection_id = state.controller.next_connection_id();
    info!(
        connection = connection_id,
        session = %join.session_id,
        user = %join.user_id,
        "socket connected"
    );
    if let Err(e) = connection(&state, socket, &join, connection_id).await {
        warn!(connection = connection_id, "connection terminated early: {e:#}");
    }
    disconnect(&state, &join, connection_id).await;
    info!(connection = connection_id, "disconnected");
}

async fn connection(
    state: &Arc<ServerState>,
    mut socket: WebSocket,
    join: &JoinRequest,
    connection_id: u64,
) -> Result<()> {
    let session = match state.sessions.get(&join.session_id) {
        Some(session) => session,
        None if join.role.can_create_session() => {
            let document = match state.database.load_document(&join.document_id).await {
                Ok(document) => document,
                Err(_) => DocumentState::new(join.document_id.as_ref(), &join.user_id),
            };
            let owner = Participant::from_connection(&join.user_id, &join.username, join.role);
            let session = state.sessions.create_session(&join.session_id, document, owner);
            crate::lifecycle::spawn_session_tasks(state, &session);
            session
        }
        None => {
            let err = EngineError::SessionNotFound(join.session_id.to_string());
            socket.send(to_message(&Envelope::server(ServerMessage::error(&err)))).await.ok();
            bail!("{err}");
        }
    };

    let participant = Participant::from_connection(&join.user_id, &join.username, join.role);
    if let Err(err) = session.join(participant.clone()).await {
        socket.send(to_message(&Envelope::server(ServerMessage::error(&err)))).await.ok();
        bail!("{err}");
    }

    let channels = state.controller.channels(&join.session_id);
    let (tx, mut rx) = mpsc::unbounded_channel();
    channels.connections.register(connection_id, tx);
    channels.connections.broadcast_except(
        connection_id,
        &Envelope::new(
            ServerMessage::ParticipantJoined { participant },
            join.user_id.clone(),
        ),
    );

    // Initial state must reach the client before any of its operations
    // are processed; failing to deliver it drops the connection.
    let sync = session.sync_state().await;
    socket
        .send(to_message(&Envelope::server(ServerMessage::document_response(sync))))
        .await
        .context("delivering initial state")?;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(envelope) => socket.send(to_message(&envelope)).await?,
                    None => break,
                }
            }
            inbound = socket.next() => {
                match inbound {
                    None => break,
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Text(text))) => {
                        // Unparseable frames close the connection; valid
                        // frames that fail only answer the origin.
                        let envelope: Envelope<ClientMessage> =
                            serde_json::from_str(text.as_str()).context("invalid message")?;
                        handle_message(&session, &channels, connection_id, join, envelope.body).await;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    Ok(())
}

async fn handle_message(
    session: &Arc<Cowrite>,
    channels: &Arc<SessionChannels>,
    connection_id: u64,
    join: &JoinRequest,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Operation { mut operation } => {
            if !ParticipantPermissions::for_role(join.role).can_edit {
                let err = EngineError::PermissionDenied {
                    user: join.user_id.clone(),
                    action: "edit",
                };
                channels
                    .connections
                    .send_to(connection_id, Envelope::server(ServerMessage::error(&err)));
                return;
            }
            ensure_metadata(&mut operation, session, join).await;
            enqueue(session, channels, connection_id, operation, &join.user_id, ApplySource::Client);
        }
        ClientMessage::Cursor { cursor } => {
            let CursorData { position, selection } = cursor;
            cursor_update(session, channels, connection_id, &join.user_id, position, selection).await;
        }
        ClientMessage::Selection { selection } => {
            cursor_update(
                session,
                channels,
                connection_id,
                &join.user_id,
                selection.end,
                Some(selection),
            )
            .await;
        }
        ClientMessage::Presence { presence } => {
            presence_update(session, channels, connection_id, &join.user_id, presence).await;
        }
        ClientMessage::DocumentRequest => {
            let sync = session.sync_state().await;
            channels.connections.send_to(
                connection_id,
                Envelope::server(ServerMessage::document_response(sync)),
            );
        }
        ClientMessage::Undo => {
            undo_redo(session, channels, connection_id, join, true).await;
        }
        ClientMessage::Redo => {
            undo_redo(session, channels, connection_id, join, false).await;
        }
    }
}

/// Populates missing metadata and pins the author to the authenticated
/// user so clients cannot impersonate each other.
async fn ensure_metadata(operation: &mut Operation, session: &Arc<Cowrite>, join: &JoinRequest) {
    let metadata = &mut operation.metadata;
    metadata.user_id = join.user_id.clone();
    metadata.session_id = join.session_id.to_string();
    if metadata.operation_id.is_empty() {
        metadata.operation_id = util::operation_id();
    }
    if metadata.timestamp == 0 {
        metadata.timestamp = util::now_millis();
    }
    if metadata.document_version == 0 {
        metadata.document_version = session.version().await;
    }
}

fn enqueue(
    session: &Arc<Cowrite>,
    channels: &Arc<SessionChannels>,
    origin: u64,
    op: Operation,
    user_id: &str,
    source: ApplySource,
) {
    if channels.queue_len() >= session.config().backpressure_limit() {
        let err = EngineError::SessionBusy(session.session_id().to_string());
        channels.connections.send_to(origin, Envelope::server(ServerMessage::error(&err)));
        return;
    }
    channels.push(QueuedOp {
        op,
        origin,
        user_id: user_id.to_string(),
        source,
        enqueued_at: Instant::now(),
    });
    tokio::spawn(process_queue(Arc::clone(session), Arc::clone(channels)));
}

/// Drains the session queue in batches. At most one processor runs per
/// session; a processor observing a non-empty queue after clearing the
/// guard re-enters, so no enqueue is lost.
async fn process_queue(session: Arc<Cowrite>, channels: Arc<SessionChannels>) {
    loop {
        if channels.processing.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let batch = channels.drain_batch(session.config().max_concurrent_operations);
            if batch.is_empty() {
                break;
            }
            for queued in batch {
                let timeout = session.config().operation_timeout();
                if queued.enqueued_at.elapsed() > timeout {
                    warn!(
                        session = session.session_id(),
                        op = queued.op.id(),
                        "operation expired in queue"
                    );
                    let err = EngineError::OperationTimeout(timeout);
                    channels
                        .connections
                        .send_to(queued.origin, Envelope::server(ServerMessage::error(&err)));
                    continue;
                }

                let origin_user = queued.user_id.clone();
                let result = session
                    .apply_operation(queued.op, &queued.user_id, queued.source)
                    .await;
                if result.success {
                    for applied in &result.applied_operations {
                        channels.connections.broadcast_except(
                            queued.origin,
                            &Envelope::new(
                                ServerMessage::Operation { operation: applied.clone() },
                                origin_user.clone(),
                            ),
                        );
                    }
                    for conflict in &result.conflicts {
                        channels.connections.send_to(
                            queued.origin,
                            Envelope::server(ServerMessage::ConflictNotification {
                                conflict_id: conflict.conflict_id.clone(),
                                requires_review: conflict.requires_review,
                            }),
                        );
                    }
                } else {
                    let error = result.error.unwrap_or_else(|| "operation rejected".to_string());
                    channels.connections.send_to(
                        queued.origin,
                        Envelope::server(ServerMessage::Error {
                            code: "operation_rejected".to_string(),
                            error,
                        }),
                    );
                    // A fresh document_response lets the origin revert its
                    // optimistic edit; other participants never hear of it.
                    let sync = session.sync_state().await;
                    channels.connections.send_to(
                        queued.origin,
                        Envelope::server(ServerMessage::document_response(sync)),
                    );
                }
            }
            if channels.queue_len() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        channels.processing.store(false, Ordering::SeqCst);
        if channels.queue_len() == 0 {
            return;
        }
    }
}

async fn cursor_update(
    session: &Arc<Cowrite>,
    channels: &Arc<SessionChannels>,
    connection_id: u64,
    user_id: &str,
    position: u32,
    selection: Option<Selection>,
) {
    match session.update_cursor(user_id, position, selection).await {
        crate::presence::CursorUpdate::Accepted(changes) => {
            emit_presence_changes(session, &changes);
            if let Some(cursor) = session.cursor(user_id).await {
                channels.connections.broadcast_except(
                    connection_id,
                    &Envelope::new(ServerMessage::Cursor { cursor }, user_id.to_string()),
                );
            }
        }
        crate::presence::CursorUpdate::Throttled => {}
    }
}

async fn presence_update(
    session: &Arc<Cowrite>,
    channels: &Arc<SessionChannels>,
    connection_id: u64,
    user_id: &str,
    update: PresenceUpdate,
) {
    let now = Instant::now();
    let viewport_changed = update.viewport.is_some();
    let follow = update.follow.clone();
    let (changes, snapshot) = session
        .with_presence(move |presence| {
            let mut changes = Vec::new();
            if let Some(status) = update.status
                && status != PresenceStatus::Offline
            {
                changes.extend(presence.set_status(user_id, status, now));
            }
            if let Some(is_typing) = update.is_typing {
                changes.extend(presence.set_typing(user_id, is_typing, now));
            }
            if let Some(viewport) = update.viewport {
                changes.extend(presence.set_viewport(user_id, viewport, now));
            }
            if let Some(target) = &update.follow {
                let target = (!target.is_empty()).then(|| target.clone());
                presence.set_following(user_id, target);
            }
            (changes, presence.presence(user_id).cloned())
        })
        .await;

    emit_presence_changes(session, &changes);
    if viewport_changed {
        session.events.emit(&SessionEvent::ViewportUpdated {
            session_id: session.session_id().to_string(),
            user_id: user_id.to_string(),
        });
    }
    if let Some(target) = follow
        && !target.is_empty()
    {
        session.events.emit(&SessionEvent::UserFollow {
            session_id: session.session_id().to_string(),
            user_id: user_id.to_string(),
            target,
        });
    }

    if let Some(presence) = snapshot {
        channels.connections.broadcast_except(
            connection_id,
            &Envelope::new(ServerMessage::Presence { presence }, user_id.to_string()),
        );
    }
}

/// Mirrors presence transitions onto the session event bus.
pub(crate) fn emit_presence_changes(session: &Cowrite, changes: &[PresenceChange]) {
    for change in changes {
        match change {
            PresenceChange::Status { user_id, status } => {
                session.events.emit(&SessionEvent::StatusChanged {
                    session_id: session.session_id().to_string(),
                    user_id: user_id.clone(),
                    status: *status,
                });
            }
            PresenceChange::Typing { user_id, is_typing } => {
                session.events.emit(&SessionEvent::TypingUpdated {
                    session_id: session.session_id().to_string(),
                    user_id: user_id.clone(),
                    is_typing: *is_typing,
                });
            }
        }
    }
}

async fn undo_redo(
    session: &Arc<Cowrite>,
    channels: &Arc<SessionChannels>,
    connection_id: u64,
    join: &JoinRequest,
    is_undo: bool,
) {
    let result = if is_undo {
        session.undo(&join.user_id).await
    } else {
        session.redo(&join.user_id).await
    };
    match result {
        Ok(Some(op)) => {
            enqueue(session, channels, connection_id, op, &join.user_id, ApplySource::UndoRedo);
        }
        // Nothing to undo/redo (or not invertible): deliberately silent.
        Ok(None) => {}
        Err(err) => {
            channels
                .connections
                .send_to(connection_id, Envelope::server(ServerMessage::error(&err)));
        }
    }
}

async fn disconnect(state: &Arc<ServerState>, join: &JoinRequest, connection_id: u64) {
    if let Some(channels) = state.controller.existing_channels(&join.session_id) {
        channels.connections.unregister(connection_id);
        channels.connections.broadcast_except(
            connection_id,
            &Envelope::new(
                ServerMessage::ParticipantLeft { user_id: join.user_id.clone() },
                join.user_id.clone(),
            ),
        );
    }
    if let Some(session) = state.sessions.get(&join.session_id) {
        let empty = session.leave(&join.user_id).await;
        if empty {
            // The reaper exports and tears the session down once it has
            // been idle long enough; an empty clean session can go now.
            if session.kill_if_idle().await {
                state.sessions.remove(&join.session_id);
                state.controller.drop_channels(&join.session_id);
            }
        }
    }
}

fn to_message(envelope: &Envelope<ServerMessage>) -> Message {
    let serialized = serde_json::to_string(envelope).expect("failed serialize");
    Message::text(serialized)
}
