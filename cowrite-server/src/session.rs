//! Per-session document state and the serialized operation-apply path.
//!
//! Each live session is a [`Cowrite`]: the document, its causal clock,
//! participants, presence, and history behind one `RwLock`. Every content
//! mutation goes through [`Cowrite::apply_operation`] under the write
//! guard, which is what gives all participants the same total order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::Identifier;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventBus, SessionEvent};
use crate::history::{HistoryLog, HistoryNode, Snapshot};
use crate::ot::clock::VectorClock;
use crate::ot::document::DocumentState;
use crate::ot::operation::{Operation, OperationMetadata};
use crate::ot::resolve::{
    ConflictResolution, ResolutionLog, ResolutionRequest, ResolutionStats, resolve,
};
use crate::ot::transform::{self, TransformCache};
use crate::presence::{CursorPosition, CursorUpdate, PresenceTracker, Selection};
use crate::util;

/// A participant's role within a session, highest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Created the document; every permission.
    Owner,
    /// Full management short of ownership.
    Admin,
    /// May edit and comment.
    Editor,
    /// May edit and comment, without standing membership rights.
    Collaborator,
    /// Read and comment only.
    Viewer,
}

impl Role {
    /// Weight used by the `user_priority` conflict strategy.
    pub fn weight(self) -> u32 {
        match self {
            Role::Owner => 100,
            Role::Admin => 80,
            Role::Editor => 60,
            Role::Collaborator => 40,
            Role::Viewer => 20,
        }
    }

    /// Whether this role may create a session that does not exist yet.
    pub fn can_create_session(self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

/// Permission bits derived from a role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPermissions {
    /// May submit operations, undo, and redo.
    pub can_edit: bool,
    /// May comment.
    pub can_comment: bool,
    /// May invite others.
    pub can_invite: bool,
    /// May change other participants' roles.
    pub can_manage_permissions: bool,
}

impl ParticipantPermissions {
    /// The default bits for a role.
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Owner => Self {
                can_edit: true,
                can_comment: true,
                can_invite: true,
                can_manage_permissions: true,
            },
            Role::Admin => Self {
                can_edit: true,
                can_comment: true,
                can_invite: true,
                can_manage_permissions: false,
            },
            Role::Editor | Role::Collaborator => Self {
                can_edit: true,
                can_comment: true,
                can_invite: false,
                can_manage_permissions: false,
            },
            Role::Viewer => Self {
                can_edit: false,
                can_comment: true,
                can_invite: false,
                can_manage_permissions: false,
            },
        }
    }
}

/// A user currently bound to a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Stable user identifier.
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Role in this session.
    pub role: Role,
    /// Deterministic display color.
    pub color: String,
    /// Wall-clock ms of the first join.
    pub joined_at: u64,
    /// Wall-clock ms of the last observed activity.
    pub last_seen: u64,
    /// Permission bits.
    pub permissions: ParticipantPermissions,
}

impl Participant {
    /// A participant derived from connection info.
    pub fn from_connection(user_id: &str, username: &str, role: Role) -> Self {
        let now = util::now_millis();
        Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            role,
            color: util::generate_user_color(user_id),
            joined_at: now,
            last_seen: now,
            permissions: ParticipantPermissions::for_role(role),
        }
    }
}

/// Where an operation entered the engine. Undo/redo-sourced operations
/// skip the push-onto-undo-stack step so the stacks stay consistent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplySource {
    /// A participant's own edit.
    Client,
    /// An operation generated by undo or redo.
    UndoRedo,
}

/// Outcome of applying one operation (or a batch).
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationResult {
    /// Whether the operation committed.
    pub success: bool,
    /// Transformed operations that were applied, in commit order.
    pub applied_operations: Vec<Operation>,
    /// Operations that were refused; the document was not touched.
    pub rejected_operations: Vec<Operation>,
    /// Resolutions recorded for conflicts the transform surfaced.
    pub conflicts: Vec<ConflictResolution>,
    /// The document after the batch, when anything committed.
    pub new_document_state: Option<DocumentState>,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SynchronizationResult {
    fn applied(op: Operation, conflicts: Vec<ConflictResolution>, doc: DocumentState) -> Self {
        Self {
            success: true,
            applied_operations: vec![op],
            rejected_operations: Vec::new(),
            conflicts,
            new_document_state: Some(doc),
            error: None,
        }
    }

    fn rejected(op: Operation, error: String) -> Self {
        Self {
            success: false,
            applied_operations: Vec::new(),
            rejected_operations: vec![op],
            conflicts: Vec::new(),
            new_document_state: None,
            error: Some(error),
        }
    }
}

/// Initial state delivered to a joining connection.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSync {
    /// Current document.
    pub document_state: DocumentState,
    /// The most recent history entries (at most 100).
    pub operation_history: Vec<HistoryNode>,
    /// Current participants.
    pub participants: Vec<Participant>,
    /// Cursors fresh enough to display.
    pub cursors: Vec<CursorPosition>,
}

/// Shared state behind the session lock.
struct State {
    document: DocumentState,
    clock: VectorClock,
    participants: HashMap<String, Participant>,
    presence: PresenceTracker,
    history: HistoryLog,
    resolutions: ResolutionLog,
    dirty: bool,
    last_activity: Instant,
    last_activity_ms: u64,
}

/// The main object representing a collaborative editing session.
pub struct Cowrite {
    session_id: String,
    document_id: String,
    config: EngineConfig,
    state: RwLock<State>,
    /// Listener registry for session events.
    pub events: EventBus,
    cache: Arc<TransformCache>,
    killed: AtomicBool,
    created_at: u64,
}

impl Cowrite {
    /// Creates a session around `document`, owned by `owner`. The vector
    /// clock starts seeded with the owner's coordinate.
    pub fn new(
        session_id: &str,
        document: DocumentState,
        owner: Participant,
        config: EngineConfig,
        cache: Arc<TransformCache>,
    ) -> Self {
        let document_id = document.id.clone();
        let mut presence = PresenceTracker::new(
            config.cursor_throttle(),
            config.typing_timeout(),
            config.presence_timeout(),
            config.max_cursors_displayed,
        );
        presence.join(&owner.user_id, Instant::now());
        let mut participants = HashMap::new();
        let clock = VectorClock::seeded(&owner.user_id);
        participants.insert(owner.user_id.clone(), owner);

        Self {
            session_id: session_id.to_string(),
            document_id,
            config,
            state: RwLock::new(State {
                document,
                clock,
                participants,
                presence,
                history: HistoryLog::default(),
                resolutions: ResolutionLog::default(),
                dirty: false,
                last_activity: Instant::now(),
                last_activity_ms: util::now_millis(),
            }),
            events: EventBus::default(),
            cache,
            killed: AtomicBool::new(false),
            created_at: util::now_millis(),
        }
    }

    /// The session's identifier.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The bound document's identifier.
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// The session's settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Wall-clock ms when the session was created.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Adds a participant, enforcing the participant cap. Re-joining is
    /// idempotent: the existing entry's `last_seen` and presence are
    /// refreshed and no second entry is created.
    pub async fn join(&self, participant: Participant) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        let user_id = participant.user_id.clone();
        if let Some(existing) = state.participants.get_mut(&user_id) {
            existing.last_seen = util::now_millis();
            existing.role = participant.role;
            existing.permissions = participant.permissions;
        } else {
            if state.participants.len() >= self.config.max_participants {
                return Err(EngineError::SessionFull(self.session_id.clone()));
            }
            state.participants.insert(user_id.clone(), participant);
        }
        state.presence.join(&user_id, Instant::now());
        state.document.metadata.collaborators.insert(user_id.clone());
        drop(state);

        self.events.emit(&SessionEvent::ParticipantJoined {
            session_id: self.session_id.clone(),
            user_id,
        });
        Ok(())
    }

    /// Removes a participant and their presence. Returns true when the
    /// session is now empty.
    pub async fn leave(&self, user_id: &str) -> bool {
        let mut state = self.state.write().await;
        state.participants.remove(user_id);
        state.presence.leave(user_id);
        let empty = state.participants.is_empty();
        drop(state);

        self.events.emit(&SessionEvent::ParticipantLeft {
            session_id: self.session_id.clone(),
            user_id: user_id.to_string(),
        });
        empty
    }

    /// Current participants.
    pub async fn participants(&self) -> Vec<Participant> {
        let state = self.state.read().await;
        state.participants.values().cloned().collect()
    }

    /// Current document text.
    pub async fn text(&self) -> String {
        let state = self.state.read().await;
        state.document.content.clone()
    }

    /// Current document version.
    pub async fn version(&self) -> u64 {
        let state = self.state.read().await;
        state.document.version
    }

    /// The initial-state payload for a joining connection: document plus
    /// the last 100 history entries.
    pub async fn sync_state(&self) -> SessionSync {
        let state = self.state.read().await;
        SessionSync {
            document_state: state.document.clone(),
            operation_history: state.history.tail(100).to_vec(),
            participants: state.participants.values().cloned().collect(),
            cursors: state.presence.session_cursors(Instant::now()),
        }
    }

    /// The critical serialization path: validates, stamps the clock,
    /// rebases across concurrent history, applies, records history and
    /// undo state, resolves surfaced conflicts, and emits events.
    ///
    /// Failures leave the document, history, and stacks untouched.
    pub async fn apply_operation(
        &self,
        mut op: Operation,
        user_id: &str,
        source: ApplySource,
    ) -> SynchronizationResult {
        let mut state = self.state.write().await;

        // Permission gate.
        let Some(participant) = state.participants.get(user_id) else {
            return self.reject(
                op,
                EngineError::PermissionDenied { user: user_id.to_string(), action: "edit" }
                    .to_string(),
            );
        };
        if !participant.permissions.can_edit {
            return self.reject(
                op,
                EngineError::PermissionDenied { user: user_id.to_string(), action: "edit" }
                    .to_string(),
            );
        }
        let actor_role = participant.role;

        // Structural validation.
        let report = crate::ot::operation::validate(&op);
        if !report.is_valid() {
            return self.reject(
                op,
                EngineError::ValidationFailed(report.error_summary()).to_string(),
            );
        }
        let base = op.metadata.document_version;
        if base > state.document.version {
            return self.reject(
                op,
                EngineError::ValidationFailed(format!(
                    "operation base version {base} is ahead of document version {}",
                    state.document.version
                ))
                .to_string(),
            );
        }

        // Stamp causality.
        state.clock.increment(user_id);
        op.metadata.vector_clock = state.clock.clone();
        op.metadata.session_id = self.session_id.clone();

        // Rebase across everything applied since the operation's base.
        let mut rebased = op.clone();
        let mut kinds = Vec::new();
        let mut collided_with: Option<Operation> = None;
        for node in state.history.nodes().iter().filter(|n| n.version_before >= base) {
            let t = self.cache.transform(&rebased, &node.operation);
            if !t.conflicts.is_empty() {
                collided_with = Some(node.operation.clone());
            }
            kinds.extend(t.conflicts);
            rebased = t.a;
        }

        // The rebased operation applies against the current head.
        rebased.metadata.document_version = state.document.version;
        let pre = state.document.clone();
        let (post, applied) = transform::apply(&rebased, &pre);

        if self.config.enable_operation_history {
            state.history.record(applied.clone(), &pre, &post);
        }
        if source == ApplySource::Client {
            state
                .history
                .push_undo(user_id, applied.clone(), self.config.max_undo_stack_size);
        }
        if self.config.compression_enabled && state.history.len() > self.config.max_history_size {
            state.history.compress();
            state.history.truncate_front(self.config.max_history_size);
        }

        // Turn leftover collisions into a recorded resolution.
        let mut conflicts = Vec::new();
        if let Some(first) = collided_with {
            let started = std::time::Instant::now();
            let first_role = state
                .participants
                .get(first.user_id())
                .map(|p| p.role)
                .unwrap_or(Role::Collaborator);
            let request = ResolutionRequest {
                first: &first,
                second: &applied,
                kinds: &kinds,
                first_role,
                second_role: actor_role,
                content: pre.metadata.content_type,
            };
            let resolution = resolve(self.config.conflict_resolution_strategy, &request);
            let micros = started.elapsed().as_micros() as u64;
            state.resolutions.record(resolution.clone());
            self.events.emit(&SessionEvent::ConflictDetected {
                session_id: self.session_id.clone(),
                conflict_id: resolution.conflict_id.clone(),
                confidence: resolution.confidence,
                resolution_micros: micros,
            });
            conflicts.push(resolution);
        }

        if self.config.enable_real_time_cursors {
            state.presence.rebase_cursors(&applied.kind);
        }
        state.presence.touch(user_id, Instant::now());
        if let Some(p) = state.participants.get_mut(user_id) {
            p.last_seen = util::now_millis();
        }
        state.document = post.clone();
        state.dirty = true;
        state.last_activity = Instant::now();
        state.last_activity_ms = util::now_millis();
        drop(state);

        debug!(
            session = %self.session_id,
            user = user_id,
            op = applied.id(),
            version = post.version,
            "operation applied"
        );
        self.events.emit(&SessionEvent::OperationApplied {
            session_id: self.session_id.clone(),
            user_id: user_id.to_string(),
            operation_id: applied.id().to_string(),
        });
        SynchronizationResult::applied(applied, conflicts, post)
    }

    fn reject(&self, op: Operation, reason: String) -> SynchronizationResult {
        self.events.emit(&SessionEvent::OperationRejected {
            session_id: self.session_id.clone(),
            user_id: op.user_id().to_string(),
            reason: reason.clone(),
        });
        SynchronizationResult::rejected(op, reason)
    }

    /// Batch apply, ordered by causal precedence (clock, then timestamp,
    /// then author) so causally-later operations rebase over earlier ones.
    pub async fn synchronize_operations(&self, mut ops: Vec<Operation>) -> SynchronizationResult {
        ops.sort_by(|a, b| {
            if transform::has_priority(&a.metadata, &b.metadata) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });

        let mut combined = SynchronizationResult {
            success: true,
            applied_operations: Vec::new(),
            rejected_operations: Vec::new(),
            conflicts: Vec::new(),
            new_document_state: None,
            error: None,
        };
        for op in ops {
            let user = op.user_id().to_string();
            let result = self.apply_operation(op, &user, ApplySource::Client).await;
            combined.success &= result.success;
            combined.applied_operations.extend(result.applied_operations);
            combined.rejected_operations.extend(result.rejected_operations);
            combined.conflicts.extend(result.conflicts);
            if result.new_document_state.is_some() {
                combined.new_document_state = result.new_document_state;
            }
            if combined.error.is_none() {
                combined.error = result.error;
            }
        }
        combined
    }

    /// Pops the actor's last operation and returns the rebased inverse,
    /// ready to flow through [`apply_operation`](Self::apply_operation)
    /// with [`ApplySource::UndoRedo`]. `None` means nothing to undo (or
    /// the entry was not invertible, which is deliberately silent).
    pub async fn undo(&self, user_id: &str) -> Result<Option<Operation>, EngineError> {
        let mut state = self.state.write().await;
        self.require_edit(&state, user_id, "undo")?;

        let Some(last) = state.history.pop_undo(user_id) else {
            return Ok(None);
        };
        let kind = match transform::inverse(&last) {
            Ok(kind) => kind,
            Err(EngineError::NonInvertible) => {
                info!(user = user_id, "undo target not invertible, dropping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let undo_op = Operation::new(
            kind,
            OperationMetadata {
                operation_id: util::operation_id(),
                user_id: user_id.to_string(),
                session_id: self.session_id.clone(),
                timestamp: util::now_millis(),
                vector_clock: VectorClock::default(),
                document_version: state.document.version,
                parent_operation_id: Some(last.id().to_string()),
            },
        );
        state
            .history
            .push_redo(user_id, last, self.config.max_undo_stack_size);
        Ok(Some(undo_op))
    }

    /// Pops the actor's last undone operation, restores it to the undo
    /// stack, and returns it re-stamped for re-application.
    pub async fn redo(&self, user_id: &str) -> Result<Option<Operation>, EngineError> {
        let mut state = self.state.write().await;
        self.require_edit(&state, user_id, "redo")?;

        let Some(op) = state.history.pop_redo(user_id) else {
            return Ok(None);
        };
        state.history.restore_undo(user_id, op.clone());
        let mut redo_op = op.clone();
        redo_op.metadata.operation_id = util::operation_id();
        redo_op.metadata.parent_operation_id = Some(op.id().to_string());
        redo_op.metadata.timestamp = util::now_millis();
        redo_op.metadata.document_version = state.document.version;
        redo_op.metadata.vector_clock = VectorClock::default();
        Ok(Some(redo_op))
    }

    fn require_edit(&self, state: &State, user_id: &str, action: &'static str) -> Result<(), EngineError> {
        let allowed = state
            .participants
            .get(user_id)
            .is_some_and(|p| p.permissions.can_edit);
        if allowed {
            Ok(())
        } else {
            Err(EngineError::PermissionDenied { user: user_id.to_string(), action })
        }
    }

    /// Throttled cursor update; on acceptance the presence timer resets.
    pub async fn update_cursor(
        &self,
        user_id: &str,
        position: u32,
        selection: Option<Selection>,
    ) -> CursorUpdate {
        if !self.config.enable_real_time_cursors {
            return CursorUpdate::Throttled;
        }
        let mut state = self.state.write().await;
        let outcome = state.presence.update_cursor(user_id, position, selection, Instant::now());
        drop(state);
        if matches!(outcome, CursorUpdate::Accepted(_)) {
            self.events.emit(&SessionEvent::CursorUpdated {
                session_id: self.session_id.clone(),
                user_id: user_id.to_string(),
            });
        }
        outcome
    }

    /// Runs `f` with mutable access to the presence tracker and returns
    /// the changes it produced. Used by the controller for status, typing,
    /// viewport, and follow updates, and by the ticker for sweeps.
    pub async fn with_presence<T>(&self, f: impl FnOnce(&mut PresenceTracker) -> T) -> T {
        let mut state = self.state.write().await;
        f(&mut state.presence)
    }

    /// Stored cursor for `user_id`, if fresh enough to display.
    pub async fn cursor(&self, user_id: &str) -> Option<CursorPosition> {
        let state = self.state.read().await;
        state.presence.cursor(user_id).cloned()
    }

    /// Deep-copies the current state into a snapshot and retains it.
    pub async fn create_snapshot(&self, description: Option<String>, automatic: bool) -> Snapshot {
        let mut state = self.state.write().await;
        let snapshot = Snapshot {
            document: state.document.clone(),
            vector_clock: state.clock.clone(),
            history_len: state.history.len(),
            timestamp: util::now_millis(),
            automatic,
            description,
        };
        state.history.add_snapshot(snapshot.clone());
        drop(state);
        self.events.emit(&SessionEvent::SnapshotCreated {
            session_id: self.session_id.clone(),
            automatic,
        });
        snapshot
    }

    /// Rewinds the session to `snapshot`. The snapshot's checksum must
    /// match its content; restoring does not notify clients (that is the
    /// controller's job).
    pub async fn restore_from_snapshot(&self, snapshot: &Snapshot) -> Result<(), EngineError> {
        if util::checksum(&snapshot.document.content) != snapshot.document.checksum {
            return Err(EngineError::InvalidSnapshot);
        }
        let mut state = self.state.write().await;
        state.document = snapshot.document.clone();
        state.clock = snapshot.vector_clock.clone();
        state.history.rewind_to(snapshot.history_len);
        state.dirty = true;
        state.last_activity = Instant::now();
        state.last_activity_ms = util::now_millis();
        Ok(())
    }

    /// Statistics over this session's conflict resolutions.
    pub async fn resolution_stats(&self) -> ResolutionStats {
        let state = self.state.read().await;
        state.resolutions.stats()
    }

    /// Full history log (cloned), for export.
    pub async fn history_nodes(&self) -> Vec<HistoryNode> {
        let state = self.state.read().await;
        state.history.nodes().to_vec()
    }

    /// The document if it changed since the last call; clears the dirty
    /// flag. One operation to avoid a lost update between check and clear.
    pub async fn dirty_document(&self) -> Option<DocumentState> {
        let mut state = self.state.write().await;
        if state.dirty {
            state.dirty = false;
            Some(state.document.clone())
        } else {
            None
        }
    }

    /// Current document state (deep copy).
    pub async fn document(&self) -> DocumentState {
        let state = self.state.read().await;
        state.document.clone()
    }

    /// Milliseconds since epoch of the last operation or join activity.
    pub async fn last_activity_ms(&self) -> u64 {
        let state = self.state.read().await;
        state.last_activity_ms
    }

    /// How long ago the session last saw activity.
    pub async fn idle_for(&self) -> std::time::Duration {
        let state = self.state.read().await;
        state.last_activity.elapsed()
    }

    /// Kills the session if it has no participants and no unsaved work.
    pub async fn kill_if_idle(&self) -> bool {
        let state = self.state.read().await;
        if state.participants.is_empty() && !state.dirty {
            drop(state);
            self.kill();
            true
        } else {
            false
        }
    }

    /// Marks the session dead; background tasks observe this and stop.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }

    /// Whether the session has been killed.
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }
}

/// An entry in the session registry, tracking recency for the reaper.
struct SessionEntry {
    last_accessed: Instant,
    session: Arc<Cowrite>,
}

/// Registry of live sessions, keyed by session identifier.
pub struct SessionManager {
    sessions: DashMap<Identifier, SessionEntry>,
    cache: Arc<TransformCache>,
    defaults: EngineConfig,
}

impl SessionManager {
    /// A manager that seeds new sessions from `defaults`.
    pub fn new(defaults: EngineConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            cache: Arc::new(TransformCache::default()),
            defaults,
        }
    }

    /// Creates and registers a session around `document`. The owner is
    /// joined immediately.
    pub fn create_session(
        &self,
        session_id: &Identifier,
        document: DocumentState,
        owner: Participant,
    ) -> Arc<Cowrite> {
        info!(session = %session_id, document = %document.id, "creating session");
        let session = Arc::new(Cowrite::new(
            session_id.as_ref(),
            document,
            owner,
            self.defaults.clone(),
            Arc::clone(&self.cache),
        ));
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                last_accessed: Instant::now(),
                session: Arc::clone(&session),
            },
        );
        session
    }

    /// Looks up a session, refreshing its recency.
    pub fn get(&self, session_id: &Identifier) -> Option<Arc<Cowrite>> {
        let mut entry = self.sessions.get_mut(session_id)?;
        entry.last_accessed = Instant::now();
        Some(Arc::clone(&entry.session))
    }

    /// Removes a session from the registry and kills it.
    pub fn remove(&self, session_id: &Identifier) -> Option<Arc<Cowrite>> {
        let (_, entry) = self.sessions.remove(session_id)?;
        entry.session.kill();
        Some(entry.session)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Engine defaults applied to new sessions.
    pub fn defaults(&self) -> &EngineConfig {
        &self.defaults
    }

    /// Session IDs that have been idle longer than `max_idle`, judged by
    /// both registry access recency and in-session activity.
    pub async fn idle_sessions(&self, max_idle: std::time::Duration) -> Vec<Identifier> {
        let candidates: Vec<(Identifier, Instant, Arc<Cowrite>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.last_accessed, Arc::clone(&e.session)))
            .collect();
        let mut idle = Vec::new();
        for (key, last_accessed, session) in candidates {
            if last_accessed.elapsed() > max_idle && session.idle_for().await > max_idle {
                idle.push(key);
            }
        }
        idle
    }

    /// Snapshot of all live sessions.
    pub fn all(&self) -> Vec<Arc<Cowrite>> {
        self.sessions.iter().map(|e| Arc::clone(&e.session)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::operation::OperationKind;

    fn session_with(config: EngineConfig) -> Cowrite {
        let owner = Participant::from_connection("alice", "Alice", Role::Owner);
        Cowrite::new(
            "s1",
            DocumentState::new("doc1", "alice"),
            owner,
            config,
            Arc::new(TransformCache::default()),
        )
    }

    fn insert(user: &str, position: u32, content: &str, version: u64) -> Operation {
        Operation::new(
            OperationKind::Insert {
                position,
                content: content.to_string(),
                attributes: None,
            },
            OperationMetadata::generated(user, "s1", version),
        )
    }

    #[tokio::test]
    async fn apply_rejects_unknown_and_read_only_users() {
        let session = session_with(EngineConfig::default());

        let result = session
            .apply_operation(insert("mallory", 0, "x", 1), "mallory", ApplySource::Client)
            .await;
        assert!(!result.success);
        assert_eq!(result.rejected_operations.len(), 1);

        session
            .join(Participant::from_connection("vera", "Vera", Role::Viewer))
            .await
            .unwrap();
        let result = session
            .apply_operation(insert("vera", 0, "x", 1), "vera", ApplySource::Client)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("permission denied"));
        assert_eq!(session.text().await, "");
    }

    #[tokio::test]
    async fn join_enforces_the_participant_cap_but_not_rejoins() {
        let session = session_with(EngineConfig {
            max_participants: 2,
            ..Default::default()
        });
        session
            .join(Participant::from_connection("bob", "Bob", Role::Editor))
            .await
            .unwrap();
        let err = session
            .join(Participant::from_connection("carol", "Carol", Role::Editor))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionFull(_)));

        // Re-joining an existing participant never counts against the cap.
        session
            .join(Participant::from_connection("bob", "Bob", Role::Editor))
            .await
            .unwrap();
        assert_eq!(session.participants().await.len(), 2);
    }

    #[tokio::test]
    async fn synchronize_applies_in_causal_order() {
        let session = session_with(EngineConfig::default());
        session
            .join(Participant::from_connection("bob", "Bob", Role::Editor))
            .await
            .unwrap();

        // Submitted out of order; timestamps carry the intended order.
        let mut first = insert("alice", 0, "a", 1);
        first.metadata.timestamp = 100;
        let mut second = insert("bob", 1, "b", 2);
        second.metadata.timestamp = 200;
        let result = session.synchronize_operations(vec![second, first]).await;
        assert!(result.success);
        assert_eq!(result.applied_operations.len(), 2);
        assert_eq!(session.text().await, "ab");
        assert_eq!(session.version().await, 3);
    }

    #[tokio::test]
    async fn snapshot_restores_only_with_matching_checksum() {
        let session = session_with(EngineConfig::default());
        let result = session
            .apply_operation(insert("alice", 0, "draft one", 1), "alice", ApplySource::Client)
            .await;
        assert!(result.success);

        let snapshot = session.create_snapshot(Some("before rewrite".into()), false).await;
        let result = session
            .apply_operation(insert("alice", 9, " and more", 2), "alice", ApplySource::Client)
            .await;
        assert!(result.success);
        assert_eq!(session.text().await, "draft one and more");

        session.restore_from_snapshot(&snapshot).await.unwrap();
        assert_eq!(session.text().await, "draft one");
        assert_eq!(session.version().await, 2);

        let mut corrupted = snapshot.clone();
        corrupted.document.content = "tampered".to_string();
        let err = session.restore_from_snapshot(&corrupted).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSnapshot));
    }

    #[tokio::test]
    async fn content_aware_resolution_reads_the_document_type() {
        use crate::ot::document::ContentKind;
        use crate::ot::resolve::ResolutionStrategy;

        let owner = Participant::from_connection("alice", "Alice", Role::Owner);
        let mut document = DocumentState::new("handlers", "alice");
        document.metadata.content_type = ContentKind::Code;
        let session = Cowrite::new(
            "s1",
            document,
            owner,
            EngineConfig {
                conflict_resolution_strategy: ResolutionStrategy::ContentAware,
                ..Default::default()
            },
            Arc::new(TransformCache::default()),
        );
        session
            .join(Participant::from_connection("bob", "Bob", Role::Editor))
            .await
            .unwrap();

        let result = session
            .apply_operation(
                insert("alice", 0, "function handle() {", 1),
                "alice",
                ApplySource::Client,
            )
            .await;
        assert!(result.success && result.conflicts.is_empty());

        // A concurrent same-position edit against structural code
        // escalates to interactive review.
        let result = session
            .apply_operation(insert("bob", 0, "let x = 1;", 1), "bob", ApplySource::Client)
            .await;
        assert!(result.success);
        assert_eq!(result.conflicts.len(), 1);
        assert!(result.conflicts[0].requires_review);
        assert_eq!(result.conflicts[0].confidence, 0.0);
    }

    #[tokio::test]
    async fn version_tracks_applied_operations() {
        let session = session_with(EngineConfig::default());
        for i in 0..5u32 {
            let result = session
                .apply_operation(
                    insert("alice", i, "x", u64::from(i) + 1),
                    "alice",
                    ApplySource::Client,
                )
                .await;
            assert!(result.success);
        }
        assert_eq!(session.version().await, 6);
        assert_eq!(session.history_nodes().await.len(), 5);
    }
}
