//! Per-session operation history, undo/redo stacks, snapshots, and
//! history compression.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ot::clock::VectorClock;
use crate::ot::document::DocumentState;
use crate::ot::operation::{Operation, OperationKind};
use crate::ot::transform;
use crate::util;

/// Adjacent same-user operations further apart than this are never merged.
pub const COMPRESSION_WINDOW_MS: u64 = 5_000;
/// At most this many automatic snapshots are retained per session.
pub const MAX_AUTOMATIC_SNAPSHOTS: usize = 10;
/// At most this many snapshots of any kind are retained per session.
pub const MAX_SNAPSHOTS: usize = 50;

/// Size classification of a history entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    /// A handful of characters.
    Minor,
    /// A typical edit.
    Normal,
    /// A large paste, deletion, or reformat.
    Major,
}

/// Descriptive metadata attached to a history entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntryMeta {
    /// Human-readable description, e.g. `Inserted 'Hello…' at position 42`.
    pub description: String,
    /// Free-form tags (`undo`, `merged`, …).
    pub tags: Vec<String>,
    /// Size classification.
    pub importance: Importance,
}

/// One applied operation with everything needed to audit or invert it.
///
/// The pre/post document states are identified by version and checksum
/// rather than deep copies; snapshots carry full state when it is needed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryNode {
    /// The applied (capture-enriched) operation.
    pub operation: Operation,
    /// Its inverse, if the captures allow one.
    pub inverse_operation: Option<OperationKind>,
    /// Document version before application.
    pub version_before: u64,
    /// Checksum before application.
    pub checksum_before: String,
    /// Document version after application.
    pub version_after: u64,
    /// Checksum after application.
    pub checksum_after: String,
    /// Application time, ms since epoch.
    pub timestamp: u64,
    /// The operation's author.
    pub user_id: String,
    /// Description, tags, importance.
    pub metadata: HistoryEntryMeta,
}

/// A deep copy of session state, restorable after divergence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Full document state at capture time.
    pub document: DocumentState,
    /// Session vector clock at capture time.
    pub vector_clock: VectorClock,
    /// History length at capture time.
    pub history_len: usize,
    /// Capture time, ms since epoch.
    pub timestamp: u64,
    /// True for timer-driven snapshots, false for user-requested ones.
    pub automatic: bool,
    /// Optional caller-supplied description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Per-user bounded undo and redo stacks.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoRedoState {
    undo: Vec<Operation>,
    redo: Vec<Operation>,
    /// Version of the document when the user last acted.
    pub current_version: u64,
}

impl UndoRedoState {
    /// Operations available to undo, oldest first.
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    /// Operations available to redo.
    pub fn redo_depth(&self) -> usize {
        self.redo.len()
    }
}

/// The per-session history store: the append-only log, per-user undo
/// state, and snapshots.
#[derive(Debug, Default)]
pub struct HistoryLog {
    nodes: Vec<HistoryNode>,
    undo_states: HashMap<String, UndoRedoState>,
    snapshots: Vec<Snapshot>,
}

impl HistoryLog {
    /// Records an applied operation. `pre` and `post` are the document
    /// states around the application; the inverse is computed here so undo
    /// never has to reconstruct it.
    pub fn record(&mut self, operation: Operation, pre: &DocumentState, post: &DocumentState) {
        let inverse_operation = transform::inverse(&operation).ok();
        let node = HistoryNode {
            version_before: pre.version,
            checksum_before: pre.checksum.clone(),
            version_after: post.version,
            checksum_after: post.checksum.clone(),
            timestamp: operation.metadata.timestamp,
            user_id: operation.user_id().to_string(),
            metadata: HistoryEntryMeta {
                description: describe(&operation.kind),
                tags: Vec::new(),
                importance: classify(&operation.kind),
            },
            inverse_operation,
            operation,
        };
        self.nodes.push(node);
    }

    /// The full log, oldest first.
    pub fn nodes(&self) -> &[HistoryNode] {
        &self.nodes
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> &[HistoryNode] {
        let start = self.nodes.len().saturating_sub(n);
        &self.nodes[start..]
    }

    /// Pushes an applied operation onto `user`'s undo stack and clears
    /// their redo stack, trimming to `cap`.
    pub fn push_undo(&mut self, user: &str, op: Operation, cap: usize) {
        let state = self.undo_states.entry(user.to_string()).or_default();
        state.current_version = op.metadata.document_version;
        state.undo.push(op);
        state.redo.clear();
        if state.undo.len() > cap {
            let excess = state.undo.len() - cap;
            state.undo.drain(..excess);
        }
    }

    /// Pops the most recent operation from `user`'s undo stack.
    pub fn pop_undo(&mut self, user: &str) -> Option<Operation> {
        self.undo_states.get_mut(user)?.undo.pop()
    }

    /// Pushes onto `user`'s redo stack, trimming to `cap`.
    pub fn push_redo(&mut self, user: &str, op: Operation, cap: usize) {
        let state = self.undo_states.entry(user.to_string()).or_default();
        state.redo.push(op);
        if state.redo.len() > cap {
            let excess = state.redo.len() - cap;
            state.redo.drain(..excess);
        }
    }

    /// Pops the most recent operation from `user`'s redo stack.
    pub fn pop_redo(&mut self, user: &str) -> Option<Operation> {
        self.undo_states.get_mut(user)?.redo.pop()
    }

    /// Re-pushes an operation onto `user`'s undo stack without touching
    /// the redo stack (the redo path).
    pub fn restore_undo(&mut self, user: &str, op: Operation) {
        self.undo_states.entry(user.to_string()).or_default().undo.push(op);
    }

    /// Undo/redo stack depths for `user`.
    pub fn undo_state(&self, user: &str) -> Option<&UndoRedoState> {
        self.undo_states.get(user)
    }

    /// Merges adjacent compressible entries in place.
    ///
    /// Only consecutive operations from the same user within
    /// [`COMPRESSION_WINDOW_MS`] merge: inserts whose ranges are
    /// contiguous, and deletes at the same position. Entries from
    /// different users never merge.
    pub fn compress(&mut self) {
        let mut compressed: Vec<HistoryNode> = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.drain(..) {
            match compressed.last_mut() {
                Some(last) if mergeable(last, &node) => {
                    *last = merge_nodes(last, &node);
                }
                _ => compressed.push(node),
            }
        }
        self.nodes = compressed;
    }

    /// Drops the oldest entries so at most `max` remain.
    pub fn truncate_front(&mut self, max: usize) {
        if self.nodes.len() > max {
            let excess = self.nodes.len() - max;
            self.nodes.drain(..excess);
        }
    }

    /// Stores a snapshot, evicting the oldest automatic one (then the
    /// oldest of any kind) past the caps.
    pub fn add_snapshot(&mut self, snapshot: Snapshot) {
        if snapshot.automatic {
            let automatic = self.snapshots.iter().filter(|s| s.automatic).count();
            if automatic >= MAX_AUTOMATIC_SNAPSHOTS
                && let Some(idx) = self.snapshots.iter().position(|s| s.automatic)
            {
                self.snapshots.remove(idx);
            }
        }
        if self.snapshots.len() >= MAX_SNAPSHOTS {
            self.snapshots.remove(0);
        }
        self.snapshots.push(snapshot);
    }

    /// All retained snapshots, oldest first.
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Most recent snapshot, if any.
    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    /// Rewinds the log to `len` entries, for snapshot restore.
    pub fn rewind_to(&mut self, len: usize) {
        self.nodes.truncate(len);
    }
}

fn mergeable(a: &HistoryNode, b: &HistoryNode) -> bool {
    if a.user_id != b.user_id || b.timestamp.saturating_sub(a.timestamp) > COMPRESSION_WINDOW_MS {
        return false;
    }
    match (&a.operation.kind, &b.operation.kind) {
        (
            OperationKind::Insert { position: pa, content: ca, .. },
            OperationKind::Insert { position: pb, .. },
        ) => pa + ca.chars().count() as u32 == *pb,
        (
            OperationKind::Delete { position: pa, .. },
            OperationKind::Delete { position: pb, .. },
        ) => pa == pb,
        _ => false,
    }
}

fn merge_nodes(a: &HistoryNode, b: &HistoryNode) -> HistoryNode {
    let kind = match (&a.operation.kind, &b.operation.kind) {
        (
            OperationKind::Insert { position, content: ca, attributes },
            OperationKind::Insert { content: cb, .. },
        ) => OperationKind::Insert {
            position: *position,
            content: format!("{ca}{cb}"),
            attributes: attributes.clone(),
        },
        (
            OperationKind::Delete { position, length: la, deleted_content: da },
            OperationKind::Delete { length: lb, deleted_content: db, .. },
        ) => OperationKind::Delete {
            position: *position,
            length: la + lb,
            deleted_content: match (da, db) {
                (Some(x), Some(y)) => Some(format!("{x}{y}")),
                _ => None,
            },
        },
        _ => unreachable!("mergeable() gates the kinds"),
    };

    let mut operation = a.operation.clone();
    operation.kind = kind;
    let inverse_operation = transform::inverse(&operation).ok();
    let mut metadata = a.metadata.clone();
    metadata.description = describe(&operation.kind);
    metadata.importance = classify(&operation.kind);
    if !metadata.tags.iter().any(|t| t == "merged") {
        metadata.tags.push("merged".to_string());
    }

    HistoryNode {
        inverse_operation,
        version_before: a.version_before,
        checksum_before: a.checksum_before.clone(),
        version_after: b.version_after,
        checksum_after: b.checksum_after.clone(),
        timestamp: a.timestamp,
        user_id: a.user_id.clone(),
        metadata,
        operation,
    }
}

fn describe(kind: &OperationKind) -> String {
    fn preview(content: &str) -> String {
        let mut p: String = content.chars().take(20).collect();
        if content.chars().count() > 20 {
            p.push('…');
        }
        p
    }
    match kind {
        OperationKind::Insert { position, content, .. } => {
            format!("Inserted '{}' at position {position}", preview(content))
        }
        OperationKind::Delete { position, length, .. } => {
            format!("Deleted {length} characters at position {position}")
        }
        OperationKind::Retain { position, length, .. } => {
            format!("Retained {length} characters at position {position}")
        }
        OperationKind::Format { position, length, .. } => {
            format!("Formatted {length} characters at position {position}")
        }
    }
}

fn classify(kind: &OperationKind) -> Importance {
    match kind.len() {
        0..=9 => Importance::Minor,
        10..=99 => Importance::Normal,
        _ => Importance::Major,
    }
}
