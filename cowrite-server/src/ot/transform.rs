//! The operational-transform kernel.
//!
//! Everything here is pure computation: pairwise transformation of
//! concurrent operations, application of an operation to a document,
//! inverse generation, and cursor index rebasing. The session layer is
//! responsible for ordering; the kernel only guarantees that for the
//! convergent operation pairs, applying `a` then `b'` equals applying `b`
//! then `a'`.

use std::cmp::{max, min};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::ot::clock::Causality;
use crate::ot::document::DocumentState;
use crate::ot::operation::{FormatSpan, Operation, OperationKind, OperationMetadata};
use crate::util;

/// Semantic collision left over after transformation. The conflict
/// resolver turns these into a recorded [`ConflictResolution`].
///
/// [`ConflictResolution`]: crate::ot::resolve::ConflictResolution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Concurrent inserts at the same position.
    PositionCollision,
    /// An insert landed strictly inside a concurrent delete's range.
    DeletionConflict,
    /// Two deletes covering overlapping ranges.
    DeletionOverlap,
    /// Two formats covering overlapping ranges.
    FormatOverlap,
}

/// Result of transforming a pair of concurrent operations.
#[derive(Clone, Debug, PartialEq)]
pub struct Transformed {
    /// `a` rebased to apply after `b`.
    pub a: Operation,
    /// `b` rebased to apply after `a`.
    pub b: Operation,
    /// Collisions the transformation could not dissolve.
    pub conflicts: Vec<ConflictKind>,
}

/// Whether `a` takes priority over `b` when both touch the same spot.
///
/// Causal predecessors win outright; concurrent operations fall back to
/// timestamp, then user ID, then operation ID, all ascending, so every
/// replica picks the same winner.
pub fn has_priority(a: &OperationMetadata, b: &OperationMetadata) -> bool {
    match a.vector_clock.compare(&b.vector_clock) {
        Causality::Before => true,
        Causality::After => false,
        Causality::Concurrent | Causality::Equal => {
            if a.timestamp != b.timestamp {
                a.timestamp < b.timestamp
            } else if a.user_id != b.user_id {
                a.user_id < b.user_id
            } else {
                a.operation_id < b.operation_id
            }
        }
    }
}

fn set_position(kind: &mut OperationKind, value: u32) {
    match kind {
        OperationKind::Insert { position, .. }
        | OperationKind::Delete { position, .. }
        | OperationKind::Retain { position, .. }
        | OperationKind::Format { position, .. } => *position = value,
    }
}

fn set_length(kind: &mut OperationKind, value: u32) {
    match kind {
        OperationKind::Delete { length, .. }
        | OperationKind::Retain { length, .. }
        | OperationKind::Format { length, .. } => *length = value,
        OperationKind::Insert { .. } => {}
    }
}

/// New `(position, length)` for a range once an insert lands.
fn range_after_insert(pos: u32, len: u32, ins_pos: u32, ins_len: u32) -> (u32, u32) {
    if ins_pos <= pos {
        (pos + ins_len, len)
    } else if ins_pos < pos + len {
        (pos, len + ins_len)
    } else {
        (pos, len)
    }
}

/// New `(position, length)` for a range once a delete lands.
fn range_after_delete(pos: u32, len: u32, del_pos: u32, del_len: u32) -> (u32, u32) {
    let del_end = del_pos + del_len;
    let end = pos + len;
    let overlap = min(end, del_end).saturating_sub(max(pos, del_pos));
    let new_pos = if pos >= del_end {
        pos - del_len
    } else if pos >= del_pos {
        del_pos
    } else {
        pos
    };
    (new_pos, len - overlap)
}

/// Transforms two operations produced against the same base document, so
/// that applying `a` then `b'` is equivalent to applying `b` then `a'`.
pub fn transform(a: &Operation, b: &Operation) -> Transformed {
    let mut out = Transformed {
        a: a.clone(),
        b: b.clone(),
        conflicts: Vec::new(),
    };

    match (&a.kind, &b.kind) {
        (
            OperationKind::Insert { position: pa, content: ca, .. },
            OperationKind::Insert { position: pb, content: cb, .. },
        ) => {
            let (la, lb) = (ca.chars().count() as u32, cb.chars().count() as u32);
            if pa < pb {
                set_position(&mut out.b.kind, pb + la);
            } else if pa > pb {
                set_position(&mut out.a.kind, pa + lb);
            } else if has_priority(&a.metadata, &b.metadata) {
                set_position(&mut out.b.kind, pb + la);
                out.conflicts.push(ConflictKind::PositionCollision);
            } else {
                set_position(&mut out.a.kind, pa + lb);
                out.conflicts.push(ConflictKind::PositionCollision);
            }
        }

        (OperationKind::Insert { .. }, OperationKind::Delete { .. }) => {
            insert_vs_delete(&mut out.a, &mut out.b, &mut out.conflicts);
        }
        (OperationKind::Delete { .. }, OperationKind::Insert { .. }) => {
            insert_vs_delete(&mut out.b, &mut out.a, &mut out.conflicts);
        }

        (
            OperationKind::Delete { position: pa, length: la, .. },
            OperationKind::Delete { position: pb, length: lb, .. },
        ) => {
            let (ea, eb) = (pa + la, pb + lb);
            if ea <= *pb {
                set_position(&mut out.b.kind, pb - la);
            } else if eb <= *pa {
                set_position(&mut out.a.kind, pa - lb);
            } else {
                // Overlapping ranges: each side deletes what the other
                // left of the union. A fully-covered delete collapses to
                // zero length and is marked not-applied downstream.
                let start = min(*pa, *pb);
                let union = max(ea, eb) - start;
                set_position(&mut out.a.kind, start);
                set_length(&mut out.a.kind, union.saturating_sub(*lb));
                clear_captured(&mut out.a.kind);
                set_position(&mut out.b.kind, start);
                set_length(&mut out.b.kind, union.saturating_sub(*la));
                clear_captured(&mut out.b.kind);
                out.conflicts.push(ConflictKind::DeletionOverlap);
            }
        }

        (
            OperationKind::Format { position: pa, length: la, attributes: aa, .. },
            OperationKind::Format { position: pb, length: lb, attributes: ab, .. },
        ) => {
            let overlaps = *pa < pb + lb && *pb < pa + la;
            if overlaps {
                let a_wins = has_priority(&a.metadata, &b.metadata);
                let merged_a = aa.union_with(ab, a_wins);
                let merged_b = ab.union_with(aa, !a_wins);
                if let OperationKind::Format { attributes, .. } = &mut out.a.kind {
                    *attributes = merged_a;
                }
                if let OperationKind::Format { attributes, .. } = &mut out.b.kind {
                    *attributes = merged_b;
                }
                out.conflicts.push(ConflictKind::FormatOverlap);
            }
        }

        // A ranged no-content operation against an insert or delete only
        // shifts; an insert or delete is never moved by a format/retain.
        (OperationKind::Retain { .. } | OperationKind::Format { .. }, OperationKind::Insert { .. }) => {
            shift_ranged(&mut out.a.kind, &b.kind);
        }
        (OperationKind::Insert { .. }, OperationKind::Retain { .. } | OperationKind::Format { .. }) => {
            shift_ranged(&mut out.b.kind, &a.kind);
        }
        (OperationKind::Retain { .. } | OperationKind::Format { .. }, OperationKind::Delete { .. }) => {
            shift_ranged(&mut out.a.kind, &b.kind);
        }
        (OperationKind::Delete { .. }, OperationKind::Retain { .. } | OperationKind::Format { .. }) => {
            shift_ranged(&mut out.b.kind, &a.kind);
        }

        // Retain/format pairs that change no content leave each other be.
        (
            OperationKind::Retain { .. } | OperationKind::Format { .. },
            OperationKind::Retain { .. } | OperationKind::Format { .. },
        ) => {}
    }

    out
}

/// Insert (`i`) against delete (`d`), mutating both to their rebased form.
fn insert_vs_delete(i: &mut Operation, d: &mut Operation, conflicts: &mut Vec<ConflictKind>) {
    let (OperationKind::Insert { position: ip, content, .. }, OperationKind::Delete { position: dp, length: dl, .. }) =
        (&i.kind, &d.kind)
    else {
        unreachable!("callers match the kinds");
    };
    let (ip, dp, dl) = (*ip, *dp, *dl);
    let ilen = content.chars().count() as u32;

    if ip <= dp {
        set_position(&mut d.kind, dp + ilen);
    } else if ip >= dp + dl {
        set_position(&mut i.kind, ip - dl);
    } else {
        // The insert landed strictly inside the deleted range: snap it to
        // the delete's start and keep it; the delete rebased over the
        // insert grows to cover the widened range.
        set_position(&mut i.kind, dp);
        set_length(&mut d.kind, dl + ilen);
        clear_captured(&mut d.kind);
        conflicts.push(ConflictKind::DeletionConflict);
    }
}

fn shift_ranged(ranged: &mut OperationKind, other: &OperationKind) {
    let (pos, len) = (ranged.position(), ranged.len());
    let (new_pos, new_len) = match other {
        OperationKind::Insert { position, content, .. } => {
            range_after_insert(pos, len, *position, content.chars().count() as u32)
        }
        OperationKind::Delete { position, length, .. } => {
            range_after_delete(pos, len, *position, *length)
        }
        _ => (pos, len),
    };
    set_position(ranged, new_pos);
    set_length(ranged, new_len);
}

fn clear_captured(kind: &mut OperationKind) {
    if let OperationKind::Delete { deleted_content, .. } = kind {
        // The range changed; the capture no longer matches and the applier
        // must re-capture for invertibility.
        *deleted_content = None;
    }
}

/// Folds [`transform`] over `others`, rebasing `op` across each in turn.
pub fn transform_against<'a>(
    op: &Operation,
    others: impl IntoIterator<Item = &'a Operation>,
) -> (Operation, Vec<ConflictKind>) {
    let mut rebased = op.clone();
    let mut conflicts = Vec::new();
    for other in others {
        let t = transform(&rebased, other);
        rebased = t.a;
        conflicts.extend(t.conflicts);
    }
    (rebased, conflicts)
}

/// Applies `op` to `doc`, returning the new state and the operation
/// enriched with the captures (`deletedContent`, `oldAttributes`, clamped
/// ranges) that make it replayable and invertible.
pub fn apply(op: &Operation, doc: &DocumentState) -> (DocumentState, Operation) {
    let mut doc = doc.clone();
    let mut op = op.clone();
    let char_len = doc.char_len();

    match &mut op.kind {
        OperationKind::Insert { position, content, attributes } => {
            let pos = (*position).min(char_len);
            *position = pos;
            let offset = doc.byte_offset(pos);
            doc.content.insert_str(offset, content);
            let ilen = content.chars().count() as u32;
            shift_formatting_for_insert(&mut doc.formatting, pos, ilen);
            if let Some(attrs) = attributes {
                for i in 0..ilen {
                    doc.formatting.insert(pos + i, attrs.clone());
                }
            }
            doc.rehash();
        }
        OperationKind::Delete { position, length, deleted_content } => {
            let pos = (*position).min(char_len);
            let effective = (*length).min(char_len - pos);
            *position = pos;
            *length = effective;
            let start = doc.byte_offset(pos);
            let end = doc.byte_offset(pos + effective);
            *deleted_content = Some(doc.content[start..end].to_string());
            doc.content.replace_range(start..end, "");
            shift_formatting_for_delete(&mut doc.formatting, pos, effective);
            doc.rehash();
        }
        OperationKind::Retain { position, length, attributes } => {
            let pos = (*position).min(char_len);
            let effective = (*length).min(char_len - pos);
            if let Some(attrs) = attributes
                && !attrs.is_empty()
            {
                for i in 0..effective {
                    doc.formatting.entry(pos + i).or_default().merge(attrs);
                }
            }
        }
        OperationKind::Format { position, length, attributes, old_attributes } => {
            let pos = (*position).min(char_len);
            let effective = (*length).min(char_len - pos);
            *position = pos;
            *length = effective;
            if attributes.is_empty() && old_attributes.is_some() {
                // Rollback form produced by `inverse`: restore the span
                // exactly, removing entries that did not exist before.
                for (offset, old) in old_attributes.as_ref().into_iter().flatten() {
                    let at = pos + offset;
                    if old.is_empty() {
                        doc.formatting.remove(&at);
                    } else {
                        doc.formatting.insert(at, old.clone());
                    }
                }
            } else {
                let mut captured = FormatSpan::new();
                for offset in 0..effective {
                    let at = pos + offset;
                    captured.insert(offset, doc.formatting.get(&at).cloned().unwrap_or_default());
                    doc.formatting.entry(at).or_default().merge(attributes);
                }
                *old_attributes = Some(captured);
            }
        }
    }

    doc.version += 1;
    doc.last_modified = util::now_millis();
    doc.metadata.collaborators.insert(op.metadata.user_id.clone());
    (doc, op)
}

fn shift_formatting_for_insert(formatting: &mut FormatSpan, pos: u32, len: u32) {
    let tail: Vec<_> = formatting.split_off(&pos).into_iter().collect();
    for (key, value) in tail {
        formatting.insert(key + len, value);
    }
}

fn shift_formatting_for_delete(formatting: &mut FormatSpan, pos: u32, len: u32) {
    let tail: Vec<_> = formatting.split_off(&pos).into_iter().collect();
    for (key, value) in tail {
        if key >= pos + len {
            formatting.insert(key - len, value);
        }
    }
}

/// Computes the inverse of an applied (capture-enriched) operation.
///
/// Applied to the post-state, the inverse restores the pre-state. Fails
/// with [`EngineError::NonInvertible`] when the operation never captured
/// the data required (a delete without its content, a format without its
/// prior attributes, a retain that changed attributes).
pub fn inverse(op: &Operation) -> Result<OperationKind, EngineError> {
    match &op.kind {
        OperationKind::Insert { position, content, .. } => Ok(OperationKind::Delete {
            position: *position,
            length: content.chars().count() as u32,
            deleted_content: Some(content.clone()),
        }),
        OperationKind::Delete { position, deleted_content, .. } => {
            let content = deleted_content.clone().ok_or(EngineError::NonInvertible)?;
            Ok(OperationKind::Insert {
                position: *position,
                content,
                attributes: None,
            })
        }
        OperationKind::Retain { position, length, attributes } => {
            if attributes.as_ref().is_some_and(|a| !a.is_empty()) {
                Err(EngineError::NonInvertible)
            } else {
                Ok(OperationKind::Retain {
                    position: *position,
                    length: *length,
                    attributes: None,
                })
            }
        }
        OperationKind::Format { position, length, old_attributes, .. } => {
            let span = old_attributes.clone().ok_or(EngineError::NonInvertible)?;
            Ok(OperationKind::Format {
                position: *position,
                length: *length,
                attributes: Default::default(),
                old_attributes: Some(span),
            })
        }
    }
}

/// Rebases a cursor or selection index across an applied operation.
pub fn transform_index(op: &OperationKind, index: u32) -> u32 {
    match op {
        OperationKind::Insert { position, content, .. } => {
            if index >= *position {
                index + content.chars().count() as u32
            } else {
                index
            }
        }
        OperationKind::Delete { position, length, .. } => {
            if index <= *position {
                index
            } else if index >= position + length {
                index - length
            } else {
                *position
            }
        }
        OperationKind::Retain { .. } | OperationKind::Format { .. } => index,
    }
}

/// Advisory cache of pairwise transforms, shared across sessions.
///
/// Keyed by the two operation IDs. Purely an optimization; eviction or a
/// miss never affects correctness.
#[derive(Debug, Default)]
pub struct TransformCache {
    entries: DashMap<(String, String), Transformed>,
}

impl TransformCache {
    /// Maximum retained entries; the cache is cleared wholesale beyond it.
    const CAPACITY: usize = 4_096;

    /// [`transform`], memoized by operation ID pair.
    pub fn transform(&self, a: &Operation, b: &Operation) -> Transformed {
        let key = (a.id().to_string(), b.id().to_string());
        if let Some(hit) = self.entries.get(&key) {
            return hit.value().clone();
        }
        let computed = transform(a, b);
        if self.entries.len() >= Self::CAPACITY {
            self.entries.clear();
        }
        self.entries.insert(key, computed.clone());
        computed
    }

    /// Current number of memoized pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
