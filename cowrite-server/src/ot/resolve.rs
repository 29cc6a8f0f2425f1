//! Strategy-selectable resolution of semantically colliding operations.
//!
//! The kernel's transform already decides what gets applied; this module
//! turns the leftover conflict annotations into a recorded
//! [`ConflictResolution`] — which operation a given strategy favors, what
//! the alternatives were, and how confident the strategy is — so sessions
//! can report, audit, and escalate.

use std::cmp::{max, min};
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ot::attrs::Attributes;
use crate::ot::document::ContentKind;
use crate::ot::operation::{Operation, OperationKind};
use crate::ot::transform::ConflictKind;
use crate::session::Role;
use crate::util;

/// How a conflict between two operations is settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// The second operand (the incoming client edit) wins.
    ClientWins,
    /// The first operand (the already-applied edit) wins.
    ServerWins,
    /// Attempt an intelligent merge of both effects.
    Merge,
    /// The operand with the earlier timestamp wins.
    TimestampPriority,
    /// The operand authored by the higher role wins.
    UserPriority,
    /// Escalate to a human; the resolution is a placeholder.
    Interactive,
    /// Dispatch on the document's content type.
    ContentAware,
}

/// Tokens whose presence marks an edit as structural for code documents.
const STRUCTURAL_TOKENS: [&str; 9] = [
    "function", "class", "interface", "import", "export", "{", "}", "(", ")",
];

/// One conflict to resolve: the already-applied operation, the incoming
/// one, the kernel's annotations, and enough context for the strategies.
#[derive(Clone, Debug)]
pub struct ResolutionRequest<'a> {
    /// The operation already applied on the server.
    pub first: &'a Operation,
    /// The incoming operation that collided with it.
    pub second: &'a Operation,
    /// The kernel's conflict annotations.
    pub kinds: &'a [ConflictKind],
    /// Role of the first operation's author.
    pub first_role: Role,
    /// Role of the second operation's author.
    pub second_role: Role,
    /// Content type of the document.
    pub content: ContentKind,
}

/// The outcome of resolving one conflict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    /// Opaque identifier, referenced by `conflict_notification` messages.
    pub conflict_id: String,
    /// The strategy that produced this resolution.
    pub strategy: ResolutionStrategy,
    /// The operation the strategy favors.
    pub resolved: Operation,
    /// The operations the strategy passed over.
    pub alternatives: Vec<Operation>,
    /// Confidence in the outcome, 0 to 1.
    pub confidence: f64,
    /// True when a human should review (interactive escalation).
    pub requires_review: bool,
    /// The annotations that triggered resolution.
    pub kinds: Vec<ConflictKind>,
}

/// Picks a strategy when the session has none configured.
pub fn select_strategy(req: &ResolutionRequest<'_>) -> ResolutionStrategy {
    use crate::ot::clock::Causality;

    let both_formats = matches!(req.first.kind, OperationKind::Format { .. })
        && matches!(req.second.kind, OperationKind::Format { .. });
    if both_formats {
        return ResolutionStrategy::Merge;
    }
    if req.kinds.contains(&ConflictKind::PositionCollision) {
        return ResolutionStrategy::TimestampPriority;
    }
    if req.kinds.contains(&ConflictKind::DeletionConflict)
        || req.kinds.contains(&ConflictKind::DeletionOverlap)
    {
        return if req.content == ContentKind::Code {
            ResolutionStrategy::Interactive
        } else {
            ResolutionStrategy::Merge
        };
    }
    if req.first.metadata.vector_clock.compare(&req.second.metadata.vector_clock)
        == Causality::Concurrent
    {
        return ResolutionStrategy::UserPriority;
    }
    ResolutionStrategy::Merge
}

/// Resolves a conflict under `strategy`.
pub fn resolve(strategy: ResolutionStrategy, req: &ResolutionRequest<'_>) -> ConflictResolution {
    match strategy {
        ResolutionStrategy::ClientWins => pick(strategy, req, false, 0.8),
        ResolutionStrategy::ServerWins => pick(strategy, req, true, 0.8),
        ResolutionStrategy::Merge => merge(req),
        ResolutionStrategy::TimestampPriority => {
            pick(strategy, req, first_is_earlier(req), 0.9)
        }
        ResolutionStrategy::UserPriority => {
            let first_wins = if req.first_role.weight() != req.second_role.weight() {
                req.first_role.weight() > req.second_role.weight()
            } else {
                first_is_earlier(req)
            };
            pick(strategy, req, first_wins, 0.85)
        }
        ResolutionStrategy::Interactive => ConflictResolution {
            conflict_id: util::conflict_id(),
            strategy,
            // Placeholder until a human decides; the applied state is
            // whatever the kernel produced.
            resolved: req.first.clone(),
            alternatives: vec![req.second.clone()],
            confidence: 0.0,
            requires_review: true,
            kinds: req.kinds.to_vec(),
        },
        ResolutionStrategy::ContentAware => content_aware(req),
    }
}

fn first_is_earlier(req: &ResolutionRequest<'_>) -> bool {
    req.first.metadata.timestamp <= req.second.metadata.timestamp
}

fn pick(
    strategy: ResolutionStrategy,
    req: &ResolutionRequest<'_>,
    first_wins: bool,
    confidence: f64,
) -> ConflictResolution {
    let (winner, loser) = if first_wins {
        (req.first, req.second)
    } else {
        (req.second, req.first)
    };
    ConflictResolution {
        conflict_id: util::conflict_id(),
        strategy,
        resolved: winner.clone(),
        alternatives: vec![loser.clone()],
        confidence,
        requires_review: false,
        kinds: req.kinds.to_vec(),
    }
}

fn content_aware(req: &ResolutionRequest<'_>) -> ConflictResolution {
    match req.content {
        ContentKind::Code if is_structural(req.first) || is_structural(req.second) => {
            resolve(ResolutionStrategy::Interactive, req)
        }
        // Markdown, rich text, plain text, and non-structural code all
        // merge; rich text additionally falls back to timestamps, which
        // merge's mixed-type rule already does.
        _ => merge(req),
    }
}

/// Scans an operation's content for code-structure tokens.
fn is_structural(op: &Operation) -> bool {
    let text = match &op.kind {
        OperationKind::Insert { content, .. } => Some(content.as_str()),
        OperationKind::Delete { deleted_content, .. } => deleted_content.as_deref(),
        _ => None,
    };
    text.is_some_and(|t| STRUCTURAL_TOKENS.iter().any(|token| t.contains(token)))
}

/// The intelligent-merge sub-rules.
fn merge(req: &ResolutionRequest<'_>) -> ConflictResolution {
    let (a, b) = (req.first, req.second);
    let merged_kind = match (&a.kind, &b.kind) {
        (
            OperationKind::Format { position: pa, length: la, attributes: aa, .. },
            OperationKind::Format { position: pb, length: lb, attributes: ab, .. },
        ) if pa < &(pb + lb) && pb < &(pa + la) => {
            let start = min(*pa, *pb);
            let end = max(pa + la, pb + lb);
            // Later timestamp supplies contested non-boolean values.
            let later_is_a = a.metadata.timestamp > b.metadata.timestamp;
            let attributes = aa.union_with(ab, later_is_a);
            Some((
                OperationKind::Format {
                    position: start,
                    length: end - start,
                    attributes,
                    old_attributes: None,
                },
                0.95,
            ))
        }
        (
            OperationKind::Insert { position: pa, content: ca, attributes: aa },
            OperationKind::Insert { position: pb, content: cb, attributes: ab },
        ) if pa == pb => {
            let (earlier, later) = if first_is_earlier(req) { (ca, cb) } else { (cb, ca) };
            let attributes = match (aa, ab) {
                (None, None) => None,
                (Some(x), None) | (None, Some(x)) => Some(x.clone()),
                (Some(x), Some(y)) => {
                    let mut merged = x.clone();
                    merged.merge(y);
                    Some(merged)
                }
            };
            Some((
                OperationKind::Insert {
                    position: *pa,
                    content: format!("{earlier}{later}"),
                    attributes,
                },
                0.9,
            ))
        }
        (
            OperationKind::Delete { position: pa, length: la, deleted_content: da },
            OperationKind::Delete { position: pb, length: lb, deleted_content: db },
        ) if pa < &(pb + lb) && pb < &(pa + la) => {
            let start = min(*pa, *pb);
            let end = max(pa + la, pb + lb);
            let deleted = match (da, db) {
                (None, None) => None,
                (Some(x), None) | (None, Some(x)) => Some(x.clone()),
                (Some(x), Some(y)) => Some(format!("{x}{y}")),
            };
            Some((
                OperationKind::Delete {
                    position: start,
                    length: end - start,
                    deleted_content: deleted,
                },
                0.95,
            ))
        }
        _ => None,
    };

    match merged_kind {
        Some((kind, confidence)) => {
            let mut resolved = a.clone();
            resolved.kind = kind;
            resolved.metadata.operation_id = util::operation_id();
            resolved.metadata.parent_operation_id = Some(a.id().to_string());
            ConflictResolution {
                conflict_id: util::conflict_id(),
                strategy: ResolutionStrategy::Merge,
                resolved,
                alternatives: vec![a.clone(), b.clone()],
                confidence,
                requires_review: false,
                kinds: req.kinds.to_vec(),
            }
        }
        // Mixed types defer to timestamp priority.
        None => {
            let mut resolution = pick(
                ResolutionStrategy::TimestampPriority,
                req,
                first_is_earlier(req),
                0.9,
            );
            resolution.strategy = ResolutionStrategy::Merge;
            resolution
        }
    }
}

/// Aggregated statistics over a session's resolutions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionStats {
    /// Resolutions recorded.
    pub total: u64,
    /// Count per strategy.
    pub by_strategy: HashMap<ResolutionStrategy, u64>,
    /// Mean confidence across all resolutions.
    pub average_confidence: f64,
    /// How many resolutions escalated to interactive review.
    pub escalations: u64,
}

/// Per-session record of every resolution, for statistics and audit.
#[derive(Debug, Default)]
pub struct ResolutionLog {
    resolutions: Vec<ConflictResolution>,
}

impl ResolutionLog {
    /// Appends a resolution.
    pub fn record(&mut self, resolution: ConflictResolution) {
        self.resolutions.push(resolution);
    }

    /// All recorded resolutions, oldest first.
    pub fn entries(&self) -> &[ConflictResolution] {
        &self.resolutions
    }

    /// Aggregates counts, confidence, and escalations.
    pub fn stats(&self) -> ResolutionStats {
        let mut stats = ResolutionStats {
            total: self.resolutions.len() as u64,
            ..Default::default()
        };
        let mut confidence_sum = 0.0;
        for resolution in &self.resolutions {
            *stats.by_strategy.entry(resolution.strategy).or_insert(0) += 1;
            confidence_sum += resolution.confidence;
            if resolution.requires_review {
                stats.escalations += 1;
            }
        }
        if stats.total > 0 {
            stats.average_confidence = confidence_sum / stats.total as f64;
        }
        stats
    }
}
