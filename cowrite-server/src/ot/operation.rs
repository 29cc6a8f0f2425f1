//! The four-way operation sum type and its metadata.

use serde::{Deserialize, Serialize};

use crate::ot::attrs::Attributes;
use crate::ot::clock::VectorClock;
use crate::util;

/// Longest content an insert may carry, in characters.
pub const MAX_CONTENT_LENGTH: usize = 50_000;
/// Largest serialized operation accepted, in bytes.
pub const MAX_OPERATION_SIZE: usize = 10_000;
/// Content length above which validation emits a warning.
pub const CONTENT_WARNING_LENGTH: usize = 1_000;

/// A sparse map of character index to attributes. Document formatting keys
/// by absolute position; a format's captured `old_attributes` keys by
/// offset from the operation's position, so transforms that move the
/// operation keep the span aligned.
pub type FormatSpan = std::collections::BTreeMap<u32, Attributes>;

/// An atomic document mutation. Positions and lengths are in characters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    /// Insert `content` at `position`.
    #[serde(rename_all = "camelCase")]
    Insert {
        position: u32,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    /// Delete `length` characters starting at `position`. `deleted_content`
    /// is captured by the applier so the operation can be inverted.
    #[serde(rename_all = "camelCase")]
    Delete {
        position: u32,
        length: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        deleted_content: Option<String>,
    },
    /// No content change; may overlay attributes on the range.
    #[serde(rename_all = "camelCase")]
    Retain {
        position: u32,
        length: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    /// Overlay `attributes` on the range. `old_attributes` is captured by
    /// the applier; an attribute-less format carrying a captured span rolls
    /// the span back exactly (this is how format undo works).
    #[serde(rename_all = "camelCase")]
    Format {
        position: u32,
        length: u32,
        attributes: Attributes,
        #[serde(skip_serializing_if = "Option::is_none")]
        old_attributes: Option<FormatSpan>,
    },
}

impl OperationKind {
    /// Start position of the operation.
    pub fn position(&self) -> u32 {
        match self {
            OperationKind::Insert { position, .. }
            | OperationKind::Delete { position, .. }
            | OperationKind::Retain { position, .. }
            | OperationKind::Format { position, .. } => *position,
        }
    }

    /// Length of the affected range: content length for inserts, the range
    /// length otherwise.
    pub fn len(&self) -> u32 {
        match self {
            OperationKind::Insert { content, .. } => content.chars().count() as u32,
            OperationKind::Delete { length, .. }
            | OperationKind::Retain { length, .. }
            | OperationKind::Format { length, .. } => *length,
        }
    }

    /// One-past-the-end of the affected range.
    pub fn end(&self) -> u32 {
        match self {
            OperationKind::Insert { position, .. } => *position,
            _ => self.position() + self.len(),
        }
    }

    /// True for ranged operations transformed to cover nothing.
    pub fn is_collapsed(&self) -> bool {
        match self {
            OperationKind::Insert { content, .. } => content.is_empty(),
            _ => self.len() == 0,
        }
    }
}

/// Metadata stamped on every operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    /// Unique opaque identifier.
    pub operation_id: String,
    /// Author of the operation.
    pub user_id: String,
    /// Session the operation belongs to.
    pub session_id: String,
    /// Milliseconds since epoch at creation.
    pub timestamp: u64,
    /// Causal history at creation; stamped by the session on apply.
    #[serde(default)]
    pub vector_clock: VectorClock,
    /// Document version the operation was produced against.
    pub document_version: u64,
    /// Linkage for undo and merged operations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_operation_id: Option<String>,
}

impl OperationMetadata {
    /// Fresh metadata for a server-generated operation.
    pub fn generated(user_id: &str, session_id: &str, document_version: u64) -> Self {
        Self {
            operation_id: util::operation_id(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            timestamp: util::now_millis(),
            vector_clock: VectorClock::default(),
            document_version,
            parent_operation_id: None,
        }
    }
}

/// An operation plus its metadata; the unit that flows through the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// The mutation itself.
    #[serde(flatten)]
    pub kind: OperationKind,
    /// Authorship, causality, and versioning.
    pub metadata: OperationMetadata,
}

impl Operation {
    /// Convenience constructor.
    pub fn new(kind: OperationKind, metadata: OperationMetadata) -> Self {
        Self { kind, metadata }
    }

    /// The operation's unique ID.
    pub fn id(&self) -> &str {
        &self.metadata.operation_id
    }

    /// The operation's author.
    pub fn user_id(&self) -> &str {
        &self.metadata.user_id
    }
}

/// Severity of a single validation finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// The operation must be rejected.
    Error,
    /// The operation is accepted but noteworthy.
    Warning,
}

/// One validation finding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Whether the finding rejects the operation.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
}

/// Structured result of validating one operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Findings, errors first is not guaranteed.
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    fn error(&mut self, message: impl Into<String>) {
        self.findings.push(Finding {
            severity: Severity::Error,
            message: message.into(),
        });
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.findings.push(Finding {
            severity: Severity::Warning,
            message: message.into(),
        });
    }

    /// True when no error-severity finding exists.
    pub fn is_valid(&self) -> bool {
        self.findings.iter().all(|f| f.severity != Severity::Error)
    }

    /// Concatenated error messages, for `ValidationFailed`.
    pub fn error_summary(&self) -> String {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .map(|f| f.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validates the structure of an operation before it reaches the kernel.
///
/// Positions are `u32` on the wire, so negative positions are rejected at
/// deserialization; the structural checks here cover everything else the
/// kernel assumes.
pub fn validate(op: &Operation) -> ValidationReport {
    let mut report = ValidationReport::default();

    if op.metadata.operation_id.is_empty() {
        report.error("missing operationId");
    }
    if op.metadata.user_id.is_empty() {
        report.error("missing userId");
    }
    if op.metadata.document_version == 0 {
        report.error("documentVersion must be at least 1");
    }

    match &op.kind {
        OperationKind::Insert { content, .. } => {
            let chars = content.chars().count();
            if content.is_empty() {
                report.error("insert with empty content");
            } else if chars > MAX_CONTENT_LENGTH {
                report.error(format!(
                    "content length {chars} exceeds maximum {MAX_CONTENT_LENGTH}"
                ));
            } else if chars > CONTENT_WARNING_LENGTH {
                report.warning(format!("large insert of {chars} characters"));
            }
        }
        OperationKind::Delete { length, .. } => {
            if *length == 0 {
                report.error("delete with zero length");
            }
        }
        OperationKind::Retain { length, .. } => {
            if *length == 0 {
                report.error("retain with zero length");
            }
        }
        OperationKind::Format {
            length,
            attributes,
            old_attributes,
            ..
        } => {
            if *length == 0 {
                report.error("format with zero length");
            }
            if attributes.is_empty() && old_attributes.is_none() {
                report.error("format with no attributes");
            }
            if let Some(heading) = attributes.heading
                && !(1..=6).contains(&heading)
            {
                report.error(format!("heading level {heading} out of range 1..=6"));
            }
        }
    }

    match serde_json::to_vec(op) {
        Ok(bytes) if bytes.len() > MAX_OPERATION_SIZE => {
            report.error(format!(
                "serialized operation is {} bytes, maximum is {MAX_OPERATION_SIZE}",
                bytes.len()
            ));
        }
        Ok(_) => {}
        Err(e) => report.error(format!("operation failed to serialize: {e}")),
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(user: &str) -> OperationMetadata {
        OperationMetadata {
            operation_id: util::operation_id(),
            user_id: user.to_string(),
            session_id: "s1".to_string(),
            timestamp: 1,
            vector_clock: VectorClock::default(),
            document_version: 1,
            parent_operation_id: None,
        }
    }

    fn insert(position: u32, content: &str) -> Operation {
        Operation::new(
            OperationKind::Insert {
                position,
                content: content.to_string(),
                attributes: None,
            },
            meta("alice"),
        )
    }

    #[test]
    fn wire_form_is_tagged_camel_case() {
        let op = insert(3, "hi");
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "insert");
        assert_eq!(value["position"], 3);
        assert_eq!(value["content"], "hi");
        assert_eq!(value["metadata"]["userId"], "alice");
        assert_eq!(value["metadata"]["documentVersion"], 1);
    }

    #[test]
    fn round_trips_through_json() {
        let op = Operation::new(
            OperationKind::Delete {
                position: 4,
                length: 2,
                deleted_content: Some("ab".to_string()),
            },
            meta("bob"),
        );
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(serde_json::from_str::<Operation>(&json).unwrap(), op);
    }

    /// P5: the documented rejection set.
    #[test]
    fn validate_rejects_structural_violations() {
        let mut op = insert(0, "x");
        op.metadata.operation_id = String::new();
        assert!(!validate(&op).is_valid());

        let mut op = insert(0, "x");
        op.metadata.user_id = String::new();
        assert!(!validate(&op).is_valid());

        let op = Operation::new(
            OperationKind::Delete {
                position: 0,
                length: 0,
                deleted_content: None,
            },
            meta("alice"),
        );
        assert!(!validate(&op).is_valid());

        let op = insert(0, &"x".repeat(MAX_CONTENT_LENGTH + 1));
        assert!(!validate(&op).is_valid());
    }

    #[test]
    fn validate_warns_on_large_content() {
        let report = validate(&insert(0, &"y".repeat(CONTENT_WARNING_LENGTH + 1)));
        assert!(report.is_valid());
        assert!(report.findings.iter().any(|f| f.severity == Severity::Warning));
    }

    #[test]
    fn validate_accepts_normal_operations() {
        assert!(validate(&insert(10, "hello")).is_valid());
        let format = Operation::new(
            OperationKind::Format {
                position: 0,
                length: 5,
                attributes: Attributes {
                    bold: Some(true),
                    ..Default::default()
                },
                old_attributes: None,
            },
            meta("alice"),
        );
        assert!(validate(&format).is_valid());
    }

    #[test]
    fn validate_rejects_oversized_serialized_ops() {
        // Characters below the content cap can still blow the byte cap once
        // serialized (four bytes per emoji).
        let op = insert(0, &"\u{1F600}".repeat(3_000));
        assert!(!validate(&op).is_valid());
    }

    #[test]
    fn len_counts_characters_not_bytes() {
        let op = insert(0, "héllo");
        assert_eq!(op.kind.len(), 5);
    }
}
