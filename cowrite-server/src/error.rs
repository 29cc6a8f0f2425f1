//! The closed set of engine errors.
//!
//! Pure-function failures (validation, transform, inverse) surface
//! synchronously to the per-session processor, which converts them into a
//! `SynchronizationResult` for the origin connection. Nothing in this set
//! ever tears down a session on its own.

use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong inside the collaboration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Apply or join referenced an unknown session.
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    /// Join refused because the participant limit was reached.
    #[error("session '{0}' is full")]
    SessionFull(String),

    /// The actor lacks the permission bit for the attempted action.
    #[error("permission denied: {user} cannot {action}")]
    PermissionDenied {
        /// User that attempted the action.
        user: String,
        /// Human-readable name of the refused action.
        action: &'static str,
    },

    /// The operation violated a structural constraint; never broadcast.
    #[error("operation failed validation: {0}")]
    ValidationFailed(String),

    /// Snapshot checksum did not match the snapshot content.
    #[error("snapshot checksum mismatch")]
    InvalidSnapshot,

    /// The operation lacks the captured data needed to invert it.
    /// Treated as "no undo available" rather than reported to the user.
    #[error("operation carries insufficient data to invert")]
    NonInvertible,

    /// The per-session queue is overloaded; retry after it drains.
    #[error("session '{0}' is busy")]
    SessionBusy(String),

    /// The operation sat in the queue past its deadline.
    #[error("operation timed out after {0:?}")]
    OperationTimeout(Duration),
}

impl EngineError {
    /// Short machine-readable code used in `error` wire messages.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::SessionFull(_) => "session_full",
            EngineError::PermissionDenied { .. } => "permission_denied",
            EngineError::ValidationFailed(_) => "validation_failed",
            EngineError::InvalidSnapshot => "invalid_snapshot",
            EngineError::NonInvertible => "non_invertible",
            EngineError::SessionBusy(_) => "session_busy",
            EngineError::OperationTimeout(_) => "operation_timeout",
        }
    }
}
