//! The operational-transformation core: operations, vector clocks, the
//! transform kernel, and conflict resolution. Everything in this tree is
//! pure, non-suspending computation.

pub mod attrs;
pub mod clock;
pub mod document;
pub mod operation;
pub mod resolve;
pub mod transform;

pub use attrs::Attributes;
pub use clock::{Causality, VectorClock};
pub use document::{ContentKind, DocumentMetadata, DocumentPermissions, DocumentState};
pub use operation::{Operation, OperationKind, OperationMetadata, ValidationReport, validate};
pub use transform::{ConflictKind, TransformCache, Transformed, apply, inverse, transform, transform_against, transform_index};
