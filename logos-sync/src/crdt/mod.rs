//! Conflict-free replicated text document.
//!
//! ```text
//!  TextEdit ──► ReplicatedDocument::apply_local ──► Operation[] ──► outbox
//!                          │
//!  Operation[] ──► apply_remote ──► Sequence (title) / Sequence (content)
//!                                          │
//!                                          ▼
//!                                   DocumentSnapshot
//! ```
//!
//! Convergence: two replicas that have accepted the same operation set hold
//! identical sequences, regardless of arrival order or duplication.

pub mod document;
pub mod op;
pub mod sequence;
pub mod version;

pub use document::{
    DocumentSnapshot, DocumentUpdate, EditError, ReplicatedDocument, SubscriptionId, TextEdit,
    UpdateOrigin,
};
pub use op::{Anchor, Field, MalformedOp, OpId, OpKind, Operation, ReplicaId, MAX_CLOCK};
pub use sequence::Sequence;
pub use version::VersionSummary;
