//! Operation identity and the operation record exchanged between replicas.
//!
//! Every character ever typed into a field is one `Insert` operation and
//! every removal is one `Delete` operation. Operations are immutable and are
//! identified by an [`OpId`] that totally orders them across replicas.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifies one replica (one open session on one document).
pub type ReplicaId = Uuid;

/// Largest clock or sequence number an operation may carry.
pub const MAX_CLOCK: u64 = u64::MAX >> 1;

/// Unique identifier for an operation.
///
/// `clock` is a Lamport timestamp, `replica` breaks ties. The derived
/// ordering compares `clock` first, then `replica`, so concurrent operations
/// with equal clocks order deterministically on every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub clock: u64,
    pub replica: ReplicaId,
}

impl OpId {
    pub fn new(replica: ReplicaId, clock: u64) -> Self {
        Self { clock, replica }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.replica)
    }
}

/// The text fields of a replicated document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Title,
    Content,
}

impl Field {
    pub const ALL: [Field; 2] = [Field::Title, Field::Content];
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Title => f.write_str("title"),
            Field::Content => f.write_str("content"),
        }
    }
}

/// Position of an insert: the element it was typed directly after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Anchor {
    /// Start of the field.
    Head,
    /// Directly after the element created by this operation.
    After(OpId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert { after: Anchor, ch: char },
    /// Tombstones the element created by `target`.
    Delete { target: OpId },
}

/// A single immutable CRDT operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    /// Per-replica delivery counter (1, 2, 3, ...) used by version summaries.
    pub seq: u64,
    pub field: Field,
    pub kind: OpKind,
}

impl Operation {
    pub fn insert(id: OpId, seq: u64, field: Field, after: Anchor, ch: char) -> Self {
        Self {
            id,
            seq,
            field,
            kind: OpKind::Insert { after, ch },
        }
    }

    pub fn delete(id: OpId, seq: u64, field: Field, target: OpId) -> Self {
        Self {
            id,
            seq,
            field,
            kind: OpKind::Delete { target },
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.id.replica
    }

    pub fn clock(&self) -> u64 {
        self.id.clock
    }

    /// The operation this one references, if any.
    pub fn dependency(&self) -> Option<OpId> {
        match self.kind {
            OpKind::Insert { after: Anchor::After(id), .. } => Some(id),
            OpKind::Insert { after: Anchor::Head, .. } => None,
            OpKind::Delete { target } => Some(target),
        }
    }

    /// Structural checks that do not depend on replica state.
    ///
    /// A referenced operation must have been observed by the author before
    /// this one was created, so its Lamport clock is strictly smaller.
    pub fn validate(&self) -> Result<(), MalformedOp> {
        if self.id.clock == 0 {
            return Err(MalformedOp::ZeroClock(self.id));
        }
        if self.seq == 0 {
            return Err(MalformedOp::ZeroSeq(self.id));
        }
        if self.id.clock > MAX_CLOCK || self.seq > MAX_CLOCK {
            return Err(MalformedOp::ClockOutOfRange(self.id));
        }
        if let Some(reference) = self.dependency() {
            if reference.clock >= self.id.clock {
                return Err(MalformedOp::ForwardReference {
                    op: self.id,
                    reference,
                });
            }
        }
        Ok(())
    }
}

/// Reasons an operation is rejected before it reaches the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedOp {
    #[error("operation {0} has a zero clock")]
    ZeroClock(OpId),
    #[error("operation {0} has a zero sequence number")]
    ZeroSeq(OpId),
    #[error("operation {0} has a clock or sequence number past the usable range")]
    ClockOutOfRange(OpId),
    #[error("operation {op} references {reference}, which is not older than itself")]
    ForwardReference { op: OpId, reference: OpId },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(n: u128) -> ReplicaId {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_op_id_orders_by_clock_then_replica() {
        let a = OpId::new(replica(9), 1);
        let b = OpId::new(replica(1), 2);
        let c = OpId::new(replica(2), 2);

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let root = OpId::new(replica(1), 1);
        let insert = Operation::insert(OpId::new(replica(1), 2), 2, Field::Content, Anchor::After(root), 'x');
        let delete = Operation::delete(OpId::new(replica(2), 3), 1, Field::Content, root);

        assert!(insert.validate().is_ok());
        assert!(delete.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_clock_and_seq() {
        let zero_clock = Operation::insert(OpId::new(replica(1), 0), 1, Field::Title, Anchor::Head, 'a');
        let zero_seq = Operation::insert(OpId::new(replica(1), 1), 0, Field::Title, Anchor::Head, 'a');

        assert!(matches!(zero_clock.validate(), Err(MalformedOp::ZeroClock(_))));
        assert!(matches!(zero_seq.validate(), Err(MalformedOp::ZeroSeq(_))));
    }

    #[test]
    fn test_validate_rejects_exhausted_clock() {
        let at_limit = Operation::insert(OpId::new(replica(1), MAX_CLOCK), 1, Field::Content, Anchor::Head, 'a');
        let past_clock = Operation::insert(OpId::new(replica(1), u64::MAX), 1, Field::Content, Anchor::Head, 'a');
        let past_seq = Operation::insert(OpId::new(replica(1), 1), u64::MAX, Field::Content, Anchor::Head, 'a');

        assert!(at_limit.validate().is_ok());
        assert!(matches!(past_clock.validate(), Err(MalformedOp::ClockOutOfRange(_))));
        assert!(matches!(past_seq.validate(), Err(MalformedOp::ClockOutOfRange(_))));
    }

    #[test]
    fn test_validate_rejects_forward_reference() {
        let own = OpId::new(replica(1), 4);
        let future = OpId::new(replica(2), 7);
        let op = Operation::insert(own, 1, Field::Content, Anchor::After(future), 'q');

        assert_eq!(
            op.validate(),
            Err(MalformedOp::ForwardReference { op: own, reference: future })
        );

        let self_delete = Operation::delete(own, 1, Field::Content, own);
        assert!(self_delete.validate().is_err());
    }

    #[test]
    fn test_dependency() {
        let root = OpId::new(replica(1), 1);
        let head = Operation::insert(root, 1, Field::Title, Anchor::Head, 'h');
        let del = Operation::delete(OpId::new(replica(1), 2), 2, Field::Title, root);

        assert_eq!(head.dependency(), None);
        assert_eq!(del.dependency(), Some(root));
    }
}
