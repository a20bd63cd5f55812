//! The replicated document: one RGA sequence per field, an append-only
//! operation log, and the bookkeeping the resync handshake needs.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use uuid::Uuid;

use super::op::{Anchor, Field, OpId, OpKind, Operation, ReplicaId, MAX_CLOCK};
use super::sequence::Sequence;
use super::version::{SeqTracker, VersionSummary};

/// Materialized text of every field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub title: String,
    pub content: String,
}

impl DocumentSnapshot {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
        }
    }

    pub fn field(&self, field: Field) -> &str {
        match field {
            Field::Title => &self.title,
            Field::Content => &self.content,
        }
    }
}

/// A caller-issued splice against the visible text of one field.
///
/// `index` and `delete` count chars, not bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub field: Field,
    pub index: usize,
    pub delete: usize,
    pub insert: String,
}

impl TextEdit {
    pub fn insert(field: Field, index: usize, text: impl Into<String>) -> Self {
        Self {
            field,
            index,
            delete: 0,
            insert: text.into(),
        }
    }

    pub fn delete(field: Field, index: usize, len: usize) -> Self {
        Self {
            field,
            index,
            delete: len,
            insert: String::new(),
        }
    }

    pub fn replace(field: Field, index: usize, delete: usize, text: impl Into<String>) -> Self {
        Self {
            field,
            index,
            delete,
            insert: text.into(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.delete == 0 && self.insert.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("edit {index}+{delete} is out of range for {field} of length {len}")]
    OutOfRange {
        field: Field,
        index: usize,
        delete: usize,
        len: usize,
    },
    #[error("replica clock {clock} cannot issue {needed} more operations")]
    ClockExhausted { clock: u64, needed: u64 },
}

/// How far a remote clock may run ahead of the local one.
const MAX_CLOCK_JUMP: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

/// Passed to `on_update` subscribers after operations were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpdate {
    pub origin: UpdateOrigin,
    /// Fields whose visible text changed.
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type UpdateListener = Box<dyn FnMut(&DocumentUpdate) + Send + Sync>;

/// Locally replicated conflict-free document.
pub struct ReplicatedDocument {
    replica: ReplicaId,
    /// Lamport clock: highest clock observed or issued.
    clock: u64,
    /// Last sequence number issued by this replica.
    seq: u64,
    title: Sequence,
    content: Sequence,
    /// Every accepted operation, in arrival order.
    log: Vec<Operation>,
    seen: HashSet<OpId>,
    versions: HashMap<ReplicaId, SeqTracker>,
    /// Local operations not yet handed to the transport.
    outbox: VecDeque<Operation>,
    listeners: Vec<(SubscriptionId, UpdateListener)>,
    next_subscription: u64,
}

impl ReplicatedDocument {
    /// Create an empty document with a fresh random replica id.
    pub fn new() -> Self {
        Self::with_replica(Uuid::new_v4())
    }

    pub fn with_replica(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: 0,
            seq: 0,
            title: Sequence::new(),
            content: Sequence::new(),
            log: Vec::new(),
            seen: HashSet::new(),
            versions: HashMap::new(),
            outbox: VecDeque::new(),
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Number of distinct operations in the log.
    pub fn op_count(&self) -> usize {
        self.log.len()
    }

    /// Operations accepted but still waiting for a referenced operation.
    pub fn pending_count(&self) -> usize {
        self.title.pending() + self.content.pending()
    }

    pub fn len(&self, field: Field) -> usize {
        self.sequence(field).len()
    }

    pub fn text(&self, field: Field) -> String {
        self.sequence(field).text()
    }

    /// Current materialized text. Pure; safe to call at any time.
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            title: self.title.text(),
            content: self.content.text(),
        }
    }

    /// Merge remote operations into the local log.
    ///
    /// Duplicates are ignored and malformed operations are dropped with a
    /// warning. Returns the number of operations newly accepted.
    pub fn apply_remote<I>(&mut self, operations: I) -> usize
    where
        I: IntoIterator<Item = Operation>,
    {
        let mut accepted = 0;
        let mut changed = Vec::new();

        for op in operations {
            if let Err(e) = op.validate() {
                log::warn!("Dropping malformed operation: {e}");
                continue;
            }
            if self.seen.contains(&op.id) {
                continue;
            }
            if op.id.clock > self.clock.saturating_add(MAX_CLOCK_JUMP) {
                log::warn!("Dropping operation {}: clock is too far ahead of {}", op.id, self.clock);
                continue;
            }
            if op.id.replica == self.replica {
                self.seq = self.seq.max(op.seq);
            }
            let field = op.field;
            if self.integrate(op) && !changed.contains(&field) {
                changed.push(field);
            }
            accepted += 1;
        }

        if !changed.is_empty() {
            self.notify(&DocumentUpdate {
                origin: UpdateOrigin::Remote,
                fields: changed,
            });
        }
        accepted
    }

    /// Translate a text edit into operations, apply them optimistically and
    /// queue them for transport. Returns the generated operations.
    pub fn apply_local(&mut self, edit: &TextEdit) -> Result<Vec<Operation>, EditError> {
        let len = self.len(edit.field);
        let in_range = edit
            .index
            .checked_add(edit.delete)
            .is_some_and(|end| end <= len);
        if !in_range {
            return Err(EditError::OutOfRange {
                field: edit.field,
                index: edit.index,
                delete: edit.delete,
                len,
            });
        }
        if edit.is_noop() {
            return Ok(Vec::new());
        }

        let sequence = self.sequence(edit.field);
        let targets = sequence.visible_range(edit.index, edit.delete);
        let mut after = sequence.anchor_at(edit.index);

        let needed = targets.len() + edit.insert.chars().count();
        self.reserve(needed as u64)?;

        let mut ops = Vec::with_capacity(needed);
        for target in targets {
            let (id, seq) = self.next_id()?;
            ops.push(Operation::delete(id, seq, edit.field, target));
        }
        for ch in edit.insert.chars() {
            let (id, seq) = self.next_id()?;
            ops.push(Operation::insert(id, seq, edit.field, after, ch));
            after = Anchor::After(id);
        }

        for op in &ops {
            self.integrate(op.clone());
            self.outbox.push_back(op.clone());
        }

        self.notify(&DocumentUpdate {
            origin: UpdateOrigin::Local,
            fields: vec![edit.field],
        });
        Ok(ops)
    }

    /// Summary of what this replica holds, for the resync handshake.
    pub fn version_summary(&self) -> VersionSummary {
        let mut summary = VersionSummary::new();
        for (replica, tracker) in &self.versions {
            summary.set(*replica, tracker.watermark());
        }
        summary
    }

    /// Operations a replica with `summary` is missing, oldest first.
    ///
    /// Lamport order guarantees anchors precede the operations that
    /// reference them, so the receiver never has to buffer.
    pub fn ops_missing_from(&self, summary: &VersionSummary) -> Vec<Operation> {
        let mut missing: Vec<Operation> = self
            .log
            .iter()
            .filter(|op| !summary.covers(op))
            .cloned()
            .collect();
        missing.sort_by_key(|op| op.id);
        missing
    }

    /// Drain local operations queued for transport.
    pub fn take_outbox(&mut self) -> Vec<Operation> {
        self.outbox.drain(..).collect()
    }

    /// Forget queued local operations (they were delivered via resync).
    pub fn clear_outbox(&mut self) {
        self.outbox.clear();
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Register a callback invoked after any applied operation.
    pub fn on_update<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&DocumentUpdate) + Send + Sync + 'static,
    {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.listeners.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    /// Check that `count` more operations fit below [`MAX_CLOCK`], so an
    /// edit either issues all of its operations or none.
    fn reserve(&self, count: u64) -> Result<(), EditError> {
        let fits = |value: u64| value.checked_add(count).is_some_and(|end| end <= MAX_CLOCK);
        if fits(self.clock) && fits(self.seq) {
            Ok(())
        } else {
            Err(EditError::ClockExhausted {
                clock: self.clock,
                needed: count,
            })
        }
    }

    fn next_id(&mut self) -> Result<(OpId, u64), EditError> {
        let exhausted = EditError::ClockExhausted {
            clock: self.clock,
            needed: 1,
        };
        let clock = self.clock.checked_add(1).ok_or(exhausted.clone())?;
        let seq = self.seq.checked_add(1).ok_or(exhausted)?;
        self.clock = clock;
        self.seq = seq;
        Ok((OpId::new(self.replica, clock), seq))
    }

    /// Record and integrate an operation. Returns true if visible text changed.
    fn integrate(&mut self, op: Operation) -> bool {
        self.clock = self.clock.max(op.id.clock);
        self.seen.insert(op.id);
        self.versions.entry(op.id.replica).or_default().record(op.seq);

        let sequence = match op.field {
            Field::Title => &mut self.title,
            Field::Content => &mut self.content,
        };
        let changed = match op.kind {
            OpKind::Insert { after, ch } => sequence.insert(op.id, after, ch),
            OpKind::Delete { target } => sequence.delete(target),
        };
        self.log.push(op);
        changed
    }

    fn sequence(&self, field: Field) -> &Sequence {
        match field {
            Field::Title => &self.title,
            Field::Content => &self.content,
        }
    }

    fn notify(&mut self, update: &DocumentUpdate) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(update);
        }
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("replica", &self.replica)
            .field("clock", &self.clock)
            .field("ops", &self.log.len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn replica(n: u128) -> ReplicaId {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_local_insert_and_snapshot() {
        let mut doc = ReplicatedDocument::with_replica(replica(1));
        doc.apply_local(&TextEdit::insert(Field::Title, 0, "Notes")).unwrap();
        doc.apply_local(&TextEdit::insert(Field::Content, 0, "hello world")).unwrap();

        let snap = doc.snapshot();
        assert_eq!(snap.title, "Notes");
        assert_eq!(snap.content, "hello world");
        assert_eq!(doc.clock(), 16);
        assert_eq!(doc.outbox_len(), 16);
    }

    #[test]
    fn test_local_replace() {
        let mut doc = ReplicatedDocument::with_replica(replica(1));
        doc.apply_local(&TextEdit::insert(Field::Content, 0, "hello world")).unwrap();
        let ops = doc
            .apply_local(&TextEdit::replace(Field::Content, 6, 5, "there"))
            .unwrap();

        assert_eq!(ops.len(), 10);
        assert_eq!(doc.text(Field::Content), "hello there");
    }

    #[test]
    fn test_local_edit_out_of_range() {
        let mut doc = ReplicatedDocument::with_replica(replica(1));
        doc.apply_local(&TextEdit::insert(Field::Title, 0, "abc")).unwrap();

        let err = doc
            .apply_local(&TextEdit::delete(Field::Title, 2, 2))
            .unwrap_err();
        assert_eq!(
            err,
            EditError::OutOfRange { field: Field::Title, index: 2, delete: 2, len: 3 }
        );
        assert!(doc.apply_local(&TextEdit::insert(Field::Title, 4, "x")).is_err());
        assert!(doc.apply_local(&TextEdit::delete(Field::Title, usize::MAX, 2)).is_err());
        assert_eq!(doc.text(Field::Title), "abc");
    }

    #[test]
    fn test_noop_edit_generates_nothing() {
        let mut doc = ReplicatedDocument::with_replica(replica(1));
        let ops = doc.apply_local(&TextEdit::insert(Field::Title, 0, "")).unwrap();
        assert!(ops.is_empty());
        assert_eq!(doc.clock(), 0);
    }

    #[test]
    fn test_unicode_edit_counts_chars() {
        let mut doc = ReplicatedDocument::with_replica(replica(1));
        doc.apply_local(&TextEdit::insert(Field::Content, 0, "héllo")).unwrap();
        doc.apply_local(&TextEdit::delete(Field::Content, 1, 1)).unwrap();
        assert_eq!(doc.text(Field::Content), "hllo");
    }

    #[test]
    fn test_remote_ops_replicate() {
        let mut a = ReplicatedDocument::with_replica(replica(1));
        let mut b = ReplicatedDocument::with_replica(replica(2));

        let ops = a.apply_local(&TextEdit::insert(Field::Content, 0, "shared")).unwrap();
        assert_eq!(b.apply_remote(ops.clone()), 6);
        assert_eq!(b.snapshot(), a.snapshot());

        // Re-delivery is a no-op.
        assert_eq!(b.apply_remote(ops), 0);
        assert_eq!(b.op_count(), 6);
    }

    #[test]
    fn test_remote_advances_lamport_clock() {
        let mut a = ReplicatedDocument::with_replica(replica(1));
        let mut b = ReplicatedDocument::with_replica(replica(2));

        let ops = a.apply_local(&TextEdit::insert(Field::Content, 0, "abcd")).unwrap();
        b.apply_remote(ops);
        let next = b.apply_local(&TextEdit::insert(Field::Content, 4, "!")).unwrap();
        assert_eq!(next[0].id.clock, 5);
        assert_eq!(next[0].seq, 1);
    }

    #[test]
    fn test_malformed_remote_ops_dropped() {
        let mut doc = ReplicatedDocument::with_replica(replica(1));
        let bad = Operation::insert(
            OpId::new(replica(2), 3),
            1,
            Field::Content,
            Anchor::After(OpId::new(replica(2), 9)),
            'x',
        );
        let zero = Operation::insert(OpId::new(replica(2), 0), 1, Field::Content, Anchor::Head, 'y');
        let good = Operation::insert(OpId::new(replica(2), 1), 1, Field::Content, Anchor::Head, 'z');

        assert_eq!(doc.apply_remote(vec![bad, zero, good]), 1);
        assert_eq!(doc.text(Field::Content), "z");
        assert_eq!(doc.pending_count(), 0);
    }

    #[test]
    fn test_remote_clock_cannot_exhaust_local_edits() {
        let mut doc = ReplicatedDocument::with_replica(replica(1));
        let huge = Operation::insert(OpId::new(replica(2), u64::MAX), 1, Field::Content, Anchor::Head, 'x');
        let far = Operation::insert(OpId::new(replica(2), MAX_CLOCK), 1, Field::Content, Anchor::Head, 'x');

        assert_eq!(doc.apply_remote([huge, far]), 0);
        assert_eq!(doc.clock(), 0);

        let ops = doc.apply_local(&TextEdit::insert(Field::Content, 0, "y")).unwrap();
        assert_eq!(ops[0].id.clock, 1);
        assert_eq!(doc.text(Field::Content), "y");
    }

    #[test]
    fn test_local_edit_at_clock_limit_fails_cleanly() {
        let mut doc = ReplicatedDocument::with_replica(replica(1));
        doc.clock = MAX_CLOCK - 1;

        let err = doc
            .apply_local(&TextEdit::insert(Field::Content, 0, "ab"))
            .unwrap_err();
        assert_eq!(err, EditError::ClockExhausted { clock: MAX_CLOCK - 1, needed: 2 });
        assert_eq!(doc.clock(), MAX_CLOCK - 1);
        assert_eq!(doc.op_count(), 0);
        assert_eq!(doc.outbox_len(), 0);
        assert_eq!(doc.text(Field::Content), "");

        let last = doc.apply_local(&TextEdit::insert(Field::Content, 0, "a")).unwrap();
        assert_eq!(last[0].id.clock, MAX_CLOCK);
        assert!(last[0].validate().is_ok());
        assert!(doc.apply_local(&TextEdit::insert(Field::Content, 1, "b")).is_err());
    }

    #[test]
    fn test_out_of_order_delete_realized() {
        let mut a = ReplicatedDocument::with_replica(replica(1));
        let inserts = a.apply_local(&TextEdit::insert(Field::Content, 0, "abc")).unwrap();
        let deletes = a.apply_local(&TextEdit::delete(Field::Content, 1, 1)).unwrap();

        let mut b = ReplicatedDocument::with_replica(replica(2));
        b.apply_remote(deletes);
        assert_eq!(b.text(Field::Content), "");
        assert_eq!(b.pending_count(), 1);

        b.apply_remote(inserts);
        assert_eq!(b.text(Field::Content), "ac");
        assert_eq!(b.snapshot(), a.snapshot());
        assert_eq!(b.pending_count(), 0);
    }

    #[test]
    fn test_version_summary_and_missing_ops() {
        let mut a = ReplicatedDocument::with_replica(replica(1));
        let mut b = ReplicatedDocument::with_replica(replica(2));

        let first = a.apply_local(&TextEdit::insert(Field::Title, 0, "ab")).unwrap();
        b.apply_remote(first);
        a.apply_local(&TextEdit::insert(Field::Title, 2, "cd")).unwrap();
        b.apply_local(&TextEdit::insert(Field::Content, 0, "z")).unwrap();

        let summary = b.version_summary();
        assert_eq!(summary.get(&replica(1)), 2);
        assert_eq!(summary.get(&replica(2)), 1);

        let missing = a.ops_missing_from(&summary);
        assert_eq!(missing.len(), 2);
        assert!(missing.windows(2).all(|w| w[0].id < w[1].id));

        b.apply_remote(missing);
        let back = b.ops_missing_from(&a.version_summary());
        assert_eq!(back.len(), 1);
        a.apply_remote(back);

        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.snapshot(), DocumentSnapshot::new("abcd", "z"));
    }

    #[test]
    fn test_outbox_drain_and_clear() {
        let mut doc = ReplicatedDocument::with_replica(replica(1));
        doc.apply_local(&TextEdit::insert(Field::Title, 0, "ab")).unwrap();
        assert_eq!(doc.take_outbox().len(), 2);
        assert_eq!(doc.outbox_len(), 0);

        doc.apply_local(&TextEdit::insert(Field::Title, 0, "c")).unwrap();
        doc.clear_outbox();
        assert_eq!(doc.outbox_len(), 0);
    }

    #[test]
    fn test_on_update_reports_origin_and_fields() {
        let seen: Arc<Mutex<Vec<DocumentUpdate>>> = Arc::default();
        let sink = seen.clone();

        let mut a = ReplicatedDocument::with_replica(replica(1));
        let mut b = ReplicatedDocument::with_replica(replica(2));
        let sub = b.on_update(move |u| sink.lock().unwrap().push(u.clone()));

        let ops = a.apply_local(&TextEdit::insert(Field::Title, 0, "t")).unwrap();
        b.apply_remote(ops.clone());
        b.apply_local(&TextEdit::insert(Field::Content, 0, "c")).unwrap();
        // Duplicate delivery does not notify.
        b.apply_remote(ops);

        {
            let updates = seen.lock().unwrap();
            assert_eq!(updates.len(), 2);
            assert_eq!(updates[0].origin, UpdateOrigin::Remote);
            assert_eq!(updates[0].fields, vec![Field::Title]);
            assert_eq!(updates[1].origin, UpdateOrigin::Local);
            assert_eq!(updates[1].fields, vec![Field::Content]);
        }

        assert!(b.unsubscribe(sub));
        assert!(!b.unsubscribe(sub));
        b.apply_local(&TextEdit::insert(Field::Content, 0, "d")).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_own_ops_from_server_bump_sequence() {
        let me = replica(1);
        let mut earlier = ReplicatedDocument::with_replica(me);
        let ops = earlier.apply_local(&TextEdit::insert(Field::Title, 0, "xy")).unwrap();

        // Same replica id rejoining with an empty document.
        let mut doc = ReplicatedDocument::with_replica(me);
        doc.apply_remote(ops);
        let next = doc.apply_local(&TextEdit::insert(Field::Title, 2, "z")).unwrap();
        assert_eq!(next[0].seq, 3);
        assert_eq!(doc.version_summary().get(&me), 3);
    }
}
