//! Compact version summaries for the resync handshake.
//!
//! A summary maps each replica to the highest sequence number `n` such that
//! every operation `1..=n` from that replica is present locally. Operations
//! received ahead of a gap are held back from the watermark, so a summary
//! never claims more than the replica really has. The worst case is that the
//! peer resends an operation we already hold, which the log de-duplicates.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::op::{Operation, ReplicaId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    entries: BTreeMap<ReplicaId, u64>,
}

impl VersionSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest contiguous sequence number known for `replica` (0 = none).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    pub fn set(&mut self, replica: ReplicaId, seq: u64) {
        if seq == 0 {
            self.entries.remove(&replica);
        } else {
            self.entries.insert(replica, seq);
        }
    }

    /// Whether the summarized replica is known to hold `op`.
    pub fn covers(&self, op: &Operation) -> bool {
        op.seq <= self.get(&op.id.replica)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Contiguous-watermark tracker for one replica's sequence numbers.
#[derive(Debug, Clone, Default)]
pub(crate) struct SeqTracker {
    watermark: u64,
    ahead: BTreeSet<u64>,
}

impl SeqTracker {
    pub(crate) fn record(&mut self, seq: u64) {
        if seq <= self.watermark {
            return;
        }
        self.ahead.insert(seq);
        while self.ahead.remove(&(self.watermark + 1)) {
            self.watermark += 1;
        }
    }

    pub(crate) fn watermark(&self) -> u64 {
        self.watermark
    }
}
