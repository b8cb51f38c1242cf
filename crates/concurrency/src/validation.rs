//! Commit-time validation
//!
//! Runs inside the commit critical section, so the set of committed
//! transactions cannot change while a validation is in progress.
//!
//! - Timestamp ordering, serializable: every slot in the read set must have
//!   no committed version newer than the transaction's start.
//! - Optimistic copy: the read and write sets must not intersect the write
//!   set of any transaction that committed after this one started.
//!
//! Two-phase locking needs no validation; its locks already exclude the
//! conflicting interleavings.

use crate::transaction::TransactionContext;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use tessera_core::{CommitId, Error, TupleSlot};
use tessera_storage::VersionStore;

/// A conflict found during validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// A slot this transaction read was overwritten by a later commit
    ReadWrite {
        /// Slot read
        slot: TupleSlot,
        /// Commit id of the overwriting transaction
        commit_id: CommitId,
    },
    /// A slot this transaction wrote was also written by a later commit
    WriteWrite {
        /// Slot written by both
        slot: TupleSlot,
        /// Commit id of the other writer
        commit_id: CommitId,
    },
}

impl ConflictType {
    /// Slot involved
    pub fn slot(&self) -> TupleSlot {
        match self {
            ConflictType::ReadWrite { slot, .. } | ConflictType::WriteWrite { slot, .. } => *slot,
        }
    }

    /// Commit id of the conflicting transaction
    pub fn commit_id(&self) -> CommitId {
        match self {
            ConflictType::ReadWrite { commit_id, .. }
            | ConflictType::WriteWrite { commit_id, .. } => *commit_id,
        }
    }
}

/// Result of transaction validation
///
/// Accumulates all conflicts found. A transaction commits only if
/// `is_valid()` returns true.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// All conflicts detected
    pub conflicts: Vec<ConflictType>,
}

impl ValidationResult {
    /// A successful validation result
    pub fn ok() -> Self {
        Self::default()
    }

    /// A result with a single conflict
    pub fn conflict(conflict: ConflictType) -> Self {
        Self {
            conflicts: vec![conflict],
        }
    }

    /// Record another conflict
    pub fn push(&mut self, conflict: ConflictType) {
        self.conflicts.push(conflict);
    }

    /// Whether validation passed
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Number of conflicts
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    /// Error describing the first conflict, if any
    pub fn into_error(self) -> Option<Error> {
        self.conflicts
            .into_iter()
            .next()
            .map(|c| Error::SerializationConflict {
                slot: c.slot(),
                commit_id: c.commit_id(),
            })
    }
}

#[derive(Debug, Clone)]
struct CommittedWrites {
    commit_id: CommitId,
    slots: FxHashSet<TupleSlot>,
}

/// Write sets of recently committed transactions, oldest first
///
/// Only entries that a live transaction could still conflict with are
/// kept; `prune` drops everything at or below the oldest live snapshot.
#[derive(Debug, Default)]
pub struct CommitHistory {
    entries: VecDeque<CommittedWrites>,
}

impl CommitHistory {
    /// Create an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the write set of the transaction committing at `commit_id`
    pub fn record<I: IntoIterator<Item = TupleSlot>>(&mut self, commit_id: CommitId, slots: I) {
        self.entries.push_back(CommittedWrites {
            commit_id,
            slots: slots.into_iter().collect(),
        });
    }

    /// Drop entries no snapshot at or after `oldest_start` can conflict with
    pub fn prune(&mut self, oldest_start: CommitId) {
        while self
            .entries
            .front()
            .map_or(false, |e| e.commit_id <= oldest_start)
        {
            self.entries.pop_front();
        }
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn committed_after(&self, start: CommitId) -> impl Iterator<Item = &CommittedWrites> {
        self.entries.iter().filter(move |e| e.commit_id > start)
    }
}

/// Validate an optimistic-copy transaction against later commits
pub fn validate_occ(ctx: &TransactionContext, history: &CommitHistory) -> ValidationResult {
    let mut result = ValidationResult::ok();
    for committed in history.committed_after(ctx.start_cid()) {
        for slot in ctx.read_set.iter() {
            if committed.slots.contains(slot) {
                result.push(ConflictType::ReadWrite {
                    slot: *slot,
                    commit_id: committed.commit_id,
                });
            }
        }
        for slot in ctx.buffer.keys() {
            if committed.slots.contains(slot) && !ctx.read_set.contains(slot) {
                result.push(ConflictType::WriteWrite {
                    slot: *slot,
                    commit_id: committed.commit_id,
                });
            }
        }
    }
    result
}

/// Validate a serializable timestamp-ordering transaction's reads
///
/// The newest committed version of every slot read must have begun at or
/// before the transaction's start.
pub fn validate_read_set(ctx: &TransactionContext, store: &VersionStore) -> ValidationResult {
    let mut result = ValidationResult::ok();
    for slot in ctx.read_set.iter() {
        let newest = store.chain(*slot).find(|v| v.is_committed());
        if let Some(version) = newest {
            if version.begin_cid() > ctx.start_cid() {
                result.push(ConflictType::ReadWrite {
                    slot: *slot,
                    commit_id: version.begin_cid(),
                });
            }
        }
    }
    result
}
