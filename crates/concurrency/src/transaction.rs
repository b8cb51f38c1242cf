//! Transaction context
//!
//! A `TransactionContext` is the private, single-threaded state of one
//! transaction: its snapshot, the slots it read, the versions it created
//! and (under optimistic copy) the writes it buffered.
//!
//! # Lifecycle
//!
//! 1. **BEGIN**: `TransactionManager::begin` registers the transaction and
//!    returns the context, status `Active`
//! 2. **READ/WRITE**: `read`, `insert`, `update`, `delete` on the manager
//! 3. **COMMIT**: status moves to `Committing` while the commit critical
//!    section validates and stamps, then to `Committed`
//! 4. **ABORT**: explicit, or forced by any conflict; status `Aborted`
//!
//! Commit and abort consume the context's work exactly once; a context in
//! a final state rejects every further operation.

use crate::registry::TxnHandle;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{CommitId, IsolationLevel, Tuple, TupleSlot, TxnId, WriteKind};
use tessera_storage::VersionId;
use tracing::warn;

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Executing; may read and write
    Active,
    /// Inside the commit critical section
    Committing,
    /// Committed; versions are stamped
    Committed,
    /// Rolled back
    Aborted,
}

impl TransactionStatus {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            TransactionStatus::Active => 0,
            TransactionStatus::Committing => 1,
            TransactionStatus::Committed => 2,
            TransactionStatus::Aborted => 3,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TransactionStatus::Active,
            1 => TransactionStatus::Committing,
            2 => TransactionStatus::Committed,
            _ => TransactionStatus::Aborted,
        }
    }

    /// Whether the transaction has finished
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed | TransactionStatus::Aborted
        )
    }
}

/// One version installed in a chain by this transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEntry {
    /// Slot written
    pub slot: TupleSlot,
    /// Kind of the first write to the slot, merged with later ones
    pub kind: WriteKind,
    /// The pending version now at the head of the chain
    pub created: VersionId,
    /// The committed version it supersedes (`None` for inserts)
    pub superseded: Option<VersionId>,
}

/// A write held back until commit (optimistic copy)
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedWrite {
    /// Kind of write
    pub kind: WriteKind,
    /// New contents, `None` for a delete
    pub data: Option<Tuple>,
}

/// Private state of one transaction
#[derive(Debug)]
pub struct TransactionContext {
    id: TxnId,
    isolation: IsolationLevel,
    start_cid: CommitId,
    pub(crate) status: TransactionStatus,
    pub(crate) commit_id: Option<CommitId>,
    pub(crate) backend: usize,
    pub(crate) handle: Arc<TxnHandle>,

    /// Slots read through the manager
    pub(crate) read_set: FxHashSet<TupleSlot>,
    /// Versions installed in place (timestamp ordering, two-phase locking)
    pub(crate) write_set: Vec<WriteEntry>,
    /// Slot -> index into `write_set`
    pub(crate) write_index: FxHashMap<TupleSlot, usize>,
    /// Deferred writes (optimistic copy), applied in slot order at commit
    pub(crate) buffer: BTreeMap<TupleSlot, BufferedWrite>,

    started_at: Instant,
}

impl TransactionContext {
    pub(crate) fn new(handle: Arc<TxnHandle>, backend: usize) -> Self {
        Self {
            id: handle.id(),
            isolation: handle.isolation(),
            start_cid: handle.start_cid(),
            status: TransactionStatus::Active,
            commit_id: None,
            backend,
            handle,
            read_set: FxHashSet::default(),
            write_set: Vec::new(),
            write_index: FxHashMap::default(),
            buffer: BTreeMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Isolation level
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Last commit id published when the transaction began
    pub fn start_cid(&self) -> CommitId {
        self.start_cid
    }

    /// Current lifecycle state
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Commit id, once committed with writes
    pub fn commit_id(&self) -> Option<CommitId> {
        self.commit_id
    }

    /// Whether the transaction can still read and write
    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }

    /// Whether nothing has been written
    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty() && self.buffer.is_empty()
    }

    /// Slots read so far
    pub fn read_set(&self) -> &FxHashSet<TupleSlot> {
        &self.read_set
    }

    /// Versions installed so far
    pub fn write_set(&self) -> &[WriteEntry] {
        &self.write_set
    }

    /// Number of distinct slots written
    pub fn write_count(&self) -> usize {
        self.write_set.len() + self.buffer.len()
    }

    /// Every slot written, installed or buffered
    pub fn written_slots(&self) -> Vec<TupleSlot> {
        let mut slots: Vec<TupleSlot> = self.write_set.iter().map(|e| e.slot).collect();
        slots.extend(self.buffer.keys().copied());
        slots
    }

    /// Time since begin
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn handle(&self) -> &Arc<TxnHandle> {
        &self.handle
    }

    pub(crate) fn set_status(&mut self, status: TransactionStatus) {
        self.status = status;
        self.handle.set_status(status);
    }

    pub(crate) fn write_entry_mut(&mut self, slot: TupleSlot) -> Option<&mut WriteEntry> {
        let index = *self.write_index.get(&slot)?;
        self.write_set.get_mut(index)
    }

    pub(crate) fn record_write(&mut self, entry: WriteEntry) {
        self.write_index.insert(entry.slot, self.write_set.len());
        self.write_set.push(entry);
    }

    pub(crate) fn clear_writes(&mut self) {
        self.write_set.clear();
        self.write_index.clear();
        self.buffer.clear();
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if !self.status.is_final() {
            warn!(
                txn_id = self.id,
                writes = self.write_count(),
                "Transaction dropped without commit or abort"
            );
        }
    }
}

/// Merge the kind of a repeated write to the same slot
///
/// An insert stays an insert when later updated; anything followed by a
/// delete becomes a delete.
pub(crate) fn merge_kind(first: WriteKind, next: WriteKind) -> WriteKind {
    match (first, next) {
        (_, WriteKind::Delete) => WriteKind::Delete,
        (WriteKind::Insert, _) => WriteKind::Insert,
        (_, next) => next,
    }
}
