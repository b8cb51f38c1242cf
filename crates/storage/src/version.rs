//! Tuple versions and the version arena
//!
//! A `TupleVersion` is one physical version of a logical row. Its
//! visibility metadata (`txn_id`, `begin_cid`, `end_cid`) is atomic; the
//! link to the next older version and the column payload are fixed when
//! the version is created.
//!
//! Versions live in a `VersionArena` keyed by a stable `VersionId`. Links
//! between versions are arena ids, never references, so a chain can be
//! truncated by removing ids from the arena. A reader that follows a link
//! to an id no longer present treats it as the end of the chain.

use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{
    CommitId, Tuple, TupleSlot, TxnId, CURRENT_CID, INVALID_TXN_ID, PENDING_CID,
};

/// Stable arena key of a tuple version
///
/// Ids are allocated from a monotonic counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionId(pub u64);

impl VersionId {
    /// Encode as a non-zero link word (`0` means "no version")
    #[inline]
    pub(crate) fn to_link(id: Option<VersionId>) -> u64 {
        match id {
            Some(VersionId(raw)) => raw + 1,
            None => 0,
        }
    }

    /// Decode a link word produced by `to_link`
    #[inline]
    pub(crate) fn from_link(word: u64) -> Option<VersionId> {
        if word == 0 {
            None
        } else {
            Some(VersionId(word - 1))
        }
    }
}

/// One physical version of a logical row
#[derive(Debug)]
pub struct TupleVersion {
    id: VersionId,
    slot: TupleSlot,
    txn_id: AtomicU64,
    begin_cid: AtomicU64,
    end_cid: AtomicU64,
    older: Option<VersionId>,
    data: Option<Tuple>,
}

impl TupleVersion {
    /// Arena id of this version
    pub fn id(&self) -> VersionId {
        self.id
    }

    /// Slot this version belongs to
    pub fn slot(&self) -> TupleSlot {
        self.slot
    }

    /// Transaction holding write ownership, or `INVALID_TXN_ID`
    #[inline]
    pub fn txn_id(&self) -> TxnId {
        self.txn_id.load(Ordering::Acquire)
    }

    /// Commit id from which this version is visible, or `PENDING_CID`
    #[inline]
    pub fn begin_cid(&self) -> CommitId {
        self.begin_cid.load(Ordering::Acquire)
    }

    /// Commit id at which this version stops being visible, or `CURRENT_CID`
    #[inline]
    pub fn end_cid(&self) -> CommitId {
        self.end_cid.load(Ordering::Acquire)
    }

    /// Next older version in the chain
    #[inline]
    pub fn older(&self) -> Option<VersionId> {
        self.older
    }

    /// Column payload; `None` marks a delete tombstone
    pub fn data(&self) -> Option<&Tuple> {
        self.data.as_ref()
    }

    /// Whether this version records a delete
    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }

    /// Whether the creating transaction has committed
    #[inline]
    pub fn is_committed(&self) -> bool {
        self.begin_cid() != PENDING_CID
    }

    /// Committed-visibility test against a read timestamp
    ///
    /// Visible iff `begin != PENDING && begin <= ts && (end == CURRENT || end > ts)`.
    #[inline]
    pub fn is_visible_at(&self, read_ts: CommitId) -> bool {
        let begin = self.begin_cid();
        if begin == PENDING_CID || begin > read_ts {
            return false;
        }
        let end = self.end_cid();
        end == CURRENT_CID || end > read_ts
    }

    /// Whether this is an uncommitted version created by `txn`
    #[inline]
    pub fn is_own_pending(&self, txn: TxnId) -> bool {
        self.txn_id() == txn && self.begin_cid() == PENDING_CID
    }

    /// Claim write ownership for `txn`
    ///
    /// Succeeds if the version is unowned or already owned by `txn`.
    /// Returns the current holder on failure.
    pub fn try_claim(&self, txn: TxnId) -> std::result::Result<(), TxnId> {
        match self.txn_id.compare_exchange(
            INVALID_TXN_ID,
            txn,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(holder) if holder == txn => Ok(()),
            Err(holder) => Err(holder),
        }
    }

    /// Release write ownership held by `txn`
    ///
    /// Returns false if `txn` did not hold the version.
    pub fn release(&self, txn: TxnId) -> bool {
        self.txn_id
            .compare_exchange(txn, INVALID_TXN_ID, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stamp the commit id from which this version is visible
    pub fn set_begin_cid(&self, cid: CommitId) {
        self.begin_cid.store(cid, Ordering::Release);
    }

    /// Stamp the commit id at which this version was superseded
    pub fn set_end_cid(&self, cid: CommitId) {
        self.end_cid.store(cid, Ordering::Release);
    }
}

type FxBuild = BuildHasherDefault<FxHasher>;

/// Arena owning every live tuple version
#[derive(Debug)]
pub struct VersionArena {
    versions: DashMap<VersionId, Arc<TupleVersion>, FxBuild>,
    next_id: AtomicU64,
}

impl VersionArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self {
            versions: DashMap::with_hasher(FxBuild::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocate an uncommitted version owned by `txn`
    pub fn alloc_pending(
        &self,
        slot: TupleSlot,
        txn: TxnId,
        data: Option<Tuple>,
        older: Option<VersionId>,
    ) -> Arc<TupleVersion> {
        self.alloc(slot, txn, PENDING_CID, data, older)
    }

    /// Allocate a version already committed at `cid`
    pub fn alloc_committed(
        &self,
        slot: TupleSlot,
        cid: CommitId,
        data: Option<Tuple>,
        older: Option<VersionId>,
    ) -> Arc<TupleVersion> {
        self.alloc(slot, INVALID_TXN_ID, cid, data, older)
    }

    fn alloc(
        &self,
        slot: TupleSlot,
        txn: TxnId,
        begin: CommitId,
        data: Option<Tuple>,
        older: Option<VersionId>,
    ) -> Arc<TupleVersion> {
        let id = VersionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let version = Arc::new(TupleVersion {
            id,
            slot,
            txn_id: AtomicU64::new(txn),
            begin_cid: AtomicU64::new(begin),
            end_cid: AtomicU64::new(CURRENT_CID),
            older,
            data,
        });
        self.versions.insert(id, Arc::clone(&version));
        version
    }

    /// Look up a version by id
    #[inline]
    pub fn get(&self, id: VersionId) -> Option<Arc<TupleVersion>> {
        self.versions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a version, returning it if it was present
    pub fn remove(&self, id: VersionId) -> Option<Arc<TupleVersion>> {
        self.versions.remove(&id).map(|(_, v)| v)
    }

    /// Number of versions currently held
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether the arena holds no versions
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl Default for VersionArena {
    fn default() -> Self {
        Self::new()
    }
}
