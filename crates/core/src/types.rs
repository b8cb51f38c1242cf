//! Identity and locator types
//!
//! This module defines:
//! - TxnId: identifier assigned at transaction start
//! - CommitId: position in the global commit order
//! - TupleSlot: `(tile_group_id, offset)` locator of a logical row
//! - IsolationLevel, ConcurrencyProtocol, WriteKind

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction identifier
///
/// Allocated from a monotonic counter at `begin()`. Used for write
/// ownership and self-visibility, never for visibility between transactions.
pub type TxnId = u64;

/// Commit identifier
///
/// Allocated at commit time. Commit ids form the single total order that
/// every transaction uses for visibility. Distinct namespace from `TxnId`.
pub type CommitId = u64;

/// Sentinel stored in a version's `txn_id` when no transaction holds it
pub const INVALID_TXN_ID: TxnId = 0;

/// Sentinel `begin_cid`: the version's creator has not committed yet
pub const PENDING_CID: CommitId = u64::MAX;

/// Sentinel `end_cid`: the version has not been superseded
pub const CURRENT_CID: CommitId = u64::MAX;

/// Commit id of the empty database, before any transaction committed
pub const INITIAL_CID: CommitId = 0;

/// Locator of a logical row
///
/// A slot is a fixed cell inside a tile group. It is allocated once by the
/// storage layer and never reused while any version chain references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleSlot {
    /// Tile group holding the slot
    pub tile_group_id: u64,
    /// Offset of the slot within the tile group
    pub offset: u32,
}

impl TupleSlot {
    /// Create a slot locator
    pub const fn new(tile_group_id: u64, offset: u32) -> Self {
        Self {
            tile_group_id,
            offset,
        }
    }
}

impl fmt::Display for TupleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.tile_group_id, self.offset)
    }
}

/// Isolation level of a transaction
///
/// Levels differ only in which commit id a reader uses as its read
/// timestamp, and in whether the read set is validated at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Snapshot reads plus commit-time read-set validation
    Serializable,
    /// Reads see the commit order as of transaction start
    #[serde(alias = "snapshot")]
    SnapshotIsolation,
    /// Each read sees the latest committed version
    ReadCommitted,
}

impl IsolationLevel {
    /// Whether reads use the snapshot captured at `begin()`
    pub fn uses_start_snapshot(&self) -> bool {
        !matches!(self, IsolationLevel::ReadCommitted)
    }

    /// Parse the configuration spelling of an isolation level
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "serializable" => Some(IsolationLevel::Serializable),
            "snapshot" | "snapshot_isolation" => Some(IsolationLevel::SnapshotIsolation),
            "read_committed" => Some(IsolationLevel::ReadCommitted),
            _ => None,
        }
    }
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::Serializable
    }
}

/// Concurrency-control protocol
///
/// Exactly one protocol is active per process, fixed before the first
/// transaction begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyProtocol {
    /// Optimistic MVCC: in-place writes guarded by a CAS on `txn_id`
    TimestampOrdering,
    /// Pessimistic strict two-phase locking over tuple slots
    TwoPhaseLocking,
    /// Buffered writes validated and applied at commit
    OptimisticCopy,
}

impl ConcurrencyProtocol {
    /// Human-readable protocol name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ConcurrencyProtocol::TimestampOrdering => "timestamp_ordering",
            ConcurrencyProtocol::TwoPhaseLocking => "two_phase_locking",
            ConcurrencyProtocol::OptimisticCopy => "optimistic_copy",
        }
    }

    /// Parse the configuration spelling of a protocol
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timestamp_ordering" | "to" => Some(ConcurrencyProtocol::TimestampOrdering),
            "two_phase_locking" | "2pl" => Some(ConcurrencyProtocol::TwoPhaseLocking),
            "optimistic_copy" | "occ" => Some(ConcurrencyProtocol::OptimisticCopy),
            _ => None,
        }
    }
}

impl Default for ConcurrencyProtocol {
    fn default() -> Self {
        ConcurrencyProtocol::TimestampOrdering
    }
}

impl fmt::Display for ConcurrencyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of write recorded in a transaction's write set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    /// New row at a freshly allocated slot
    Insert,
    /// New version of an existing row
    Update,
    /// Tombstone version of an existing row
    Delete,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_compare_above_every_real_commit() {
        assert!(PENDING_CID > INITIAL_CID);
        assert!(CURRENT_CID > 1_000_000);
        assert_eq!(INVALID_TXN_ID, 0);
    }

    #[test]
    fn test_slot_ordering_is_group_then_offset() {
        let a = TupleSlot::new(1, 9);
        let b = TupleSlot::new(2, 0);
        let c = TupleSlot::new(2, 1);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(format!("{}", c), "(2, 1)");
    }

    #[test]
    fn test_isolation_parse() {
        assert_eq!(
            IsolationLevel::parse("snapshot"),
            Some(IsolationLevel::SnapshotIsolation)
        );
        assert_eq!(
            IsolationLevel::parse("read_committed"),
            Some(IsolationLevel::ReadCommitted)
        );
        assert_eq!(IsolationLevel::parse("chaos"), None);
        assert!(IsolationLevel::Serializable.uses_start_snapshot());
        assert!(!IsolationLevel::ReadCommitted.uses_start_snapshot());
    }

    #[test]
    fn test_protocol_parse_and_display() {
        assert_eq!(
            ConcurrencyProtocol::parse("2pl"),
            Some(ConcurrencyProtocol::TwoPhaseLocking)
        );
        assert_eq!(
            ConcurrencyProtocol::parse("optimistic_copy"),
            Some(ConcurrencyProtocol::OptimisticCopy)
        );
        assert_eq!(
            ConcurrencyProtocol::TimestampOrdering.to_string(),
            "timestamp_ordering"
        );
    }
}
