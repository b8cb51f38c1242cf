//! Error types for Tessera
//!
//! This module defines all error types surfaced by the transactional core.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Conflict, deadlock and timeout errors are always raised after the
//! transaction that detected them has been rolled back. Callers retry the
//! whole transaction (see [`Error::is_retryable`]).

use crate::types::{CommitId, TupleSlot, TxnId};
use std::io;
use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the transactional core
#[derive(Debug, Error)]
pub enum Error {
    /// Another live transaction holds write ownership of the slot's newest
    /// version, or the version was replaced after this transaction started
    #[error("write conflict on slot {slot}: held or replaced by txn {holder}")]
    WriteConflict {
        /// Contended slot
        slot: TupleSlot,
        /// Transaction that owns the conflicting version, or
        /// `INVALID_TXN_ID` if it was already replaced by a commit
        holder: TxnId,
    },

    /// Commit-time validation found a read or write invalidated by a
    /// transaction that committed after this one started
    #[error("serialization conflict on slot {slot}: overwritten at commit {commit_id}")]
    SerializationConflict {
        /// Slot whose contents changed
        slot: TupleSlot,
        /// Commit id of the overwriting transaction
        commit_id: CommitId,
    },

    /// This transaction was chosen as the victim of a wait-for cycle
    #[error("deadlock detected: txn {victim} aborted")]
    Deadlock {
        /// Aborted transaction (lowest id in the cycle)
        victim: TxnId,
    },

    /// A lock wait exceeded the configured bound
    #[error("lock wait timed out on slot {slot} after {waited_ms}ms")]
    LockTimeout {
        /// Slot being waited on
        slot: TupleSlot,
        /// Time spent waiting
        waited_ms: u64,
    },

    /// The durability barrier failed; no further commit is acknowledged
    #[error("log I/O failure: {0}")]
    LogIo(String),

    /// The operation requires an active transaction
    #[error("transaction {0} is not active")]
    TransactionNotActive(TxnId),

    /// Update or delete targeted a slot with no visible version
    #[error("no visible tuple at slot {0}")]
    TupleNotFound(TupleSlot),

    /// Insert targeted a slot that already carries a version chain
    #[error("slot {0} is already occupied")]
    SlotOccupied(TupleSlot),

    /// Persisted data failed validation
    #[error("data corruption: {0}")]
    Corruption(String),

    /// A log record ends before its declared length
    #[error("incomplete record at offset {offset}: have {have} bytes, need {needed}")]
    IncompleteRecord {
        /// File offset of the record start
        offset: u64,
        /// Bytes available
        have: usize,
        /// Bytes required
        needed: usize,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error outside the durability barrier
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The database has been shut down and accepts no new transactions
    #[error("database is shut down")]
    DatabaseClosed,
}

impl Error {
    /// Whether the caller should retry the whole transaction
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WriteConflict { .. }
                | Error::SerializationConflict { .. }
                | Error::Deadlock { .. }
                | Error::LockTimeout { .. }
        )
    }

    /// Whether the error means the log can no longer acknowledge commits
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LogIo(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
