//! Log replay
//!
//! Reads the durable log in flushed order and hands back the committed
//! transactions, oldest commit first. Tuple records are buffered per
//! transaction until its COMMIT; transactions that end in ABORT, or never
//! reach a COMMIT before the end of the valid prefix, are discarded.

use crate::log_file::scan_log;
use crate::record::LogRecord;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use tessera_core::{CommitId, Result, Tuple, TupleSlot, TxnId, INITIAL_CID};
use tracing::{info, warn};

/// One redo operation
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedWrite {
    /// Target slot
    pub slot: TupleSlot,
    /// New contents; `None` is a delete
    pub data: Option<Tuple>,
}

/// A committed transaction recovered from the log
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedTransaction {
    /// Transaction id
    pub txn_id: TxnId,
    /// Commit id
    pub commit_id: CommitId,
    /// Writes in the order the transaction performed them
    pub writes: Vec<ReplayedWrite>,
}

/// Outcome of replaying a log file
#[derive(Debug, Default)]
pub struct ReplayOutcome {
    /// Committed transactions in flushed order
    pub transactions: Vec<ReplayedTransaction>,
    /// Highest commit id found
    pub highest_commit_id: CommitId,
    /// Highest transaction id found in any record
    pub max_txn_id: TxnId,
    /// Records decoded
    pub records_read: usize,
    /// Transactions without a COMMIT
    pub discarded_transactions: usize,
    /// Length of the valid prefix
    pub valid_len: u64,
    /// Whether a truncated or corrupt tail was ignored
    pub truncated: bool,
}

/// Replays a write-ahead log file
#[derive(Debug, Clone)]
pub struct LogReplayer {
    path: PathBuf,
}

impl LogReplayer {
    /// Create a replayer for the log at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Read the log and collect committed transactions
    pub fn replay(&self) -> Result<ReplayOutcome> {
        let scan = scan_log(&self.path)?;
        let mut outcome = ReplayOutcome {
            highest_commit_id: INITIAL_CID,
            records_read: scan.records.len(),
            valid_len: scan.valid_len,
            truncated: scan.truncated,
            ..Default::default()
        };

        let mut open: FxHashMap<TxnId, Vec<ReplayedWrite>> = FxHashMap::default();
        for record in scan.records {
            let txn_id = record.txn_id();
            outcome.max_txn_id = outcome.max_txn_id.max(txn_id);

            match record {
                LogRecord::Begin { .. } => {
                    open.entry(txn_id).or_default();
                }
                LogRecord::TupleInsert { slot, tuple, .. }
                | LogRecord::TupleUpdate { slot, tuple, .. } => {
                    open.entry(txn_id).or_default().push(ReplayedWrite {
                        slot,
                        data: Some(tuple),
                    });
                }
                LogRecord::TupleDelete { slot, .. } => {
                    open.entry(txn_id)
                        .or_default()
                        .push(ReplayedWrite { slot, data: None });
                }
                LogRecord::Abort { .. } => {
                    open.remove(&txn_id);
                    outcome.discarded_transactions += 1;
                }
                LogRecord::Commit { commit_id, .. } => {
                    if commit_id <= outcome.highest_commit_id {
                        warn!(
                            txn_id,
                            commit_id,
                            previous = outcome.highest_commit_id,
                            "COMMIT record out of commit id order"
                        );
                    }
                    outcome.highest_commit_id = outcome.highest_commit_id.max(commit_id);
                    let writes = open.remove(&txn_id).unwrap_or_default();
                    outcome.transactions.push(ReplayedTransaction {
                        txn_id,
                        commit_id,
                        writes,
                    });
                }
            }
        }
        outcome.discarded_transactions += open.len();

        info!(
            path = %self.path.display(),
            committed = outcome.transactions.len(),
            discarded = outcome.discarded_transactions,
            highest_commit_id = outcome.highest_commit_id,
            truncated = outcome.truncated,
            "Replayed write-ahead log"
        );
        Ok(outcome)
    }
}
