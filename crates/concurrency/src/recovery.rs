//! Startup recovery
//!
//! Rebuilds the version store from the durable log before any transaction
//! begins:
//!
//! 1. Replay the log; keep transactions with a COMMIT record
//! 2. Reapply their writes in flushed order as committed versions
//! 3. Truncate a torn or corrupt tail so appends resume on a clean record
//!    boundary
//! 4. Report the highest commit id and transaction id so the manager
//!    continues after them
//!
//! Replay never re-runs validation; commit decisions in the log are final.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tessera_core::{CommitId, Error, Result, TxnId};
use tessera_durability::{truncate_log, LogReplayer};
use tessera_storage::VersionStore;
use tracing::{info, warn};

/// Statistics from one recovery run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Log records decoded
    pub records_read: usize,
    /// Committed transactions reapplied
    pub transactions_replayed: usize,
    /// Transactions without a COMMIT
    pub transactions_discarded: usize,
    /// Tuple writes reapplied
    pub writes_applied: usize,
    /// Bytes cut from a torn tail
    pub bytes_truncated: u64,
    /// Wall time spent
    pub elapsed: Duration,
}

/// Result of recovery
#[derive(Debug, Clone, Default)]
pub struct RecoveryResult {
    /// Highest durable commit id; new commits continue after it
    pub highest_commit_id: CommitId,
    /// Highest transaction id in the log
    pub max_txn_id: TxnId,
    /// Whether the log tail had to be cut
    pub truncated: bool,
    /// Counters
    pub stats: RecoveryStats,
}

/// Replays a log file into a version store
#[derive(Debug, Clone)]
pub struct RecoveryCoordinator {
    log_path: PathBuf,
}

impl RecoveryCoordinator {
    /// Recover from the log at `log_path`
    pub fn new<P: AsRef<Path>>(log_path: P) -> Self {
        Self {
            log_path: log_path.as_ref().to_path_buf(),
        }
    }

    /// Log file path
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Reapply every committed transaction to `store`
    ///
    /// `store` should be empty. A missing log file recovers nothing.
    ///
    /// # Errors
    ///
    /// - `Io` if the log cannot be read or truncated
    /// - `Corruption` if a recovered write names a slot the store cannot hold
    pub fn recover(&self, store: &VersionStore) -> Result<RecoveryResult> {
        let started = Instant::now();
        let outcome = LogReplayer::new(&self.log_path).replay()?;

        let mut writes_applied = 0;
        for txn in &outcome.transactions {
            for write in &txn.writes {
                if !store.install_recovered(write.slot, write.data.clone(), txn.commit_id) {
                    return Err(Error::Corruption(format!(
                        "txn {} wrote slot {} outside tile group capacity {}",
                        txn.txn_id,
                        write.slot,
                        store.tile_group_capacity()
                    )));
                }
                writes_applied += 1;
            }
        }

        let mut bytes_truncated = 0;
        if outcome.truncated {
            let len = std::fs::metadata(&self.log_path)?.len();
            bytes_truncated = len.saturating_sub(outcome.valid_len);
            truncate_log(&self.log_path, outcome.valid_len)?;
            warn!(
                path = %self.log_path.display(),
                valid_len = outcome.valid_len,
                bytes_truncated,
                "Truncated log tail"
            );
        }

        let stats = RecoveryStats {
            records_read: outcome.records_read,
            transactions_replayed: outcome.transactions.len(),
            transactions_discarded: outcome.discarded_transactions,
            writes_applied,
            bytes_truncated,
            elapsed: started.elapsed(),
        };
        info!(
            replayed = stats.transactions_replayed,
            writes = stats.writes_applied,
            highest_commit_id = outcome.highest_commit_id,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Recovery complete"
        );

        Ok(RecoveryResult {
            highest_commit_id: outcome.highest_commit_id,
            max_txn_id: outcome.max_txn_id,
            truncated: outcome.truncated,
            stats,
        })
    }
}
