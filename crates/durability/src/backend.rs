//! Backend logger: per-worker record queue
//!
//! Each worker appends encoded records to its own backend under a private
//! lock. The frontend logger drains every backend on each flush cycle.
//! A backend never touches the log file.

use crate::frontend::FlushSignal;
use crate::record::{encode_record, LogRecord};
use parking_lot::Mutex;
use std::sync::Arc;
use tessera_core::{CommitId, Result, TxnId};
use tracing::trace;

/// An encoded record waiting for the next flush cycle
#[derive(Debug, Clone)]
pub(crate) struct QueuedRecord {
    pub txn_id: TxnId,
    pub commit_id: Option<CommitId>,
    pub backend_id: usize,
    pub seq: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct BackendQueue {
    records: Vec<QueuedRecord>,
    highest_logged_commit_id: CommitId,
    next_seq: u64,
}

/// Per-worker log queue
#[derive(Debug)]
pub struct BackendLogger {
    id: usize,
    queue: Mutex<BackendQueue>,
    signal: Arc<FlushSignal>,
}

impl BackendLogger {
    pub(crate) fn new(id: usize, initial_commit_id: CommitId, signal: Arc<FlushSignal>) -> Self {
        Self {
            id,
            queue: Mutex::new(BackendQueue {
                records: Vec::new(),
                highest_logged_commit_id: initial_commit_id,
                next_seq: 0,
            }),
            signal,
        }
    }

    /// Backend id, used to break ordering ties in the frontend merge
    pub fn id(&self) -> usize {
        self.id
    }

    /// Serialize `record` and queue it for the next flush cycle
    ///
    /// # Panics
    ///
    /// Panics if a COMMIT record does not carry a commit id strictly above
    /// every commit id previously logged on this backend.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        let bytes = encode_record(record)?;
        let commit_id = record.commit_id();

        {
            let mut queue = self.queue.lock();
            if let Some(cid) = commit_id {
                assert!(
                    cid > queue.highest_logged_commit_id,
                    "backend {}: commit id {} logged after {}",
                    self.id,
                    cid,
                    queue.highest_logged_commit_id
                );
                queue.highest_logged_commit_id = cid;
            }
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.records.push(QueuedRecord {
                txn_id: record.txn_id(),
                commit_id,
                backend_id: self.id,
                seq,
                bytes,
            });
        }

        if let Some(cid) = commit_id {
            self.signal.commit_appended(cid);
        }
        self.signal.record_queued();

        trace!(
            backend = self.id,
            txn_id = record.txn_id(),
            record_type = record.type_tag(),
            "Queued log record"
        );
        Ok(())
    }

    /// Highest commit id whose COMMIT record this backend has queued
    pub fn highest_logged_commit_id(&self) -> CommitId {
        self.queue.lock().highest_logged_commit_id
    }

    /// Records waiting for the next flush cycle
    pub fn pending(&self) -> usize {
        self.queue.lock().records.len()
    }

    pub(crate) fn drain(&self) -> Vec<QueuedRecord> {
        std::mem::take(&mut self.queue.lock().records)
    }

    /// Queue a record without publishing its commit id to the frontend
    #[cfg(test)]
    pub(crate) fn queue_for_test(&self, record: LogRecord) {
        let bytes = encode_record(&record).unwrap();
        let mut queue = self.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.records.push(QueuedRecord {
            txn_id: record.txn_id(),
            commit_id: record.commit_id(),
            backend_id: self.id,
            seq,
            bytes,
        });
    }
}
