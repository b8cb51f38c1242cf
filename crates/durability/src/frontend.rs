//! Frontend logger: group commit over all backend queues
//!
//! One flush cycle:
//! 1. Read the appended-commit watermark `G`
//! 2. Drain every backend queue
//! 3. Hold back COMMIT records above `G` for the next cycle
//! 4. Order the batch by (commit id of the owning transaction, backend id,
//!    append order); records of transactions not committing in this batch
//!    sort first with commit id 0
//! 5. Write the batch and `sync_data` it
//! 6. Publish `highest_flushed_commit_id = G` and release every waiter at
//!    or below it
//!
//! Commit ids are allocated and COMMIT records queued inside the
//! transaction manager's commit critical section, so every COMMIT at or
//! below `G` has been queued before `G` is read. That makes COMMIT order in
//! the file follow commit id order across cycles.
//!
//! # Failure
//!
//! If the write or sync fails, every pending waiter receives `LogIo` and
//! the logger refuses to acknowledge any later commit.
//!
//! # Thread Lifecycle
//!
//! - `shutdown: AtomicBool` signals the flush thread to stop
//! - `flush_thread: JoinHandle` allows waiting for thread completion
//! - the thread runs one final cycle before exiting

use crate::backend::{BackendLogger, QueuedRecord};
use crate::log_file::LogFile;
use crate::mode::DurabilityMode;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tessera_core::{CommitId, Error, Result, TxnId};
use tracing::{debug, error, info};

/// Wake-up channel shared by the backends and the flush thread
#[derive(Debug)]
pub(crate) struct FlushSignal {
    appended_commit_id: AtomicU64,
    queued: AtomicUsize,
    batch_size: usize,
    wake: Mutex<bool>,
    cvar: Condvar,
}

impl FlushSignal {
    pub(crate) fn new(batch_size: usize) -> Self {
        Self {
            appended_commit_id: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            batch_size: batch_size.max(1),
            wake: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    pub(crate) fn commit_appended(&self, cid: CommitId) {
        self.appended_commit_id.fetch_max(cid, Ordering::AcqRel);
    }

    pub(crate) fn record_queued(&self) {
        let queued = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        if queued >= self.batch_size {
            self.notify();
        }
    }

    fn consumed(&self, n: usize) {
        let _ = self
            .queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |q| {
                Some(q.saturating_sub(n))
            });
    }

    pub(crate) fn notify(&self) {
        let mut signaled = self.wake.lock();
        *signaled = true;
        self.cvar.notify_one();
    }
}

/// Completion signal of one pending commit
#[derive(Debug, Default)]
struct CommitPromise {
    outcome: Mutex<Option<std::result::Result<(), String>>>,
    ready: Condvar,
}

impl CommitPromise {
    fn fulfill(&self, outcome: std::result::Result<(), String>) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.ready.notify_all();
    }

    fn wait(&self) -> std::result::Result<(), String> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.ready.wait(&mut slot);
        }
    }
}

#[derive(Debug, Default)]
struct Waiters {
    pending: BTreeMap<CommitId, Vec<Arc<CommitPromise>>>,
    failure: Option<String>,
}

#[derive(Debug)]
struct FlushState {
    file: LogFile,
    carried: Vec<QueuedRecord>,
}

/// Group-commit flusher over a set of backend loggers
#[derive(Debug)]
pub struct FrontendLogger {
    backends: Vec<Arc<BackendLogger>>,
    signal: Arc<FlushSignal>,
    state: Mutex<FlushState>,
    flushed_commit_id: AtomicU64,
    waiters: Mutex<Waiters>,
    interval: Duration,
    immediate: bool,
    cycles: AtomicU64,
    records_flushed: AtomicU64,
    shutdown: AtomicBool,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl FrontendLogger {
    /// Create a frontend over `backend_count` fresh backends
    ///
    /// `initial_commit_id` is the highest commit id already durable (from
    /// recovery, or `0` for a new log). Call `start_flush_thread` to run
    /// cycles in the background.
    pub fn new(
        file: LogFile,
        backend_count: usize,
        mode: DurabilityMode,
        initial_commit_id: CommitId,
    ) -> Self {
        let signal = Arc::new(FlushSignal::new(mode.batch_size()));
        signal.commit_appended(initial_commit_id);
        let backends = (0..backend_count.max(1))
            .map(|id| Arc::new(BackendLogger::new(id, initial_commit_id, Arc::clone(&signal))))
            .collect();

        Self {
            backends,
            signal,
            state: Mutex::new(FlushState {
                file,
                carried: Vec::new(),
            }),
            flushed_commit_id: AtomicU64::new(initial_commit_id),
            waiters: Mutex::new(Waiters::default()),
            interval: mode.flush_interval(),
            immediate: mode.requires_immediate_fsync(),
            cycles: AtomicU64::new(0),
            records_flushed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            flush_thread: Mutex::new(None),
        }
    }

    /// Backend loggers fed by this frontend
    pub fn backends(&self) -> &[Arc<BackendLogger>] {
        &self.backends
    }

    /// Highest commit id whose COMMIT record is durable
    pub fn highest_flushed_commit_id(&self) -> CommitId {
        self.flushed_commit_id.load(Ordering::Acquire)
    }

    /// Whether a durability barrier has failed
    pub fn has_failed(&self) -> bool {
        self.waiters.lock().failure.is_some()
    }

    /// Completed flush cycles
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Records written across all cycles
    pub fn records_flushed(&self) -> u64 {
        self.records_flushed.load(Ordering::Relaxed)
    }

    /// Start the background flush thread
    pub fn start_flush_thread(self: &Arc<Self>) {
        let frontend = Arc::clone(self);
        let handle = thread::spawn(move || {
            frontend.flush_loop();
        });
        *self.flush_thread.lock() = Some(handle);
    }

    fn flush_loop(&self) {
        loop {
            {
                let mut signaled = self.signal.wake.lock();
                if !*signaled {
                    self.signal.cvar.wait_for(&mut signaled, self.interval);
                }
                *signaled = false;
            }

            if self.shutdown.load(Ordering::SeqCst) {
                if let Err(e) = self.flush_cycle() {
                    error!(error = %e, "Final log flush failed");
                }
                break;
            }

            if self.flush_cycle().is_err() {
                // Failure already reported to waiters; nothing more will be acknowledged.
                break;
            }
        }
    }

    /// Run one flush cycle now
    ///
    /// Returns the highest flushed commit id after the cycle.
    pub fn flush_cycle(&self) -> Result<CommitId> {
        let mut state = self.state.lock();
        if let Some(failure) = self.waiters.lock().failure.clone() {
            return Err(Error::LogIo(failure));
        }

        let watermark = self.signal.appended_commit_id.load(Ordering::Acquire);
        let mut drained = std::mem::take(&mut state.carried);
        let carried_in = drained.len();
        for backend in &self.backends {
            drained.extend(backend.drain());
        }
        self.signal.consumed(drained.len() - carried_in);

        let (mut batch, carried): (Vec<_>, Vec<_>) = drained
            .into_iter()
            .partition(|r| r.commit_id.map_or(true, |cid| cid <= watermark));
        state.carried = carried;

        let committing: FxHashMap<TxnId, CommitId> = batch
            .iter()
            .filter_map(|r| r.commit_id.map(|cid| (r.txn_id, cid)))
            .collect();
        batch.sort_by_key(|r| {
            let cid = committing.get(&r.txn_id).copied().unwrap_or(0);
            (cid, r.backend_id, r.seq)
        });

        if !batch.is_empty() {
            let mut bytes = Vec::with_capacity(batch.iter().map(|r| r.bytes.len()).sum());
            for record in &batch {
                bytes.extend_from_slice(&record.bytes);
            }
            if let Err(e) = state.file.append_durable(&bytes) {
                let message = format!("flush of {} records failed: {}", batch.len(), e);
                self.fail(&message);
                return Err(Error::LogIo(message));
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.records_flushed
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        let flushed = self.publish(watermark);

        if !batch.is_empty() {
            debug!(
                records = batch.len(),
                committed = committing.len(),
                carried = state.carried.len(),
                flushed_commit_id = flushed,
                "Flush cycle complete"
            );
        }
        Ok(flushed)
    }

    fn publish(&self, watermark: CommitId) -> CommitId {
        let released = {
            let mut waiters = self.waiters.lock();
            let previous = self.flushed_commit_id.fetch_max(watermark, Ordering::AcqRel);
            let flushed = previous.max(watermark);
            let still_pending = waiters.pending.split_off(&(flushed + 1));
            std::mem::replace(&mut waiters.pending, still_pending)
        };
        for promise in released.into_values().flatten() {
            promise.fulfill(Ok(()));
        }
        self.highest_flushed_commit_id()
    }

    fn fail(&self, message: &str) {
        error!(error = message, "Durability barrier failed; commits will no longer be acknowledged");
        let abandoned = {
            let mut waiters = self.waiters.lock();
            waiters.failure = Some(message.to_string());
            std::mem::take(&mut waiters.pending)
        };
        for promise in abandoned.into_values().flatten() {
            promise.fulfill(Err(message.to_string()));
        }
    }

    /// Block until the COMMIT record for `cid` is durable
    ///
    /// Returns `Err(LogIo)` once any durability barrier has failed.
    pub fn wait_until_flushed(&self, cid: CommitId) -> Result<()> {
        let promise = {
            let mut waiters = self.waiters.lock();
            if let Some(failure) = &waiters.failure {
                return Err(Error::LogIo(failure.clone()));
            }
            if cid <= self.highest_flushed_commit_id() {
                return Ok(());
            }
            let promise = Arc::new(CommitPromise::default());
            waiters
                .pending
                .entry(cid)
                .or_default()
                .push(Arc::clone(&promise));
            promise
        };

        if self.shutdown.load(Ordering::SeqCst) {
            // No flush thread left to serve the waiter.
            self.flush_cycle()?;
        } else if self.immediate {
            self.signal.notify();
        }

        promise.wait().map_err(Error::LogIo)
    }

    /// Stop the flush thread after a final cycle
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.signal.notify();
        let handle = self.flush_thread.lock().take();
        match handle {
            Some(handle) => {
                let _ = handle.join();
            }
            None => {
                if let Err(e) = self.flush_cycle() {
                    error!(error = %e, "Final log flush failed");
                }
            }
        }
        info!(
            cycles = self.cycles(),
            records = self.records_flushed(),
            flushed_commit_id = self.highest_flushed_commit_id(),
            "Frontend logger stopped"
        );
    }
}

impl Drop for FrontendLogger {
    fn drop(&mut self) {
        self.shutdown();
    }
}
