//! Transaction manager
//!
//! Owns the transaction lifecycle for one process-wide concurrency control
//! protocol:
//!
//! - **Timestamp ordering**: writes install a pending version in place after
//!   claiming write ownership of the chain head; serializable transactions
//!   validate their read set at commit.
//! - **Two-phase locking**: as above, but every read takes a shared lock
//!   and every write an exclusive one, held until commit or abort.
//! - **Optimistic copy**: writes are buffered privately and installed at
//!   commit after validation against transactions that committed since
//!   this one started.
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. Enter the commit critical section
//! 2. Validate (protocol specific); on failure roll back and return
//! 3. Install buffered writes (optimistic copy only)
//! 4. commit_id = last_commit_id + 1
//! 5. Append COMMIT to the transaction's backend logger
//! 6. Stamp created versions begin = commit_id, superseded end = commit_id
//! 7. Publish last_commit_id, release write ownership
//! 8. Leave the critical section, release locks, deregister
//! 9. Wait until the frontend logger reports commit_id durable
//! ```
//!
//! Appending the COMMIT inside the critical section keeps commit ids in
//! append order, which the frontend logger relies on to flush them in order.
//!
//! Any conflict, deadlock or timeout raised inside an operation rolls the
//! transaction back before the error is returned.

use crate::lock_table::{LockMode, LockTable, DEFAULT_LOCK_TIMEOUT};
use crate::registry::ActiveTransactionRegistry;
use crate::transaction::{
    merge_kind, BufferedWrite, TransactionContext, TransactionStatus, WriteEntry,
};
use crate::validation::{validate_occ, validate_read_set, CommitHistory, ValidationResult};
use crate::visibility;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    CommitId, ConcurrencyProtocol, Error, IsolationLevel, Result, Tuple, TupleSlot, TxnId,
    WriteKind, CURRENT_CID, INITIAL_CID, INVALID_TXN_ID,
};
use tessera_durability::{LogManager, LogRecord};
use tessera_storage::{TupleVersion, VersionStore};
use tracing::{debug, trace, warn};

/// Transaction manager settings, fixed for the life of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionManagerConfig {
    /// Concurrency control protocol
    pub protocol: ConcurrencyProtocol,
    /// Isolation level used by `begin`
    pub isolation: IsolationLevel,
    /// Bound on a single lock wait (two-phase locking)
    pub lock_timeout: Duration,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            protocol: ConcurrencyProtocol::default(),
            isolation: IsolationLevel::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

impl TransactionManagerConfig {
    /// Settings for `protocol` with default isolation and timeout
    pub fn new(protocol: ConcurrencyProtocol) -> Self {
        Self {
            protocol,
            ..Self::default()
        }
    }

    /// Set the default isolation level
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Set the lock wait bound
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

/// Counters since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    /// Transactions begun
    pub started: u64,
    /// Transactions committed
    pub committed: u64,
    /// Transactions rolled back, explicitly or by a conflict
    pub aborted: u64,
    /// Transactions currently registered
    pub active: usize,
    /// Last published commit id
    pub last_commit_id: CommitId,
}

#[derive(Debug, Default)]
struct CommitState {
    history: CommitHistory,
}

/// Coordinates transactions over a shared version store
///
/// Thread-safe; share it behind an `Arc`. Each `TransactionContext` is used
/// by one thread at a time.
#[derive(Debug)]
pub struct TransactionManager {
    config: TransactionManagerConfig,
    store: Arc<VersionStore>,
    log: Arc<LogManager>,
    registry: ActiveTransactionRegistry,
    locks: LockTable,

    /// Next transaction id
    next_txn_id: AtomicU64,
    /// Highest published commit id
    last_commit_id: AtomicU64,
    /// Commit critical section
    commit_state: Mutex<CommitState>,
    /// Begin takes the shared side while it reads its snapshot and
    /// registers; commit publication and the reclamation watermark take
    /// the exclusive side.
    snapshot_gate: RwLock<()>,

    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TransactionManager {
    /// Create a manager for an empty store
    pub fn new(
        config: TransactionManagerConfig,
        store: Arc<VersionStore>,
        log: Arc<LogManager>,
    ) -> Self {
        Self::with_ids(config, store, log, INITIAL_CID, INVALID_TXN_ID)
    }

    /// Create a manager that continues after recovered ids
    ///
    /// New commit ids start at `last_commit_id + 1` and new transaction ids
    /// at `max_txn_id + 1`.
    pub fn with_ids(
        config: TransactionManagerConfig,
        store: Arc<VersionStore>,
        log: Arc<LogManager>,
        last_commit_id: CommitId,
        max_txn_id: TxnId,
    ) -> Self {
        Self {
            config,
            store,
            log,
            registry: ActiveTransactionRegistry::new(),
            locks: LockTable::new(config.lock_timeout),
            next_txn_id: AtomicU64::new(max_txn_id + 1),
            last_commit_id: AtomicU64::new(last_commit_id),
            commit_state: Mutex::new(CommitState::default()),
            snapshot_gate: RwLock::new(()),
            started: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    /// Active protocol
    pub fn protocol(&self) -> ConcurrencyProtocol {
        self.config.protocol
    }

    /// Isolation level used by `begin`
    pub fn default_isolation(&self) -> IsolationLevel {
        self.config.isolation
    }

    /// Underlying version store
    pub fn store(&self) -> &Arc<VersionStore> {
        &self.store
    }

    /// Underlying log manager
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// Live transaction registry
    pub fn registry(&self) -> &ActiveTransactionRegistry {
        &self.registry
    }

    /// Highest published commit id
    pub fn last_commit_id(&self) -> CommitId {
        self.last_commit_id.load(Ordering::Acquire)
    }

    /// Number of live transactions
    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Counters since startup
    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            active: self.registry.len(),
            last_commit_id: self.last_commit_id(),
        }
    }

    /// Reserve a fresh, never used slot for an insert
    pub fn allocate_slot(&self) -> TupleSlot {
        self.store.allocate_slot()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Begin a transaction at the default isolation level
    pub fn begin(&self) -> TransactionContext {
        self.begin_with_isolation(self.config.isolation)
    }

    /// Begin a transaction at `isolation`
    pub fn begin_with_isolation(&self, isolation: IsolationLevel) -> TransactionContext {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let handle = {
            let _gate = self.snapshot_gate.read();
            let start_cid = self.last_commit_id.load(Ordering::Acquire);
            self.registry.register(id, start_cid, isolation)
        };
        let backend = id as usize;
        if let Err(e) = self.log.log(backend, &LogRecord::Begin { txn_id: id }) {
            warn!(txn_id = id, error = %e, "Failed to queue BEGIN record");
        }
        self.started.fetch_add(1, Ordering::Relaxed);
        trace!(txn_id = id, start_cid = handle.start_cid(), ?isolation, "Began transaction");
        TransactionContext::new(handle, backend)
    }

    /// Commit `ctx`
    ///
    /// Returns the assigned commit id once the COMMIT record is durable.
    ///
    /// # Errors
    ///
    /// - `SerializationConflict` if validation fails; the transaction is
    ///   rolled back
    /// - `TransactionNotActive` if `ctx` already finished
    /// - `LogIo` if the log failed; the commit is applied in memory but
    ///   was not acknowledged as durable
    pub fn commit(&self, ctx: &mut TransactionContext) -> Result<CommitId> {
        self.check_active(ctx)?;
        ctx.set_status(TransactionStatus::Committing);
        let txn_id = ctx.id();

        let commit_id = {
            let mut state = self.commit_state.lock();

            if let Some(err) = self.validate(ctx, &state).into_error() {
                drop(state);
                debug!(txn_id, error = %err, "Validation failed");
                self.rollback(ctx);
                return Err(err);
            }

            if self.config.protocol == ConcurrencyProtocol::OptimisticCopy {
                if let Err(err) = self.install_buffered(ctx) {
                    drop(state);
                    self.rollback(ctx);
                    return Err(err);
                }
            }

            let commit_id = self.last_commit_id.load(Ordering::Acquire) + 1;
            if let Err(err) = self.log.log(ctx.backend, &LogRecord::Commit { txn_id, commit_id }) {
                drop(state);
                self.rollback(ctx);
                return Err(err);
            }

            self.stamp(ctx, commit_id);
            if self.config.protocol == ConcurrencyProtocol::OptimisticCopy {
                state.history.record(commit_id, ctx.written_slots());
            }
            self.publish(&mut state, commit_id);
            self.release_ownership(ctx);
            commit_id
        };

        ctx.commit_id = Some(commit_id);
        let writes = ctx.write_count();
        self.finish(ctx, TransactionStatus::Committed);
        self.committed.fetch_add(1, Ordering::Relaxed);
        debug!(txn_id, commit_id, writes, "Committed transaction");

        self.log.wait_until_flushed(commit_id)?;
        Ok(commit_id)
    }

    /// Roll back `ctx`
    ///
    /// Idempotent: returns the final status without doing anything if the
    /// transaction already finished.
    pub fn abort(&self, ctx: &mut TransactionContext) -> TransactionStatus {
        self.rollback(ctx);
        ctx.status()
    }

    // ========================================================================
    // Data operations
    // ========================================================================

    /// Read the version of `slot` visible to `ctx`
    ///
    /// `Ok(None)` means no version is visible: the slot is empty, holds only
    /// versions committed after the read timestamp, or the row is deleted.
    pub fn read(&self, ctx: &mut TransactionContext, slot: TupleSlot) -> Result<Option<Tuple>> {
        self.check_active(ctx)?;

        if let Some(buffered) = ctx.buffer.get(&slot) {
            return Ok(buffered.data.clone());
        }

        let two_phase = self.config.protocol == ConcurrencyProtocol::TwoPhaseLocking;
        if two_phase {
            self.lock(ctx, slot, LockMode::Shared)?;
        }

        let read_ts = self.read_timestamp(ctx);
        let data = visibility::read_visible(&self.store, slot, ctx.id(), read_ts);
        ctx.read_set.insert(slot);

        if two_phase && ctx.isolation() == IsolationLevel::ReadCommitted {
            self.locks.release_shared(ctx.id(), slot);
        }
        Ok(data)
    }

    /// Insert `tuple` at an empty slot
    ///
    /// # Errors
    ///
    /// - `SlotOccupied` if the slot already has a version chain
    /// - `WriteConflict` if another live transaction's insert holds the slot
    /// - `TupleNotFound` if the slot was never allocated
    pub fn insert(&self, ctx: &mut TransactionContext, slot: TupleSlot, tuple: Tuple) -> Result<()> {
        self.write(ctx, slot, WriteKind::Insert, Some(tuple))
    }

    /// Replace the row at `slot` with `tuple`
    ///
    /// # Errors
    ///
    /// - `WriteConflict` if another transaction owns the newest version, or
    ///   (snapshot and serializable levels) it committed after `ctx` began
    /// - `TupleNotFound` if there is no row to update
    pub fn update(&self, ctx: &mut TransactionContext, slot: TupleSlot, tuple: Tuple) -> Result<()> {
        self.write(ctx, slot, WriteKind::Update, Some(tuple))
    }

    /// Delete the row at `slot`
    ///
    /// Installs a tombstone version; errors as for `update`.
    pub fn delete(&self, ctx: &mut TransactionContext, slot: TupleSlot) -> Result<()> {
        self.write(ctx, slot, WriteKind::Delete, None)
    }

    // ========================================================================
    // Version reclamation
    // ========================================================================

    /// Oldest commit id any live or future transaction can read at
    ///
    /// Retired versions with an epoch below this value are unreachable.
    pub fn gc_watermark(&self) -> CommitId {
        let _gate = self.snapshot_gate.write();
        let next = self.last_commit_id.load(Ordering::Acquire) + 1;
        let mut watermark = self
            .registry
            .min_start_cid()
            .map_or(next, |oldest| oldest.min(next));
        if self.log.is_enabled() {
            watermark = watermark.min(self.log.highest_logged_commit_id() + 1);
        }
        watermark
    }

    /// Reclaim every retired version below the current watermark
    pub fn collect_garbage(&self) -> usize {
        let watermark = self.gc_watermark();
        self.store.collect(watermark)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_active(&self, ctx: &mut TransactionContext) -> Result<()> {
        if !ctx.is_active() {
            return Err(Error::TransactionNotActive(ctx.id()));
        }
        if ctx.handle().is_doomed() {
            let victim = ctx.id();
            self.rollback(ctx);
            return Err(Error::Deadlock { victim });
        }
        Ok(())
    }

    /// Roll back on conflict-class errors, then hand the error back
    fn fail<T>(&self, ctx: &mut TransactionContext, err: Error) -> Result<T> {
        if err.is_retryable() {
            debug!(txn_id = ctx.id(), error = %err, "Operation conflicted");
            self.rollback(ctx);
        }
        Err(err)
    }

    fn lock(&self, ctx: &mut TransactionContext, slot: TupleSlot, mode: LockMode) -> Result<()> {
        match self
            .locks
            .acquire(ctx.handle(), slot, mode, &self.registry)
        {
            Ok(()) => Ok(()),
            Err(err) => self.fail(ctx, err),
        }
    }

    fn read_timestamp(&self, ctx: &TransactionContext) -> CommitId {
        if ctx.isolation().uses_start_snapshot() {
            ctx.start_cid()
        } else {
            self.last_commit_id.load(Ordering::Acquire)
        }
    }

    fn write(
        &self,
        ctx: &mut TransactionContext,
        slot: TupleSlot,
        kind: WriteKind,
        data: Option<Tuple>,
    ) -> Result<()> {
        self.check_active(ctx)?;
        match self.config.protocol {
            ConcurrencyProtocol::OptimisticCopy => self.buffer_write(ctx, slot, kind, data),
            ConcurrencyProtocol::TwoPhaseLocking => {
                self.lock(ctx, slot, LockMode::Exclusive)?;
                match self.install(ctx, slot, kind, data) {
                    Ok(()) => Ok(()),
                    Err(err) => self.fail(ctx, err),
                }
            }
            ConcurrencyProtocol::TimestampOrdering => match self.install(ctx, slot, kind, data) {
                Ok(()) => Ok(()),
                Err(err) => self.fail(ctx, err),
            },
        }
    }

    /// Install a pending version at the head of `slot` and log it
    fn install(
        &self,
        ctx: &mut TransactionContext,
        slot: TupleSlot,
        kind: WriteKind,
        data: Option<Tuple>,
    ) -> Result<()> {
        if !self.store.contains_slot(slot) {
            return Err(Error::TupleNotFound(slot));
        }
        let record = self.log.is_enabled().then(|| write_record(ctx.id(), slot, kind, &data));

        let head = self.store.head(slot);
        match (kind, head) {
            (WriteKind::Insert, Some(head)) => return Err(insert_conflict(ctx, &head)),
            (WriteKind::Insert, None) => {
                let version = self.store.alloc_pending(slot, ctx.id(), data, None);
                if !self.store.cas_head(slot, None, Some(version.id())) {
                    self.store.discard(version.id());
                    return Err(match self.store.head(slot) {
                        Some(winner) => insert_conflict(ctx, &winner),
                        // the winner already rolled back
                        None => Error::WriteConflict {
                            slot,
                            holder: INVALID_TXN_ID,
                        },
                    });
                }
                ctx.record_write(WriteEntry {
                    slot,
                    kind,
                    created: version.id(),
                    superseded: None,
                });
            }
            (_, None) => return Err(Error::TupleNotFound(slot)),
            (_, Some(head)) if head.is_own_pending(ctx.id()) => {
                self.rewrite_own(ctx, &head, kind, data)?;
            }
            (_, Some(head)) => {
                if let Err(holder) = head.try_claim(ctx.id()) {
                    return Err(Error::WriteConflict { slot, holder });
                }
                if let Err(err) = self.check_supersede(ctx, &head) {
                    head.release(ctx.id());
                    return Err(err);
                }
                let version = self
                    .store
                    .alloc_pending(slot, ctx.id(), data, Some(head.id()));
                if !self
                    .store
                    .cas_head(slot, Some(head.id()), Some(version.id()))
                {
                    head.release(ctx.id());
                    self.store.discard(version.id());
                    return Err(Error::WriteConflict {
                        slot,
                        holder: INVALID_TXN_ID,
                    });
                }
                ctx.record_write(WriteEntry {
                    slot,
                    kind,
                    created: version.id(),
                    superseded: Some(head.id()),
                });
            }
        }

        if let Some(record) = record {
            self.log.log(ctx.backend, &record)?;
        }
        Ok(())
    }

    /// Whether `ctx` may supersede the committed, claimed `head`
    fn check_supersede(&self, ctx: &TransactionContext, head: &TupleVersion) -> Result<()> {
        let slot = head.slot();
        // unlinked by an abort, or already superseded by a commit
        if !head.is_committed() || head.end_cid() != CURRENT_CID {
            return Err(Error::WriteConflict {
                slot,
                holder: INVALID_TXN_ID,
            });
        }
        // a snapshot writer may not replace a version it cannot see
        if ctx.isolation().uses_start_snapshot() && head.begin_cid() > ctx.start_cid() {
            return Err(Error::WriteConflict {
                slot,
                holder: INVALID_TXN_ID,
            });
        }
        if head.is_tombstone() {
            return Err(Error::TupleNotFound(slot));
        }
        Ok(())
    }

    /// Replace this transaction's own pending head version
    fn rewrite_own(
        &self,
        ctx: &mut TransactionContext,
        head: &TupleVersion,
        kind: WriteKind,
        data: Option<Tuple>,
    ) -> Result<()> {
        let slot = head.slot();
        if head.is_tombstone() {
            return Err(Error::TupleNotFound(slot));
        }
        let version = self.store.alloc_pending(slot, ctx.id(), data, head.older());
        if !self
            .store
            .cas_head(slot, Some(head.id()), Some(version.id()))
        {
            self.store.discard(version.id());
            return Err(Error::WriteConflict {
                slot,
                holder: ctx.id(),
            });
        }
        // Never visible to anyone else; a reader that already loaded it
        // skips it and follows its older link.
        self.store
            .retire(head.id(), self.last_commit_id.load(Ordering::Acquire));

        if let Some(entry) = ctx.write_entry_mut(slot) {
            entry.created = version.id();
            entry.kind = merge_kind(entry.kind, kind);
        }
        Ok(())
    }

    /// Stage a write for commit (optimistic copy)
    fn buffer_write(
        &self,
        ctx: &mut TransactionContext,
        slot: TupleSlot,
        kind: WriteKind,
        data: Option<Tuple>,
    ) -> Result<()> {
        if let Some(existing) = ctx.buffer.get_mut(&slot) {
            if kind == WriteKind::Insert {
                return Err(Error::SlotOccupied(slot));
            }
            if existing.data.is_none() {
                return Err(Error::TupleNotFound(slot));
            }
            if existing.kind == WriteKind::Insert && kind == WriteKind::Delete {
                ctx.buffer.remove(&slot);
                return Ok(());
            }
            existing.kind = merge_kind(existing.kind, kind);
            existing.data = data;
            return Ok(());
        }

        if !self.store.contains_slot(slot) {
            return Err(Error::TupleNotFound(slot));
        }
        match kind {
            WriteKind::Insert => {
                if self.store.head_id(slot).is_some() {
                    return Err(Error::SlotOccupied(slot));
                }
            }
            WriteKind::Update | WriteKind::Delete => {
                let read_ts = self.read_timestamp(ctx);
                if visibility::visible_version(&self.store, slot, ctx.id(), read_ts).is_none() {
                    return Err(Error::TupleNotFound(slot));
                }
            }
        }
        ctx.buffer.insert(slot, BufferedWrite { kind, data });
        Ok(())
    }

    /// Install every buffered write, in slot order (optimistic copy)
    fn install_buffered(&self, ctx: &mut TransactionContext) -> Result<()> {
        let buffer = std::mem::take(&mut ctx.buffer);
        for (slot, write) in buffer {
            self.install(ctx, slot, write.kind, write.data)?;
        }
        Ok(())
    }

    fn validate(&self, ctx: &TransactionContext, state: &CommitState) -> ValidationResult {
        match self.config.protocol {
            ConcurrencyProtocol::TimestampOrdering
                if ctx.isolation() == IsolationLevel::Serializable =>
            {
                validate_read_set(ctx, &self.store)
            }
            ConcurrencyProtocol::OptimisticCopy => validate_occ(ctx, &state.history),
            _ => ValidationResult::ok(),
        }
    }

    /// Make every created version visible from `commit_id`
    fn stamp(&self, ctx: &TransactionContext, commit_id: CommitId) {
        for entry in &ctx.write_set {
            if let Some(created) = self.store.version(entry.created) {
                created.set_begin_cid(commit_id);
            }
            if let Some(old_id) = entry.superseded {
                if let Some(old) = self.store.version(old_id) {
                    old.set_end_cid(commit_id);
                }
                self.store.retire(old_id, commit_id);
            }
        }
    }

    /// Publish `commit_id` and drop commit history no snapshot can need
    ///
    /// Runs under the exclusive snapshot gate, so a concurrent `begin`
    /// either registered before the prune floor was taken or starts at
    /// `commit_id` or later.
    fn publish(&self, state: &mut CommitState, commit_id: CommitId) {
        let _gate = self.snapshot_gate.write();
        if self.config.protocol == ConcurrencyProtocol::OptimisticCopy {
            let floor = self.registry.min_start_cid().unwrap_or(commit_id);
            state.history.prune(floor);
        }
        self.last_commit_id.store(commit_id, Ordering::Release);
    }

    fn release_ownership(&self, ctx: &TransactionContext) {
        for entry in &ctx.write_set {
            if let Some(created) = self.store.version(entry.created) {
                created.release(ctx.id());
            }
            if let Some(old) = entry.superseded.and_then(|id| self.store.version(id)) {
                old.release(ctx.id());
            }
        }
    }

    /// Undo every installed version and finish as aborted
    fn rollback(&self, ctx: &mut TransactionContext) {
        if ctx.status().is_final() {
            return;
        }
        let txn_id = ctx.id();

        for entry in ctx.write_set.iter().rev() {
            if let Some(created) = self.store.version(entry.created) {
                if !self.store.unlink_head(&created) {
                    warn!(txn_id, slot = %entry.slot, "Pending version was not the chain head");
                }
                created.release(txn_id);
            }
            if let Some(old) = entry.superseded.and_then(|id| self.store.version(id)) {
                old.release(txn_id);
            }
            // read after the unlink: no reader starting later can reach it
            let epoch = self.last_commit_id.load(Ordering::Acquire);
            self.store.retire(entry.created, epoch);
        }
        let undone = ctx.write_count();
        ctx.clear_writes();

        if let Err(e) = self.log.log(ctx.backend, &LogRecord::Abort { txn_id }) {
            warn!(txn_id, error = %e, "Failed to queue ABORT record");
        }
        self.finish(ctx, TransactionStatus::Aborted);
        self.aborted.fetch_add(1, Ordering::Relaxed);
        debug!(txn_id, undone, "Aborted transaction");
    }

    fn finish(&self, ctx: &mut TransactionContext, status: TransactionStatus) {
        if self.config.protocol == ConcurrencyProtocol::TwoPhaseLocking {
            self.locks.release_all(ctx.id());
        }
        self.registry.deregister(ctx.id());
        ctx.set_status(status);
    }
}

/// Error for an insert that found `head` already in its slot
///
/// Another transaction's uncommitted insert is a write conflict; it may
/// still roll back and free the slot. Anything else occupies the slot.
fn insert_conflict(ctx: &TransactionContext, head: &TupleVersion) -> Error {
    if !head.is_committed() && head.txn_id() != ctx.id() {
        Error::WriteConflict {
            slot: head.slot(),
            holder: head.txn_id(),
        }
    } else {
        Error::SlotOccupied(head.slot())
    }
}

fn write_record(txn_id: TxnId, slot: TupleSlot, kind: WriteKind, data: &Option<Tuple>) -> LogRecord {
    match (kind, data) {
        (WriteKind::Delete, _) | (_, None) => LogRecord::TupleDelete { txn_id, slot },
        (WriteKind::Insert, Some(tuple)) => LogRecord::TupleInsert {
            txn_id,
            slot,
            tuple: tuple.clone(),
        },
        (WriteKind::Update, Some(tuple)) => LogRecord::TupleUpdate {
            txn_id,
            slot,
            tuple: tuple.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Value;

    fn row(v: i64) -> Tuple {
        Tuple::new(vec![Value::Int(v)])
    }

    fn manager(protocol: ConcurrencyProtocol) -> TransactionManager {
        TransactionManager::new(
            TransactionManagerConfig::new(protocol)
                .with_lock_timeout(Duration::from_millis(50)),
            Arc::new(VersionStore::new(16)),
            Arc::new(LogManager::disabled()),
        )
    }

    const ALL: [ConcurrencyProtocol; 3] = [
        ConcurrencyProtocol::TimestampOrdering,
        ConcurrencyProtocol::TwoPhaseLocking,
        ConcurrencyProtocol::OptimisticCopy,
    ];

    /// Commit one row and return its slot
    fn seed(tm: &TransactionManager, v: i64) -> TupleSlot {
        let slot = tm.allocate_slot();
        let mut ctx = tm.begin();
        tm.insert(&mut ctx, slot, row(v)).unwrap();
        tm.commit(&mut ctx).unwrap();
        slot
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[test]
    fn test_commit_ids_are_sequential() {
        for protocol in ALL {
            let tm = manager(protocol);
            let a = seed(&tm, 1);
            let b = seed(&tm, 2);
            assert_ne!(a, b);
            assert_eq!(tm.last_commit_id(), 2, "{protocol}");
            assert_eq!(tm.stats().committed, 2);
            assert_eq!(tm.active_count(), 0);
        }
    }

    #[test]
    fn test_with_ids_continues_counters() {
        let tm = TransactionManager::with_ids(
            TransactionManagerConfig::default(),
            Arc::new(VersionStore::new(16)),
            Arc::new(LogManager::disabled()),
            41,
            99,
        );
        let mut ctx = tm.begin();
        assert_eq!(ctx.id(), 100);
        assert_eq!(ctx.start_cid(), 41);
        assert_eq!(tm.commit(&mut ctx).unwrap(), 42);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let tm = manager(ConcurrencyProtocol::TimestampOrdering);
        let mut ctx = tm.begin();
        assert_eq!(tm.abort(&mut ctx), TransactionStatus::Aborted);
        assert_eq!(tm.abort(&mut ctx), TransactionStatus::Aborted);
        assert_eq!(tm.stats().aborted, 1);
        assert!(matches!(
            tm.commit(&mut ctx),
            Err(Error::TransactionNotActive(_))
        ));
    }

    #[test]
    fn test_finished_context_rejects_operations() {
        let tm = manager(ConcurrencyProtocol::TimestampOrdering);
        let slot = seed(&tm, 1);
        let mut ctx = tm.begin();
        tm.commit(&mut ctx).unwrap();
        assert!(matches!(
            tm.read(&mut ctx, slot),
            Err(Error::TransactionNotActive(_))
        ));
        assert_eq!(tm.abort(&mut ctx), TransactionStatus::Committed);
    }

    // ========================================================================
    // Reads and writes
    // ========================================================================

    #[test]
    fn test_read_own_writes() {
        for protocol in ALL {
            let tm = manager(protocol);
            let slot = tm.allocate_slot();
            let mut ctx = tm.begin();
            assert_eq!(tm.read(&mut ctx, slot).unwrap(), None);
            tm.insert(&mut ctx, slot, row(1)).unwrap();
            assert_eq!(tm.read(&mut ctx, slot).unwrap(), Some(row(1)), "{protocol}");
            tm.update(&mut ctx, slot, row(2)).unwrap();
            assert_eq!(tm.read(&mut ctx, slot).unwrap(), Some(row(2)), "{protocol}");
            tm.commit(&mut ctx).unwrap();

            let mut reader = tm.begin();
            assert_eq!(tm.read(&mut reader, slot).unwrap(), Some(row(2)));
            tm.commit(&mut reader).unwrap();
        }
    }

    #[test]
    fn test_delete_hides_row_and_blocks_second_delete() {
        for protocol in ALL {
            let tm = manager(protocol);
            let slot = seed(&tm, 1);

            let mut ctx = tm.begin();
            tm.delete(&mut ctx, slot).unwrap();
            assert_eq!(tm.read(&mut ctx, slot).unwrap(), None);
            assert!(matches!(
                tm.update(&mut ctx, slot, row(2)),
                Err(Error::TupleNotFound(_))
            ));
            tm.commit(&mut ctx).unwrap();

            let mut later = tm.begin();
            assert_eq!(tm.read(&mut later, slot).unwrap(), None);
            assert!(matches!(
                tm.delete(&mut later, slot),
                Err(Error::TupleNotFound(_))
            ));
            assert!(later.is_active(), "{protocol}");
            tm.abort(&mut later);
        }
    }

    #[test]
    fn test_insert_into_occupied_slot() {
        for protocol in ALL {
            let tm = manager(protocol);
            let slot = seed(&tm, 1);
            let mut ctx = tm.begin();
            assert!(matches!(
                tm.insert(&mut ctx, slot, row(2)),
                Err(Error::SlotOccupied(_))
            ));
            tm.abort(&mut ctx);
        }
    }

    #[test]
    fn test_insert_over_pending_insert_conflicts() {
        let tm = manager(ConcurrencyProtocol::TimestampOrdering);
        let slot = tm.allocate_slot();

        let mut a = tm.begin();
        tm.insert(&mut a, slot, row(1)).unwrap();

        let mut b = tm.begin();
        let err = tm.insert(&mut b, slot, row(2)).unwrap_err();
        assert!(matches!(err, Error::WriteConflict { holder, .. } if holder == a.id()));
        assert!(err.is_retryable());
        assert_eq!(b.status(), TransactionStatus::Aborted);

        // the slot is free again once the first inserter rolls back
        tm.abort(&mut a);
        let mut c = tm.begin();
        tm.insert(&mut c, slot, row(3)).unwrap();
        tm.commit(&mut c).unwrap();

        let mut reader = tm.begin();
        assert_eq!(tm.read(&mut reader, slot).unwrap(), Some(row(3)));
        tm.commit(&mut reader).unwrap();
    }

    #[test]
    fn test_abort_restores_previous_version() {
        for protocol in ALL {
            let tm = manager(protocol);
            let slot = seed(&tm, 1);

            let mut ctx = tm.begin();
            tm.update(&mut ctx, slot, row(2)).unwrap();
            tm.update(&mut ctx, slot, row(3)).unwrap();
            tm.abort(&mut ctx);

            let mut reader = tm.begin();
            assert_eq!(tm.read(&mut reader, slot).unwrap(), Some(row(1)), "{protocol}");
            tm.commit(&mut reader).unwrap();
            assert_eq!(tm.store().committed_intervals(slot).len(), 1);
        }
    }

    #[test]
    fn test_aborted_insert_frees_nothing_for_reuse() {
        let tm = manager(ConcurrencyProtocol::TimestampOrdering);
        let slot = tm.allocate_slot();
        let mut ctx = tm.begin();
        tm.insert(&mut ctx, slot, row(1)).unwrap();
        tm.abort(&mut ctx);
        assert!(tm.store().head(slot).is_none());

        let mut reader = tm.begin();
        assert_eq!(tm.read(&mut reader, slot).unwrap(), None);
        tm.commit(&mut reader).unwrap();
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    #[test]
    fn test_timestamp_ordering_write_conflict_aborts_loser() {
        let tm = manager(ConcurrencyProtocol::TimestampOrdering);
        let slot = seed(&tm, 1);

        let mut a = tm.begin();
        let mut b = tm.begin();
        tm.update(&mut a, slot, row(2)).unwrap();
        let err = tm.update(&mut b, slot, row(3)).unwrap_err();
        assert!(matches!(err, Error::WriteConflict { holder, .. } if holder == a.id()));
        assert_eq!(b.status(), TransactionStatus::Aborted);

        tm.commit(&mut a).unwrap();
    }

    #[test]
    fn test_first_updater_wins_after_commit() {
        let tm = manager(ConcurrencyProtocol::TimestampOrdering);
        let slot = seed(&tm, 1);

        let mut a = tm.begin();
        let mut b = tm.begin();
        tm.update(&mut a, slot, row(2)).unwrap();
        tm.commit(&mut a).unwrap();

        assert!(matches!(
            tm.update(&mut b, slot, row(3)),
            Err(Error::WriteConflict { .. })
        ));
    }

    #[test]
    fn test_read_committed_may_overwrite_newer_commit() {
        let tm = manager(ConcurrencyProtocol::TimestampOrdering);
        let slot = seed(&tm, 1);

        let mut a = tm.begin();
        let mut b = tm.begin_with_isolation(IsolationLevel::ReadCommitted);
        tm.update(&mut a, slot, row(2)).unwrap();
        tm.commit(&mut a).unwrap();

        assert_eq!(tm.read(&mut b, slot).unwrap(), Some(row(2)));
        tm.update(&mut b, slot, row(3)).unwrap();
        tm.commit(&mut b).unwrap();
    }

    #[test]
    fn test_serializable_read_validation() {
        let tm = manager(ConcurrencyProtocol::TimestampOrdering);
        let x = seed(&tm, 1);
        let y = seed(&tm, 1);

        let mut a = tm.begin();
        assert_eq!(tm.read(&mut a, x).unwrap(), Some(row(1)));

        let mut b = tm.begin();
        tm.update(&mut b, x, row(2)).unwrap();
        tm.commit(&mut b).unwrap();

        tm.update(&mut a, y, row(5)).unwrap();
        assert!(matches!(
            tm.commit(&mut a),
            Err(Error::SerializationConflict { .. })
        ));
        assert_eq!(a.status(), TransactionStatus::Aborted);

        let mut reader = tm.begin();
        assert_eq!(tm.read(&mut reader, y).unwrap(), Some(row(1)));
        tm.commit(&mut reader).unwrap();
    }

    #[test]
    fn test_snapshot_isolation_skips_read_validation() {
        let tm = manager(ConcurrencyProtocol::TimestampOrdering);
        let x = seed(&tm, 1);
        let y = seed(&tm, 1);

        let mut a = tm.begin_with_isolation(IsolationLevel::SnapshotIsolation);
        tm.read(&mut a, x).unwrap();
        let mut b = tm.begin();
        tm.update(&mut b, x, row(2)).unwrap();
        tm.commit(&mut b).unwrap();

        tm.update(&mut a, y, row(5)).unwrap();
        tm.commit(&mut a).unwrap();
    }

    #[test]
    fn test_optimistic_second_committer_fails() {
        let tm = manager(ConcurrencyProtocol::OptimisticCopy);
        let slot = seed(&tm, 1);

        let mut a = tm.begin();
        let mut b = tm.begin();
        tm.update(&mut a, slot, row(2)).unwrap();
        tm.update(&mut b, slot, row(3)).unwrap();

        tm.commit(&mut a).unwrap();
        assert!(matches!(
            tm.commit(&mut b),
            Err(Error::SerializationConflict { .. })
        ));

        let mut reader = tm.begin();
        assert_eq!(tm.read(&mut reader, slot).unwrap(), Some(row(2)));
        tm.commit(&mut reader).unwrap();
    }

    #[test]
    fn test_optimistic_writes_invisible_until_commit() {
        let tm = manager(ConcurrencyProtocol::OptimisticCopy);
        let slot = seed(&tm, 1);

        let mut a = tm.begin();
        tm.update(&mut a, slot, row(2)).unwrap();
        assert_eq!(tm.store().committed_intervals(slot).len(), 1);
        assert!(tm.store().head(slot).unwrap().is_committed());

        let mut other = tm.begin();
        assert_eq!(tm.read(&mut other, slot).unwrap(), Some(row(1)));
        tm.commit(&mut other).unwrap();
        tm.commit(&mut a).unwrap();
    }

    #[test]
    fn test_optimistic_insert_then_delete_is_noop() {
        let tm = manager(ConcurrencyProtocol::OptimisticCopy);
        let slot = tm.allocate_slot();
        let mut ctx = tm.begin();
        tm.insert(&mut ctx, slot, row(1)).unwrap();
        tm.delete(&mut ctx, slot).unwrap();
        assert_eq!(tm.read(&mut ctx, slot).unwrap(), None);
        tm.commit(&mut ctx).unwrap();
        assert!(tm.store().head(slot).is_none());
    }

    #[test]
    fn test_two_phase_reader_blocks_writer() {
        let tm = manager(ConcurrencyProtocol::TwoPhaseLocking);
        let slot = seed(&tm, 1);

        let mut reader = tm.begin();
        tm.read(&mut reader, slot).unwrap();

        let mut writer = tm.begin();
        assert!(matches!(
            tm.update(&mut writer, slot, row(2)),
            Err(Error::LockTimeout { .. })
        ));
        assert_eq!(writer.status(), TransactionStatus::Aborted);
        tm.commit(&mut reader).unwrap();
    }

    #[test]
    fn test_two_phase_read_committed_releases_shared_lock() {
        let tm = manager(ConcurrencyProtocol::TwoPhaseLocking);
        let slot = seed(&tm, 1);

        let mut reader = tm.begin_with_isolation(IsolationLevel::ReadCommitted);
        tm.read(&mut reader, slot).unwrap();

        let mut writer = tm.begin();
        tm.update(&mut writer, slot, row(2)).unwrap();
        tm.commit(&mut writer).unwrap();

        assert_eq!(tm.read(&mut reader, slot).unwrap(), Some(row(2)));
        tm.commit(&mut reader).unwrap();
    }

    #[test]
    fn test_two_phase_snapshot_reads_at_start() {
        let tm = manager(ConcurrencyProtocol::TwoPhaseLocking);
        let slot = seed(&tm, 1);
        let fresh = tm.allocate_slot();

        let mut snapshot = tm.begin_with_isolation(IsolationLevel::SnapshotIsolation);
        let mut writer = tm.begin();
        tm.update(&mut writer, slot, row(2)).unwrap();
        tm.insert(&mut writer, fresh, row(9)).unwrap();
        tm.commit(&mut writer).unwrap();

        assert_eq!(tm.read(&mut snapshot, slot).unwrap(), Some(row(1)));
        assert_eq!(tm.read(&mut snapshot, fresh).unwrap(), None);
        tm.commit(&mut snapshot).unwrap();
    }

    #[test]
    fn test_two_phase_snapshot_writer_cannot_replace_newer_commit() {
        for isolation in [IsolationLevel::SnapshotIsolation, IsolationLevel::Serializable] {
            let tm = manager(ConcurrencyProtocol::TwoPhaseLocking);
            let slot = seed(&tm, 1);

            let mut late = tm.begin_with_isolation(isolation);
            let mut writer = tm.begin();
            tm.update(&mut writer, slot, row(2)).unwrap();
            tm.commit(&mut writer).unwrap();

            assert!(matches!(
                tm.update(&mut late, slot, row(3)),
                Err(Error::WriteConflict { .. })
            ));
            assert_eq!(late.status(), TransactionStatus::Aborted, "{isolation:?}");

            let mut reader = tm.begin();
            assert_eq!(tm.read(&mut reader, slot).unwrap(), Some(row(2)));
            tm.commit(&mut reader).unwrap();
        }
    }

    #[test]
    fn test_optimistic_history_kept_for_registered_snapshot() {
        let tm = manager(ConcurrencyProtocol::OptimisticCopy);
        let slot = seed(&tm, 1);
        let other = seed(&tm, 1);

        let mut stale = tm.begin();

        let mut c = tm.begin();
        tm.update(&mut c, slot, row(2)).unwrap();
        tm.commit(&mut c).unwrap();

        // a later commit prunes history, but not past the stale snapshot
        let mut t = tm.begin();
        tm.update(&mut t, other, row(5)).unwrap();
        tm.commit(&mut t).unwrap();
        assert_eq!(tm.commit_state.lock().history.len(), 2);

        tm.update(&mut stale, slot, row(3)).unwrap();
        assert!(matches!(
            tm.commit(&mut stale),
            Err(Error::SerializationConflict { .. })
        ));

        // with no older snapshot registered only the newest entry survives
        let mut last = tm.begin();
        tm.update(&mut last, other, row(6)).unwrap();
        tm.commit(&mut last).unwrap();
        assert_eq!(tm.commit_state.lock().history.len(), 1);
    }

    // ========================================================================
    // Reclamation
    // ========================================================================

    #[test]
    fn test_watermark_tracks_oldest_snapshot() {
        let tm = manager(ConcurrencyProtocol::TimestampOrdering);
        let slot = seed(&tm, 1);
        assert_eq!(tm.gc_watermark(), 2);

        let mut old = tm.begin();
        for v in 2..5 {
            let mut ctx = tm.begin();
            tm.update(&mut ctx, slot, row(v)).unwrap();
            tm.commit(&mut ctx).unwrap();
        }
        assert_eq!(tm.gc_watermark(), 1);
        assert_eq!(tm.collect_garbage(), 0);
        assert_eq!(tm.read(&mut old, slot).unwrap(), Some(row(1)));

        tm.abort(&mut old);
        assert_eq!(tm.gc_watermark(), 5);
        assert_eq!(tm.collect_garbage(), 3);
        assert_eq!(tm.store().committed_intervals(slot).len(), 1);
    }

    #[test]
    fn test_rollback_garbage_is_reclaimed() {
        let tm = manager(ConcurrencyProtocol::TimestampOrdering);
        let slot = seed(&tm, 1);
        let before = tm.store().version_count();

        let mut ctx = tm.begin();
        tm.update(&mut ctx, slot, row(2)).unwrap();
        tm.update(&mut ctx, slot, row(3)).unwrap();
        tm.abort(&mut ctx);

        assert_eq!(tm.collect_garbage(), 2);
        assert_eq!(tm.store().version_count(), before);
    }
}
