//! Database: the engine entry point
//!
//! Opening a database wires the layers together in a fixed order:
//!
//! 1. Load (or create) `tessera.toml` and validate it
//! 2. Replay the write-ahead log into a fresh version store
//! 3. Open the log for appending and start the frontend logger
//! 4. Create the transaction manager, continuing after recovered ids
//!
//! The protocol and isolation level chosen at open stay fixed until the
//! database is dropped.

mod transactions;

pub use transactions::{RetryConfig, Transaction};

use crate::config::{EngineConfig, CONFIG_FILE_NAME};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_concurrency::{
    RecoveryCoordinator, RecoveryResult, TransactionContext, TransactionManager, TransactionStats,
};
use tessera_core::{
    CommitId, ConcurrencyProtocol, Error, IsolationLevel, Result, Tuple, TupleSlot,
};
use tessera_durability::{DurabilityMode, LogManager, LOG_FILE_NAME};
use tessera_storage::VersionStore;
use tracing::{debug, info, warn};

/// How long `shutdown` waits for in-flight transactions
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// An open Tessera database
///
/// Thread-safe; `open` returns it behind an `Arc`.
#[derive(Debug)]
pub struct Database {
    data_dir: PathBuf,
    config: EngineConfig,
    durability_mode: DurabilityMode,
    manager: TransactionManager,
    recovery: RecoveryResult,
    accepting_transactions: AtomicBool,
}

impl Database {
    /// Open the database in `path`, creating the directory if needed
    ///
    /// Settings come from `tessera.toml` in the directory; a default file
    /// is written on first open.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` if `tessera.toml` cannot be read or is invalid
    /// - `Io` or `Corruption` if recovery fails
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let data_dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let config_path = data_dir.join(CONFIG_FILE_NAME);
        EngineConfig::write_default_if_missing(&config_path)?;
        let config = EngineConfig::from_file(&config_path)?;

        Self::open_with_config(path, config)
    }

    /// Open the database in `path` with an explicit configuration
    ///
    /// The config is written to `tessera.toml` so a later `open` picks up
    /// the same settings.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let data_dir = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        config.write_to_file(&data_dir.join(CONFIG_FILE_NAME))?;

        let mode = config.durability_mode()?;
        let store = Arc::new(VersionStore::new(config.tile_group_capacity));

        let log_path = data_dir.join(LOG_FILE_NAME);
        let recovery = RecoveryCoordinator::new(&log_path).recover(&store)?;
        let log = LogManager::open(
            &log_path,
            mode,
            config.backend_loggers,
            recovery.highest_commit_id,
        )?;

        let db = Self::assemble(data_dir, config, mode, store, log, recovery)?;
        info!(
            target: "tessera::db",
            path = %db.data_dir.display(),
            protocol = %db.protocol(),
            isolation = ?db.default_isolation(),
            durability = mode.description(),
            last_commit_id = db.last_commit_id(),
            "Opened database"
        );
        Ok(Arc::new(db))
    }

    /// Create an in-memory database with default settings
    ///
    /// Nothing is read from or written to disk.
    pub fn cache() -> Result<Arc<Self>> {
        Self::cache_with_config(EngineConfig::default())
    }

    /// Create an in-memory database with `config`
    ///
    /// The durability setting is forced to cache mode.
    pub fn cache_with_config(config: EngineConfig) -> Result<Arc<Self>> {
        let config = config.with_durability(DurabilityMode::Cache);
        config.validate()?;
        let store = Arc::new(VersionStore::new(config.tile_group_capacity));
        let db = Self::assemble(
            PathBuf::new(),
            config,
            DurabilityMode::Cache,
            store,
            LogManager::disabled(),
            RecoveryResult::default(),
        )?;
        debug!(target: "tessera::db", protocol = %db.protocol(), "Created cache database");
        Ok(Arc::new(db))
    }

    fn assemble(
        data_dir: PathBuf,
        config: EngineConfig,
        durability_mode: DurabilityMode,
        store: Arc<VersionStore>,
        log: LogManager,
        recovery: RecoveryResult,
    ) -> Result<Self> {
        let manager = TransactionManager::with_ids(
            config.manager_config()?,
            store,
            Arc::new(log),
            recovery.highest_commit_id,
            recovery.max_txn_id,
        );
        Ok(Self {
            data_dir,
            config,
            durability_mode,
            manager,
            recovery,
            accepting_transactions: AtomicBool::new(true),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Data directory (empty for a cache database)
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Settings the database was opened with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Durability mode of the log
    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability_mode
    }

    /// Whether commits are memory-only
    pub fn is_cache(&self) -> bool {
        !self.durability_mode.requires_wal()
    }

    /// Whether new transactions are accepted
    pub fn is_open(&self) -> bool {
        self.accepting_transactions.load(Ordering::SeqCst)
    }

    /// Active concurrency-control protocol
    pub fn protocol(&self) -> ConcurrencyProtocol {
        self.manager.protocol()
    }

    /// Isolation level used by `begin`
    pub fn default_isolation(&self) -> IsolationLevel {
        self.manager.default_isolation()
    }

    /// Outcome of the recovery run at open
    pub fn recovery(&self) -> &RecoveryResult {
        &self.recovery
    }

    /// Underlying transaction manager
    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Highest published commit id
    pub fn last_commit_id(&self) -> CommitId {
        self.manager.last_commit_id()
    }

    /// Transaction counters since open
    pub fn stats(&self) -> TransactionStats {
        self.manager.stats()
    }

    /// Reserve a fresh slot for an insert
    pub fn allocate_slot(&self) -> TupleSlot {
        self.manager.allocate_slot()
    }

    // ========================================================================
    // Manual transactions
    // ========================================================================

    fn check_accepting(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::DatabaseClosed)
        }
    }

    /// Begin a transaction at the default isolation level
    ///
    /// The returned context must be finished with `commit` or `abort`.
    pub fn begin(&self) -> Result<TransactionContext> {
        self.check_accepting()?;
        Ok(self.manager.begin())
    }

    /// Begin a transaction at `isolation`
    pub fn begin_with_isolation(&self, isolation: IsolationLevel) -> Result<TransactionContext> {
        self.check_accepting()?;
        Ok(self.manager.begin_with_isolation(isolation))
    }

    /// Read the version of `slot` visible to `ctx`
    pub fn read(&self, ctx: &mut TransactionContext, slot: TupleSlot) -> Result<Option<Tuple>> {
        self.manager.read(ctx, slot)
    }

    /// Insert `tuple` into the empty `slot`
    pub fn insert(&self, ctx: &mut TransactionContext, slot: TupleSlot, tuple: Tuple) -> Result<()> {
        self.manager.insert(ctx, slot, tuple)
    }

    /// Replace the row in `slot`
    pub fn update(&self, ctx: &mut TransactionContext, slot: TupleSlot, tuple: Tuple) -> Result<()> {
        self.manager.update(ctx, slot, tuple)
    }

    /// Delete the row in `slot`
    pub fn delete(&self, ctx: &mut TransactionContext, slot: TupleSlot) -> Result<()> {
        self.manager.delete(ctx, slot)
    }

    /// Commit `ctx`, returning once the commit is durable
    pub fn commit(&self, ctx: &mut TransactionContext) -> Result<CommitId> {
        self.manager.commit(ctx)
    }

    /// Roll back `ctx`
    pub fn abort(&self, ctx: &mut TransactionContext) {
        self.manager.abort(ctx);
    }

    // ========================================================================
    // Closure transactions
    // ========================================================================

    fn run_single_attempt<T>(
        &self,
        ctx: &mut TransactionContext,
        result: Result<T>,
    ) -> Result<(T, CommitId)> {
        match result {
            Ok(value) => {
                let commit_id = self.manager.commit(ctx)?;
                Ok((value, commit_id))
            }
            Err(e) => {
                self.manager.abort(ctx);
                Err(e)
            }
        }
    }

    /// Run `f` in a transaction
    ///
    /// Commits if `f` returns `Ok`, rolls back otherwise.
    ///
    /// # Example
    /// ```ignore
    /// let slot = db.transaction(|txn| txn.insert_new(Tuple::new(vec![Value::Int(1)])))?;
    /// ```
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        self.transaction_with_commit_id(f).map(|(value, _)| value)
    }

    /// Like `transaction`, also returning the commit id
    pub fn transaction_with_commit_id<F, T>(&self, f: F) -> Result<(T, CommitId)>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut ctx = self.begin()?;
        let result = f(&mut Transaction::new(&self.manager, &mut ctx));
        self.run_single_attempt(&mut ctx, result)
    }

    /// Run `f` in a transaction, retrying on retryable errors
    ///
    /// `f` is called again from scratch after each conflict, deadlock or
    /// lock timeout, up to `config.max_retries` times. Other errors are
    /// returned immediately.
    pub fn transaction_with_retry<F, T>(&self, config: RetryConfig, f: F) -> Result<T>
    where
        F: Fn(&mut Transaction<'_>) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let mut ctx = self.begin()?;
            let result = f(&mut Transaction::new(&self.manager, &mut ctx));
            match self.run_single_attempt(&mut ctx, result) {
                Ok((value, _)) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < config.max_retries => {
                    debug!(
                        target: "tessera::db",
                        txn_id = ctx.id(),
                        attempt,
                        error = %e,
                        "Retrying transaction"
                    );
                    std::thread::sleep(config.calculate_delay(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Reclaim versions no live or future transaction can read
    ///
    /// Returns the number of versions freed.
    pub fn collect_garbage(&self) -> usize {
        let reclaimed = self.manager.collect_garbage();
        if reclaimed > 0 {
            debug!(target: "tessera::db", reclaimed, "Collected garbage");
        }
        reclaimed
    }

    /// Run one flush cycle now
    ///
    /// Returns the highest durable commit id. A no-op for cache databases.
    pub fn flush(&self) -> Result<CommitId> {
        self.manager.log().flush_now()
    }

    /// Stop accepting transactions, drain in-flight ones and flush the log
    ///
    /// Transactions still running after the drain timeout are left to
    /// their owners; their writes are not committed.
    pub fn shutdown(&self) -> Result<()> {
        if !self.accepting_transactions.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let start = Instant::now();
        while self.manager.active_count() > 0 && start.elapsed() < SHUTDOWN_DRAIN_TIMEOUT {
            std::thread::sleep(Duration::from_millis(10));
        }
        let abandoned = self.manager.active_count();
        if abandoned > 0 {
            warn!(target: "tessera::db", abandoned, "Shutting down with active transactions");
        }

        let flushed = self.close_log();
        info!(
            target: "tessera::db",
            last_commit_id = self.last_commit_id(),
            "Database shut down"
        );
        flushed
    }

    fn close_log(&self) -> Result<()> {
        let flushed = self.flush();
        self.manager.log().shutdown();
        flushed.map(|_| ())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.accepting_transactions.swap(false, Ordering::SeqCst) {
            let _ = self.close_log();
        }
    }
}
