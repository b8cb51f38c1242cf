//! Closure transactions and retry logic
//!
//! Contains the `Transaction` handle passed to `Database::transaction`
//! closures and `RetryConfig` for `Database::transaction_with_retry`.

use std::time::Duration;
use tessera_concurrency::{TransactionContext, TransactionManager};
use tessera_core::{IsolationLevel, Result, Tuple, TupleSlot, TxnId};

// ============================================================================
// Transaction Handle
// ============================================================================

/// A running transaction inside a `Database::transaction` closure
///
/// Every operation goes through the transaction manager with this
/// transaction's context. The closure never commits or aborts; the
/// database does that based on the closure's result.
pub struct Transaction<'a> {
    manager: &'a TransactionManager,
    ctx: &'a mut TransactionContext,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(manager: &'a TransactionManager, ctx: &'a mut TransactionContext) -> Self {
        Self { manager, ctx }
    }

    /// Transaction id
    pub fn id(&self) -> TxnId {
        self.ctx.id()
    }

    /// Isolation level
    pub fn isolation(&self) -> IsolationLevel {
        self.ctx.isolation()
    }

    /// Reserve a fresh slot for an insert
    pub fn allocate_slot(&self) -> TupleSlot {
        self.manager.allocate_slot()
    }

    /// Read the version of `slot` visible to this transaction
    pub fn read(&mut self, slot: TupleSlot) -> Result<Option<Tuple>> {
        self.manager.read(self.ctx, slot)
    }

    /// Create the first version of an empty slot
    pub fn insert(&mut self, slot: TupleSlot, tuple: Tuple) -> Result<()> {
        self.manager.insert(self.ctx, slot, tuple)
    }

    /// Replace the visible version of `slot`
    pub fn update(&mut self, slot: TupleSlot, tuple: Tuple) -> Result<()> {
        self.manager.update(self.ctx, slot, tuple)
    }

    /// Delete the row in `slot`
    pub fn delete(&mut self, slot: TupleSlot) -> Result<()> {
        self.manager.delete(self.ctx, slot)
    }

    /// Allocate a slot and insert `tuple` into it
    pub fn insert_new(&mut self, tuple: Tuple) -> Result<TupleSlot> {
        let slot = self.manager.allocate_slot();
        self.insert(slot, tuple)?;
        Ok(slot)
    }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Configuration for transaction retry behavior
///
/// Only retryable errors (write conflicts, serialization conflicts,
/// deadlocks, lock timeouts) are retried.
///
/// # Example
/// ```ignore
/// let config = RetryConfig::new().with_max_retries(5);
/// db.transaction_with_retry(config, |txn| { ... })?;
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: usize,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Delay before retry number `attempt` (exponential backoff)
    pub(crate) fn calculate_delay(&self, attempt: usize) -> Duration {
        let shift = attempt.min(63);
        let delay_ms = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}
