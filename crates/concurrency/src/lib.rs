//! Concurrency control for Tessera
//!
//! This crate implements multi-version concurrency control over the
//! version store:
//! - TransactionManager: begin, read, write, commit, abort
//! - Three protocols: timestamp ordering, two-phase locking, optimistic copy
//! - Snapshot, serializable and read-committed isolation
//! - LockTable: tuple locks with wait-for deadlock detection
//! - RecoveryCoordinator: rebuilds the store from the log at startup

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lock_table;
pub mod manager;
pub mod recovery;
pub mod registry;
pub mod transaction;
pub mod validation;
pub mod visibility;

pub use lock_table::{LockMode, LockTable, DEFAULT_LOCK_TIMEOUT};
pub use manager::{TransactionManager, TransactionManagerConfig, TransactionStats};
pub use recovery::{RecoveryCoordinator, RecoveryResult, RecoveryStats};
pub use registry::{ActiveTransactionRegistry, TxnHandle};
pub use transaction::{BufferedWrite, TransactionContext, TransactionStatus, WriteEntry};
pub use validation::{CommitHistory, ConflictType, ValidationResult};
