//! Tessera - transactional core of an in-memory multi-version storage engine
//!
//! Tessera keeps every logical row as a chain of tuple versions and
//! coordinates concurrent transactions over them with one of three
//! protocols: timestamp ordering, two-phase locking or optimistic copy.
//! Commits are made durable by a group-commit write-ahead log and replayed
//! at startup.
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::{Database, Tuple, Value};
//!
//! let db = Database::open("/path/to/data")?;
//! let slot = db.transaction(|txn| txn.insert_new(Tuple::new(vec![Value::Int(1)])))?;
//! let row = db.transaction(|txn| txn.read(slot))?;
//! ```
//!
//! # Architecture
//!
//! The [`Database`] wires the layers together; the lower crates are
//! re-exported for executors that drive the transaction manager directly.

pub use tessera_engine::*;

pub use tessera_core::{
    CommitId, ConcurrencyProtocol, Error, IsolationLevel, Result, Tuple, TupleSlot, TxnId, Value,
};

pub use tessera_concurrency as concurrency;
pub use tessera_durability as durability;
pub use tessera_storage as storage;
