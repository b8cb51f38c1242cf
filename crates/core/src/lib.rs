//! Core types for Tessera
//!
//! This crate defines the foundational types shared by every layer:
//! - TxnId / CommitId: transaction identity and the global commit order
//! - TupleSlot: physical locator of a logical row inside a tile group
//! - Value / Tuple: column data carried by tuple versions and log records
//! - IsolationLevel / ConcurrencyProtocol: process-wide policy selection
//! - Error: the error taxonomy surfaced to executors

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;
pub mod value;

pub use error::{Error, Result};
pub use types::{
    CommitId, ConcurrencyProtocol, IsolationLevel, TupleSlot, TxnId, WriteKind, CURRENT_CID,
    INITIAL_CID, INVALID_TXN_ID, PENDING_CID,
};
pub use value::{Tuple, Value};
