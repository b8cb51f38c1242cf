//! Durability layer for Tessera
//!
//! This crate implements the group-commit write-ahead log:
//! - Log record encoding with CRC32 checksums
//! - BackendLogger: per-worker record queue
//! - FrontendLogger: batches, orders and syncs all backend queues
//! - LogManager: facade used by the transaction manager
//! - LogReplayer: reads committed transactions back after a restart
//!
//! # Durability Modes
//!
//! - Cache: no log, commits are in-memory only
//! - Always: each waiting commit triggers a flush cycle
//! - Standard: flush cycles on a timer or a queued-record threshold

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod frontend;
pub mod log_file;
pub mod manager;
pub mod mode;
pub mod record;
pub mod recovery;

pub use backend::BackendLogger;
pub use frontend::FrontendLogger;
pub use log_file::{scan_log, truncate_log, LogFile, LogScan, LOG_FILE_NAME};
pub use manager::LogManager;
pub use mode::DurabilityMode;
pub use record::{decode_record, encode_record, LogRecord};
pub use recovery::{LogReplayer, ReplayOutcome, ReplayedTransaction, ReplayedWrite};
