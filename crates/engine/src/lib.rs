//! Database engine for Tessera
//!
//! This crate orchestrates the lower layers:
//! - Database: open, recovery, transactions, shutdown
//! - EngineConfig: `tessera.toml` settings
//! - ProjectInfo: materializes executor output tuples
//!
//! The engine is the only component that knows the startup order
//! (recovery before logging before the first transaction).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod database;
pub mod projection;

pub use config::{ConfigError, EngineConfig, CONFIG_FILE_NAME};
pub use database::{Database, RetryConfig, Transaction};
pub use projection::{ArithmeticOp, ColumnId, CompareOp, Expression, ProjectInfo, ProjectionError};
