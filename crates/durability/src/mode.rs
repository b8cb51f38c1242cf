//! Durability mode configuration
//!
//! Controls when the frontend logger runs a flush cycle (Cache, Standard, Always).

use std::time::Duration;

/// Flush interval used when the mode itself carries none
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;

/// Pending-record threshold used when the mode itself carries none
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 1000;

/// Durability mode for the write-ahead log
///
/// # Modes
///
/// | Mode | Log | Flush trigger | Commit returns |
/// |------|-----|---------------|----------------|
/// | Cache | none | never | after in-memory stamping |
/// | Always | yes | every waiting commit | after its flush cycle |
/// | Standard | yes | timer or record threshold | after the next flush cycle |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// No log at all; every committed change is lost on crash
    ///
    /// Use case: tests, caches, ephemeral data.
    Cache,

    /// A committing transaction wakes the frontend logger immediately
    ///
    /// Concurrent commits still share a flush cycle.
    Always,

    /// Flush every `interval_ms` or once `batch_size` records are queued
    ///
    /// Commits wait for the next cycle, so under load many commits share
    /// one durability barrier.
    Standard {
        /// Maximum time between flush cycles in milliseconds
        interval_ms: u64,
        /// Queued records that trigger an early flush cycle
        batch_size: usize,
    },
}

impl DurabilityMode {
    /// Check if this mode writes a log
    ///
    /// Returns false for Cache mode, true for all others.
    pub fn requires_wal(&self) -> bool {
        !matches!(self, DurabilityMode::Cache)
    }

    /// Check if a waiting commit triggers a flush cycle on its own
    pub fn requires_immediate_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }

    /// Timer period of the frontend logger
    pub fn flush_interval(&self) -> Duration {
        match self {
            DurabilityMode::Standard { interval_ms, .. } => Duration::from_millis(*interval_ms),
            _ => Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
        }
    }

    /// Queued-record threshold that wakes the frontend logger
    pub fn batch_size(&self) -> usize {
        match self {
            DurabilityMode::Standard { batch_size, .. } => (*batch_size).max(1),
            _ => DEFAULT_FLUSH_BATCH_SIZE,
        }
    }

    /// Human-readable description of the mode
    pub fn description(&self) -> &'static str {
        match self {
            DurabilityMode::Cache => "Cache (fastest, all data lost on crash)",
            DurabilityMode::Always => "Always sync (safest, slowest)",
            DurabilityMode::Standard { .. } => "Standard (group commit on timer or batch)",
        }
    }

    /// Create a standard mode with recommended defaults
    ///
    /// Returns `Standard { interval_ms: 100, batch_size: 1000 }`.
    pub fn standard_default() -> Self {
        DurabilityMode::Standard {
            interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            batch_size: DEFAULT_FLUSH_BATCH_SIZE,
        }
    }
}

impl Default for DurabilityMode {
    fn default() -> Self {
        Self::standard_default()
    }
}
