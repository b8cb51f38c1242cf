//! Epoch-based version reclamation
//!
//! Versions leave their chains in two ways: a committed writer supersedes
//! them (their `end_cid` is stamped) or an aborting writer unlinks them.
//! Either way they are retired here with an epoch commit id and removed
//! from the arena only once every active reader started after that epoch.
//!
//! The collector never runs on the transaction hot path. The transaction
//! manager calls `collect` with the oldest active read timestamp.

use crate::version::{VersionArena, VersionId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::CommitId;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Retired {
    version: VersionId,
    epoch: CommitId,
}

/// Retired-version list plus reclamation counters
#[derive(Debug, Default)]
pub struct VersionCollector {
    retired: Mutex<Vec<Retired>>,
    reclaimed: AtomicU64,
}

impl VersionCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Retire a version that no reader starting after `epoch` can reach
    pub fn retire(&self, version: VersionId, epoch: CommitId) {
        self.retired.lock().push(Retired { version, epoch });
    }

    /// Remove retired versions whose epoch precedes `watermark`
    ///
    /// `watermark` must not exceed the read timestamp of any active
    /// transaction. Returns the number of versions removed.
    pub fn collect(&self, watermark: CommitId, arena: &VersionArena) -> usize {
        let ready: Vec<Retired> = {
            let mut retired = self.retired.lock();
            let mut ready = Vec::new();
            retired.retain(|r| {
                if r.epoch < watermark {
                    ready.push(*r);
                    false
                } else {
                    true
                }
            });
            ready
        };

        let removed = ready
            .iter()
            .filter(|r| arena.remove(r.version).is_some())
            .count();
        self.reclaimed.fetch_add(removed as u64, Ordering::Relaxed);

        if removed > 0 {
            debug!(watermark, removed, "Reclaimed tuple versions");
        }
        removed
    }

    /// Number of versions waiting for reclamation
    pub fn pending(&self) -> usize {
        self.retired.lock().len()
    }

    /// Total versions reclaimed since creation
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }
}
