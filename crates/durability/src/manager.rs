//! Log manager: the transaction manager's view of the write-ahead log
//!
//! Wraps one frontend logger and its backends, or nothing at all in
//! `DurabilityMode::Cache`. In cache mode every call succeeds immediately
//! and nothing is written.

use crate::backend::BackendLogger;
use crate::frontend::FrontendLogger;
use crate::log_file::LogFile;
use crate::mode::DurabilityMode;
use crate::record::LogRecord;
use std::path::Path;
use std::sync::Arc;
use tessera_core::{CommitId, Result};
use tracing::info;

/// Write-ahead log facade
#[derive(Debug)]
pub struct LogManager {
    mode: DurabilityMode,
    frontend: Option<Arc<FrontendLogger>>,
}

impl LogManager {
    /// A log manager that writes nothing (cache mode)
    pub fn disabled() -> Self {
        Self {
            mode: DurabilityMode::Cache,
            frontend: None,
        }
    }

    /// Open the log at `path` and start the frontend flush thread
    ///
    /// `initial_commit_id` is the highest commit id recovered from the
    /// existing log. In cache mode no file is opened.
    pub fn open<P: AsRef<Path>>(
        path: P,
        mode: DurabilityMode,
        backend_count: usize,
        initial_commit_id: CommitId,
    ) -> Result<Self> {
        if !mode.requires_wal() {
            return Ok(Self::disabled());
        }

        let file = LogFile::open(path.as_ref())?;
        info!(
            path = %path.as_ref().display(),
            size = file.size(),
            backends = backend_count,
            mode = mode.description(),
            "Opened write-ahead log"
        );

        let frontend = Arc::new(FrontendLogger::new(
            file,
            backend_count,
            mode,
            initial_commit_id,
        ));
        frontend.start_flush_thread();

        Ok(Self {
            mode,
            frontend: Some(frontend),
        })
    }

    /// Durability mode
    pub fn mode(&self) -> DurabilityMode {
        self.mode
    }

    /// Whether records are written at all
    pub fn is_enabled(&self) -> bool {
        self.frontend.is_some()
    }

    /// Number of backend loggers
    pub fn backend_count(&self) -> usize {
        self.frontend.as_ref().map_or(0, |f| f.backends().len())
    }

    /// Backend logger by index (wrapping)
    pub fn backend(&self, index: usize) -> Option<&Arc<BackendLogger>> {
        let frontend = self.frontend.as_ref()?;
        let backends = frontend.backends();
        backends.get(index % backends.len())
    }

    /// Queue `record` on backend `index`
    pub fn log(&self, index: usize, record: &LogRecord) -> Result<()> {
        match self.backend(index) {
            Some(backend) => backend.log(record),
            None => Ok(()),
        }
    }

    /// Block until the COMMIT for `cid` is durable
    pub fn wait_until_flushed(&self, cid: CommitId) -> Result<()> {
        match &self.frontend {
            Some(frontend) => frontend.wait_until_flushed(cid),
            None => Ok(()),
        }
    }

    /// Run one flush cycle on the caller's thread
    pub fn flush_now(&self) -> Result<CommitId> {
        match &self.frontend {
            Some(frontend) => frontend.flush_cycle(),
            None => Ok(0),
        }
    }

    /// Highest commit id known durable
    pub fn highest_flushed_commit_id(&self) -> CommitId {
        self.frontend
            .as_ref()
            .map_or(0, |f| f.highest_flushed_commit_id())
    }

    /// Highest commit id queued on any backend
    ///
    /// Every commit at or below this id has its COMMIT record serialized,
    /// which bounds how far version reclamation may advance.
    pub fn highest_logged_commit_id(&self) -> CommitId {
        self.frontend.as_ref().map_or(0, |f| {
            f.backends()
                .iter()
                .map(|b| b.highest_logged_commit_id())
                .max()
                .unwrap_or(0)
        })
    }

    /// Whether a durability barrier has failed
    pub fn has_failed(&self) -> bool {
        self.frontend.as_ref().map_or(false, |f| f.has_failed())
    }

    /// Flush what is queued and stop the frontend thread
    pub fn shutdown(&self) {
        if let Some(frontend) = &self.frontend {
            frontend.shutdown();
        }
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
