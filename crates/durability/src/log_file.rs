//! Append-only log file
//!
//! The frontend logger is the only writer. Every batch is written through a
//! `BufWriter`, flushed and `sync_data`ed before the batch counts as durable.
//! Readers open a separate handle and stop at the first record that fails to
//! decode; everything before it is the valid prefix.

use crate::record::{decode_record, LogRecord};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tessera_core::{Error, Result};
use tracing::warn;

/// Default log file name inside a database directory
pub const LOG_FILE_NAME: &str = "tessera.log";

/// Writer half of the log file
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

impl LogFile {
    /// Open or create the log file for appending
    ///
    /// Parent directories are created if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            size,
        })
    }

    /// Append one batch and force it to stable storage
    ///
    /// The batch is durable only if this returns `Ok`.
    pub fn append_durable(&mut self, batch: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(batch)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.size += batch.len() as u64;
        Ok(())
    }

    /// Bytes written so far, including any pre-existing prefix
    pub fn size(&self) -> u64 {
        self.size
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Result of scanning a log file
#[derive(Debug, Default)]
pub struct LogScan {
    /// Records in file order
    pub records: Vec<LogRecord>,
    /// Length of the prefix made of whole, checksummed records
    pub valid_len: u64,
    /// Whether bytes after `valid_len` were ignored
    pub truncated: bool,
}

/// Read every whole record from `path`
///
/// A missing file reads as empty. Scanning stops at the first truncated or
/// corrupt record; the bytes from there on are reported, not returned.
pub fn scan_log<P: AsRef<Path>>(path: P) -> Result<LogScan> {
    let path = path.as_ref();
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogScan::default()),
        Err(e) => return Err(e.into()),
    };

    let mut scan = LogScan::default();
    let mut pos = 0usize;
    while pos < bytes.len() {
        match decode_record(&bytes[pos..], pos as u64) {
            Ok((record, used)) => {
                scan.records.push(record);
                pos += used;
            }
            Err(Error::IncompleteRecord { offset, have, needed }) => {
                warn!(offset, have, needed, "Discarding incomplete trailing log record");
                scan.truncated = true;
                break;
            }
            Err(e) => {
                warn!(offset = pos, error = %e, "Discarding log tail after corrupt record");
                scan.truncated = true;
                break;
            }
        }
    }
    scan.valid_len = pos as u64;
    Ok(scan)
}

/// Cut the log at `len` bytes so appends resume after the valid prefix
pub fn truncate_log<P: AsRef<Path>>(path: P, len: u64) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(());
    }
    let file = OpenOptions::new().write(true).open(path)?;
    if file.metadata()?.len() > len {
        file.set_len(len)?;
        file.sync_all()?;
    }
    Ok(())
}
