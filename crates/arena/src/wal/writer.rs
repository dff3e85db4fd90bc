//! Append-only WAL writer.
//!
//! The writer appends framed records and fsyncs on commit. The file is
//! reset (truncated) after a successful checkpoint folds its records into
//! the pool image.

use super::record::WalRecord;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// WAL writer handle.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    /// Bytes appended since open/reset (for counters)
    appended: u64,
}

impl WalWriter {
    /// Open the WAL for appending, creating it if absent.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let end = file.seek(SeekFrom::End(0))?;
        Ok(WalWriter {
            file,
            path: path.to_path_buf(),
            appended: end,
        })
    }

    /// Append one record and fsync.
    ///
    /// Durability contract: when this returns, the record survives a crash.
    pub fn append(&mut self, record: &WalRecord) -> std::io::Result<()> {
        let bytes = record.to_bytes();
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        self.appended += bytes.len() as u64;
        Ok(())
    }

    /// Truncate the WAL after a checkpoint.
    pub fn reset(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        self.appended = 0;
        Ok(())
    }

    /// Current WAL size in bytes.
    pub fn size(&self) -> u64 {
        self.appended
    }

    /// Path of the WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
