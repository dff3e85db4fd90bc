//! Persistent-memory arena with transactional mutation.
//!
//! The arena is a single byte region backed by the pool file. All
//! mutation happens inside a transaction: every written range is captured
//! for undo (abort) and redo (the WAL record sealed at commit). The
//! on-disk image is only rewritten at checkpoints; between checkpoints the
//! WAL alone carries committed state, and open-time replay folds it back
//! into the image.
//!
//! Transactions nest by joining: an inner `tx_begin` attaches to the
//! enclosing transaction and only the outermost `tx_commit` seals a WAL
//! record. A failure anywhere inside requires an abort, which restores
//! every captured range.

use crate::layout::{
    Superblock, LAYOUT_VERSION, OFF_FRONTIER, OFF_ROOT, OFF_WAL_HEAD, OFF_WAL_TAIL,
    POOL_MAGIC, SUPERBLOCK_SIZE,
};
use crate::replay;
use crate::wal::{WalRange, WalRecord, WalWriter};
use std::path::{Path, PathBuf};
use tracing::debug;
use vostok_core::{Result, VosError};

/// Active transaction state.
pub(crate) struct TxState {
    /// Nesting depth; outermost commit seals the WAL record
    depth: u32,
    /// Set once any level aborts; commit then refuses to seal
    aborted: bool,
    /// Captured original bytes, in capture order (rolled back in reverse)
    undo: Vec<(u64, Vec<u8>)>,
    /// Written ranges, merged into the redo record at commit
    ranges: Vec<(u64, u32)>,
    /// Frees deferred to commit so addresses are not reused early
    pending_free: Vec<u64>,
}

/// A transactional byte arena backed by a pool file plus a WAL.
pub struct Arena {
    pub(crate) image: Vec<u8>,
    path: PathBuf,
    wal: WalWriter,
    next_seq: u64,
    tx: Option<TxState>,
    read_only: bool,
}

impl Arena {
    /// Create a fresh arena of `capacity` bytes and persist its image.
    pub fn create(path: &Path, wal_path: &Path, uuid: [u8; 16], capacity: u64) -> Result<Arena> {
        if capacity < SUPERBLOCK_SIZE + 1024 {
            return Err(VosError::InvalArg(format!(
                "pool capacity {} below minimum",
                capacity
            )));
        }
        let mut image = vec![0u8; capacity as usize];
        Superblock::format(&mut image, uuid, capacity);
        persist_image(path, &image)?;

        // A fresh pool starts with an empty WAL.
        let mut wal = WalWriter::open(wal_path)?;
        wal.reset()?;

        debug!(pool = %path.display(), capacity, "arena created");
        Ok(Arena {
            image,
            path: path.to_path_buf(),
            wal,
            next_seq: 1,
            tx: None,
            read_only: false,
        })
    }

    /// Open an existing arena: validate the superblock, then replay the WAL.
    pub fn open(path: &Path, wal_path: &Path) -> Result<Arena> {
        let mut image = std::fs::read(path)?;
        let sb = Superblock::decode(&image)?;

        let stats = replay::replay_into(&mut image, wal_path, sb.wal_tail)?;
        let wal = WalWriter::open(wal_path)?;

        debug!(
            pool = %path.display(),
            applied = stats.applied,
            last_seq = stats.last_seq,
            "arena opened"
        );
        Ok(Arena {
            image,
            path: path.to_path_buf(),
            wal,
            next_seq: stats.last_seq.map(|s| s + 1).unwrap_or(sb.wal_tail),
            tx: None,
            read_only: false,
        })
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begin a transaction, or join the one already in progress.
    pub fn tx_begin(&mut self) -> Result<()> {
        if self.read_only {
            return Err(VosError::InvalState("arena is read-only".into()));
        }
        match self.tx.as_mut() {
            Some(tx) => tx.depth += 1,
            None => {
                self.tx = Some(TxState {
                    depth: 1,
                    aborted: false,
                    undo: Vec::new(),
                    ranges: Vec::new(),
                    pending_free: Vec::new(),
                });
            }
        }
        Ok(())
    }

    /// True while a transaction is open.
    pub fn tx_in_progress(&self) -> bool {
        self.tx.is_some()
    }

    /// Commit one nesting level; the outermost level seals the WAL record.
    pub fn tx_commit(&mut self) -> Result<()> {
        let (depth, aborted) = match self.tx.as_ref() {
            Some(tx) => (tx.depth, tx.aborted),
            None => return Err(VosError::InvalState("commit outside transaction".into())),
        };

        if aborted {
            // An inner level already gave up; unwind instead of sealing.
            self.tx_abort();
            return Err(VosError::InvalState("transaction was aborted".into()));
        }

        if depth > 1 {
            self.tx.as_mut().unwrap().depth -= 1;
            return Ok(());
        }

        // Outermost commit: release deferred frees inside the transaction so
        // the allocator mutations land in the same WAL record.
        let pending = std::mem::take(&mut self.tx.as_mut().unwrap().pending_free);
        for off in pending {
            self.free_now(off)?;
        }

        let tx = self.tx.take().expect("tx present at outermost commit");
        let ranges = merge_ranges(&tx.ranges);
        let redo: Vec<WalRange> = ranges
            .iter()
            .map(|&(off, len)| WalRange {
                off,
                bytes: self.image[off as usize..(off + len as u64) as usize].to_vec(),
            })
            .collect();

        let record = WalRecord::new(self.next_seq, self.next_seq, redo);
        if let Err(e) = self.wal.append(&record) {
            // The commit cannot be made durable; roll the image back and
            // degrade, since the WAL tail state is now unknown.
            for (off, bytes) in tx.undo.iter().rev() {
                self.image[*off as usize..*off as usize + bytes.len()].copy_from_slice(bytes);
            }
            self.read_only = true;
            return Err(VosError::Corrupt(format!("WAL append failed: {}", e)));
        }
        self.next_seq += 1;
        Ok(())
    }

    /// Abort one nesting level. When the outermost level unwinds, every
    /// captured range is restored and the transaction disappears.
    pub fn tx_abort(&mut self) {
        let done = match self.tx.as_mut() {
            Some(tx) => {
                tx.aborted = true;
                tx.depth -= 1;
                tx.depth == 0
            }
            None => return,
        };
        if done {
            let tx = self.tx.take().expect("tx present at outermost abort");
            for (off, bytes) in tx.undo.iter().rev() {
                self.image[*off as usize..*off as usize + bytes.len()].copy_from_slice(bytes);
            }
        }
    }

    /// Run `f` inside a (possibly joined) transaction, committing on `Ok`
    /// and aborting on `Err`.
    pub fn with_tx<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Arena) -> Result<T>,
    {
        self.tx_begin()?;
        match f(&mut *self) {
            Ok(v) => match self.tx_commit() {
                Ok(()) => Ok(v),
                Err(e) => {
                    self.tx_abort();
                    Err(e)
                }
            },
            Err(e) => {
                self.tx_abort();
                Err(e)
            }
        }
    }

    // =========================================================================
    // Byte access
    // =========================================================================

    /// Write bytes inside the active transaction.
    pub fn write(&mut self, off: u64, data: &[u8]) -> Result<()> {
        let end = off as usize + data.len();
        if end > self.image.len() {
            return Err(VosError::InvalArg(format!(
                "write [{}, {}) beyond arena capacity {}",
                off,
                end,
                self.image.len()
            )));
        }
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| VosError::InvalState("write outside transaction".into()))?;
        if tx.aborted {
            return Err(VosError::InvalState("transaction was aborted".into()));
        }
        tx.undo
            .push((off, self.image[off as usize..end].to_vec()));
        tx.ranges.push((off, data.len() as u32));
        self.image[off as usize..end].copy_from_slice(data);
        Ok(())
    }

    /// Write a little-endian u64 inside the active transaction.
    pub fn write_u64(&mut self, off: u64, v: u64) -> Result<()> {
        self.write(off, &v.to_le_bytes())
    }

    /// Write a little-endian u32 inside the active transaction.
    pub fn write_u32(&mut self, off: u64, v: u32) -> Result<()> {
        self.write(off, &v.to_le_bytes())
    }

    /// Borrow a byte range of the arena.
    pub fn slice(&self, off: u64, len: usize) -> Result<&[u8]> {
        let end = off as usize + len;
        if end > self.image.len() {
            return Err(VosError::Corrupt(format!(
                "reference [{}, {}) beyond arena capacity {}",
                off,
                end,
                self.image.len()
            )));
        }
        Ok(&self.image[off as usize..end])
    }

    /// Read a little-endian u64.
    pub fn read_u64(&self, off: u64) -> Result<u64> {
        Ok(u64::from_le_bytes(self.slice(off, 8)?.try_into().unwrap()))
    }

    /// Read a little-endian u32.
    pub fn read_u32(&self, off: u64) -> Result<u32> {
        Ok(u32::from_le_bytes(self.slice(off, 4)?.try_into().unwrap()))
    }

    // =========================================================================
    // Superblock fields
    // =========================================================================

    /// Container-directory root offset (0 = none yet).
    pub fn root(&self) -> u64 {
        u64::from_le_bytes(
            self.image[OFF_ROOT as usize..OFF_ROOT as usize + 8]
                .try_into()
                .unwrap(),
        )
    }

    /// Set the container-directory root (inside a transaction).
    pub fn set_root(&mut self, off: u64) -> Result<()> {
        self.write_u64(OFF_ROOT, off)
    }

    /// Pool UUID from the superblock.
    pub fn uuid(&self) -> [u8; 16] {
        self.image[8..24].try_into().unwrap()
    }

    /// Total arena capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.image.len() as u64
    }

    /// Degrade to read-only after a durable error.
    pub fn set_read_only(&mut self) {
        self.read_only = true;
    }

    /// True once the arena refuses mutation.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    // =========================================================================
    // Checkpoint / close
    // =========================================================================

    /// Fold committed WAL state into the on-disk image and reset the WAL.
    pub fn checkpoint(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(VosError::InvalState(
                "checkpoint during open transaction".into(),
            ));
        }
        if self.read_only {
            return Err(VosError::InvalState("arena is read-only".into()));
        }
        let seq = self.next_seq.to_le_bytes();
        self.image[OFF_WAL_HEAD as usize..OFF_WAL_HEAD as usize + 8].copy_from_slice(&seq);
        self.image[OFF_WAL_TAIL as usize..OFF_WAL_TAIL as usize + 8].copy_from_slice(&seq);
        persist_image(&self.path, &self.image)?;
        self.wal.reset()?;
        debug!(pool = %self.path.display(), seq = self.next_seq, "arena checkpoint");
        Ok(())
    }

    /// Checkpoint and drop the arena. Read-only arenas close without
    /// touching the image.
    pub fn close(mut self) -> Result<()> {
        if !self.read_only {
            self.checkpoint()?;
        }
        Ok(())
    }

    pub(crate) fn tx_state(&mut self) -> Option<&mut TxState> {
        self.tx.as_mut()
    }
}

impl TxState {
    pub(crate) fn defer_free(&mut self, off: u64) {
        self.pending_free.push(off);
    }
}

/// Atomically replace the image file (write-temp-then-rename).
fn persist_image(path: &Path, image: &[u8]) -> Result<()> {
    let tmp = path.with_extension("img.tmp");
    {
        use std::io::Write;
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(image)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Sort and merge touched ranges so the redo record stays compact.
fn merge_ranges(ranges: &[(u64, u32)]) -> Vec<(u64, u32)> {
    let mut sorted: Vec<(u64, u32)> = ranges.to_vec();
    sorted.sort_by_key(|&(off, _)| off);
    let mut out: Vec<(u64, u32)> = Vec::with_capacity(sorted.len());
    for (off, len) in sorted {
        match out.last_mut() {
            Some((last_off, last_len)) if *last_off + *last_len as u64 >= off => {
                let end = (off + len as u64).max(*last_off + *last_len as u64);
                *last_len = (end - *last_off) as u32;
            }
            _ => out.push((off, len)),
        }
    }
    out
}

// Sanity constants used by unit tests below.
const _: () = assert!(LAYOUT_VERSION == 2);
const _: () = assert!(POOL_MAGIC[0] == b'V');
const _: () = assert!(OFF_FRONTIER < SUPERBLOCK_SIZE);
