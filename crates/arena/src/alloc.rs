//! First-fit free-list allocator over the arena.
//!
//! Blocks carry a 16-byte header directly in the arena:
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────┐
//! │ size (u64)   │ next (u64)       │ payload (size B) │
//! └──────────────┴──────────────────┴──────────────────┘
//! ```
//!
//! `next` links free blocks; allocated blocks hold the `ALLOCATED`
//! sentinel. The free-list head and the bump frontier live in the
//! superblock, so allocator state is transactional like everything else:
//! an aborted transaction rolls the allocator back byte-for-byte.
//!
//! Frees requested inside a transaction are deferred to commit, so a freed
//! address is never handed out again before the free itself is durable.

use crate::arena::Arena;
use crate::layout::{OFF_FREE_HEAD, OFF_FRONTIER, OFF_USED};
use vostok_core::{Result, VosError};

/// Per-block header size.
pub const BLOCK_HEADER_SIZE: u64 = 16;

/// `next` value marking an allocated block.
const ALLOCATED: u64 = u64::MAX;

/// Minimum leftover payload worth splitting a free block for.
const SPLIT_MIN: u64 = 32;

impl Arena {
    /// Allocate `n` payload bytes inside the active transaction.
    ///
    /// Returns the payload offset. Fails with `NoSpace` when neither the
    /// free list nor the frontier can satisfy the request.
    pub fn alloc(&mut self, n: usize) -> Result<u64> {
        if n == 0 {
            return Err(VosError::InvalArg("zero-size allocation".into()));
        }
        let want = (n as u64 + 7) & !7;

        // First fit from the free list.
        let mut prev: u64 = 0;
        let mut cur = self.read_u64(OFF_FREE_HEAD)?;
        while cur != 0 {
            let size = self.read_u64(cur)?;
            let next = self.read_u64(cur + 8)?;
            if size >= want {
                if size >= want + BLOCK_HEADER_SIZE + SPLIT_MIN {
                    // Split: keep `want`, link the remainder where this
                    // block sat in the list.
                    let rem = cur + BLOCK_HEADER_SIZE + want;
                    self.write_u64(rem, size - want - BLOCK_HEADER_SIZE)?;
                    self.write_u64(rem + 8, next)?;
                    self.relink(prev, rem)?;
                    self.write_u64(cur, want)?;
                    self.bump_used(want as i64 + BLOCK_HEADER_SIZE as i64)?;
                } else {
                    self.relink(prev, next)?;
                    self.bump_used(size as i64 + BLOCK_HEADER_SIZE as i64)?;
                }
                self.write_u64(cur + 8, ALLOCATED)?;
                return Ok(cur + BLOCK_HEADER_SIZE);
            }
            prev = cur;
            cur = next;
        }

        // Fall back to the frontier.
        let frontier = self.read_u64(OFF_FRONTIER)?;
        if frontier + BLOCK_HEADER_SIZE + want > self.capacity() {
            return Err(VosError::NoSpace);
        }
        self.write_u64(frontier, want)?;
        self.write_u64(frontier + 8, ALLOCATED)?;
        self.write_u64(OFF_FRONTIER, frontier + BLOCK_HEADER_SIZE + want)?;
        self.bump_used(want as i64 + BLOCK_HEADER_SIZE as i64)?;
        Ok(frontier + BLOCK_HEADER_SIZE)
    }

    /// Release a payload offset. The block returns to the free list at
    /// commit; until then the address stays unavailable.
    pub fn free(&mut self, payload_off: u64) -> Result<()> {
        if payload_off < BLOCK_HEADER_SIZE {
            return Err(VosError::InvalArg(format!(
                "free of impossible offset {}",
                payload_off
            )));
        }
        let tx = self
            .tx_state()
            .ok_or_else(|| VosError::InvalState("free outside transaction".into()))?;
        tx.defer_free(payload_off);
        Ok(())
    }

    /// Immediately push a block onto the free list (commit-time path).
    pub(crate) fn free_now(&mut self, payload_off: u64) -> Result<()> {
        let block = payload_off - BLOCK_HEADER_SIZE;
        let size = self.read_u64(block)?;
        let state = self.read_u64(block + 8)?;
        if state != ALLOCATED {
            return Err(VosError::Corrupt(format!(
                "double free at offset {}",
                payload_off
            )));
        }
        let head = self.read_u64(OFF_FREE_HEAD)?;
        self.write_u64(block + 8, head)?;
        self.write_u64(OFF_FREE_HEAD, block)?;
        self.bump_used(-(size as i64 + BLOCK_HEADER_SIZE as i64))?;
        Ok(())
    }

    /// Allocated byte count (headers included).
    pub fn used(&self) -> u64 {
        self.read_u64(OFF_USED).unwrap_or(0)
    }

    /// Payload size of an allocated block.
    pub fn alloc_size(&self, payload_off: u64) -> Result<u64> {
        self.read_u64(payload_off - BLOCK_HEADER_SIZE)
    }

    fn relink(&mut self, prev: u64, to: u64) -> Result<()> {
        if prev == 0 {
            self.write_u64(OFF_FREE_HEAD, to)
        } else {
            self.write_u64(prev + 8, to)
        }
    }

    fn bump_used(&mut self, delta: i64) -> Result<()> {
        let used = self.read_u64(OFF_USED)? as i64 + delta;
        self.write_u64(OFF_USED, used.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mk(capacity: u64) -> (tempfile::TempDir, Arena) {
        let dir = tempdir().unwrap();
        let a = Arena::create(
            &dir.path().join("pool.img"),
            &dir.path().join("pool.wal"),
            [1u8; 16],
            capacity,
        )
        .unwrap();
        (dir, a)
    }

    #[test]
    fn alloc_returns_distinct_blocks() {
        let (_d, mut a) = mk(1 << 20);
        a.tx_begin().unwrap();
        let x = a.alloc(100).unwrap();
        let y = a.alloc(100).unwrap();
        assert_ne!(x, y);
        assert!(y >= x + 100);
        a.tx_commit().unwrap();
        assert!(a.used() > 200);
    }

    #[test]
    fn freed_block_is_reused_after_commit_only() {
        let (_d, mut a) = mk(1 << 20);
        a.tx_begin().unwrap();
        let x = a.alloc(64).unwrap();
        a.tx_commit().unwrap();

        a.tx_begin().unwrap();
        a.free(x).unwrap();
        // Not recycled before commit.
        let y = a.alloc(64).unwrap();
        assert_ne!(x, y);
        a.tx_commit().unwrap();

        a.tx_begin().unwrap();
        let z = a.alloc(64).unwrap();
        a.tx_commit().unwrap();
        assert_eq!(z, x);
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let (_d, mut a) = mk(4096 + 128);
        a.tx_begin().unwrap();
        let r = a.alloc(1 << 20);
        assert!(matches!(r, Err(VosError::NoSpace)));
        a.tx_abort();
    }

    #[test]
    fn aborted_alloc_rolls_back_allocator_state() {
        let (_d, mut a) = mk(1 << 20);
        let used_before = a.used();
        a.tx_begin().unwrap();
        a.alloc(512).unwrap();
        a.tx_abort();
        assert_eq!(a.used(), used_before);

        // The same space is handed out again.
        a.tx_begin().unwrap();
        let x = a.alloc(512).unwrap();
        a.tx_commit().unwrap();

        a.tx_begin().unwrap();
        let y = a.alloc(512).unwrap();
        a.tx_commit().unwrap();
        assert!(y > x);
    }

    #[test]
    fn split_leaves_usable_remainder() {
        let (_d, mut a) = mk(1 << 20);
        a.tx_begin().unwrap();
        let big = a.alloc(1024).unwrap();
        a.tx_commit().unwrap();

        a.tx_begin().unwrap();
        a.free(big).unwrap();
        a.tx_commit().unwrap();

        // A small alloc should carve out of the freed kilobyte.
        a.tx_begin().unwrap();
        let small = a.alloc(64).unwrap();
        let rest = a.alloc(512).unwrap();
        a.tx_commit().unwrap();
        assert_eq!(small, big);
        assert!(rest > small && rest < big + 2048);
    }

    #[test]
    fn double_free_detected_at_commit() {
        let (_d, mut a) = mk(1 << 20);
        a.tx_begin().unwrap();
        let x = a.alloc(64).unwrap();
        a.tx_commit().unwrap();

        a.tx_begin().unwrap();
        a.free(x).unwrap();
        a.free(x).unwrap();
        assert!(a.tx_commit().is_err());
    }
}
