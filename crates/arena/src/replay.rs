//! Open-time WAL replay.
//!
//! Replay folds committed WAL records back into the pool image. It is
//! deterministic and idempotent: the same log applied to the same image
//! always converges to the same state.
//!
//! A torn or corrupt frame terminates replay; the damaged tail is
//! truncated so subsequent appends start from a clean boundary. A range
//! that points outside the arena is a structural impossibility and
//! surfaces as `Corrupt`.

use crate::wal::{read_records, WalRecord};
use std::path::Path;
use tracing::{debug, warn};
use vostok_core::{Result, VosError};

/// Summary of a replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Number of records applied
    pub applied: usize,
    /// Number of records skipped (already in the checkpointed image)
    pub skipped: usize,
    /// Sequence of the last record in the log, if any
    pub last_seq: Option<u64>,
}

/// Replay the WAL at `wal_path` into `image`, applying records with
/// `seq >= from_seq`.
pub fn replay_into(image: &mut [u8], wal_path: &Path, from_seq: u64) -> Result<ReplayStats> {
    let outcome = read_records(wal_path)?;

    if let Some(pos) = outcome.truncate_at {
        warn!(
            wal = %wal_path.display(),
            at = pos,
            "torn or corrupt WAL tail, truncating"
        );
        let f = std::fs::OpenOptions::new().write(true).open(wal_path)?;
        f.set_len(pos)?;
        f.sync_all()?;
    }

    let mut stats = ReplayStats {
        applied: 0,
        skipped: 0,
        last_seq: None,
    };
    for rec in &outcome.records {
        stats.last_seq = Some(rec.seq);
        if rec.seq < from_seq {
            stats.skipped += 1;
            continue;
        }
        apply_record(image, rec)?;
        stats.applied += 1;
    }

    debug!(
        wal = %wal_path.display(),
        applied = stats.applied,
        skipped = stats.skipped,
        "WAL replay complete"
    );
    Ok(stats)
}

fn apply_record(image: &mut [u8], rec: &WalRecord) -> Result<()> {
    for range in &rec.ranges {
        let end = range.off as usize + range.bytes.len();
        if end > image.len() {
            return Err(VosError::Corrupt(format!(
                "WAL record {} range [{}, {}) beyond arena capacity {}",
                rec.seq,
                range.off,
                end,
                image.len()
            )));
        }
        image[range.off as usize..end].copy_from_slice(&range.bytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{WalRange, WalRecord, WalWriter};
    use tempfile::tempdir;

    fn write_wal(path: &Path, records: &[WalRecord]) {
        let mut w = WalWriter::open(path).unwrap();
        for r in records {
            w.append(r).unwrap();
        }
    }

    fn rec(seq: u64, off: u64, bytes: &[u8]) -> WalRecord {
        WalRecord::new(
            seq,
            seq,
            vec![WalRange {
                off,
                bytes: bytes.to_vec(),
            }],
        )
    }

    #[test]
    fn applies_records_at_or_after_watermark() {
        let dir = tempdir().unwrap();
        let wal = dir.path().join("w.wal");
        write_wal(&wal, &[rec(1, 0, b"aa"), rec(2, 2, b"bb"), rec(3, 4, b"cc")]);

        let mut image = vec![0u8; 64];
        let stats = replay_into(&mut image, &wal, 2).unwrap();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.last_seq, Some(3));
        assert_eq!(&image[0..6], b"\0\0bbcc");
    }

    #[test]
    fn replay_is_idempotent() {
        let dir = tempdir().unwrap();
        let wal = dir.path().join("w.wal");
        write_wal(&wal, &[rec(1, 0, b"xyz")]);

        let mut image = vec![0u8; 16];
        replay_into(&mut image, &wal, 1).unwrap();
        let snapshot = image.clone();
        replay_into(&mut image, &wal, 1).unwrap();
        assert_eq!(image, snapshot);
    }

    #[test]
    fn out_of_bounds_range_is_corrupt() {
        let dir = tempdir().unwrap();
        let wal = dir.path().join("w.wal");
        write_wal(&wal, &[rec(1, 1000, b"overflow")]);

        let mut image = vec![0u8; 64];
        assert!(matches!(
            replay_into(&mut image, &wal, 1),
            Err(VosError::Corrupt(_))
        ));
    }

    #[test]
    fn torn_tail_is_truncated_and_prefix_applies() {
        let dir = tempdir().unwrap();
        let wal = dir.path().join("w.wal");
        write_wal(&wal, &[rec(1, 0, b"keep")]);
        let good = std::fs::metadata(&wal).unwrap().len();
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&wal).unwrap();
            let torn = rec(2, 8, b"lost").to_bytes();
            f.write_all(&torn[..torn.len() - 3]).unwrap();
        }

        let mut image = vec![0u8; 16];
        let stats = replay_into(&mut image, &wal, 1).unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(&image[0..4], b"keep");
        assert_eq!(std::fs::metadata(&wal).unwrap().len(), good);
    }
}
