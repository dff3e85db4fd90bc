//! WAL reader.
//!
//! Reads framed records sequentially. A torn frame or a CRC mismatch
//! terminates the scan: everything before it is returned, and the byte
//! offset of the bad frame is reported so replay can truncate the tail.

use super::record::{WalRecord, FRAME_LEN_SIZE};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Result of scanning a WAL file.
#[derive(Debug)]
pub struct WalReadOutcome {
    /// Records that decoded cleanly, in file order
    pub records: Vec<WalRecord>,
    /// Byte offset of the first torn/corrupt frame, if any
    pub truncate_at: Option<u64>,
}

impl WalReadOutcome {
    /// True when the whole file decoded without damage.
    pub fn clean(&self) -> bool {
        self.truncate_at.is_none()
    }
}

/// Scan all records out of a WAL file.
///
/// A missing file reads as an empty, clean log.
pub fn read_records(path: &Path) -> std::io::Result<WalReadOutcome> {
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut f) => {
            f.read_to_end(&mut data)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(WalReadOutcome {
                records: Vec::new(),
                truncate_at: None,
            });
        }
        Err(e) => return Err(e),
    }

    let mut records = Vec::new();
    let mut pos: usize = 0;
    while pos < data.len() {
        if pos + FRAME_LEN_SIZE > data.len() {
            return Ok(WalReadOutcome {
                records,
                truncate_at: Some(pos as u64),
            });
        }
        let body_len =
            u32::from_le_bytes(data[pos..pos + FRAME_LEN_SIZE].try_into().unwrap()) as usize;
        let body_start = pos + FRAME_LEN_SIZE;
        if body_len == 0 || body_start + body_len > data.len() {
            return Ok(WalReadOutcome {
                records,
                truncate_at: Some(pos as u64),
            });
        }
        match WalRecord::from_body(&data[body_start..body_start + body_len]) {
            Some(rec) => records.push(rec),
            None => {
                return Ok(WalReadOutcome {
                    records,
                    truncate_at: Some(pos as u64),
                });
            }
        }
        pos = body_start + body_len;
    }

    Ok(WalReadOutcome {
        records,
        truncate_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::record::WalRange;
    use crate::wal::writer::WalWriter;
    use std::io::Write;
    use tempfile::tempdir;

    fn rec(seq: u64) -> WalRecord {
        WalRecord::new(
            seq,
            seq,
            vec![WalRange {
                off: seq,
                bytes: vec![seq as u8; 16],
            }],
        )
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let outcome = read_records(&dir.path().join("absent.wal")).unwrap();
        assert!(outcome.records.is_empty());
        assert!(outcome.clean());
    }

    #[test]
    fn torn_tail_keeps_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.wal");
        let mut w = WalWriter::open(&path).unwrap();
        w.append(&rec(1)).unwrap();
        w.append(&rec(2)).unwrap();
        let good_len = std::fs::metadata(&path).unwrap().len();

        // Simulate a torn third record: a frame cut off mid-body.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        let torn = rec(3).to_bytes();
        f.write_all(&torn[..torn.len() / 2]).unwrap();
        drop(f);

        let outcome = read_records(&path).unwrap();
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.truncate_at, Some(good_len));
    }

    #[test]
    fn bad_crc_terminates_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.wal");
        let mut w = WalWriter::open(&path).unwrap();
        w.append(&rec(1)).unwrap();
        let first_len = std::fs::metadata(&path).unwrap().len();
        w.append(&rec(2)).unwrap();
        w.append(&rec(3)).unwrap();

        // Flip a payload byte inside the second record.
        let mut data = std::fs::read(&path).unwrap();
        let idx = first_len as usize + 30;
        data[idx] ^= 0x01;
        std::fs::write(&path, &data).unwrap();

        let outcome = read_records(&path).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.truncate_at, Some(first_len));
    }
}
