//! WAL record framing.
//!
//! # Record Layout
//!
//! ```text
//! ┌──────────────┬─────────────────────────────────────────────┬──────────┐
//! │ Length (4)   │ Body (variable)                             │          │
//! └──────────────┴─────────────────────────────────────────────┴──────────┘
//!
//! Body:
//! ┌─────────┬───────────┬───────────────┬──────────────────────┬──────────┐
//! │ Seq (8) │ TxId (8)  │ RangeCount (4)│ Ranges (variable)    │ CRC32 (4)│
//! └─────────┴───────────┴───────────────┴──────────────────────┴──────────┘
//!
//! Range:
//! ┌────────────┬───────────┬──────────────────┐
//! │ Offset (8) │ Len (4)   │ Bytes (variable) │
//! └────────────┴───────────┴──────────────────┘
//! ```
//!
//! All integers little-endian. The CRC covers the body up to itself; a
//! record with a bad CRC terminates replay.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

/// Size of the length prefix.
pub const FRAME_LEN_SIZE: usize = 4;

/// A contiguous byte-range mutation captured by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRange {
    /// Arena offset of the range
    pub off: u64,
    /// New bytes for the range
    pub bytes: Vec<u8>,
}

/// One committed transaction's redo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Monotone record sequence
    pub seq: u64,
    /// Transaction identity (equals `seq` for implicit transactions)
    pub tx_id: u64,
    /// Byte ranges to redo, in capture order
    pub ranges: Vec<WalRange>,
}

impl WalRecord {
    /// Create a record.
    pub fn new(seq: u64, tx_id: u64, ranges: Vec<WalRange>) -> Self {
        WalRecord { seq, tx_id, ranges }
    }

    /// Serialize to the framed wire form (length prefix included).
    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len: usize = 8
            + 8
            + 4
            + self
                .ranges
                .iter()
                .map(|r| 12 + r.bytes.len())
                .sum::<usize>()
            + 4;
        let mut out = Vec::with_capacity(FRAME_LEN_SIZE + body_len);
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&self.tx_id.to_le_bytes());
        out.extend_from_slice(&(self.ranges.len() as u32).to_le_bytes());
        for r in &self.ranges {
            out.extend_from_slice(&r.off.to_le_bytes());
            out.extend_from_slice(&(r.bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&r.bytes);
        }
        let mut hasher = Hasher::new();
        hasher.update(&out[FRAME_LEN_SIZE..]);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
        out
    }

    /// Deserialize a record body (the bytes after the length prefix).
    ///
    /// Returns `None` on any structural or CRC mismatch.
    pub fn from_body(body: &[u8]) -> Option<WalRecord> {
        if body.len() < 8 + 8 + 4 + 4 {
            return None;
        }
        let crc_off = body.len() - 4;
        let stored_crc = LittleEndian::read_u32(&body[crc_off..]);
        let mut hasher = Hasher::new();
        hasher.update(&body[..crc_off]);
        if hasher.finalize() != stored_crc {
            return None;
        }
        let seq = LittleEndian::read_u64(&body[0..8]);
        let tx_id = LittleEndian::read_u64(&body[8..16]);
        let count = LittleEndian::read_u32(&body[16..20]) as usize;
        let mut ranges = Vec::with_capacity(count);
        let mut pos = 20;
        for _ in 0..count {
            if pos + 12 > crc_off {
                return None;
            }
            let off = LittleEndian::read_u64(&body[pos..pos + 8]);
            let len = LittleEndian::read_u32(&body[pos + 8..pos + 12]) as usize;
            pos += 12;
            if pos + len > crc_off {
                return None;
            }
            ranges.push(WalRange {
                off,
                bytes: body[pos..pos + len].to_vec(),
            });
            pos += len;
        }
        if pos != crc_off {
            return None;
        }
        Some(WalRecord { seq, tx_id, ranges })
    }
}
