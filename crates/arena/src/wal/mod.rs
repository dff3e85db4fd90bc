//! Write-ahead log: framing, append, scan.
//!
//! - `record`: framed record format `(seq, tx_id, ranges…, crc32)`
//! - `writer`: append + fsync, reset after checkpoint
//! - `reader`: sequential scan, stops at the first torn or corrupt frame

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::{read_records, WalReadOutcome};
pub use record::{WalRange, WalRecord};
pub use writer::WalWriter;
