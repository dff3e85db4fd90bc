//! Pool superblock layout.
//!
//! The pool file begins with a fixed superblock at offset 0. Everything
//! after it belongs to the allocator.
//!
//! # Superblock Layout
//!
//! ```text
//! ┌────────┬──────────────────────────────────────────┐
//! │ offset │ field                                    │
//! ├────────┼──────────────────────────────────────────┤
//! │ 0      │ magic "VOSP" (4 bytes)                   │
//! │ 4      │ layout version (u32, currently 2)        │
//! │ 8      │ pool UUID (16 bytes)                     │
//! │ 24     │ arena capacity (u64)                     │
//! │ 32     │ container-directory root offset (u64)    │
//! │ 40     │ WAL head sequence (u64)                  │
//! │ 48     │ WAL tail sequence (u64)                  │
//! │ 56     │ allocator free-list head (u64)           │
//! │ 64     │ allocator frontier (u64)                 │
//! │ 72     │ allocated bytes (u64)                    │
//! │ 80..   │ reserved                                 │
//! └────────┴──────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Layout version 1 is recognised but
//! rejected with `Incompat`; the WAL head/tail fields are only meaningful
//! at checkpoint boundaries (replay re-derives the live values).

use vostok_core::{Result, VosError};

/// Magic bytes identifying a pool file.
pub const POOL_MAGIC: [u8; 4] = *b"VOSP";

/// Current superblock layout version.
pub const LAYOUT_VERSION: u32 = 2;

/// Total reserved size of the superblock region.
pub const SUPERBLOCK_SIZE: u64 = 128;

/// Field offset: magic bytes
pub const OFF_MAGIC: u64 = 0;
/// Field offset: layout version
pub const OFF_VERSION: u64 = 4;
/// Field offset: pool uuid
pub const OFF_UUID: u64 = 8;
/// Field offset: arena capacity
pub const OFF_CAPACITY: u64 = 24;
/// Field offset: container-directory root
pub const OFF_ROOT: u64 = 32;
/// Field offset: WAL head sequence
pub const OFF_WAL_HEAD: u64 = 40;
/// Field offset: WAL tail sequence
pub const OFF_WAL_TAIL: u64 = 48;
/// Field offset: allocator free-list head
pub const OFF_FREE_HEAD: u64 = 56;
/// Field offset: allocator frontier
pub const OFF_FRONTIER: u64 = 64;
/// Field offset: allocated byte count
pub const OFF_USED: u64 = 72;

/// Decoded superblock, used for validation at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Pool UUID
    pub uuid: [u8; 16],
    /// Arena capacity in bytes (equals the pool file size)
    pub capacity: u64,
    /// Container-directory root offset (0 = none yet)
    pub root: u64,
    /// Sequence of the next WAL record at last checkpoint
    pub wal_head: u64,
    /// First sequence not reflected in the checkpointed image
    pub wal_tail: u64,
}

impl Superblock {
    /// Initialise the superblock region of a fresh image.
    pub fn format(image: &mut [u8], uuid: [u8; 16], capacity: u64) {
        image[0..4].copy_from_slice(&POOL_MAGIC);
        image[4..8].copy_from_slice(&LAYOUT_VERSION.to_le_bytes());
        image[8..24].copy_from_slice(&uuid);
        image[24..32].copy_from_slice(&capacity.to_le_bytes());
        image[32..40].copy_from_slice(&0u64.to_le_bytes());
        image[40..48].copy_from_slice(&1u64.to_le_bytes());
        image[48..56].copy_from_slice(&1u64.to_le_bytes());
        image[56..64].copy_from_slice(&0u64.to_le_bytes());
        image[64..72].copy_from_slice(&SUPERBLOCK_SIZE.to_le_bytes());
        image[72..80].copy_from_slice(&0u64.to_le_bytes());
    }

    /// Decode and validate the superblock of an existing image.
    ///
    /// Rejects version 1 with `Incompat` (recognised, unsupported) and
    /// anything else unexpected with `Corrupt`.
    pub fn decode(image: &[u8]) -> Result<Superblock> {
        if image.len() < SUPERBLOCK_SIZE as usize {
            return Err(VosError::Corrupt("pool file shorter than superblock".into()));
        }
        if image[0..4] != POOL_MAGIC {
            return Err(VosError::Corrupt("bad pool magic".into()));
        }
        let version = u32::from_le_bytes(image[4..8].try_into().unwrap());
        if version == 1 {
            return Err(VosError::Incompat { found: 1 });
        }
        if version != LAYOUT_VERSION {
            return Err(VosError::Corrupt(format!(
                "unknown pool layout version {}",
                version
            )));
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&image[8..24]);
        let capacity = u64::from_le_bytes(image[24..32].try_into().unwrap());
        if capacity as usize != image.len() {
            return Err(VosError::Corrupt(format!(
                "superblock capacity {} does not match file size {}",
                capacity,
                image.len()
            )));
        }
        Ok(Superblock {
            uuid,
            capacity,
            root: u64::from_le_bytes(image[32..40].try_into().unwrap()),
            wal_head: u64::from_le_bytes(image[40..48].try_into().unwrap()),
            wal_tail: u64::from_le_bytes(image[48..56].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_image() -> Vec<u8> {
        let mut image = vec![0u8; 4096];
        Superblock::format(&mut image, [7u8; 16], 4096);
        image
    }

    #[test]
    fn format_then_decode_round_trips() {
        let image = fresh_image();
        let sb = Superblock::decode(&image).unwrap();
        assert_eq!(sb.uuid, [7u8; 16]);
        assert_eq!(sb.capacity, 4096);
        assert_eq!(sb.root, 0);
        assert_eq!(sb.wal_head, 1);
        assert_eq!(sb.wal_tail, 1);
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let mut image = fresh_image();
        image[0] = b'X';
        assert!(matches!(
            Superblock::decode(&image),
            Err(VosError::Corrupt(_))
        ));
    }

    #[test]
    fn version_one_is_incompat() {
        let mut image = fresh_image();
        image[4..8].copy_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            Superblock::decode(&image),
            Err(VosError::Incompat { found: 1 })
        ));
    }

    #[test]
    fn unknown_version_is_corrupt() {
        let mut image = fresh_image();
        image[4..8].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            Superblock::decode(&image),
            Err(VosError::Corrupt(_))
        ));
    }

    #[test]
    fn capacity_mismatch_is_corrupt() {
        let mut image = fresh_image();
        image.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            Superblock::decode(&image),
            Err(VosError::Corrupt(_))
        ));
    }
}
