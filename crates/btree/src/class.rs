//! Tree classes.
//!
//! A class fixes how a tree derives its fixed-size hashed key from the
//! caller's full key, whether the full key is stored alongside the record
//! for collision disambiguation, and how colliding keys are resolved.
//!
//! Classes are a closed sum type rather than a table of callbacks: the
//! per-class behaviour is small, and dispatch stays monomorphic inside
//! each match arm.

use vostok_core::{Result, VosError};
use xxhash_rust::xxh3::xxh3_128;

/// Size of the fixed hashed key stored in tree nodes.
pub const HKEY_SIZE: usize = 16;

/// Fixed-size hashed key.
pub type HKey = [u8; HKEY_SIZE];

/// The closed set of tree classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TreeClass {
    /// 128-bit hash of the full key; collisions resolved by byte-wise
    /// comparison of the stored full key
    Hashed = 0,
    /// Like `Hashed` but with no comparator registered: distinct keys
    /// that collide are refused
    HashedUnique = 1,
    /// 64-bit integer keys, big-endian encoded so byte order is numeric
    Uint64 = 2,
    /// Variable-length byte-string keys in lexicographic order; the first
    /// 16 bytes route, the stored full key breaks prefix ties
    Lexical = 3,
    /// Fixed 16-byte keys compared byte-wise (object-ids, extent keys)
    Fixed16 = 4,
}

impl TreeClass {
    /// Persistent class id.
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Decode a persistent class id.
    pub fn from_id(id: u32) -> Option<TreeClass> {
        match id {
            0 => Some(TreeClass::Hashed),
            1 => Some(TreeClass::HashedUnique),
            2 => Some(TreeClass::Uint64),
            3 => Some(TreeClass::Lexical),
            4 => Some(TreeClass::Fixed16),
            _ => None,
        }
    }

    /// Derive the fixed hashed key for a full key.
    pub fn hkey(self, key: &[u8]) -> Result<HKey> {
        let mut out = [0u8; HKEY_SIZE];
        match self {
            TreeClass::Hashed | TreeClass::HashedUnique => {
                out.copy_from_slice(&xxh3_128(key).to_be_bytes());
            }
            TreeClass::Uint64 => {
                if key.len() != 8 {
                    return Err(VosError::InvalArg(format!(
                        "uint64 key must be 8 bytes, got {}",
                        key.len()
                    )));
                }
                out[8..].copy_from_slice(key);
            }
            TreeClass::Lexical => {
                if key.is_empty() {
                    return Err(VosError::InvalArg("empty lexical key".into()));
                }
                let n = key.len().min(HKEY_SIZE);
                out[..n].copy_from_slice(&key[..n]);
            }
            TreeClass::Fixed16 => {
                if key.len() != HKEY_SIZE {
                    return Err(VosError::InvalArg(format!(
                        "fixed key must be 16 bytes, got {}",
                        key.len()
                    )));
                }
                out.copy_from_slice(key);
            }
        }
        Ok(out)
    }

    /// Whether records keep the full key for collision disambiguation.
    pub fn stores_full_key(self) -> bool {
        matches!(
            self,
            TreeClass::Hashed | TreeClass::HashedUnique | TreeClass::Lexical
        )
    }

    /// Whether a comparator resolves colliding hashed keys. Without one,
    /// inserting a second distinct key under the same hashed key fails.
    pub fn has_comparator(self) -> bool {
        matches!(self, TreeClass::Hashed | TreeClass::Lexical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip() {
        for id in 0..5 {
            assert_eq!(TreeClass::from_id(id).unwrap().id(), id);
        }
        assert!(TreeClass::from_id(5).is_none());
    }

    #[test]
    fn uint64_hkey_preserves_numeric_order() {
        let c = TreeClass::Uint64;
        let a = c.hkey(&1u64.to_be_bytes()).unwrap();
        let b = c.hkey(&256u64.to_be_bytes()).unwrap();
        assert!(a < b);
        assert!(c.hkey(&[1, 2, 3]).is_err());
    }

    #[test]
    fn lexical_hkey_preserves_prefix_order() {
        let c = TreeClass::Lexical;
        assert!(c.hkey(b"abc").unwrap() < c.hkey(b"abd").unwrap());
        assert!(c.hkey(b"ab").unwrap() <= c.hkey(b"abc").unwrap());
        assert!(c.hkey(b"").is_err());
    }

    #[test]
    fn hashed_is_deterministic_and_spreads() {
        let c = TreeClass::Hashed;
        assert_eq!(c.hkey(b"dkey").unwrap(), c.hkey(b"dkey").unwrap());
        assert_ne!(c.hkey(b"dkey").unwrap(), c.hkey(b"akey").unwrap());
    }

    #[test]
    fn fixed16_requires_exact_width() {
        let c = TreeClass::Fixed16;
        assert!(c.hkey(&[0u8; 16]).is_ok());
        assert!(c.hkey(&[0u8; 15]).is_err());
    }

    #[test]
    fn full_key_and_comparator_policy() {
        assert!(TreeClass::Hashed.stores_full_key());
        assert!(TreeClass::Hashed.has_comparator());
        assert!(TreeClass::HashedUnique.stores_full_key());
        assert!(!TreeClass::HashedUnique.has_comparator());
        assert!(!TreeClass::Uint64.stores_full_key());
        assert!(!TreeClass::Fixed16.stores_full_key());
        assert!(TreeClass::Lexical.has_comparator());
    }
}
