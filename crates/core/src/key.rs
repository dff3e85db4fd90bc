//! Distribution and attribute keys
//!
//! A key is either a byte string or a 64-bit integer, per the owning
//! object's type. Byte-string keys order lexicographically, integer keys
//! numerically; the big-endian tree encoding makes the two coincide.

use crate::limits::Limits;
use thiserror::Error;

/// A distribution or attribute key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyBuf {
    /// Variable-length byte-string key (lexicographic order)
    Bytes(Vec<u8>),
    /// 64-bit integer key (numeric order)
    Uint(u64),
}

impl KeyBuf {
    /// Tree encoding: bytes as-is, integers big-endian so byte order is
    /// numeric order.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            KeyBuf::Bytes(b) => b.clone(),
            KeyBuf::Uint(v) => v.to_be_bytes().to_vec(),
        }
    }

    /// Decode an integer key back from its tree encoding.
    pub fn decode_uint(bytes: &[u8]) -> Option<u64> {
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    }

    /// Validate against pool limits.
    pub fn validate(&self, limits: &Limits) -> Result<(), KeyError> {
        match self {
            KeyBuf::Bytes(b) => {
                if b.is_empty() {
                    return Err(KeyError::Empty);
                }
                if b.len() > limits.max_key_bytes {
                    return Err(KeyError::TooLong {
                        actual: b.len(),
                        max: limits.max_key_bytes,
                    });
                }
                Ok(())
            }
            KeyBuf::Uint(_) => Ok(()),
        }
    }

    /// True for integer keys
    pub fn is_uint(&self) -> bool {
        matches!(self, KeyBuf::Uint(_))
    }
}

impl From<&[u8]> for KeyBuf {
    fn from(b: &[u8]) -> Self {
        KeyBuf::Bytes(b.to_vec())
    }
}

impl From<&str> for KeyBuf {
    fn from(s: &str) -> Self {
        KeyBuf::Bytes(s.as_bytes().to_vec())
    }
}

impl From<u64> for KeyBuf {
    fn from(v: u64) -> Self {
        KeyBuf::Uint(v)
    }
}

/// Key validation errors; surface as `InvalArg` at the API boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// Byte-string keys must be non-empty
    #[error("key is empty")]
    Empty,

    /// Key exceeds the configured maximum
    #[error("key is {actual} bytes, max is {max}")]
    TooLong {
        /// Actual key length
        actual: usize,
        /// Configured maximum
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_encoding_preserves_numeric_order() {
        let a = KeyBuf::Uint(1).encode();
        let b = KeyBuf::Uint(256).encode();
        let c = KeyBuf::Uint(u64::MAX).encode();
        assert!(a < b);
        assert!(b < c);
        assert_eq!(KeyBuf::decode_uint(&b), Some(256));
    }

    #[test]
    fn bytes_validation() {
        let limits = Limits::default();
        assert!(KeyBuf::from("dkey-0").validate(&limits).is_ok());
        assert_eq!(
            KeyBuf::Bytes(vec![]).validate(&limits),
            Err(KeyError::Empty)
        );
        let long = KeyBuf::Bytes(vec![b'x'; limits.max_key_bytes + 1]);
        assert!(matches!(
            long.validate(&limits),
            Err(KeyError::TooLong { .. })
        ));
    }

    #[test]
    fn uint_keys_always_valid() {
        assert!(KeyBuf::Uint(0).validate(&Limits::default()).is_ok());
    }
}
