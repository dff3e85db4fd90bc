//! Core identity types for the Vostok object store
//!
//! - `Epoch`: 64-bit monotone token ordering mutations within a pool
//! - `PoolId` / `ContId`: UUID-backed identities for pools and containers
//! - `ObjType`: the closed object-type enumeration (stable bit-for-bit)
//! - `ObjId`: 128-bit object identifier with the type encoded in its high word
//! - `DtxId`: distributed-transaction identity `(leader epoch, sequence)`

use crate::error::{Result, VosError};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A 64-bit monotone token ordering mutations within a pool.
///
/// Epochs are opaque to every component except the epoch manager that
/// issues them; comparisons are the only meaningful operation elsewhere.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Epoch(pub u64);

/// Highest possible epoch; reads at `EPOCH_MAX` observe all committed state.
pub const EPOCH_MAX: Epoch = Epoch(u64::MAX);

impl Epoch {
    /// Raw value accessor
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// True for epochs that may stamp a mutation (zero is reserved)
    pub fn is_valid_stamp(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identity of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId(Uuid);

impl PoolId {
    /// Create a new random pool identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuild from raw bytes (superblock storage)
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw byte accessor
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identity of a container within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContId(Uuid);

impl ContId {
    /// Create a new random container identity
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuild from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw byte accessor
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ContId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed object-type enumeration.
///
/// The numeric values are part of the persistent format and must be
/// preserved bit-for-bit; anything outside `0..=14` in an object-id type
/// field is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ObjType {
    /// Hashed dkeys and akeys
    MultiHashed = 0,
    /// Object-index table
    Oit = 1,
    /// 64-bit integer dkeys, hashed akeys
    DkeyUint64 = 2,
    /// Hashed dkeys, 64-bit integer akeys
    AkeyUint64 = 3,
    /// 64-bit integer dkeys and akeys
    MultiUint64 = 4,
    /// Lexically ordered dkeys, hashed akeys
    DkeyLexical = 5,
    /// Hashed dkeys, lexically ordered akeys
    AkeyLexical = 6,
    /// Lexically ordered dkeys and akeys
    MultiLexical = 7,
    /// Flat key/value, hashed keys
    KvHashed = 8,
    /// Flat key/value, integer keys
    KvUint64 = 9,
    /// Flat key/value, lexical keys
    KvLexical = 10,
    /// Array object
    Array = 11,
    /// Array object with attributes
    ArrayAttr = 12,
    /// Byte-array object
    ArrayByte = 13,
    /// Object-index table, second generation
    OitV2 = 14,
}

impl ObjType {
    /// Decode from the raw type field; `None` outside the closed set.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ObjType::MultiHashed),
            1 => Some(ObjType::Oit),
            2 => Some(ObjType::DkeyUint64),
            3 => Some(ObjType::AkeyUint64),
            4 => Some(ObjType::MultiUint64),
            5 => Some(ObjType::DkeyLexical),
            6 => Some(ObjType::AkeyLexical),
            7 => Some(ObjType::MultiLexical),
            8 => Some(ObjType::KvHashed),
            9 => Some(ObjType::KvUint64),
            10 => Some(ObjType::KvLexical),
            11 => Some(ObjType::Array),
            12 => Some(ObjType::ArrayAttr),
            13 => Some(ObjType::ArrayByte),
            14 => Some(ObjType::OitV2),
            _ => None,
        }
    }

    /// Raw value accessor
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Distribution keys are 64-bit integers
    pub fn dkey_is_uint64(self) -> bool {
        matches!(
            self,
            ObjType::DkeyUint64 | ObjType::MultiUint64 | ObjType::KvUint64
        )
    }

    /// Distribution keys are lexically ordered byte strings
    pub fn dkey_is_lexical(self) -> bool {
        matches!(
            self,
            ObjType::DkeyLexical | ObjType::MultiLexical | ObjType::KvLexical
        )
    }

    /// Attribute keys are 64-bit integers
    pub fn akey_is_uint64(self) -> bool {
        matches!(
            self,
            ObjType::AkeyUint64 | ObjType::MultiUint64 | ObjType::Array | ObjType::ArrayByte
        )
    }

    /// Attribute keys are lexically ordered byte strings
    pub fn akey_is_lexical(self) -> bool {
        matches!(self, ObjType::AkeyLexical | ObjType::MultiLexical)
    }
}

/// Bit layout of the high word of an object-id.
///
/// The upper 32 bits of `hi` carry object metadata:
///
/// ```text
/// bits 63..48   shard hint
/// bits 47..40   redundancy hint
/// bits 39..32   object type (closed enumeration)
/// bits 31..0    caller-owned
/// ```
const OID_TYPE_SHIFT: u64 = 32;
const OID_RDX_SHIFT: u64 = 40;
const OID_SHARD_SHIFT: u64 = 48;

/// 128-bit object identifier.
///
/// The high word encodes the object type and redundancy/shard hints; the
/// rest is caller-owned. Objects are created implicitly on first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjId {
    /// High 64 bits (type + hints + caller bits)
    pub hi: u64,
    /// Low 64 bits (caller-owned)
    pub lo: u64,
}

impl ObjId {
    /// Build an object-id with the given type and hints.
    pub fn new(otype: ObjType, rdx_hint: u8, shard_hint: u16, hi_bits: u32, lo: u64) -> Self {
        let hi = ((shard_hint as u64) << OID_SHARD_SHIFT)
            | ((rdx_hint as u64) << OID_RDX_SHIFT)
            | ((otype.as_u32() as u64) << OID_TYPE_SHIFT)
            | hi_bits as u64;
        ObjId { hi, lo }
    }

    /// Raw value of the type field (may be outside the closed set).
    pub fn type_field(&self) -> u32 {
        ((self.hi >> OID_TYPE_SHIFT) & 0xff) as u32
    }

    /// Decode the object type, failing on values outside the closed set.
    pub fn otype(&self) -> Result<ObjType> {
        ObjType::from_u32(self.type_field()).ok_or(VosError::InvalType(self.type_field()))
    }

    /// Redundancy hint bits
    pub fn rdx_hint(&self) -> u8 {
        ((self.hi >> OID_RDX_SHIFT) & 0xff) as u8
    }

    /// Shard hint bits
    pub fn shard_hint(&self) -> u16 {
        ((self.hi >> OID_SHARD_SHIFT) & 0xffff) as u16
    }

    /// Big-endian 16-byte encoding, ordered (hi, lo).
    pub fn to_be_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.hi.to_be_bytes());
        out[8..].copy_from_slice(&self.lo.to_be_bytes());
        out
    }

    /// Rebuild from the big-endian 16-byte encoding.
    pub fn from_be_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let hi = u64::from_be_bytes(bytes[..8].try_into().ok()?);
        let lo = u64::from_be_bytes(bytes[8..].try_into().ok()?);
        Some(ObjId { hi, lo })
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}.{:016x}", self.hi, self.lo)
    }
}

/// Distributed-transaction identity: `(leader epoch, sequence)`.
///
/// The sequence is unique within a pool lifetime; the pair orders conflict
/// resolution deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DtxId {
    /// Epoch stamped by the transaction leader at open
    pub leader_epoch: Epoch,
    /// Pool-unique sequence number (nonzero)
    pub seq: u64,
}

impl fmt::Display for DtxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dtx:{}.{}", self.leader_epoch, self.seq)
    }
}
