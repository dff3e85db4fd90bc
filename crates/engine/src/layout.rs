//! Engine record layouts.
//!
//! Every structure here is persisted inside the pool arena as a B-tree
//! value, hand-framed little-endian. Fixed-size layouts are patched in
//! place through their value offset; only the container descriptor (which
//! carries the snapshot list) is variable length.

use byteorder::{ByteOrder, LittleEndian};
use vostok_core::{Epoch, Result, VosError};

/// Offset inside the superblock's reserved area where the engine keeps the
/// highest stamped epoch, so the clock resumes monotone after reopen.
pub const OFF_MAX_EPOCH: u64 = 80;

/// Value kind of an attribute key, fixed on first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ValueKind {
    /// No value written yet (dkey-level metadata, or akey before first write)
    Unset = 0,
    /// Single-value: one opaque payload per epoch
    Single = 1,
    /// Array of fixed-size records indexed by 64-bit offsets
    Array = 2,
}

impl ValueKind {
    /// Decode from the persistent tag.
    pub fn from_u32(v: u32) -> Option<ValueKind> {
        match v {
            0 => Some(ValueKind::Unset),
            1 => Some(ValueKind::Single),
            2 => Some(ValueKind::Array),
            _ => None,
        }
    }
}

// =============================================================================
// Container descriptor
// =============================================================================

/// Container descriptor: value of the container directory, keyed by the
/// container UUID.
///
/// ```text
/// oi_root (u64) | nobjs (u64) | used (u64) | nsnaps (u32) | pad (u32)
/// | snapshots: nsnaps × u64
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContMeta {
    /// Root descriptor offset of the object index
    pub oi_root: u64,
    /// Live object count
    pub nobjs: u64,
    /// Payload bytes attributed to this container
    pub used: u64,
    /// Pinned snapshot epochs, ascending
    pub snaps: Vec<Epoch>,
}

/// Byte offset of `nobjs` within an encoded [`ContMeta`].
pub const CONT_NOBJS_OFF: u64 = 8;
/// Byte offset of `used` within an encoded [`ContMeta`].
pub const CONT_USED_OFF: u64 = 16;

impl ContMeta {
    /// Fixed prefix size before the snapshot list.
    pub const FIXED: usize = 32;

    /// Encode to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::FIXED + self.snaps.len() * 8];
        LittleEndian::write_u64(&mut out[0..8], self.oi_root);
        LittleEndian::write_u64(&mut out[8..16], self.nobjs);
        LittleEndian::write_u64(&mut out[16..24], self.used);
        LittleEndian::write_u32(&mut out[24..28], self.snaps.len() as u32);
        for (i, s) in self.snaps.iter().enumerate() {
            LittleEndian::write_u64(
                &mut out[Self::FIXED + i * 8..Self::FIXED + (i + 1) * 8],
                s.0,
            );
        }
        out
    }

    /// Decode from bytes.
    pub fn decode(buf: &[u8]) -> Result<ContMeta> {
        if buf.len() < Self::FIXED {
            return Err(VosError::Corrupt("container descriptor too short".into()));
        }
        let nsnaps = LittleEndian::read_u32(&buf[24..28]) as usize;
        if buf.len() < Self::FIXED + nsnaps * 8 {
            return Err(VosError::Corrupt(
                "container descriptor snapshot list truncated".into(),
            ));
        }
        let mut snaps = Vec::with_capacity(nsnaps);
        for i in 0..nsnaps {
            snaps.push(Epoch(LittleEndian::read_u64(
                &buf[Self::FIXED + i * 8..Self::FIXED + (i + 1) * 8],
            )));
        }
        Ok(ContMeta {
            oi_root: LittleEndian::read_u64(&buf[0..8]),
            nobjs: LittleEndian::read_u64(&buf[8..16]),
            used: LittleEndian::read_u64(&buf[16..24]),
            snaps,
        })
    }

    /// True when a snapshot epoch falls inside `[lo, hi)`.
    pub fn has_snap_in(&self, lo: Epoch, hi: Epoch) -> bool {
        self.snaps.iter().any(|s| *s >= lo && *s < hi)
    }
}

// =============================================================================
// Object descriptor
// =============================================================================

/// Object descriptor: value of the object index, keyed by the 16-byte
/// big-endian object-id. Fixed 64 bytes so marks patch in place.
///
/// ```text
/// dkey_root (u64) | ilog (u64) | otype (u32) | mark_len (u32)
/// | mark (32 bytes) | max_epoch (u64)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjMeta {
    /// Root descriptor offset of the distribution-key tree
    pub dkey_root: u64,
    /// Incarnation log blob offset
    pub ilog: u64,
    /// Raw object type field
    pub otype: u32,
    /// Opaque mark (≤ 32 bytes), cleared only explicitly
    pub mark: Vec<u8>,
    /// Highest epoch that mutated this object
    pub max_epoch: Epoch,
}

/// Encoded size of [`ObjMeta`].
pub const OBJ_META_SIZE: usize = 64;
/// Byte offset of the ilog field within an encoded [`ObjMeta`].
pub const OBJ_ILOG_OFF: u64 = 8;
/// Byte offset of the mark length within an encoded [`ObjMeta`].
pub const OBJ_MARK_LEN_OFF: u64 = 20;
/// Byte offset of the mark bytes within an encoded [`ObjMeta`].
pub const OBJ_MARK_OFF: u64 = 24;
/// Byte offset of the max-epoch field within an encoded [`ObjMeta`].
pub const OBJ_MAX_EPOCH_OFF: u64 = 56;

impl ObjMeta {
    /// Encode to the fixed 64-byte form.
    pub fn encode(&self) -> [u8; OBJ_META_SIZE] {
        let mut out = [0u8; OBJ_META_SIZE];
        LittleEndian::write_u64(&mut out[0..8], self.dkey_root);
        LittleEndian::write_u64(&mut out[8..16], self.ilog);
        LittleEndian::write_u32(&mut out[16..20], self.otype);
        LittleEndian::write_u32(&mut out[20..24], self.mark.len() as u32);
        out[24..24 + self.mark.len()].copy_from_slice(&self.mark);
        LittleEndian::write_u64(&mut out[56..64], self.max_epoch.0);
        out
    }

    /// Decode from bytes.
    pub fn decode(buf: &[u8]) -> Result<ObjMeta> {
        if buf.len() < OBJ_META_SIZE {
            return Err(VosError::Corrupt("object descriptor too short".into()));
        }
        let mark_len = LittleEndian::read_u32(&buf[20..24]) as usize;
        if mark_len > 32 {
            return Err(VosError::Corrupt("object mark over 32 bytes".into()));
        }
        Ok(ObjMeta {
            dkey_root: LittleEndian::read_u64(&buf[0..8]),
            ilog: LittleEndian::read_u64(&buf[8..16]),
            otype: LittleEndian::read_u32(&buf[16..20]),
            mark: buf[24..24 + mark_len].to_vec(),
            max_epoch: Epoch(LittleEndian::read_u64(&buf[56..64])),
        })
    }
}

// =============================================================================
// Key descriptor (dkey and akey levels)
// =============================================================================

/// Key descriptor: value of dkey/akey trees. Fixed 24 bytes.
///
/// For a dkey the subtree is its akey tree; for an akey it is the
/// single-value history tree or the extent tree, per `kind`.
///
/// ```text
/// subtree (u64) | ilog (u64) | kind (u32) | rsize (u32)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMeta {
    /// Subtree root descriptor offset (0 until first value lands)
    pub subtree: u64,
    /// Incarnation log blob offset
    pub ilog: u64,
    /// Value kind (akey level)
    pub kind: ValueKind,
    /// Fixed array record size, 0 for single-value
    pub rsize: u32,
}

/// Encoded size of [`KeyMeta`].
pub const KEY_META_SIZE: usize = 24;
/// Byte offset of the subtree field within an encoded [`KeyMeta`].
pub const KEY_SUBTREE_OFF: u64 = 0;
/// Byte offset of the ilog field within an encoded [`KeyMeta`].
pub const KEY_ILOG_OFF: u64 = 8;

impl KeyMeta {
    /// Encode to the fixed 24-byte form.
    pub fn encode(&self) -> [u8; KEY_META_SIZE] {
        let mut out = [0u8; KEY_META_SIZE];
        LittleEndian::write_u64(&mut out[0..8], self.subtree);
        LittleEndian::write_u64(&mut out[8..16], self.ilog);
        LittleEndian::write_u32(&mut out[16..20], self.kind as u32);
        LittleEndian::write_u32(&mut out[20..24], self.rsize);
        out
    }

    /// Decode from bytes.
    pub fn decode(buf: &[u8]) -> Result<KeyMeta> {
        if buf.len() < KEY_META_SIZE {
            return Err(VosError::Corrupt("key descriptor too short".into()));
        }
        let kind_raw = LittleEndian::read_u32(&buf[16..20]);
        let kind = ValueKind::from_u32(kind_raw)
            .ok_or_else(|| VosError::Corrupt(format!("bad value kind {}", kind_raw)))?;
        Ok(KeyMeta {
            subtree: LittleEndian::read_u64(&buf[0..8]),
            ilog: LittleEndian::read_u64(&buf[8..16]),
            kind,
            rsize: LittleEndian::read_u32(&buf[20..24]),
        })
    }
}

// =============================================================================
// Single-value record
// =============================================================================

/// Single-value record header; the payload follows inline.
///
/// ```text
/// dtx (u64) | flags (u32) | size (u32) | crc (u32) | pad (u32) | payload
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvHdr {
    /// Owning DTX sequence (0 = committed outright)
    pub dtx: u64,
    /// Reserved flag bits
    pub flags: u32,
    /// Payload size
    pub size: u32,
    /// CRC32 of the payload
    pub crc: u32,
}

/// Encoded size of [`SvHdr`].
pub const SV_HDR_SIZE: usize = 24;

impl SvHdr {
    /// Encode header plus payload.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; SV_HDR_SIZE + payload.len()];
        LittleEndian::write_u64(&mut out[0..8], self.dtx);
        LittleEndian::write_u32(&mut out[8..12], self.flags);
        LittleEndian::write_u32(&mut out[12..16], self.size);
        LittleEndian::write_u32(&mut out[16..20], self.crc);
        out[SV_HDR_SIZE..].copy_from_slice(payload);
        out
    }

    /// Decode a header.
    pub fn decode(buf: &[u8]) -> Result<SvHdr> {
        if buf.len() < SV_HDR_SIZE {
            return Err(VosError::Corrupt("single-value record too short".into()));
        }
        Ok(SvHdr {
            dtx: LittleEndian::read_u64(&buf[0..8]),
            flags: LittleEndian::read_u32(&buf[8..12]),
            size: LittleEndian::read_u32(&buf[12..16]),
            crc: LittleEndian::read_u32(&buf[16..20]),
        })
    }
}

// =============================================================================
// Array extent record
// =============================================================================

/// Extent record flag: punch tombstone (no payload).
pub const EX_PUNCH: u32 = 1 << 0;

/// Extent record header; keyed by `(start index, epoch)`, payload inline.
///
/// ```text
/// dtx (u64) | flags (u32) | rsize (u32) | nr (u64) | crc (u32) | pad (u32)
/// | payload (nr × rsize, absent for punches)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExHdr {
    /// Owning DTX sequence (0 = committed outright)
    pub dtx: u64,
    /// Flag bits (`EX_PUNCH`)
    pub flags: u32,
    /// Record size in bytes
    pub rsize: u32,
    /// Number of records covered
    pub nr: u64,
    /// CRC32 of the payload (0 for punches)
    pub crc: u32,
}

/// Encoded size of [`ExHdr`].
pub const EX_HDR_SIZE: usize = 32;

impl ExHdr {
    /// True for punch tombstones.
    pub fn is_punch(&self) -> bool {
        self.flags & EX_PUNCH != 0
    }

    /// Encode header plus payload.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; EX_HDR_SIZE + payload.len()];
        LittleEndian::write_u64(&mut out[0..8], self.dtx);
        LittleEndian::write_u32(&mut out[8..12], self.flags);
        LittleEndian::write_u32(&mut out[12..16], self.rsize);
        LittleEndian::write_u64(&mut out[16..24], self.nr);
        LittleEndian::write_u32(&mut out[24..28], self.crc);
        out[EX_HDR_SIZE..].copy_from_slice(payload);
        out
    }

    /// Decode a header.
    pub fn decode(buf: &[u8]) -> Result<ExHdr> {
        if buf.len() < EX_HDR_SIZE {
            return Err(VosError::Corrupt("extent record too short".into()));
        }
        Ok(ExHdr {
            dtx: LittleEndian::read_u64(&buf[0..8]),
            flags: LittleEndian::read_u32(&buf[8..12]),
            rsize: LittleEndian::read_u32(&buf[12..16]),
            nr: LittleEndian::read_u64(&buf[16..24]),
            crc: LittleEndian::read_u32(&buf[24..28]),
        })
    }
}

/// Encode an extent-tree key: `(start, epoch)`, big-endian so byte order
/// matches `(start, epoch)` order.
pub fn ex_key(start: u64, epoch: Epoch) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&start.to_be_bytes());
    out[8..].copy_from_slice(&epoch.0.to_be_bytes());
    out
}

/// Decode an extent-tree key.
pub fn ex_key_decode(key: &[u8]) -> Result<(u64, Epoch)> {
    if key.len() != 16 {
        return Err(VosError::Corrupt("extent key must be 16 bytes".into()));
    }
    Ok((
        u64::from_be_bytes(key[..8].try_into().unwrap()),
        Epoch(u64::from_be_bytes(key[8..].try_into().unwrap())),
    ))
}

/// Encode an epoch as a history-tree key (big-endian u64).
pub fn epoch_key(epoch: Epoch) -> [u8; 8] {
    epoch.0.to_be_bytes()
}

/// Decode a history-tree key back into an epoch.
pub fn epoch_key_decode(key: &[u8]) -> Result<Epoch> {
    if key.len() != 8 {
        return Err(VosError::Corrupt("epoch key must be 8 bytes".into()));
    }
    Ok(Epoch(u64::from_be_bytes(key.try_into().unwrap())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cont_meta_round_trip_with_snapshots() {
        let meta = ContMeta {
            oi_root: 4096,
            nobjs: 3,
            used: 777,
            snaps: vec![Epoch(10), Epoch(50)],
        };
        let buf = meta.encode();
        assert_eq!(ContMeta::decode(&buf).unwrap(), meta);
        assert!(meta.has_snap_in(Epoch(10), Epoch(11)));
        assert!(!meta.has_snap_in(Epoch(11), Epoch(50)));
        assert!(meta.has_snap_in(Epoch(1), Epoch(100)));
    }

    #[test]
    fn obj_meta_round_trip_and_mark_cap() {
        let meta = ObjMeta {
            dkey_root: 128,
            ilog: 256,
            otype: 7,
            mark: b"oit-pass-1".to_vec(),
            max_epoch: Epoch(99),
        };
        let buf = meta.encode();
        assert_eq!(ObjMeta::decode(&buf).unwrap(), meta);

        let mut bad = buf;
        LittleEndian::write_u32(&mut bad[20..24], 33);
        assert!(ObjMeta::decode(&bad).is_err());
    }

    #[test]
    fn key_meta_round_trip() {
        let meta = KeyMeta {
            subtree: 512,
            ilog: 640,
            kind: ValueKind::Array,
            rsize: 4,
        };
        assert_eq!(KeyMeta::decode(&meta.encode()).unwrap(), meta);
    }

    #[test]
    fn sv_and_ex_headers_round_trip() {
        let sv = SvHdr {
            dtx: 9,
            flags: 0,
            size: 5,
            crc: 0xdeadbeef,
        };
        let enc = sv.encode(b"hello");
        assert_eq!(SvHdr::decode(&enc).unwrap(), sv);
        assert_eq!(&enc[SV_HDR_SIZE..], b"hello");

        let ex = ExHdr {
            dtx: 0,
            flags: EX_PUNCH,
            rsize: 1,
            nr: 4,
            crc: 0,
        };
        let enc = ex.encode(&[]);
        let back = ExHdr::decode(&enc).unwrap();
        assert!(back.is_punch());
        assert_eq!(back, ex);
    }

    #[test]
    fn extent_keys_order_by_start_then_epoch() {
        let a = ex_key(1, Epoch(50));
        let b = ex_key(1, Epoch(60));
        let c = ex_key(2, Epoch(1));
        assert!(a < b);
        assert!(b < c);
        let (start, epoch) = ex_key_decode(&b).unwrap();
        assert_eq!((start, epoch), (1, Epoch(60)));
    }

    #[test]
    fn epoch_keys_round_trip_in_order() {
        assert!(epoch_key(Epoch(9)) < epoch_key(Epoch(10)));
        assert_eq!(epoch_key_decode(&epoch_key(Epoch(77))).unwrap(), Epoch(77));
    }
}
