//! The versioned key-array engine.
//!
//! Every object stores, per distribution key and attribute key, either a
//! single-value history or an extent-indexed array. Records carry epochs;
//! reads at epoch E resolve to the newest record at or below E that no
//! punch or newer record shadows.
//!
//! - `update`: the write path with conditional flags
//! - `fetch`: epoch-resolved reads
//! - `punch`: tombstones at object / dkey / akey / extent granularity
//! - `list`: anchored enumeration of dkeys, akeys, and extents
//! - `query`: min/max key and index probes

pub mod fetch;
pub mod list;
pub mod punch;
pub mod query;
pub mod update;

use crate::container::load_cont;
use crate::ilog::{ilog_entries, ilog_punch_floor, ilog_visibility, KeyVis};
use crate::layout::{ex_key_decode, epoch_key_decode, ExHdr, KeyMeta, SvHdr};
use crate::object::{load_key, load_obj, KeyCtx, ObjCtx};
use crate::pool::{dtx_visible, PoolInner};
use vostok_btree::{Btree, BtreeIter, Probe};
use vostok_core::{ContId, Epoch, KeyBuf, ObjId, Result, VosError};

/// Conditional-update flags of the write path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CondFlags {
    /// Fail with `PrecondFail` when the dkey already exists
    pub insert_dkey: bool,
    /// Fail with `NoKey` when the dkey does not exist
    pub update_dkey: bool,
    /// Fail with `PrecondFail` when the akey already exists
    pub insert_akey: bool,
    /// Fail with `NoKey` when the akey does not exist
    pub update_akey: bool,
    /// Evaluate akey conditions per entry, from each entry's own flags
    pub per_akey: bool,
}

/// Payload of one akey in an update.
#[derive(Debug, Clone)]
pub enum UpdatePayload {
    /// Single-value payload
    Single(Vec<u8>),
    /// Array extents sharing one record size
    Array {
        /// Record size in bytes, fixed at first write
        rsize: u32,
        /// `(start index, bytes)` per extent; byte length must be a
        /// multiple of `rsize`
        extents: Vec<(u64, Vec<u8>)>,
    },
}

/// One akey's contribution to an update.
#[derive(Debug, Clone)]
pub struct AkeyUpdate {
    /// Attribute key
    pub akey: KeyBuf,
    /// Value payload
    pub payload: UpdatePayload,
    /// Per-akey conditional flags, honored under `CondFlags::per_akey`
    pub flags: Option<CondFlags>,
}

impl AkeyUpdate {
    /// Single-value update entry.
    pub fn single(akey: impl Into<KeyBuf>, payload: impl Into<Vec<u8>>) -> Self {
        AkeyUpdate {
            akey: akey.into(),
            payload: UpdatePayload::Single(payload.into()),
            flags: None,
        }
    }

    /// Array update entry with one extent.
    pub fn extent(
        akey: impl Into<KeyBuf>,
        rsize: u32,
        start: u64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        AkeyUpdate {
            akey: akey.into(),
            payload: UpdatePayload::Array {
                rsize,
                extents: vec![(start, payload.into())],
            },
            flags: None,
        }
    }

    /// Attach per-akey conditional flags.
    pub fn with_flags(mut self, flags: CondFlags) -> Self {
        self.flags = Some(flags);
        self
    }
}

/// Result of an array fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayFetch {
    /// Record size of the akey
    pub rsize: u32,
    /// Resolved bytes for the requested window; holes read as zero
    pub data: Vec<u8>,
    /// `(start, nr)` runs inside the window with no committed record
    pub holes: Vec<(u64, u64)>,
    /// Min/max committed index over the whole akey, when any
    pub committed: Option<(u64, u64)>,
    /// Extents that contributed bytes to the window
    pub extents: Vec<ExtentInfo>,
}

/// A committed extent fragment reported by list/fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentInfo {
    /// First record index
    pub start: u64,
    /// Record count
    pub nr: u64,
    /// Commit epoch
    pub epoch: Epoch,
}

// =============================================================================
// Raw record collection (shared by fetch, list, query, aggregate, discard)
// =============================================================================

/// A single-value record's location and header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawSv {
    pub epoch: Epoch,
    pub dtx: u64,
    pub val_off: u64,
    pub size: u32,
    pub crc: u32,
}

/// An extent record's location and header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawEx {
    pub start: u64,
    pub epoch: Epoch,
    pub nr: u64,
    pub rsize: u32,
    pub punch: bool,
    pub dtx: u64,
    pub val_off: u64,
    pub crc: u32,
}

/// Collect every single-value record, epoch ascending.
pub(crate) fn collect_sv(inner: &PoolInner, tree: Btree) -> Result<Vec<RawSv>> {
    let mut out = Vec::new();
    let mut iter = BtreeIter::prepare(tree, &inner.arena, false);
    if !iter.probe(Probe::First, None)? {
        return Ok(out);
    }
    loop {
        let entry = iter.fetch()?;
        let hdr = SvHdr::decode(entry.value(&inner.arena)?)?;
        out.push(RawSv {
            epoch: epoch_key_decode(&entry.key)?,
            dtx: hdr.dtx,
            val_off: entry.val_off,
            size: hdr.size,
            crc: hdr.crc,
        });
        if !iter.next()? {
            return Ok(out);
        }
    }
}

/// Collect every extent record, `(start, epoch)` ascending.
pub(crate) fn collect_ex(inner: &PoolInner, tree: Btree) -> Result<Vec<RawEx>> {
    let mut out = Vec::new();
    let mut iter = BtreeIter::prepare(tree, &inner.arena, false);
    if !iter.probe(Probe::First, None)? {
        return Ok(out);
    }
    loop {
        let entry = iter.fetch()?;
        let hdr = ExHdr::decode(entry.value(&inner.arena)?)?;
        let (start, epoch) = ex_key_decode(&entry.key)?;
        out.push(RawEx {
            start,
            epoch,
            nr: hdr.nr,
            rsize: hdr.rsize,
            punch: hdr.is_punch(),
            dtx: hdr.dtx,
            val_off: entry.val_off,
            crc: hdr.crc,
        });
        if !iter.next()? {
            return Ok(out);
        }
    }
}

/// Resolve the visible extent fragments of an array akey at `at`: each
/// non-punch record minus every younger record's coverage, ascending by
/// start index. This is the committed view listing and queries report.
pub(crate) fn visible_fragments(
    inner: &mut PoolInner,
    tree: Btree,
    floor: Option<Epoch>,
    at: Epoch,
) -> Result<Vec<ExtentInfo>> {
    let mut candidates = Vec::new();
    for rec in collect_ex(inner, tree)? {
        if rec.epoch > at {
            continue;
        }
        if matches!(floor, Some(f) if rec.epoch <= f) {
            continue;
        }
        candidates.push(rec);
    }
    let mut visible = Vec::new();
    for rec in candidates {
        if dtx_visible(inner, rec.dtx, at)? {
            visible.push(rec);
        }
    }

    let mut out = Vec::new();
    for rec in visible.iter().filter(|r| !r.punch) {
        let mut fragments = vec![(rec.start, rec.start + rec.nr)];
        for newer in visible.iter().filter(|r| r.epoch > rec.epoch) {
            fragments = subtract_range(&fragments, newer.start, newer.start + newer.nr);
            if fragments.is_empty() {
                break;
            }
        }
        for (lo, hi) in fragments {
            out.push(ExtentInfo {
                start: lo,
                nr: hi - lo,
                epoch: rec.epoch,
            });
        }
    }
    out.sort_by_key(|f| f.start);
    Ok(out)
}

/// Subtract `[lo, hi)` from every range in the list.
fn subtract_range(ranges: &[(u64, u64)], lo: u64, hi: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::with_capacity(ranges.len() + 1);
    for &(a, b) in ranges {
        if hi <= a || b <= lo {
            out.push((a, b));
            continue;
        }
        if a < lo {
            out.push((a, lo));
        }
        if hi < b {
            out.push((hi, b));
        }
    }
    out
}

// =============================================================================
// Read-path chain resolution
// =============================================================================

/// The resolved chain for a read at some epoch: descriptors plus the punch
/// floor accumulated across object, dkey, and akey incarnation logs.
pub(crate) struct ReadChain {
    pub obj: ObjCtx,
    pub dkey: Option<KeyCtx>,
    pub akey: Option<KeyCtx>,
    /// Records at or below this epoch are shadowed by a key-level punch
    pub floor: Option<Epoch>,
}

impl ReadChain {
    /// The akey descriptor; `NoKey` when the chain stopped earlier.
    pub fn akey_meta(&self) -> Result<&KeyMeta> {
        self.akey
            .as_ref()
            .map(|k| &k.meta)
            .ok_or(VosError::NoKey)
    }

    /// True when a record epoch is shadowed by the punch floor.
    pub fn shadowed(&self, epoch: Epoch) -> bool {
        matches!(self.floor, Some(f) if epoch <= f)
    }
}

/// Walk container → object → dkey → akey, checking visibility at `at`
/// level by level. Any invisible or missing link resolves to `NoKey`.
pub(crate) fn read_chain(
    inner: &mut PoolInner,
    cont_id: ContId,
    oid: ObjId,
    dkey: Option<&[u8]>,
    akey: Option<&[u8]>,
    at: Epoch,
) -> Result<ReadChain> {
    let cont = load_cont(inner, cont_id)?;
    let obj = load_obj(inner, &cont, oid)?.ok_or(VosError::NoKey)?;

    let mut floor: Option<Epoch> = None;
    let marks = ilog_entries(&inner.arena, obj.meta.ilog)?;
    check_level(inner, &marks, at, &mut floor)?;

    let mut chain = ReadChain {
        obj,
        dkey: None,
        akey: None,
        floor,
    };

    let dkey_bytes = match dkey {
        Some(d) => d,
        None => return Ok(chain),
    };
    let dkey_tree = Btree::open(chain.obj.meta.dkey_root);
    let dctx = load_key(inner, dkey_tree, dkey_bytes)?.ok_or(VosError::NoKey)?;
    let marks = ilog_entries(&inner.arena, dctx.meta.ilog)?;
    check_level(inner, &marks, at, &mut chain.floor)?;
    let akey_tree = Btree::open(dctx.meta.subtree);
    chain.dkey = Some(dctx);

    let akey_bytes = match akey {
        Some(a) => a,
        None => return Ok(chain),
    };
    let actx = load_key(inner, akey_tree, akey_bytes)?.ok_or(VosError::NoKey)?;
    let marks = ilog_entries(&inner.arena, actx.meta.ilog)?;
    check_level(inner, &marks, at, &mut chain.floor)?;
    chain.akey = Some(actx);

    Ok(chain)
}

/// Fold one level's incarnation log into the chain state: invisible or
/// punched levels end the read, punches below `at` raise the floor.
fn check_level(
    inner: &mut PoolInner,
    marks: &[crate::ilog::IlogEntry],
    at: Epoch,
    floor: &mut Option<Epoch>,
) -> Result<()> {
    let vis = ilog_visibility(marks, at, &mut |seq| dtx_visible(inner, seq, at))?;
    match vis {
        KeyVis::Absent | KeyVis::Punched(_) => return Err(VosError::NoKey),
        KeyVis::Visible(_) => {}
    }
    if let Some(p) = ilog_punch_floor(marks, at, &mut |seq| dtx_visible(inner, seq, at))? {
        if floor.map(|f| p > f).unwrap_or(true) {
            *floor = Some(p);
        }
    }
    Ok(())
}
