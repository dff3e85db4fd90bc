//! The read path.
//!
//! Reads resolve at a snapshot epoch: for every requested unit the newest
//! committed, unshadowed record at or below the epoch wins. Key-level
//! punches shadow through the accumulated floor; extent punches shadow per
//! index. Units with no qualifying record are holes (arrays) or `NoKey`
//! (single values).

use crate::layout::{ValueKind, SV_HDR_SIZE};
use crate::pool::{dtx_visible, PoolInner};
use crate::vka::{collect_ex, collect_sv, read_chain, ArrayFetch, ExtentInfo, RawEx};
use crate::ObjectHandle;
use vostok_btree::Btree;
use vostok_core::{Epoch, KeyBuf, Result, VosError};

impl ObjectHandle {
    /// Fetch a single-value akey at `epoch`. `max_size`, when given,
    /// bounds the caller's sink: a larger stored value fails with `Trunc`.
    pub fn fetch_single(
        &self,
        dkey: &KeyBuf,
        akey: &KeyBuf,
        epoch: Epoch,
        max_size: Option<usize>,
    ) -> Result<Vec<u8>> {
        let mut inner = self.cont.pool.lock();
        let chain = read_chain(
            &mut inner,
            self.cont.id,
            self.oid,
            Some(&dkey.encode()),
            Some(&akey.encode()),
            epoch,
        )?;
        let meta = *chain.akey_meta()?;
        match meta.kind {
            ValueKind::Single => {}
            ValueKind::Unset => return Err(VosError::NoKey),
            ValueKind::Array => return Err(VosError::InvalKind),
        }

        let records = collect_sv(&inner, Btree::open(meta.subtree))?;
        let mut winner = None;
        for rec in records.iter().rev() {
            if rec.epoch > epoch || chain.shadowed(rec.epoch) {
                continue;
            }
            if !dtx_visible(&mut inner, rec.dtx, epoch)? {
                continue;
            }
            winner = Some(*rec);
            break;
        }
        let rec = winner.ok_or(VosError::NoKey)?;

        let payload = inner
            .arena
            .slice(rec.val_off + SV_HDR_SIZE as u64, rec.size as usize)?
            .to_vec();
        if crc32fast::hash(&payload) != rec.crc {
            return Err(VosError::Corrupt(format!(
                "single-value payload checksum mismatch at epoch {}",
                rec.epoch
            )));
        }
        if let Some(max) = max_size {
            if payload.len() > max {
                return Err(VosError::Trunc {
                    needed: payload.len(),
                    provided: max,
                });
            }
        }
        inner.counters.fetches += 1;
        Ok(payload)
    }

    /// Fetch `nr` records of an array akey starting at `start`, resolved
    /// at `epoch`. Holes read as zero bytes and are reported explicitly.
    pub fn fetch_array(
        &self,
        dkey: &KeyBuf,
        akey: &KeyBuf,
        epoch: Epoch,
        start: u64,
        nr: u64,
    ) -> Result<ArrayFetch> {
        if nr == 0 {
            return Err(VosError::InvalArg("array fetch of zero records".into()));
        }
        let mut inner = self.cont.pool.lock();
        let chain = read_chain(
            &mut inner,
            self.cont.id,
            self.oid,
            Some(&dkey.encode()),
            Some(&akey.encode()),
            epoch,
        )?;
        let meta = *chain.akey_meta()?;
        match meta.kind {
            ValueKind::Array => {}
            ValueKind::Unset => return Err(VosError::NoKey),
            ValueKind::Single => return Err(VosError::InvalKind),
        }
        let rsize = meta.rsize as usize;

        // Visible candidates, epoch-ascending so later paints win.
        let mut candidates = Vec::new();
        for rec in collect_ex(&inner, Btree::open(meta.subtree))? {
            if rec.epoch > epoch || chain.shadowed(rec.epoch) {
                continue;
            }
            candidates.push(rec);
        }
        let mut visible = Vec::new();
        for rec in candidates {
            if dtx_visible(&mut inner, rec.dtx, epoch)? {
                visible.push(rec);
            }
        }
        visible.sort_by_key(|r| r.epoch);

        let committed = committed_range(&visible);

        let end = start + nr;
        let mut data = vec![0u8; nr as usize * rsize];
        // Painter per index: epoch order makes the newest record win.
        let mut owner: Vec<Option<usize>> = vec![None; nr as usize];
        for (i, rec) in visible.iter().enumerate() {
            if rec.rsize as usize != rsize {
                return Err(VosError::InvalRecSize {
                    expected: meta.rsize,
                    got: rec.rsize,
                });
            }
            let lo = rec.start.max(start);
            let hi = (rec.start + rec.nr).min(end);
            if lo >= hi {
                continue;
            }
            for idx in lo..hi {
                owner[(idx - start) as usize] = if rec.punch { None } else { Some(i) };
            }
        }

        let mut extents: Vec<ExtentInfo> = Vec::new();
        let mut holes: Vec<(u64, u64)> = Vec::new();
        let mut idx = 0u64;
        while idx < nr {
            match owner[idx as usize] {
                None => {
                    let run_start = idx;
                    while idx < nr && owner[idx as usize].is_none() {
                        idx += 1;
                    }
                    holes.push((start + run_start, idx - run_start));
                }
                Some(rec_i) => {
                    let rec = visible[rec_i];
                    let run_start = idx;
                    while idx < nr && owner[idx as usize] == Some(rec_i) {
                        idx += 1;
                    }
                    copy_extent_bytes(
                        &inner,
                        &rec,
                        start + run_start,
                        idx - run_start,
                        &mut data[(run_start as usize) * rsize..(idx as usize) * rsize],
                    )?;
                    match extents.last_mut() {
                        Some(last)
                            if last.epoch == rec.epoch
                                && last.start + last.nr == start + run_start =>
                        {
                            last.nr += idx - run_start;
                        }
                        _ => extents.push(ExtentInfo {
                            start: start + run_start,
                            nr: idx - run_start,
                            epoch: rec.epoch,
                        }),
                    }
                }
            }
        }

        inner.counters.fetches += 1;
        Ok(ArrayFetch {
            rsize: meta.rsize,
            data,
            holes,
            committed,
            extents,
        })
    }
}

/// Copy `count` records starting at array index `from` out of a record's
/// payload, verifying the stored checksum of the whole payload.
fn copy_extent_bytes(
    inner: &PoolInner,
    rec: &RawEx,
    from: u64,
    count: u64,
    out: &mut [u8],
) -> Result<()> {
    let rsize = rec.rsize as usize;
    let payload = inner.arena.slice(
        rec.val_off + crate::layout::EX_HDR_SIZE as u64,
        rec.nr as usize * rsize,
    )?;
    if crc32fast::hash(payload) != rec.crc {
        return Err(VosError::Corrupt(format!(
            "extent payload checksum mismatch at ({}, {})",
            rec.start, rec.epoch
        )));
    }
    let skip = (from - rec.start) as usize * rsize;
    out.copy_from_slice(&payload[skip..skip + count as usize * rsize]);
    Ok(())
}

/// Min/max committed index across the visible, non-punch extents.
fn committed_range(visible: &[RawEx]) -> Option<(u64, u64)> {
    let mut range: Option<(u64, u64)> = None;
    for rec in visible.iter().filter(|r| !r.punch) {
        let lo = rec.start;
        let hi = rec.start + rec.nr - 1;
        range = Some(match range {
            None => (lo, hi),
            Some((a, b)) => (a.min(lo), b.max(hi)),
        });
    }
    range
}
