//! Aggregation: history compaction inside an epoch window.
//!
//! Within `[lo, hi]` the pass drops records fully shadowed by a newer
//! record or tombstone, coalesces adjacent same-epoch array extents, and
//! garbage-collects incarnation marks shadowed the same way. Everything
//! observable outside the window — and at every pinned snapshot epoch
//! inside it — is preserved exactly: a record or mark is only removable
//! when a strictly newer mutation at or below `hi` shadows it and no
//! pinned snapshot falls inside the gap between the two.
//!
//! Aggregation refuses to run while a distributed transaction is pending
//! inside the window; records still tagged by an unresolved or aborted
//! transaction neither shadow anything nor get dropped here (discard
//! reclaims them).

use crate::container::{bump_cont_used, load_cont, ContainerHandle};
use crate::ilog::{ilog_remove, IlogEntry, ILOG_PUNCH};
use crate::layout::{epoch_key, ex_key, ExHdr, ValueKind, EX_HDR_SIZE};
use crate::object::walk_container;
use crate::pool::{with_pool_tx, PoolInner};
use crate::vka::{collect_ex, collect_sv, RawEx};
use tracing::debug;
use vostok_btree::{Btree, UpdateCond};
use vostok_core::{Epoch, Result, VosError};

impl ContainerHandle {
    /// Compact history inside `[lo, hi]`. Returns the number of records
    /// dropped. Idempotent: a second identical pass drops nothing.
    pub fn aggregate(&self, lo: Epoch, hi: Epoch) -> Result<u64> {
        if !lo.is_valid_stamp() || hi < lo {
            return Err(VosError::InvalArg(format!(
                "bad aggregation window [{}, {}]",
                lo, hi
            )));
        }
        let mut inner = self.pool.lock();
        self.pool.writable(&inner)?;
        if inner.dtx.has_pending_in(lo, hi) {
            return Err(VosError::Busy);
        }

        let dropped = with_pool_tx(&mut inner, |inner| {
            let cont = load_cont(inner, self.id)?;
            let snaps = cont.meta.snaps.clone();
            let objects = walk_container(inner, &cont)?;

            let mut dropped = 0u64;
            let mut used_delta = 0i64;
            for obj in &objects {
                for dkey in &obj.dkeys {
                    // Punch epochs at covering levels shadow records too.
                    let mut key_punches: Vec<Epoch> = obj
                        .marks
                        .iter()
                        .chain(dkey.marks.iter())
                        .filter(|m| m.op == ILOG_PUNCH && m.dtx == 0)
                        .map(|m| m.epoch)
                        .collect();
                    key_punches.sort();

                    for akey in &dkey.akeys {
                        let mut punches = key_punches.clone();
                        punches.extend(
                            akey.marks
                                .iter()
                                .filter(|m| m.op == ILOG_PUNCH && m.dtx == 0)
                                .map(|m| m.epoch),
                        );
                        punches.sort();

                        match akey.meta.kind {
                            ValueKind::Single => {
                                dropped += aggregate_single(
                                    inner,
                                    Btree::open(akey.meta.subtree),
                                    &punches,
                                    &snaps,
                                    lo,
                                    hi,
                                    &mut used_delta,
                                )?;
                            }
                            ValueKind::Array => {
                                dropped += aggregate_array(
                                    inner,
                                    Btree::open(akey.meta.subtree),
                                    &punches,
                                    &snaps,
                                    lo,
                                    hi,
                                    &mut used_delta,
                                )?;
                            }
                            ValueKind::Unset => {}
                        }

                        gc_marks(inner, akey.meta.ilog, &akey.marks, &snaps, lo, hi)?;
                    }
                    gc_marks(inner, dkey.meta.ilog, &dkey.marks, &snaps, lo, hi)?;
                }
                gc_marks(inner, obj.meta.ilog, &obj.marks, &snaps, lo, hi)?;
            }

            bump_cont_used(inner, &cont, used_delta)?;
            Ok(dropped)
        })?;

        inner.counters.aggregations += 1;
        debug!(container = %self.id, %lo, %hi, dropped, "aggregation pass complete");
        Ok(dropped)
    }
}

fn snap_in(snaps: &[Epoch], from: Epoch, to: Epoch) -> bool {
    snaps.iter().any(|s| *s >= from && *s < to)
}

/// Drop single-value records shadowed by the next mutation inside the
/// window.
fn aggregate_single(
    inner: &mut PoolInner,
    hist: Btree,
    punches: &[Epoch],
    snaps: &[Epoch],
    lo: Epoch,
    hi: Epoch,
    used_delta: &mut i64,
) -> Result<u64> {
    let records: Vec<_> = collect_sv(inner, hist)?
        .into_iter()
        .filter(|r| r.dtx == 0)
        .collect();

    // The mutation timeline: committed record epochs plus key punches.
    let mut timeline: Vec<Epoch> = records.iter().map(|r| r.epoch).collect();
    timeline.extend_from_slice(punches);
    timeline.sort();

    let mut dropped = 0;
    for rec in &records {
        if rec.epoch < lo || rec.epoch > hi {
            continue;
        }
        let next = timeline.iter().find(|e| **e > rec.epoch).copied();
        let shadow = match next {
            Some(m) if m <= hi && !snap_in(snaps, rec.epoch, m) => true,
            _ => false,
        };
        if shadow {
            hist.delete(&mut inner.arena, &epoch_key(rec.epoch), true)?;
            *used_delta -= rec.size as i64;
            dropped += 1;
        }
    }
    Ok(dropped)
}

/// Coalesce same-epoch neighbours, then drop extents fully covered by a
/// single newer extent inside the window.
fn aggregate_array(
    inner: &mut PoolInner,
    tree: Btree,
    punches: &[Epoch],
    snaps: &[Epoch],
    lo: Epoch,
    hi: Epoch,
    used_delta: &mut i64,
) -> Result<u64> {
    coalesce_neighbours(inner, tree)?;

    let records: Vec<RawEx> = collect_ex(inner, tree)?
        .into_iter()
        .filter(|r| r.dtx == 0)
        .collect();

    let mut dropped = 0;
    for rec in &records {
        if rec.epoch < lo || rec.epoch > hi {
            continue;
        }
        let covered = records.iter().any(|m| {
            m.epoch > rec.epoch
                && m.epoch <= hi
                && m.start <= rec.start
                && m.start + m.nr >= rec.start + rec.nr
                && !snap_in(snaps, rec.epoch, m.epoch)
        });
        // A whole-key punch shadows the extent regardless of range.
        let punched = punches
            .iter()
            .any(|p| *p > rec.epoch && *p <= hi && !snap_in(snaps, rec.epoch, *p));
        if covered || punched {
            tree.delete(&mut inner.arena, &ex_key(rec.start, rec.epoch), true)?;
            if !rec.punch {
                *used_delta -= (rec.nr * rec.rsize as u64) as i64;
            }
            dropped += 1;
        }
    }
    Ok(dropped)
}

/// Merge adjacent same-epoch, same-size extents into one record. Runs to
/// a fixpoint; observable state is identical at every epoch.
fn coalesce_neighbours(inner: &mut PoolInner, tree: Btree) -> Result<()> {
    loop {
        let records: Vec<RawEx> = collect_ex(inner, tree)?
            .into_iter()
            .filter(|r| r.dtx == 0 && !r.punch)
            .collect();

        let mut merged = false;
        'scan: for (i, left) in records.iter().enumerate() {
            for right in records.iter().skip(i + 1) {
                if right.epoch == left.epoch
                    && right.rsize == left.rsize
                    && right.start == left.start + left.nr
                {
                    let mut payload = inner
                        .arena
                        .slice(
                            left.val_off + EX_HDR_SIZE as u64,
                            (left.nr * left.rsize as u64) as usize,
                        )?
                        .to_vec();
                    payload.extend_from_slice(inner.arena.slice(
                        right.val_off + EX_HDR_SIZE as u64,
                        (right.nr * right.rsize as u64) as usize,
                    )?);

                    tree.delete(&mut inner.arena, &ex_key(left.start, left.epoch), true)?;
                    tree.delete(&mut inner.arena, &ex_key(right.start, right.epoch), true)?;
                    let hdr = ExHdr {
                        dtx: 0,
                        flags: 0,
                        rsize: left.rsize,
                        nr: left.nr + right.nr,
                        crc: crc32fast::hash(&payload),
                    };
                    tree.update(
                        &mut inner.arena,
                        &ex_key(left.start, left.epoch),
                        &hdr.encode(&payload),
                        UpdateCond::Insert,
                    )?;
                    merged = true;
                    break 'scan;
                }
            }
        }
        if !merged {
            return Ok(());
        }
    }
}

/// Remove incarnation marks shadowed by the next mark inside the window.
fn gc_marks(
    inner: &mut PoolInner,
    ilog_off: u64,
    marks: &[IlogEntry],
    snaps: &[Epoch],
    lo: Epoch,
    hi: Epoch,
) -> Result<()> {
    let committed: Vec<&IlogEntry> = marks.iter().filter(|m| m.dtx == 0).collect();
    for (i, mark) in committed.iter().enumerate() {
        if mark.epoch < lo || mark.epoch > hi {
            continue;
        }
        let next = committed.get(i + 1);
        let shadowed = match next {
            Some(n) if n.epoch <= hi && !snap_in(snaps, mark.epoch, n.epoch) => true,
            _ => false,
        };
        if shadowed {
            ilog_remove(&mut inner.arena, ilog_off, mark.epoch)?;
        }
    }
    Ok(())
}
