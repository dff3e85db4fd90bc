//! Discard: unconditional removal of an epoch range.
//!
//! Discard removes every record and incarnation mark with an epoch inside
//! `[lo, hi]`, irrespective of tombstones. It exists to undo failed
//! distributed transactions: an abort parks the transaction's leader
//! epoch, and the next reclaim pass discards that epoch everywhere.
//!
//! Discard and aggregation are mutually exclusive with pending
//! distributed transactions over overlapping ranges; the single-writer
//! pool queue already serialises the two passes against each other.

use crate::container::{bump_cont_used, load_cont, ContainerHandle};
use crate::ilog::{ilog_entries, ilog_remove};
use crate::layout::{epoch_key, ex_key, ValueKind, KEY_ILOG_OFF};
use crate::object::{destroy_object_tree, walk_container, ObjNode};
use crate::pool::{with_pool_tx, PoolHandle, PoolInner};
use crate::vka::{collect_ex, collect_sv};
use tracing::debug;
use vostok_btree::Btree;
use vostok_core::{ContId, Epoch, Result, VosError};

impl ContainerHandle {
    /// Remove all records and marks with epochs inside `[lo, hi]`.
    /// Returns the number of records removed.
    pub fn discard(&self, lo: Epoch, hi: Epoch) -> Result<u64> {
        if !lo.is_valid_stamp() || hi < lo {
            return Err(VosError::InvalArg(format!(
                "bad discard range [{}, {}]",
                lo, hi
            )));
        }
        let mut inner = self.pool.lock();
        self.pool.writable(&inner)?;
        if inner.dtx.has_pending_in(lo, hi) {
            return Err(VosError::Busy);
        }
        let removed = with_pool_tx(&mut inner, |inner| {
            discard_range(inner, self.id, lo, hi)
        })?;
        inner.counters.discards += 1;
        debug!(container = %self.id, %lo, %hi, removed, "discard pass complete");
        Ok(removed)
    }
}

impl PoolHandle {
    /// Reclaim the records of every aborted distributed transaction by
    /// discarding their leader epochs in all containers. Returns the
    /// number of records removed.
    pub fn reclaim_aborted(&self) -> Result<u64> {
        let mut inner = self.lock();
        self.writable(&inner)?;
        let epochs = inner.dtx.take_discard_epochs();
        if epochs.is_empty() {
            return Ok(0);
        }

        let root = inner.arena.root();
        if root == 0 {
            return Ok(0);
        }
        let dir = Btree::open(root);
        let mut containers = Vec::new();
        {
            let mut iter = vostok_btree::BtreeIter::prepare(dir, &inner.arena, false);
            if iter.probe(vostok_btree::Probe::First, None)? {
                loop {
                    let entry = iter.fetch()?;
                    let id: [u8; 16] = entry
                        .key
                        .as_slice()
                        .try_into()
                        .map_err(|_| VosError::Corrupt("malformed container key".into()))?;
                    containers.push(ContId::from_bytes(id));
                    if !iter.next()? {
                        break;
                    }
                }
            }
        }

        let mut removed = 0;
        for cont_id in containers {
            for epoch in &epochs {
                removed += with_pool_tx(&mut inner, |inner| {
                    discard_range(inner, cont_id, *epoch, *epoch)
                })?;
            }
        }
        inner.counters.discards += 1;
        debug!(epochs = epochs.len(), removed, "aborted transactions reclaimed");
        Ok(removed)
    }
}

/// The discard pass over one container. Runs inside the caller's
/// transaction.
pub(crate) fn discard_range(
    inner: &mut PoolInner,
    cont_id: ContId,
    lo: Epoch,
    hi: Epoch,
) -> Result<u64> {
    let cont = load_cont(inner, cont_id)?;
    let objects = walk_container(inner, &cont)?;

    let mut removed = 0u64;
    let mut used_delta = 0i64;
    let mut objs_dropped = 0u64;
    for obj in &objects {
        for dkey in &obj.dkeys {
            let akey_tree = Btree::open(dkey.meta.subtree);
            for akey in &dkey.akeys {
                match akey.meta.kind {
                    ValueKind::Single => {
                        let hist = Btree::open(akey.meta.subtree);
                        for rec in collect_sv(inner, hist)? {
                            if rec.epoch >= lo && rec.epoch <= hi {
                                hist.delete(&mut inner.arena, &epoch_key(rec.epoch), true)?;
                                used_delta -= rec.size as i64;
                                removed += 1;
                            }
                        }
                    }
                    ValueKind::Array => {
                        let tree = Btree::open(akey.meta.subtree);
                        for rec in collect_ex(inner, tree)? {
                            if rec.epoch >= lo && rec.epoch <= hi {
                                tree.delete(
                                    &mut inner.arena,
                                    &ex_key(rec.start, rec.epoch),
                                    true,
                                )?;
                                if !rec.punch {
                                    used_delta -= (rec.nr * rec.rsize as u64) as i64;
                                }
                                removed += 1;
                            }
                        }
                    }
                    ValueKind::Unset => {}
                }

                discard_marks(inner, akey.meta.ilog, lo, hi)?;

                // An akey with no history and no marks left is gone.
                let ilog_off = inner.arena.read_u64(akey.val_off + KEY_ILOG_OFF)?;
                let empty_marks = ilog_entries(&inner.arena, ilog_off)?.is_empty();
                let empty_hist = akey.meta.subtree == 0
                    || Btree::open(akey.meta.subtree).is_empty(&inner.arena)?;
                if empty_marks && empty_hist {
                    if akey.meta.subtree != 0 {
                        Btree::open(akey.meta.subtree).destroy(&mut inner.arena)?;
                    }
                    inner.arena.free(ilog_off)?;
                    akey_tree.delete(&mut inner.arena, &akey.key, true)?;
                }
            }
            discard_marks(inner, dkey.meta.ilog, lo, hi)?;

            // A dkey with no akeys and no marks left is gone too.
            let empty_marks = ilog_entries(&inner.arena, dkey.meta.ilog)?.is_empty();
            if empty_marks && akey_tree.is_empty(&inner.arena)? {
                akey_tree.destroy(&mut inner.arena)?;
                inner.arena.free(dkey.meta.ilog)?;
                Btree::open(obj.meta.dkey_root).delete(&mut inner.arena, &dkey.key, true)?;
            }
        }
        discard_marks(inner, obj.meta.ilog, lo, hi)?;

        if object_is_hollow(inner, obj)? {
            destroy_object_tree(&mut inner.arena, &obj.meta)?;
            Btree::open(cont.meta.oi_root).delete(&mut inner.arena, &obj.oid_key, true)?;
            objs_dropped += 1;
        }
    }

    bump_cont_used(inner, &cont, used_delta)?;
    if objs_dropped > 0 {
        let nobjs = inner
            .arena
            .read_u64(cont.val_off + crate::layout::CONT_NOBJS_OFF)?;
        inner.arena.write_u64(
            cont.val_off + crate::layout::CONT_NOBJS_OFF,
            nobjs.saturating_sub(objs_dropped),
        )?;
    }
    Ok(removed)
}

fn discard_marks(inner: &mut PoolInner, ilog_off: u64, lo: Epoch, hi: Epoch) -> Result<()> {
    for mark in ilog_entries(&inner.arena, ilog_off)? {
        if mark.epoch >= lo && mark.epoch <= hi {
            ilog_remove(&mut inner.arena, ilog_off, mark.epoch)?;
        }
    }
    Ok(())
}

/// True when nothing under the object survived: no object marks, and
/// every dkey emptied out.
fn object_is_hollow(inner: &PoolInner, obj: &ObjNode) -> Result<bool> {
    if !ilog_entries(&inner.arena, obj.meta.ilog)?.is_empty() {
        return Ok(false);
    }
    let dkey_tree = Btree::open(obj.meta.dkey_root);
    Ok(dkey_tree.is_empty(&inner.arena)?)
}
