//! Punches.
//!
//! A punch records a tombstone at the caller's epoch: it shadows records
//! at or below its own epoch within its scope and erases nothing until
//! aggregation. Scopes: whole object, one dkey, a set of akeys, or an
//! extent range of an array akey.

use crate::ilog::{ilog_append, IlogEntry, ILOG_PUNCH};
use crate::layout::{ex_key, ExHdr, ValueKind, EX_PUNCH, KEY_ILOG_OFF, OBJ_ILOG_OFF};
use crate::object::{load_key, load_obj};
use crate::pool::{note_epoch, with_pool_tx, DtxTouch, PoolInner};
use crate::vka::collect_ex;
use crate::ObjectHandle;
use tracing::trace;
use vostok_btree::{Btree, UpdateCond};
use vostok_core::{DtxId, Epoch, KeyBuf, Result, VosError};

impl ObjectHandle {
    /// Punch the whole object at `epoch`.
    pub fn punch_object(&self, epoch: Epoch, dtx: Option<DtxId>) -> Result<()> {
        self.punch_keys_inner(None, &[], epoch, dtx)
    }

    /// Punch one dkey (and everything under it) at `epoch`.
    pub fn punch_dkey(&self, dkey: &KeyBuf, epoch: Epoch, dtx: Option<DtxId>) -> Result<()> {
        self.punch_keys_inner(Some(dkey), &[], epoch, dtx)
    }

    /// Punch a set of akeys under `dkey` at `epoch`.
    pub fn punch_akeys(
        &self,
        dkey: &KeyBuf,
        akeys: &[KeyBuf],
        epoch: Epoch,
        dtx: Option<DtxId>,
    ) -> Result<()> {
        if akeys.is_empty() {
            return Err(VosError::InvalArg("akey punch names no akeys".into()));
        }
        self.punch_keys_inner(Some(dkey), akeys, epoch, dtx)
    }

    fn punch_keys_inner(
        &self,
        dkey: Option<&KeyBuf>,
        akeys: &[KeyBuf],
        epoch: Epoch,
        dtx: Option<DtxId>,
    ) -> Result<()> {
        if !epoch.is_valid_stamp() {
            return Err(VosError::InvalArg("punch epoch must be positive".into()));
        }
        let mut inner = self.cont.pool.lock();
        self.cont.pool.writable(&inner)?;

        let r = with_pool_tx(&mut inner, |inner| {
            let cont = crate::container::load_cont(inner, self.cont.id)?;
            let obj = load_obj(inner, &cont, self.oid)?.ok_or(VosError::NoKey)?;

            let dkey = match dkey {
                None => {
                    // Whole-object punch.
                    mark_punch(inner, obj.val_off + OBJ_ILOG_OFF, epoch, dtx)?;
                    note_epoch(inner, epoch)?;
                    return Ok(());
                }
                Some(d) => d,
            };

            let dkey_tree = Btree::open(obj.meta.dkey_root);
            let dctx =
                load_key(inner, dkey_tree, &dkey.encode())?.ok_or(VosError::NoKey)?;
            if akeys.is_empty() {
                mark_punch(inner, dctx.val_off + KEY_ILOG_OFF, epoch, dtx)?;
                note_epoch(inner, epoch)?;
                return Ok(());
            }

            let akey_tree = Btree::open(dctx.meta.subtree);
            for akey in akeys {
                let actx =
                    load_key(inner, akey_tree, &akey.encode())?.ok_or(VosError::NoKey)?;
                mark_punch(inner, actx.val_off + KEY_ILOG_OFF, epoch, dtx)?;
            }
            note_epoch(inner, epoch)?;
            Ok(())
        });
        if r.is_ok() {
            inner.counters.punches += 1;
            trace!(oid = %self.oid, %epoch, "punch recorded");
        }
        r
    }

    /// Punch an extent range `(start, nr)` of an array akey at `epoch`.
    pub fn punch_extent(
        &self,
        dkey: &KeyBuf,
        akey: &KeyBuf,
        start: u64,
        nr: u64,
        epoch: Epoch,
        dtx: Option<DtxId>,
    ) -> Result<()> {
        if !epoch.is_valid_stamp() {
            return Err(VosError::InvalArg("punch epoch must be positive".into()));
        }
        if nr == 0 {
            return Err(VosError::InvalArg("extent punch of zero records".into()));
        }
        let mut inner = self.cont.pool.lock();
        self.cont.pool.writable(&inner)?;

        let r = with_pool_tx(&mut inner, |inner| {
            let cont = crate::container::load_cont(inner, self.cont.id)?;
            let obj = load_obj(inner, &cont, self.oid)?.ok_or(VosError::NoKey)?;
            let dkey_tree = Btree::open(obj.meta.dkey_root);
            let dctx =
                load_key(inner, dkey_tree, &dkey.encode())?.ok_or(VosError::NoKey)?;
            let akey_tree = Btree::open(dctx.meta.subtree);
            let actx =
                load_key(inner, akey_tree, &akey.encode())?.ok_or(VosError::NoKey)?;
            match actx.meta.kind {
                ValueKind::Array => {}
                ValueKind::Unset => return Err(VosError::NoKey),
                ValueKind::Single => return Err(VosError::InvalKind),
            }

            let tree = Btree::open(actx.meta.subtree);
            let end = start + nr;
            let clashes = collect_ex(inner, tree)?
                .iter()
                .any(|e| e.epoch == epoch && start < e.start + e.nr && e.start < end);
            if clashes {
                return Err(VosError::Conflict);
            }

            let hdr = ExHdr {
                dtx: dtx.map(|d| d.seq).unwrap_or(0),
                flags: EX_PUNCH,
                rsize: actx.meta.rsize,
                nr,
                crc: 0,
            };
            let val_off = tree.update(
                &mut inner.arena,
                &ex_key(start, epoch),
                &hdr.encode(&[]),
                UpdateCond::Insert,
            )?;
            if let Some(id) = dtx {
                inner.dtx.touch(id, DtxTouch::Field(val_off))?;
            }
            note_epoch(inner, epoch)?;
            Ok(())
        });
        if r.is_ok() {
            inner.counters.punches += 1;
        }
        r
    }
}

/// Append a punch mark to the ilog held at `holder` (inside a tx).
/// Same-epoch overlap with any existing mark is a conflict.
pub(crate) fn mark_punch(
    inner: &mut PoolInner,
    holder: u64,
    epoch: Epoch,
    dtx: Option<DtxId>,
) -> Result<()> {
    let blob = inner.arena.read_u64(holder)?;
    let (new_blob, inserted) = ilog_append(
        &mut inner.arena,
        blob,
        IlogEntry {
            epoch,
            dtx: dtx.map(|d| d.seq).unwrap_or(0),
            op: ILOG_PUNCH,
        },
    )?;
    if new_blob != blob {
        inner.arena.write_u64(holder, new_blob)?;
    }
    if inserted {
        if let Some(id) = dtx {
            inner.dtx.touch(id, DtxTouch::IlogMark { holder, epoch })?;
        }
    }
    Ok(())
}
