//! The write path.
//!
//! An update lands one or more akey payloads under one dkey at one epoch,
//! atomically: the whole call is a single arena transaction. Conditional
//! flags gate on key visibility at the write epoch. Two updates at the
//! same epoch touching overlapping state conflict; same-epoch updates on
//! disjoint keys or extents are independent.

use crate::container::bump_cont_used;
use crate::ilog::{ilog_entries, ilog_visibility, KeyVis};
use crate::layout::{
    ex_key, epoch_key, ExHdr, SvHdr, ValueKind, KEY_ILOG_OFF, KEY_META_SIZE,
};
use crate::object::{akey_class, ensure_key, ensure_obj, load_key, load_obj, KeyCtx};
use crate::pool::{dtx_visible, note_epoch, with_pool_tx, DtxTouch, PoolInner};
use crate::vka::{collect_ex, AkeyUpdate, CondFlags, UpdatePayload};
use crate::ObjectHandle;
use tracing::trace;
use vostok_btree::{Btree, TreeClass, UpdateCond};
use vostok_core::{DtxId, Epoch, KeyBuf, Limits, Result, VosError};

impl ObjectHandle {
    /// Apply one or more akey payloads under `dkey` at `epoch`.
    ///
    /// On success an equivalent fetch at any epoch at or above `epoch`
    /// observes the payloads until a later update or punch shadows them.
    /// On failure nothing persists.
    pub fn update(
        &self,
        dkey: &KeyBuf,
        updates: &[AkeyUpdate],
        epoch: Epoch,
        flags: CondFlags,
        dtx: Option<DtxId>,
    ) -> Result<()> {
        if !epoch.is_valid_stamp() {
            return Err(VosError::InvalArg("update epoch must be positive".into()));
        }
        if updates.is_empty() {
            return Err(VosError::InvalArg("update carries no akeys".into()));
        }
        let limits = Limits::default();
        dkey.validate(&limits)
            .map_err(|e| VosError::InvalArg(e.to_string()))?;
        for u in updates {
            u.akey
                .validate(&limits)
                .map_err(|e| VosError::InvalArg(e.to_string()))?;
            validate_payload(&u.payload, &limits)?;
        }

        let mut inner = self.cont.pool.lock();
        self.cont.pool.writable(&inner)?;

        let r = with_pool_tx(&mut inner, |inner| {
            self.update_inner(inner, dkey, updates, epoch, flags, dtx)
        });
        if r.is_ok() {
            inner.counters.updates += 1;
        }
        r
    }

    fn update_inner(
        &self,
        inner: &mut PoolInner,
        dkey: &KeyBuf,
        updates: &[AkeyUpdate],
        epoch: Epoch,
        flags: CondFlags,
        dtx: Option<DtxId>,
    ) -> Result<()> {
        let cont = crate::container::load_cont(inner, self.cont.id)?;
        let dkey_bytes = dkey.encode();

        // Conditional dkey gates, evaluated on visibility at the write
        // epoch before anything mutates.
        if flags.insert_dkey || flags.update_dkey {
            let exists = dkey_visible(inner, &cont, self, &dkey_bytes, epoch)?;
            if flags.insert_dkey && exists {
                return Err(VosError::PrecondFail);
            }
            if flags.update_dkey && !exists {
                return Err(VosError::NoKey);
            }
        }

        let obj = ensure_obj(inner, &cont, self.oid, self.otype, epoch, dtx)?;
        let dkey_tree = Btree::open(obj.meta.dkey_root);
        let (dctx, _) = ensure_key(
            inner,
            dkey_tree,
            &dkey_bytes,
            Some(akey_class(self.otype)),
            epoch,
            dtx,
        )?;
        let akey_tree = Btree::open(dctx.meta.subtree);

        let mut used_delta: i64 = 0;
        for u in updates {
            let eflags = if flags.per_akey {
                u.flags.unwrap_or(flags)
            } else {
                flags
            };
            let akey_bytes = u.akey.encode();

            if eflags.insert_akey || eflags.update_akey {
                let exists = akey_visible(inner, akey_tree, &akey_bytes, epoch)?;
                if eflags.insert_akey && exists {
                    return Err(VosError::PrecondFail);
                }
                if eflags.update_akey && !exists {
                    return Err(VosError::NoKey);
                }
            }

            let (actx, _) = ensure_key(inner, akey_tree, &akey_bytes, None, epoch, dtx)?;
            match &u.payload {
                UpdatePayload::Single(payload) => {
                    used_delta += payload.len() as i64;
                    self.write_single(inner, actx, payload, epoch, dtx)?;
                }
                UpdatePayload::Array { rsize, extents } => {
                    for (_, data) in extents {
                        used_delta += data.len() as i64;
                    }
                    self.write_extents(inner, actx, *rsize, extents, epoch, dtx)?;
                }
            }
        }

        bump_cont_used(inner, &cont, used_delta)?;
        note_epoch(inner, epoch)?;
        trace!(oid = %self.oid, %epoch, akeys = updates.len(), "update applied");
        Ok(())
    }

    fn write_single(
        &self,
        inner: &mut PoolInner,
        actx: KeyCtx,
        payload: &[u8],
        epoch: Epoch,
        dtx: Option<DtxId>,
    ) -> Result<()> {
        let hist = self.value_subtree(inner, &actx, ValueKind::Single, 0)?;
        let hdr = SvHdr {
            dtx: dtx.map(|d| d.seq).unwrap_or(0),
            flags: 0,
            size: payload.len() as u32,
            crc: crc32fast::hash(payload),
        };
        // A record already present at this epoch is a same-epoch overlap.
        let val_off = hist
            .update(
                &mut inner.arena,
                &epoch_key(epoch),
                &hdr.encode(payload),
                UpdateCond::Insert,
            )
            .map_err(|e| match e {
                VosError::PrecondFail => VosError::Conflict,
                other => other,
            })?;
        if let Some(id) = dtx {
            inner.dtx.touch(id, DtxTouch::Field(val_off))?;
        }
        Ok(())
    }

    fn write_extents(
        &self,
        inner: &mut PoolInner,
        actx: KeyCtx,
        rsize: u32,
        extents: &[(u64, Vec<u8>)],
        epoch: Epoch,
        dtx: Option<DtxId>,
    ) -> Result<()> {
        let tree = self.value_subtree(inner, &actx, ValueKind::Array, rsize)?;

        // Same-epoch overlap detection is exact over the existing extents
        // plus the extents of this call.
        let existing = collect_ex(inner, tree)?;
        let mut staged: Vec<(u64, u64)> = Vec::new();
        for (start, data) in extents {
            let nr = (data.len() / rsize as usize) as u64;
            let end = start + nr;
            let clashes = existing
                .iter()
                .any(|e| e.epoch == epoch && overlaps(*start, end, e.start, e.start + e.nr))
                || staged
                    .iter()
                    .any(|(s, e)| overlaps(*start, end, *s, *e));
            if clashes {
                return Err(VosError::Conflict);
            }
            staged.push((*start, end));
        }

        for (start, data) in extents {
            let nr = (data.len() / rsize as usize) as u64;
            let hdr = ExHdr {
                dtx: dtx.map(|d| d.seq).unwrap_or(0),
                flags: 0,
                rsize,
                nr,
                crc: crc32fast::hash(data),
            };
            let val_off = tree
                .update(
                    &mut inner.arena,
                    &ex_key(*start, epoch),
                    &hdr.encode(data),
                    UpdateCond::Insert,
                )
                .map_err(|e| match e {
                    VosError::PrecondFail => VosError::Conflict,
                    other => other,
                })?;
            if let Some(id) = dtx {
                inner.dtx.touch(id, DtxTouch::Field(val_off))?;
            }
        }
        Ok(())
    }

    /// Resolve (or establish) the akey's value subtree, enforcing the
    /// kind fixed on first write and the array record size.
    fn value_subtree(
        &self,
        inner: &mut PoolInner,
        actx: &KeyCtx,
        kind: ValueKind,
        rsize: u32,
    ) -> Result<Btree> {
        match actx.meta.kind {
            ValueKind::Unset => {
                let class = match kind {
                    ValueKind::Single => TreeClass::Uint64,
                    _ => TreeClass::Fixed16,
                };
                let order = inner.order;
                let subtree = Btree::create(&mut inner.arena, class, order)?;
                let meta = crate::layout::KeyMeta {
                    subtree: subtree.meta_off,
                    ilog: inner.arena.read_u64(actx.val_off + KEY_ILOG_OFF)?,
                    kind,
                    rsize,
                };
                debug_assert_eq!(meta.encode().len(), KEY_META_SIZE);
                inner.arena.write(actx.val_off, &meta.encode())?;
                Ok(subtree)
            }
            k if k != kind => Err(VosError::InvalKind),
            _ => {
                if kind == ValueKind::Array && actx.meta.rsize != rsize {
                    return Err(VosError::InvalRecSize {
                        expected: actx.meta.rsize,
                        got: rsize,
                    });
                }
                Ok(Btree::open(actx.meta.subtree))
            }
        }
    }
}

fn validate_payload(payload: &UpdatePayload, limits: &Limits) -> Result<()> {
    match payload {
        UpdatePayload::Single(data) => {
            if data.len() > limits.max_value_bytes {
                return Err(VosError::InvalArg(format!(
                    "single value of {} bytes exceeds limit",
                    data.len()
                )));
            }
        }
        UpdatePayload::Array { rsize, extents } => {
            if *rsize == 0 {
                return Err(VosError::InvalArg("array record size is zero".into()));
            }
            if extents.is_empty() {
                return Err(VosError::InvalArg("array update carries no extents".into()));
            }
            for (start, data) in extents {
                if data.is_empty() || data.len() % *rsize as usize != 0 {
                    return Err(VosError::InvalArg(format!(
                        "extent at {} is {} bytes, not a positive multiple of {}",
                        start,
                        data.len(),
                        rsize
                    )));
                }
            }
        }
    }
    Ok(())
}

fn overlaps(a_lo: u64, a_hi: u64, b_lo: u64, b_hi: u64) -> bool {
    a_lo < b_hi && b_lo < a_hi
}

/// Is the dkey visible at `at`? Used by the conditional gates.
fn dkey_visible(
    inner: &mut PoolInner,
    cont: &crate::container::ContCtx,
    obj: &ObjectHandle,
    dkey_bytes: &[u8],
    at: Epoch,
) -> Result<bool> {
    let octx = match load_obj(inner, cont, obj.oid)? {
        Some(o) => o,
        None => return Ok(false),
    };
    let dkey_tree = Btree::open(octx.meta.dkey_root);
    key_visible(inner, dkey_tree, dkey_bytes, at)
}

fn akey_visible(
    inner: &mut PoolInner,
    tree: Btree,
    key_bytes: &[u8],
    at: Epoch,
) -> Result<bool> {
    key_visible(inner, tree, key_bytes, at)
}

fn key_visible(inner: &mut PoolInner, tree: Btree, key: &[u8], at: Epoch) -> Result<bool> {
    let ctx = match load_key(inner, tree, key)? {
        Some(c) => c,
        None => return Ok(false),
    };
    let marks = ilog_entries(&inner.arena, ctx.meta.ilog)?;
    let vis = ilog_visibility(&marks, at, &mut |seq| dtx_visible(inner, seq, at))?;
    Ok(matches!(vis, KeyVis::Visible(_)))
}
