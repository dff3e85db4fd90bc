//! Objects: the object index and the tree chain underneath it.
//!
//! Objects are created implicitly on first write. The object index (OI) is
//! one B-tree per container keyed by the 16-byte object-id; its value is
//! the object descriptor pointing at the distribution-key tree and the
//! object's incarnation log. The OI refuses identifiers whose type field
//! falls outside the closed enumeration, supports enumeration at a chosen
//! snapshot epoch, and carries short opaque marks that only an explicit
//! clear removes.

use crate::container::{ContCtx, ContainerHandle};
use crate::ilog::{
    ilog_append, ilog_entries, ilog_new, ilog_visibility, IlogEntry, KeyVis, ILOG_CREATE,
};
use crate::layout::{
    KeyMeta, ObjMeta, ValueKind, CONT_NOBJS_OFF, KEY_ILOG_OFF, OBJ_ILOG_OFF, OBJ_MARK_LEN_OFF,
    OBJ_MARK_OFF, OBJ_MAX_EPOCH_OFF,
};
use crate::pool::{dtx_visible, DtxTouch, PoolInner};
use vostok_arena::Arena;
use vostok_btree::{Anchor, Btree, BtreeIter, Probe, TreeClass, UpdateCond};
use vostok_core::{DtxId, Epoch, ObjId, ObjType, Result, VosError, MAX_MARK_BYTES};

/// Handle to one object within a container.
#[derive(Clone)]
pub struct ObjectHandle {
    pub(crate) cont: ContainerHandle,
    pub(crate) oid: ObjId,
    pub(crate) otype: ObjType,
}

impl ContainerHandle {
    /// Get an object handle. Fails with `InvalType` when the id's type
    /// field is outside the closed set.
    pub fn object(&self, oid: ObjId) -> Result<ObjectHandle> {
        let otype = oid.otype()?;
        Ok(ObjectHandle {
            cont: self.clone(),
            oid,
            otype,
        })
    }

    /// Enumerate object-ids present at `epoch`, in id order, up to `max`
    /// per batch. Returns the batch and a resume anchor (`None` when
    /// exhausted).
    pub fn list_objects(
        &self,
        epoch: Epoch,
        anchor: Option<&[u8]>,
        max: usize,
    ) -> Result<(Vec<ObjId>, Option<Vec<u8>>)> {
        let mut inner = self.pool.lock();
        let ctx = crate::container::load_cont(&inner, self.id)?;
        let oi = Btree::open(ctx.meta.oi_root);

        // Collect candidates first; visibility checks may need to resolve
        // in-doubt transactions, which mutates the pool.
        let mut candidates = Vec::new();
        {
            let mut iter = BtreeIter::prepare(oi, &inner.arena, false);
            let found = match anchor {
                None => iter.probe(Probe::First, None)?,
                Some(blob) => iter.probe_anchor(&Anchor::from_bytes(blob)?)?,
            };
            if found {
                loop {
                    let entry = iter.fetch()?;
                    let oid = ObjId::from_be_bytes(&entry.key)
                        .ok_or_else(|| VosError::Corrupt("malformed object-id key".into()))?;
                    let marks = ilog_entries(
                        &inner.arena,
                        ObjMeta::decode(entry.value(&inner.arena)?)?.ilog,
                    )?;
                    candidates.push((oid, marks));
                    if !iter.next()? {
                        break;
                    }
                }
            }
        }

        let mut out = Vec::new();
        let mut anchor_out = None;
        for (oid, marks) in candidates {
            let vis = ilog_visibility(&marks, epoch, &mut |seq| {
                dtx_visible(&mut inner, seq, epoch)
            })?;
            if matches!(vis, KeyVis::Visible(_)) {
                out.push(oid);
                if out.len() == max {
                    anchor_out = Some(
                        Anchor {
                            hkey: oid.to_be_bytes(),
                            key: Vec::new(),
                        }
                        .to_bytes(),
                    );
                    break;
                }
            }
        }
        inner.counters.lists += 1;
        Ok((out, anchor_out))
    }

    /// Tag an object with a short opaque mark (≤ 32 bytes).
    pub fn mark_object(&self, oid: ObjId, mark: &[u8]) -> Result<()> {
        if mark.len() > MAX_MARK_BYTES {
            return Err(VosError::InvalArg(format!(
                "mark is {} bytes, max {}",
                mark.len(),
                MAX_MARK_BYTES
            )));
        }
        let mut inner = self.pool.lock();
        self.pool.writable(&inner)?;
        let ctx = crate::container::load_cont(&inner, self.id)?;
        let obj = load_obj(&inner, &ctx, oid)?.ok_or(VosError::NoKey)?;
        let mut padded = [0u8; MAX_MARK_BYTES];
        padded[..mark.len()].copy_from_slice(mark);
        let mark_len = mark.len() as u32;
        inner.arena.with_tx(|arena| {
            arena.write_u32(obj.val_off + OBJ_MARK_LEN_OFF, mark_len)?;
            arena.write(obj.val_off + OBJ_MARK_OFF, &padded)
        })
    }

    /// Clear an object's mark. Marks never expire on their own.
    pub fn clear_mark(&self, oid: ObjId) -> Result<()> {
        let mut inner = self.pool.lock();
        self.pool.writable(&inner)?;
        let ctx = crate::container::load_cont(&inner, self.id)?;
        let obj = load_obj(&inner, &ctx, oid)?.ok_or(VosError::NoKey)?;
        inner
            .arena
            .with_tx(|arena| arena.write_u32(obj.val_off + OBJ_MARK_LEN_OFF, 0))
    }

    /// Read an object's mark, if any.
    pub fn object_mark(&self, oid: ObjId) -> Result<Option<Vec<u8>>> {
        let inner = self.pool.lock();
        let ctx = crate::container::load_cont(&inner, self.id)?;
        let obj = load_obj(&inner, &ctx, oid)?.ok_or(VosError::NoKey)?;
        Ok(if obj.meta.mark.is_empty() {
            None
        } else {
            Some(obj.meta.mark)
        })
    }
}

impl ObjectHandle {
    /// Object identity.
    pub fn oid(&self) -> ObjId {
        self.oid
    }

    /// Decoded object type.
    pub fn otype(&self) -> ObjType {
        self.otype
    }

    /// The owning container.
    pub fn container(&self) -> &ContainerHandle {
        &self.cont
    }
}

// =============================================================================
// Chain helpers shared by the value engine
// =============================================================================

/// Tree class for an object's distribution keys.
pub(crate) fn dkey_class(otype: ObjType) -> TreeClass {
    if otype.dkey_is_uint64() {
        TreeClass::Uint64
    } else if otype.dkey_is_lexical() {
        TreeClass::Lexical
    } else {
        TreeClass::Hashed
    }
}

/// Tree class for an object's attribute keys.
pub(crate) fn akey_class(otype: ObjType) -> TreeClass {
    if otype.akey_is_uint64() {
        TreeClass::Uint64
    } else if otype.akey_is_lexical() {
        TreeClass::Lexical
    } else {
        TreeClass::Hashed
    }
}

/// Resolved object state.
pub(crate) struct ObjCtx {
    pub val_off: u64,
    pub meta: ObjMeta,
}

/// Resolved key state (dkey or akey level).
pub(crate) struct KeyCtx {
    pub val_off: u64,
    pub meta: KeyMeta,
}

pub(crate) fn load_obj(
    inner: &PoolInner,
    cont: &ContCtx,
    oid: ObjId,
) -> Result<Option<ObjCtx>> {
    let oi = Btree::open(cont.meta.oi_root);
    let entry = oi.fetch(&inner.arena, Probe::Eq, &oid.to_be_bytes())?;
    match entry {
        None => Ok(None),
        Some(e) => Ok(Some(ObjCtx {
            val_off: e.val_off,
            meta: ObjMeta::decode(e.value(&inner.arena)?)?,
        })),
    }
}

/// Append a create mark to the ilog held at `holder` (inside a tx),
/// patching the holder when the blob moves and registering the mark with
/// the owning DTX.
pub(crate) fn mark_create(
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
            op: ILOG_CREATE,
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

/// Load the object, creating it (descriptor, dkey tree, ilog) when absent.
/// Runs inside the caller's transaction.
pub(crate) fn ensure_obj(
    inner: &mut PoolInner,
    cont: &ContCtx,
    oid: ObjId,
    otype: ObjType,
    epoch: Epoch,
    dtx: Option<DtxId>,
) -> Result<ObjCtx> {
    if let Some(obj) = load_obj(inner, cont, oid)? {
        mark_create(inner, obj.val_off + OBJ_ILOG_OFF, epoch, dtx)?;
        if epoch > obj.meta.max_epoch {
            inner
                .arena
                .write_u64(obj.val_off + OBJ_MAX_EPOCH_OFF, epoch.0)?;
        }
        return Ok(obj);
    }

    let order = inner.order;
    let dkey_tree = Btree::create(&mut inner.arena, dkey_class(otype), order)?;
    let ilog = ilog_new(&mut inner.arena)?;
    let meta = ObjMeta {
        dkey_root: dkey_tree.meta_off,
        ilog,
        otype: otype.as_u32(),
        mark: Vec::new(),
        max_epoch: epoch,
    };
    let oi = Btree::open(cont.meta.oi_root);
    let val_off = oi.update(
        &mut inner.arena,
        &oid.to_be_bytes(),
        &meta.encode(),
        UpdateCond::Insert,
    )?;
    mark_create(inner, val_off + OBJ_ILOG_OFF, epoch, dtx)?;

    let nobjs = inner.arena.read_u64(cont.val_off + CONT_NOBJS_OFF)?;
    inner
        .arena
        .write_u64(cont.val_off + CONT_NOBJS_OFF, nobjs + 1)?;
    Ok(ObjCtx { val_off, meta })
}

pub(crate) fn load_key(inner: &PoolInner, tree: Btree, key: &[u8]) -> Result<Option<KeyCtx>> {
    let entry = tree.fetch(&inner.arena, Probe::Eq, key)?;
    match entry {
        None => Ok(None),
        Some(e) => Ok(Some(KeyCtx {
            val_off: e.val_off,
            meta: KeyMeta::decode(e.value(&inner.arena)?)?,
        })),
    }
}

/// Load a key entry, creating its descriptor (and, for dkeys, the akey
/// subtree) when absent. Runs inside the caller's transaction. Returns
/// the context and whether the key pre-existed.
pub(crate) fn ensure_key(
    inner: &mut PoolInner,
    tree: Btree,
    key: &[u8],
    subtree_class: Option<TreeClass>,
    epoch: Epoch,
    dtx: Option<DtxId>,
) -> Result<(KeyCtx, bool)> {
    if let Some(ctx) = load_key(inner, tree, key)? {
        mark_create(inner, ctx.val_off + KEY_ILOG_OFF, epoch, dtx)?;
        return Ok((ctx, true));
    }

    let order = inner.order;
    let subtree = match subtree_class {
        Some(class) => Btree::create(&mut inner.arena, class, order)?.meta_off,
        None => 0,
    };
    let ilog = ilog_new(&mut inner.arena)?;
    let meta = KeyMeta {
        subtree,
        ilog,
        kind: ValueKind::Unset,
        rsize: 0,
    };
    let val_off = tree.update(&mut inner.arena, key, &meta.encode(), UpdateCond::Insert)?;
    mark_create(inner, val_off + KEY_ILOG_OFF, epoch, dtx)?;
    Ok((KeyCtx { val_off, meta }, false))
}

// =============================================================================
// Container walk (aggregation / discard)
// =============================================================================

/// An akey with its descriptor and incarnation marks.
pub(crate) struct AkeyNode {
    pub key: Vec<u8>,
    pub val_off: u64,
    pub meta: KeyMeta,
    pub marks: Vec<IlogEntry>,
}

/// A dkey with its akeys.
pub(crate) struct DkeyNode {
    pub key: Vec<u8>,
    pub meta: KeyMeta,
    pub marks: Vec<IlogEntry>,
    pub akeys: Vec<AkeyNode>,
}

/// An object with its dkeys.
pub(crate) struct ObjNode {
    pub oid_key: Vec<u8>,
    pub meta: ObjMeta,
    pub marks: Vec<IlogEntry>,
    pub dkeys: Vec<DkeyNode>,
}

fn collect_entries(inner: &PoolInner, tree: Btree) -> Result<Vec<(Vec<u8>, u64, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut iter = BtreeIter::prepare(tree, &inner.arena, false);
    if !iter.probe(Probe::First, None)? {
        return Ok(out);
    }
    loop {
        let entry = iter.fetch()?;
        out.push((
            entry.key,
            entry.val_off,
            inner
                .arena
                .slice(entry.val_off, entry.val_len as usize)?
                .to_vec(),
        ));
        if !iter.next()? {
            return Ok(out);
        }
    }
}

/// Snapshot the whole object/dkey/akey structure of a container for a
/// maintenance pass. Read-only; the pass mutates afterwards.
pub(crate) fn walk_container(inner: &PoolInner, cont: &ContCtx) -> Result<Vec<ObjNode>> {
    let mut objects = Vec::new();
    for (oid_key, _val_off, value) in collect_entries(inner, Btree::open(cont.meta.oi_root))? {
        let meta = ObjMeta::decode(&value)?;
        let marks = ilog_entries(&inner.arena, meta.ilog)?;
        let mut dkeys = Vec::new();
        for (dkey, _dval, dvalue) in collect_entries(inner, Btree::open(meta.dkey_root))? {
            let dmeta = KeyMeta::decode(&dvalue)?;
            let dmarks = ilog_entries(&inner.arena, dmeta.ilog)?;
            let mut akeys = Vec::new();
            for (akey, aval, avalue) in collect_entries(inner, Btree::open(dmeta.subtree))? {
                let ameta = KeyMeta::decode(&avalue)?;
                akeys.push(AkeyNode {
                    key: akey,
                    val_off: aval,
                    meta: ameta,
                    marks: ilog_entries(&inner.arena, ameta.ilog)?,
                });
            }
            dkeys.push(DkeyNode {
                key: dkey,
                meta: dmeta,
                marks: dmarks,
                akeys,
            });
        }
        objects.push(ObjNode {
            oid_key,
            meta,
            marks,
            dkeys,
        });
    }
    Ok(objects)
}

/// Free every tree, record, and ilog under an object descriptor. Runs
/// inside the caller's transaction.
pub(crate) fn destroy_object_tree(arena: &mut Arena, obj: &ObjMeta) -> Result<()> {
    let dkey_tree = Btree::open(obj.dkey_root);

    let mut dkeys = Vec::new();
    {
        let mut iter = BtreeIter::prepare(dkey_tree, &*arena, false);
        if iter.probe(Probe::First, None)? {
            loop {
                let entry = iter.fetch()?;
                dkeys.push(KeyMeta::decode(entry.value(&*arena)?)?);
                if !iter.next()? {
                    break;
                }
            }
        }
    }

    for dkey in dkeys {
        if dkey.subtree != 0 {
            let akey_tree = Btree::open(dkey.subtree);
            let mut akeys = Vec::new();
            {
                let mut iter = BtreeIter::prepare(akey_tree, &*arena, false);
                if iter.probe(Probe::First, None)? {
                    loop {
                        let entry = iter.fetch()?;
                        akeys.push(KeyMeta::decode(entry.value(&*arena)?)?);
                        if !iter.next()? {
                            break;
                        }
                    }
                }
            }
            for akey in akeys {
                if akey.subtree != 0 {
                    Btree::open(akey.subtree).destroy(arena)?;
                }
                arena.free(akey.ilog)?;
            }
            akey_tree.destroy(arena)?;
        }
        arena.free(dkey.ilog)?;
    }
    dkey_tree.destroy(arena)?;
    arena.free(obj.ilog)?;
    Ok(())
}
