//! Containers: the per-pool container directory and per-container state.
//!
//! The container directory is one B-tree per pool, keyed by container
//! UUID, rooted in the superblock. Each entry holds the container
//! descriptor: the object-index root, object/space counters, and the
//! pinned snapshot list that aggregation must preserve.

use crate::layout::{ContMeta, CONT_USED_OFF};
use crate::object::destroy_object_tree;
use crate::pool::{PoolHandle, PoolInner};
use tracing::debug;
use vostok_btree::{Btree, BtreeIter, Probe, TreeClass, UpdateCond};
use vostok_core::{ContId, Epoch, Result, VosError};

/// Handle to a container within an open pool.
#[derive(Clone)]
pub struct ContainerHandle {
    pub(crate) pool: PoolHandle,
    pub(crate) id: ContId,
}

/// Container usage reported by [`ContainerHandle::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContInfo {
    /// Live objects in the container
    pub nobjs: u64,
    /// Payload bytes attributed to the container
    pub used: u64,
    /// Pinned snapshots
    pub nsnaps: u32,
}

/// Resolved container state: directory tree, descriptor value offset, and
/// the decoded descriptor.
pub(crate) struct ContCtx {
    pub dir: Btree,
    pub val_off: u64,
    pub meta: ContMeta,
}

/// The pool's container directory, created on first use.
pub(crate) fn cont_dir(inner: &mut PoolInner) -> Result<Btree> {
    let root = inner.arena.root();
    if root != 0 {
        return Ok(Btree::open(root));
    }
    let order = inner.order;
    inner.arena.with_tx(|arena| {
        let dir = Btree::create(arena, TreeClass::Fixed16, order)?;
        arena.set_root(dir.meta_off)?;
        Ok(dir)
    })
}

/// Load a container's descriptor; `NoKey` when it does not exist.
pub(crate) fn load_cont(inner: &PoolInner, id: ContId) -> Result<ContCtx> {
    let root = inner.arena.root();
    if root == 0 {
        return Err(VosError::NoKey);
    }
    let dir = Btree::open(root);
    let entry = dir
        .fetch(&inner.arena, Probe::Eq, id.as_bytes())?
        .ok_or(VosError::NoKey)?;
    let meta = ContMeta::decode(entry.value(&inner.arena)?)?;
    Ok(ContCtx {
        dir,
        val_off: entry.val_off,
        meta,
    })
}

/// Adjust the container's used-bytes counter in place (inside a tx).
pub(crate) fn bump_cont_used(inner: &mut PoolInner, ctx: &ContCtx, delta: i64) -> Result<()> {
    let cur = inner.arena.read_u64(ctx.val_off + CONT_USED_OFF)? as i64;
    inner
        .arena
        .write_u64(ctx.val_off + CONT_USED_OFF, cur.saturating_add(delta).max(0) as u64)
}

impl PoolHandle {
    /// Create a container. Fails with `PrecondFail` when the UUID exists.
    pub fn create_container(&self, id: ContId) -> Result<()> {
        let mut inner = self.lock();
        self.writable(&inner)?;
        let dir = cont_dir(&mut inner)?;
        let order = inner.order;
        inner.arena.with_tx(|arena| {
            let oi = Btree::create(arena, TreeClass::Fixed16, order)?;
            let meta = ContMeta {
                oi_root: oi.meta_off,
                nobjs: 0,
                used: 0,
                snaps: Vec::new(),
            };
            dir.update(arena, id.as_bytes(), &meta.encode(), UpdateCond::Insert)?;
            Ok(())
        })?;
        debug!(container = %id, "container created");
        Ok(())
    }

    /// Open a container; `NoKey` when absent.
    pub fn open_container(&self, id: ContId) -> Result<ContainerHandle> {
        let inner = self.lock();
        load_cont(&inner, id)?;
        drop(inner);
        Ok(ContainerHandle {
            pool: self.clone(),
            id,
        })
    }

    /// Destroy a container and every object under it.
    pub fn destroy_container(&self, id: ContId) -> Result<()> {
        let mut inner = self.lock();
        self.writable(&inner)?;
        let ctx = load_cont(&inner, id)?;

        // Collect the object descriptors first; tree destruction mutates
        // the arena and cannot overlap an iterator borrow.
        let oi = Btree::open(ctx.meta.oi_root);
        let mut objects = Vec::new();
        {
            let mut iter = BtreeIter::prepare(oi, &inner.arena, false);
            if iter.probe(Probe::First, None)? {
                loop {
                    let entry = iter.fetch()?;
                    objects.push(crate::layout::ObjMeta::decode(
                        entry.value(&inner.arena)?,
                    )?);
                    if !iter.next()? {
                        break;
                    }
                }
            }
        }

        let dir = ctx.dir;
        inner.arena.with_tx(|arena| {
            for obj in &objects {
                destroy_object_tree(arena, obj)?;
            }
            oi.destroy(arena)?;
            dir.delete(arena, id.as_bytes(), true)?;
            Ok(())
        })?;
        debug!(container = %id, objects = objects.len(), "container destroyed");
        Ok(())
    }
}

impl ContainerHandle {
    /// Container identity.
    pub fn id(&self) -> ContId {
        self.id
    }

    /// The owning pool.
    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    /// Object count, used bytes, snapshot count.
    pub fn query(&self) -> Result<ContInfo> {
        let inner = self.pool.lock();
        let ctx = load_cont(&inner, self.id)?;
        Ok(ContInfo {
            nobjs: ctx.meta.nobjs,
            used: ctx.meta.used,
            nsnaps: ctx.meta.snaps.len() as u32,
        })
    }

    /// Pin a snapshot epoch. Aggregation never compresses a pinned epoch
    /// away. Idempotent.
    pub fn snap_create(&self, epoch: Epoch) -> Result<()> {
        if !epoch.is_valid_stamp() {
            return Err(VosError::InvalArg("snapshot epoch must be nonzero".into()));
        }
        let mut inner = self.pool.lock();
        self.pool.writable(&inner)?;
        let ctx = load_cont(&inner, self.id)?;
        if ctx.meta.snaps.contains(&epoch) {
            return Ok(());
        }
        let mut meta = ctx.meta;
        let pos = meta.snaps.partition_point(|s| *s < epoch);
        meta.snaps.insert(pos, epoch);
        let dir = ctx.dir;
        let id = self.id;
        inner.arena.with_tx(|arena| {
            dir.update(arena, id.as_bytes(), &meta.encode(), UpdateCond::Replace)?;
            Ok(())
        })?;
        debug!(container = %self.id, %epoch, "snapshot pinned");
        Ok(())
    }

    /// Drop a pinned snapshot; `NoKey` when it was never pinned.
    pub fn snap_destroy(&self, epoch: Epoch) -> Result<()> {
        let mut inner = self.pool.lock();
        self.pool.writable(&inner)?;
        let ctx = load_cont(&inner, self.id)?;
        if !ctx.meta.snaps.contains(&epoch) {
            return Err(VosError::NoKey);
        }
        let mut meta = ctx.meta;
        meta.snaps.retain(|s| *s != epoch);
        let dir = ctx.dir;
        let id = self.id;
        inner.arena.with_tx(|arena| {
            dir.update(arena, id.as_bytes(), &meta.encode(), UpdateCond::Replace)?;
            Ok(())
        })?;
        debug!(container = %self.id, %epoch, "snapshot dropped");
        Ok(())
    }

    /// The pinned snapshot epochs, ascending.
    pub fn snapshots(&self) -> Result<Vec<Epoch>> {
        let inner = self.pool.lock();
        Ok(load_cont(&inner, self.id)?.meta.snaps)
    }
}
