//! Pools: lifecycle, handles, open modes, and the DTX surface.
//!
//! A pool is one arena file plus its WAL. Process-wide state is limited to
//! the table of open pools: the first open of a pool maps it, later opens
//! share the same `PoolShared`, and the last handle drop checkpoints and
//! unmaps it.
//!
//! Scheduling is single-threaded cooperative per pool: every operation
//! takes the pool mutex, so mutations serialise on one logical executor;
//! operations on different pools run concurrently.

use crate::ilog::ilog_clear_dtx;
use crate::layout::{ContMeta, OFF_MAX_EPOCH};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};
use vostok_arena::{Arena, LAYOUT_VERSION, POOL_MAGIC, SUPERBLOCK_SIZE};
use vostok_btree::{Btree, BtreeIter, Probe, DEFAULT_ORDER};
use vostok_core::{DtxId, Epoch, PoolId, Result, VosError};
use vostok_dtx::{DtxCheck, DtxRegistry, DtxResolver, EpochClock};

/// Pool creation parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Arena capacity in bytes
    pub capacity: u64,
    /// Horizon after which pending DTX entries are force-resolved
    pub dtx_horizon: Duration,
    /// B-tree order used for every index in the pool
    pub order: u16,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            capacity: 64 << 20,
            dtx_horizon: Duration::from_secs(60),
            order: DEFAULT_ORDER,
        }
    }
}

impl PoolConfig {
    /// Small pool for tests.
    pub fn for_testing() -> Self {
        PoolConfig {
            capacity: 8 << 20,
            dtx_horizon: Duration::from_secs(5),
            order: 8,
        }
    }
}

/// Pool open options.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenMode {
    /// Refuse mutation through this handle
    pub read_only: bool,
    /// Refuse to open while any other handle exists
    pub exclusive: bool,
    /// Create the pool (default config) when the file is absent
    pub create_if_absent: bool,
}

impl OpenMode {
    /// Plain read-write open.
    pub fn read_write() -> Self {
        OpenMode::default()
    }

    /// Read-only open.
    pub fn read_only() -> Self {
        OpenMode {
            read_only: true,
            ..Default::default()
        }
    }

    /// Demand exclusivity.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Create the pool when absent.
    pub fn create_if_absent(mut self) -> Self {
        self.create_if_absent = true;
        self
    }
}

/// Space usage reported by [`PoolHandle::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    /// Total arena capacity
    pub capacity: u64,
    /// Allocated bytes (headers included)
    pub used: u64,
    /// Remaining bytes
    pub free: u64,
}

/// Per-pool operation counters, fetched on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounters {
    /// Committed updates
    pub updates: u64,
    /// Fetches served
    pub fetches: u64,
    /// Punches recorded
    pub punches: u64,
    /// Enumeration batches served
    pub lists: u64,
    /// Min/max queries served
    pub queries: u64,
    /// Aggregation passes completed
    pub aggregations: u64,
    /// Discard passes completed
    pub discards: u64,
}

/// Reference to a record's DTX tag, registered at write time and cleared
/// at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DtxTouch {
    /// Stable arena offset of the tag (value records never move once
    /// inserted: same-epoch overwrites are conflicts)
    Field(u64),
    /// Incarnation-log mark, reached through the holder's ilog pointer
    /// because the log blob may move as it grows
    IlogMark {
        /// Arena offset of the u64 field holding the ilog blob offset
        holder: u64,
        /// Epoch of the mark
        epoch: Epoch,
    },
}

/// Clear a set of DTX tags inside the caller's transaction.
pub(crate) fn clear_touches(arena: &mut Arena, touches: &[DtxTouch]) -> Result<()> {
    for t in touches {
        match *t {
            DtxTouch::Field(off) => arena.write_u64(off, 0)?,
            DtxTouch::IlogMark { holder, epoch } => {
                let blob = arena.read_u64(holder)?;
                ilog_clear_dtx(arena, blob, epoch)?;
            }
        }
    }
    Ok(())
}

pub(crate) struct PoolInner {
    pub arena: Arena,
    pub clock: EpochClock,
    pub dtx: DtxRegistry<DtxTouch>,
    pub order: u16,
    pub degraded: bool,
    pub counters: PoolCounters,
}

pub(crate) struct PoolShared {
    id: PoolId,
    path: PathBuf,
    exclusive: bool,
    _lock: File,
    pub(crate) inner: Mutex<PoolInner>,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        open_pools().lock().remove(&self.id);
        let inner = self.inner.get_mut();
        if !inner.degraded && !inner.arena.is_read_only() {
            if let Err(e) = inner.arena.checkpoint() {
                error!(pool = %self.id, %e, "checkpoint on close failed");
            }
        }
        debug!(pool = %self.id, path = %self.path.display(), "pool closed");
    }
}

/// Reference-counted pool handle.
#[derive(Clone)]
pub struct PoolHandle {
    pub(crate) shared: Arc<PoolShared>,
    read_only: bool,
}

static OPEN_POOLS: Lazy<Mutex<HashMap<PoolId, Weak<PoolShared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn open_pools() -> &'static Mutex<HashMap<PoolId, Weak<PoolShared>>> {
    &OPEN_POOLS
}

fn wal_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".wal");
    PathBuf::from(p)
}

fn lock_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".lock");
    PathBuf::from(p)
}

/// Read just the superblock header to learn the pool identity, without
/// mapping the whole file.
fn peek_pool_id(path: &Path) -> Result<PoolId> {
    let mut buf = [0u8; 24];
    let mut f = File::open(path)?;
    f.read_exact(&mut buf)?;
    if buf[0..4] != POOL_MAGIC {
        return Err(VosError::Corrupt("bad pool magic".into()));
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if version == 1 {
        return Err(VosError::Incompat { found: 1 });
    }
    if version != LAYOUT_VERSION {
        return Err(VosError::Corrupt(format!(
            "unknown pool layout version {}",
            version
        )));
    }
    Ok(PoolId::from_bytes(buf[8..24].try_into().unwrap()))
}

impl PoolHandle {
    /// Create a pool at `path` with the given identity and configuration.
    pub fn create(path: &Path, id: PoolId, config: &PoolConfig) -> Result<()> {
        if path.exists() {
            return Err(VosError::InvalArg(format!(
                "pool file {} already exists",
                path.display()
            )));
        }
        let arena = Arena::create(path, &wal_path(path), *id.as_bytes(), config.capacity)?;
        arena.close()?;
        debug!(pool = %id, path = %path.display(), "pool created");
        Ok(())
    }

    /// Open a pool. Repeated opens share one mapping; `exclusive` refuses
    /// to coexist with any other handle.
    pub fn open(path: &Path, mode: OpenMode, config: &PoolConfig) -> Result<PoolHandle> {
        if !path.exists() {
            if mode.create_if_absent {
                Self::create(path, PoolId::new(), config)?;
            } else {
                return Err(VosError::NoKey);
            }
        }
        let id = peek_pool_id(path)?;

        let mut pools = open_pools().lock();
        if let Some(existing) = pools.get(&id).and_then(Weak::upgrade) {
            if mode.exclusive || existing.exclusive {
                return Err(VosError::Busy);
            }
            return Ok(PoolHandle {
                shared: existing,
                read_only: mode.read_only,
            });
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path(path))?;
        let locked = if mode.exclusive {
            fs2::FileExt::try_lock_exclusive(&lock_file)
        } else {
            fs2::FileExt::try_lock_shared(&lock_file)
        };
        if locked.is_err() {
            return Err(VosError::Busy);
        }

        let arena = Arena::open(path, &wal_path(path))?;
        let clock = EpochClock::resume_from(Epoch(arena.read_u64(OFF_MAX_EPOCH)?));
        let config_order = config.order;
        let mut inner = PoolInner {
            arena,
            clock,
            dtx: DtxRegistry::new(config.dtx_horizon),
            order: config_order,
            degraded: false,
            counters: PoolCounters::default(),
        };

        // Recovery ran in Arena::open; now walk the container directory.
        // Structural damage degrades the pool to read-only rather than
        // refusing to open.
        if let Err(e) = sanity_walk(&inner) {
            warn!(pool = %id, %e, "sanity walk failed, pool opens read-only");
            inner.arena.set_read_only();
            inner.degraded = true;
        }

        let shared = Arc::new(PoolShared {
            id,
            path: path.to_path_buf(),
            exclusive: mode.exclusive,
            _lock: lock_file,
            inner: Mutex::new(inner),
        });
        pools.insert(id, Arc::downgrade(&shared));
        debug!(pool = %id, "pool opened");
        Ok(PoolHandle {
            shared,
            read_only: mode.read_only,
        })
    }

    /// Destroy the pool at `path`. Refused while any handle is open.
    pub fn destroy(path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(VosError::NoKey);
        }
        let id = peek_pool_id(path)?;
        let pools = open_pools().lock();
        if pools.get(&id).map(|w| w.strong_count() > 0).unwrap_or(false) {
            return Err(VosError::Busy);
        }
        drop(pools);
        std::fs::remove_file(path)?;
        let _ = std::fs::remove_file(wal_path(path));
        let _ = std::fs::remove_file(lock_path(path));
        debug!(pool = %id, "pool destroyed");
        Ok(())
    }

    /// Pool identity.
    pub fn id(&self) -> PoolId {
        self.shared.id
    }

    /// Close this handle. The pool unmaps when the last handle closes.
    pub fn close(self) {}

    /// Stamp the next epoch from the pool's hybrid logical clock.
    pub fn stamp(&self) -> Epoch {
        self.lock().clock.stamp()
    }

    /// Space usage.
    pub fn query(&self) -> PoolInfo {
        let inner = self.lock();
        let capacity = inner.arena.capacity();
        let used = inner.arena.used();
        PoolInfo {
            capacity,
            used,
            free: capacity.saturating_sub(used + SUPERBLOCK_SIZE),
        }
    }

    /// Operation counters.
    pub fn counters(&self) -> PoolCounters {
        self.lock().counters
    }

    // =========================================================================
    // DTX surface
    // =========================================================================

    /// Open a distributed transaction led at a freshly stamped epoch.
    pub fn dtx_open(&self) -> Result<DtxId> {
        let mut inner = self.lock();
        self.writable(&inner)?;
        let leader = inner.clock.stamp();
        Ok(inner.dtx.open(leader))
    }

    /// Commit a DTX: its records become visible at the leader epoch.
    pub fn dtx_commit(&self, id: DtxId) -> Result<()> {
        let mut inner = self.lock();
        self.writable(&inner)?;
        let touched = inner.dtx.begin_commit(id)?;
        inner
            .arena
            .with_tx(|arena| clear_touches(arena, &touched))?;
        inner.dtx.finish_commit(id, id.leader_epoch)
    }

    /// Abort a DTX: its records become permanently invisible and its epoch
    /// joins the discard set.
    pub fn dtx_abort(&self, id: DtxId) -> Result<()> {
        let mut inner = self.lock();
        inner.dtx.abort(id)?;
        Ok(())
    }

    /// Install the external DTX resolution callback.
    pub fn set_dtx_resolver(&self, resolver: DtxResolver) {
        self.lock().dtx.set_resolver(resolver);
    }

    /// Force-resolve every pending DTX past the configured horizon. With
    /// no resolver installed the expired entries abort.
    pub fn dtx_resolve_expired(&self) -> Result<()> {
        let mut inner = self.lock();
        for id in inner.dtx.expired() {
            match inner.dtx.check(id.seq, Epoch(u64::MAX)) {
                Ok(DtxCheck::ResolveCommit(id)) => {
                    let touched = inner.dtx.begin_commit(id)?;
                    inner
                        .arena
                        .with_tx(|arena| clear_touches(arena, &touched))?;
                    inner.dtx.finish_commit(id, id.leader_epoch)?;
                }
                Ok(DtxCheck::ResolveAbort(id)) => {
                    inner.dtx.abort(id)?;
                }
                // No resolver installed: expired entries abort.
                Err(VosError::Timeout) => {
                    inner.dtx.abort(id)?;
                }
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.shared.inner.lock()
    }

    /// Gate mutation: degraded pools fail with `Corrupt`, read-only
    /// handles with `InvalArg`.
    pub(crate) fn writable(&self, inner: &PoolInner) -> Result<()> {
        if inner.degraded {
            return Err(VosError::Corrupt("pool is degraded read-only".into()));
        }
        if self.read_only {
            return Err(VosError::InvalArg("pool handle is read-only".into()));
        }
        Ok(())
    }
}

/// Run `f` inside an arena transaction with full pool state available,
/// committing on `Ok` and aborting on `Err`. A durable error (corruption,
/// incompatible layout) degrades the pool to read-only; later writes keep
/// failing with `Corrupt` until operator recovery.
pub(crate) fn with_pool_tx<T>(
    inner: &mut PoolInner,
    f: impl FnOnce(&mut PoolInner) -> Result<T>,
) -> Result<T> {
    inner.arena.tx_begin()?;
    let out = match f(&mut *inner) {
        Ok(v) => match inner.arena.tx_commit() {
            Ok(()) => Ok(v),
            Err(e) => {
                inner.arena.tx_abort();
                Err(e)
            }
        },
        Err(e) => {
            inner.arena.tx_abort();
            Err(e)
        }
    };
    if let Err(e) = &out {
        if e.is_fatal() {
            error!(%e, "durable error, pool degrades to read-only");
            inner.arena.set_read_only();
            inner.degraded = true;
        }
    }
    out
}

/// Decide record visibility under a DTX for a reader at `at`, performing
/// any resolution the registry asks for.
pub(crate) fn dtx_visible(inner: &mut PoolInner, seq: u64, at: Epoch) -> Result<bool> {
    match inner.dtx.check(seq, at)? {
        DtxCheck::Visible => Ok(true),
        DtxCheck::Invisible => Ok(false),
        DtxCheck::ResolveCommit(id) => {
            let touched = inner.dtx.begin_commit(id)?;
            inner
                .arena
                .with_tx(|arena| clear_touches(arena, &touched))?;
            inner.dtx.finish_commit(id, id.leader_epoch)?;
            Ok(true)
        }
        DtxCheck::ResolveAbort(id) => {
            inner.dtx.abort(id)?;
            Ok(false)
        }
    }
}

/// Fold a caller-supplied epoch into the clock and persist the high-water
/// mark (inside the caller's transaction).
pub(crate) fn note_epoch(inner: &mut PoolInner, epoch: Epoch) -> Result<()> {
    inner.clock.observe(epoch);
    let stored = inner.arena.read_u64(OFF_MAX_EPOCH)?;
    if epoch.0 > stored {
        inner.arena.write_u64(OFF_MAX_EPOCH, epoch.0)?;
    }
    Ok(())
}

/// Structural sanity walk after recovery: every container descriptor must
/// decode and its object index must be readable.
fn sanity_walk(inner: &PoolInner) -> Result<()> {
    let root = inner.arena.root();
    if root == 0 {
        return Ok(());
    }
    let dir = Btree::open(root);
    let mut iter = BtreeIter::prepare(dir, &inner.arena, false);
    if !iter.probe(Probe::First, None)? {
        return Ok(());
    }
    loop {
        let entry = iter.fetch()?;
        let meta = ContMeta::decode(entry.value(&inner.arena)?)?;
        let oi = Btree::open(meta.oi_root);
        oi.count(&inner.arena)?;
        if !iter.next()? {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(name)
    }

    #[test]
    fn create_open_close_destroy() {
        let dir = tempdir().unwrap();
        let path = pool_path(dir.path(), "p1.pool");
        let id = PoolId::new();
        PoolHandle::create(&path, id, &PoolConfig::for_testing()).unwrap();

        let handle = PoolHandle::open(&path, OpenMode::read_write(), &PoolConfig::for_testing())
            .unwrap();
        assert_eq!(handle.id(), id);
        let info = handle.query();
        assert!(info.free > 0);
        handle.close();

        PoolHandle::destroy(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn create_over_existing_file_fails() {
        let dir = tempdir().unwrap();
        let path = pool_path(dir.path(), "p1.pool");
        PoolHandle::create(&path, PoolId::new(), &PoolConfig::for_testing()).unwrap();
        assert!(matches!(
            PoolHandle::create(&path, PoolId::new(), &PoolConfig::for_testing()),
            Err(VosError::InvalArg(_))
        ));
    }

    #[test]
    fn destroy_while_open_is_busy() {
        let dir = tempdir().unwrap();
        let path = pool_path(dir.path(), "p1.pool");
        PoolHandle::create(&path, PoolId::new(), &PoolConfig::for_testing()).unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                PoolHandle::open(&path, OpenMode::read_write(), &PoolConfig::for_testing())
                    .unwrap()
            })
            .collect();
        assert!(matches!(PoolHandle::destroy(&path), Err(VosError::Busy)));

        // Dropping all but one still pins the pool.
        let last = handles.into_iter().last().unwrap();
        assert!(matches!(PoolHandle::destroy(&path), Err(VosError::Busy)));
        last.close();
        PoolHandle::destroy(&path).unwrap();
    }

    #[test]
    fn exclusive_refuses_second_handle() {
        let dir = tempdir().unwrap();
        let path = pool_path(dir.path(), "p1.pool");
        PoolHandle::create(&path, PoolId::new(), &PoolConfig::for_testing()).unwrap();

        let h1 = PoolHandle::open(&path, OpenMode::read_write(), &PoolConfig::for_testing())
            .unwrap();
        assert!(matches!(
            PoolHandle::open(
                &path,
                OpenMode::read_write().exclusive(),
                &PoolConfig::for_testing()
            ),
            Err(VosError::Busy)
        ));
        drop(h1);

        let hx = PoolHandle::open(
            &path,
            OpenMode::read_write().exclusive(),
            &PoolConfig::for_testing(),
        )
        .unwrap();
        assert!(matches!(
            PoolHandle::open(&path, OpenMode::read_write(), &PoolConfig::for_testing()),
            Err(VosError::Busy)
        ));
        drop(hx);
    }

    #[test]
    fn open_missing_pool() {
        let dir = tempdir().unwrap();
        let path = pool_path(dir.path(), "absent.pool");
        assert!(matches!(
            PoolHandle::open(&path, OpenMode::read_write(), &PoolConfig::for_testing()),
            Err(VosError::NoKey)
        ));

        let h = PoolHandle::open(
            &path,
            OpenMode::read_write().create_if_absent(),
            &PoolConfig::for_testing(),
        )
        .unwrap();
        drop(h);
        assert!(path.exists());
    }

    #[test]
    fn layout_version_one_is_incompat() {
        let dir = tempdir().unwrap();
        let path = pool_path(dir.path(), "p1.pool");
        PoolHandle::create(&path, PoolId::new(), &PoolConfig::for_testing()).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        data[4..8].copy_from_slice(&1u32.to_le_bytes());
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            PoolHandle::open(&path, OpenMode::read_write(), &PoolConfig::for_testing()),
            Err(VosError::Incompat { found: 1 })
        ));
    }

    #[test]
    fn stamps_are_monotone_across_reopen() {
        let dir = tempdir().unwrap();
        let path = pool_path(dir.path(), "p1.pool");
        PoolHandle::create(&path, PoolId::new(), &PoolConfig::for_testing()).unwrap();

        let first;
        {
            let h = PoolHandle::open(&path, OpenMode::read_write(), &PoolConfig::for_testing())
                .unwrap();
            first = h.stamp();
        }
        let h = PoolHandle::open(&path, OpenMode::read_write(), &PoolConfig::for_testing())
            .unwrap();
        assert!(h.stamp() > first);
    }

    #[test]
    fn read_only_handle_refuses_dtx() {
        let dir = tempdir().unwrap();
        let path = pool_path(dir.path(), "p1.pool");
        PoolHandle::create(&path, PoolId::new(), &PoolConfig::for_testing()).unwrap();
        let h = PoolHandle::open(&path, OpenMode::read_only(), &PoolConfig::for_testing())
            .unwrap();
        assert!(matches!(h.dtx_open(), Err(VosError::InvalArg(_))));
    }
}
