//! Vostok: an embeddable versioned object store.
//!
//! Pools hold containers; containers hold objects; objects hold
//! distribution keys, attribute keys, and epoch-versioned values — single
//! values or extent-indexed arrays. Reads resolve at arbitrary snapshot
//! epochs; punches shadow history without erasing it; aggregation compacts
//! history while preserving every pinned snapshot; discard rolls an epoch
//! range back.
//!
//! ```no_run
//! use vostok::{
//!     AkeyUpdate, CondFlags, Epoch, KeyBuf, ObjId, ObjType, OpenMode, PoolConfig,
//!     PoolHandle, PoolId,
//! };
//!
//! # fn main() -> vostok::Result<()> {
//! let path = std::path::Path::new("/tmp/example.pool");
//! PoolHandle::create(path, PoolId::new(), &PoolConfig::default())?;
//! let pool = PoolHandle::open(path, OpenMode::read_write(), &PoolConfig::default())?;
//!
//! let cont_id = vostok::ContId::new();
//! pool.create_container(cont_id)?;
//! let cont = pool.open_container(cont_id)?;
//!
//! let obj = cont.object(ObjId::new(ObjType::MultiHashed, 0, 0, 0, 1))?;
//! obj.update(
//!     &KeyBuf::from("dkey"),
//!     &[AkeyUpdate::single("akey", b"value".to_vec())],
//!     pool.stamp(),
//!     CondFlags::default(),
//!     None,
//! )?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use vostok_core::{
    ContId, DtxId, Epoch, KeyBuf, KeyError, Limits, ObjId, ObjType, PoolId, Result, VosError,
    EPOCH_MAX, MAX_MARK_BYTES,
};
pub use vostok_engine::{
    AkeyUpdate, ArrayFetch, CondFlags, ContInfo, ContainerHandle, DtxResolver, DtxVerdict,
    ExtentInfo, ObjQuery, ObjectHandle, OpenMode, PoolConfig, PoolCounters, PoolHandle, PoolInfo,
    QueryFlags, UpdatePayload, ValueKind,
};

/// Lower layers, exposed for embedders that build their own indexes.
pub mod layers {
    pub use vostok_arena::{Arena, ReplayStats, Superblock, LAYOUT_VERSION, POOL_MAGIC};
    pub use vostok_btree::{Anchor, Btree, BtreeIter, IterState, Probe, TreeClass, UpdateCond};
    pub use vostok_dtx::{DtxCheck, DtxRegistry, DtxState, EpochClock};
}
