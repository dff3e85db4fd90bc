//! The Vostok storage engine
//!
//! This crate ties the lower layers together into the embeddable
//! versioned object store:
//! - pools and containers with reference-counted handles
//! - the object index with typed 128-bit object-ids
//! - the versioned key-array engine: update / fetch / punch / list /
//!   query over epoch-stamped single values and extent arrays
//! - aggregation and discard over epoch windows
//! - the distributed-transaction surface (open / commit / abort,
//!   resolution callbacks, reclaim of aborted epochs)
//!
//! Scheduling is single-threaded cooperative per pool: one logical
//! executor serialises every mutation in a pool, while separate pools run
//! concurrently.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod aggregate;
mod container;
mod discard;
mod ilog;
mod layout;
mod object;
mod pool;
mod vka;

pub use container::{ContInfo, ContainerHandle};
pub use layout::ValueKind;
pub use object::ObjectHandle;
pub use pool::{OpenMode, PoolConfig, PoolCounters, PoolHandle, PoolInfo};
pub use vka::query::{ObjQuery, QueryFlags};
pub use vka::{AkeyUpdate, ArrayFetch, CondFlags, ExtentInfo, UpdatePayload};
pub use vostok_dtx::{DtxResolver, DtxVerdict};
