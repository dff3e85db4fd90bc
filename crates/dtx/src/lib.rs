//! Epoch and transaction management for the Vostok object store
//!
//! - `clock`: hybrid logical clock issuing monotone epochs
//! - `registry`: the distributed-transaction (DTX) table with resolution
//!   callbacks, horizon-based force resolution, and the discard feed

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod registry;

pub use clock::EpochClock;
pub use registry::{DtxCheck, DtxRegistry, DtxResolver, DtxState, DtxVerdict};
