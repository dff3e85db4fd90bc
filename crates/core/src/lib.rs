//! Core types for the Vostok object store
//!
//! This crate defines the foundational types shared by every layer:
//! - `Epoch`: monotone mutation-ordering token
//! - `PoolId` / `ContId`: pool and container identities
//! - `ObjId` / `ObjType`: typed 128-bit object identifiers
//! - `KeyBuf`: distribution/attribute keys
//! - `VosError`: the closed caller-facing error set
//! - `DtxId`: distributed-transaction identity

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod key;
pub mod limits;
pub mod types;

pub use error::{Result, VosError};
pub use key::{KeyBuf, KeyError};
pub use limits::{Limits, MAX_MARK_BYTES};
pub use types::{ContId, DtxId, Epoch, ObjId, ObjType, PoolId, EPOCH_MAX};
