//! Persistent-memory arena for the Vostok object store
//!
//! This crate provides the storage substrate everything else sits on:
//! - `Arena`: a file-backed byte region with typed allocation and
//!   transactional mutation (begin / write / commit / abort, join-on-nest)
//! - `wal`: write-ahead log framing, append, and scan
//! - `replay`: open-time recovery by WAL redo
//! - `layout`: the pool superblock
//!
//! The durability contract: a committed transaction's effects are either
//! fully present in the checkpointed image or fully replayable from the
//! WAL; an aborted or torn transaction leaves no trace.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod arena;
pub mod layout;
pub mod replay;
pub mod wal;

pub use alloc::BLOCK_HEADER_SIZE;
pub use arena::Arena;
pub use layout::{Superblock, LAYOUT_VERSION, POOL_MAGIC, SUPERBLOCK_SIZE};
pub use replay::ReplayStats;
