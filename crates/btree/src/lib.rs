//! Class-parameterised transactional B-tree over the Vostok arena
//!
//! The tree primitive underneath the object store:
//! - `class`: the closed set of tree classes (hashed, integer, lexical,
//!   fixed-width) and their hashed-key derivation
//! - `node`: the on-arena node layout, addressed by offsets
//! - `tree`: fetch/update/delete/destroy with conditional modes and
//!   leaf-to-root splits
//! - `iter`: forward/reverse iteration with durable anchors
//!
//! All mutations run inside an arena transaction, started here or joined
//! if the caller already opened one.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod class;
pub mod iter;
pub mod node;
pub mod tree;

pub use class::{HKey, TreeClass, HKEY_SIZE};
pub use iter::{Anchor, BtreeIter, IterState};
pub use tree::{Btree, Entry, Probe, UpdateCond, DEFAULT_ORDER};
