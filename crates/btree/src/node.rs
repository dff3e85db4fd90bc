//! On-arena node layout.
//!
//! Nodes are fixed-size blocks inside the pool arena, addressed by offset;
//! children and records are offsets too, never pointers. A node decodes
//! into an in-memory `Node` for manipulation and is encoded back inside
//! the enclosing transaction.
//!
//! # Node Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │ flags (u16) | nkeys (u16) | level (u16) | order    │  16-byte header
//! │ (u16) | class (u32) | reserved (u32)               │
//! ├────────────────────────────────────────────────────┤
//! │ children: order × u64                              │
//! ├────────────────────────────────────────────────────┤
//! │ hkeys: (order − 1) × 16 bytes                      │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! A leaf holds `nkeys` keys with `children[i]` pointing at record `i`.
//! An internal node holds `nkeys` pivot keys and `nkeys + 1` children.
//! The key count never exceeds `order − 1` on disk; an in-memory node may
//! transiently overflow by one entry between insert and split.

use crate::class::{HKey, HKEY_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use vostok_arena::Arena;
use vostok_core::{Result, VosError};

/// Node flag: leaf.
pub const NODE_LEAF: u16 = 1 << 0;
/// Node flag: root.
pub const NODE_ROOT: u16 = 1 << 1;

const HEADER_SIZE: usize = 16;

/// Persistent size of a node of the given order.
pub const fn node_bytes(order: u16) -> usize {
    HEADER_SIZE + order as usize * 8 + (order as usize - 1) * HKEY_SIZE
}

/// In-memory image of one tree node.
#[derive(Debug, Clone)]
pub struct Node {
    /// Leaf/root flags
    pub flags: u16,
    /// Distance from the leaf level (leaves are level 0)
    pub level: u16,
    /// Tree order this node was allocated for
    pub order: u16,
    /// Persistent class id (sanity-checked against the tree)
    pub class: u32,
    /// Pivot or record keys
    pub keys: Vec<HKey>,
    /// Child node offsets (internal) or record offsets (leaf)
    pub children: Vec<u64>,
}

impl Node {
    /// Create an empty node.
    pub fn new(order: u16, class: u32, level: u16, flags: u16) -> Node {
        Node {
            flags,
            level,
            order,
            class,
            keys: Vec::new(),
            children: Vec::new(),
        }
    }

    /// True for leaf nodes.
    pub fn is_leaf(&self) -> bool {
        self.flags & NODE_LEAF != 0
    }

    /// Number of live keys.
    pub fn nkeys(&self) -> usize {
        self.keys.len()
    }

    /// True once the node holds more than `order − 1` keys and must split.
    pub fn overflows(&self) -> bool {
        self.nkeys() > self.order as usize - 1
    }

    /// Decode a node from the arena.
    pub fn read(arena: &Arena, off: u64) -> Result<Node> {
        let header = arena.slice(off, HEADER_SIZE)?;
        let flags = LittleEndian::read_u16(&header[0..2]);
        let nkeys = LittleEndian::read_u16(&header[2..4]) as usize;
        let level = LittleEndian::read_u16(&header[4..6]);
        let order = LittleEndian::read_u16(&header[6..8]);
        let class = LittleEndian::read_u32(&header[8..12]);
        if order < 4 || nkeys > order as usize - 1 {
            return Err(VosError::Corrupt(format!(
                "node at {} has impossible shape (order {}, nkeys {})",
                off, order, nkeys
            )));
        }
        let body = arena.slice(off, node_bytes(order))?;
        let is_leaf = flags & NODE_LEAF != 0;
        let nchildren = if is_leaf { nkeys } else { nkeys + 1 };
        let mut children = Vec::with_capacity(nchildren);
        for i in 0..nchildren {
            children.push(LittleEndian::read_u64(
                &body[HEADER_SIZE + i * 8..HEADER_SIZE + i * 8 + 8],
            ));
        }
        let keys_base = HEADER_SIZE + order as usize * 8;
        let mut keys = Vec::with_capacity(nkeys);
        for i in 0..nkeys {
            let mut k = [0u8; HKEY_SIZE];
            k.copy_from_slice(&body[keys_base + i * HKEY_SIZE..keys_base + (i + 1) * HKEY_SIZE]);
            keys.push(k);
        }
        Ok(Node {
            flags,
            level,
            order,
            class,
            keys,
            children,
        })
    }

    /// Encode this node back into the arena (inside a transaction).
    pub fn write(&self, arena: &mut Arena, off: u64) -> Result<()> {
        debug_assert!(!self.overflows(), "persisting an overflowing node");
        let mut buf = vec![0u8; node_bytes(self.order)];
        LittleEndian::write_u16(&mut buf[0..2], self.flags);
        LittleEndian::write_u16(&mut buf[2..4], self.nkeys() as u16);
        LittleEndian::write_u16(&mut buf[4..6], self.level);
        LittleEndian::write_u16(&mut buf[6..8], self.order);
        LittleEndian::write_u32(&mut buf[8..12], self.class);
        for (i, child) in self.children.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[HEADER_SIZE + i * 8..HEADER_SIZE + i * 8 + 8], *child);
        }
        let keys_base = HEADER_SIZE + self.order as usize * 8;
        for (i, k) in self.keys.iter().enumerate() {
            buf[keys_base + i * HKEY_SIZE..keys_base + (i + 1) * HKEY_SIZE].copy_from_slice(k);
        }
        arena.write(off, &buf)
    }

    /// Allocate arena space for this node and persist it.
    pub fn alloc_and_write(&self, arena: &mut Arena) -> Result<u64> {
        let off = arena.alloc(node_bytes(self.order))?;
        self.write(arena, off)?;
        Ok(off)
    }

    /// Index of the child to descend into for the leftmost occurrence of
    /// `hkey`: the count of pivots strictly below it.
    pub fn route(&self, hkey: &HKey) -> usize {
        self.keys.partition_point(|k| k < hkey)
    }

    /// First in-leaf index whose key is `>= hkey`.
    pub fn leaf_lower_bound(&self, hkey: &HKey) -> usize {
        self.keys.partition_point(|k| k < hkey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn mk(dir: &Path) -> Arena {
        Arena::create(
            &dir.join("pool.img"),
            &dir.join("pool.wal"),
            [2u8; 16],
            1 << 20,
        )
        .unwrap()
    }

    fn key(b: u8) -> HKey {
        let mut k = [0u8; HKEY_SIZE];
        k[15] = b;
        k
    }

    #[test]
    fn leaf_round_trip() {
        let dir = tempdir().unwrap();
        let mut arena = mk(dir.path());
        arena.tx_begin().unwrap();

        let mut node = Node::new(8, 3, 0, NODE_LEAF | NODE_ROOT);
        node.keys = vec![key(1), key(5), key(9)];
        node.children = vec![100, 200, 300];
        let off = node.alloc_and_write(&mut arena).unwrap();
        arena.tx_commit().unwrap();

        let back = Node::read(&arena, off).unwrap();
        assert!(back.is_leaf());
        assert_eq!(back.keys, node.keys);
        assert_eq!(back.children, node.children);
        assert_eq!(back.level, 0);
        assert_eq!(back.class, 3);
    }

    #[test]
    fn internal_round_trip_keeps_extra_child() {
        let dir = tempdir().unwrap();
        let mut arena = mk(dir.path());
        arena.tx_begin().unwrap();

        let mut node = Node::new(8, 0, 1, 0);
        node.keys = vec![key(10), key(20)];
        node.children = vec![1000, 2000, 3000];
        let off = node.alloc_and_write(&mut arena).unwrap();
        arena.tx_commit().unwrap();

        let back = Node::read(&arena, off).unwrap();
        assert!(!back.is_leaf());
        assert_eq!(back.children.len(), back.nkeys() + 1);
        assert_eq!(back.children, vec![1000, 2000, 3000]);
    }

    #[test]
    fn route_descends_left_on_equal_pivot() {
        let mut node = Node::new(8, 0, 1, 0);
        node.keys = vec![key(10), key(20)];
        node.children = vec![1, 2, 3];
        assert_eq!(node.route(&key(5)), 0);
        assert_eq!(node.route(&key(10)), 0); // equal pivot: go left
        assert_eq!(node.route(&key(15)), 1);
        assert_eq!(node.route(&key(25)), 2);
    }

    #[test]
    fn corrupt_shape_is_detected() {
        let dir = tempdir().unwrap();
        let mut arena = mk(dir.path());
        arena.tx_begin().unwrap();
        let off = arena.alloc(node_bytes(8)).unwrap();
        // nkeys 200 with order 8 is impossible
        let mut buf = vec![0u8; 16];
        LittleEndian::write_u16(&mut buf[2..4], 200);
        LittleEndian::write_u16(&mut buf[6..8], 8);
        arena.write(off, &buf).unwrap();
        arena.tx_commit().unwrap();
        assert!(matches!(
            Node::read(&arena, off),
            Err(VosError::Corrupt(_))
        ));
    }
}
