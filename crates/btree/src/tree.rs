//! The B-tree primitive.
//!
//! A tree is identified by the arena offset of its small root descriptor;
//! everything else (nodes, records) hangs off it inside the arena. All
//! mutations run inside an arena transaction — started here, or joined if
//! the caller already opened one.
//!
//! Records live adjacent to their keys: a leaf entry points at a record
//! blob holding the (optional) full key and the value. Internal entries
//! point at child nodes. Search routes by the fixed hashed key; classes
//! that store the full key resolve hashed-key ties by walking the short
//! run of colliding entries and comparing stored keys.
//!
//! Deletion is lazy: an underfull node is tolerated, an empty node is
//! pruned, and the root collapses when it routes a single child. The
//! upper bound of `order − 1` keys per node is strict.

use crate::class::{HKey, TreeClass};
use crate::node::{node_bytes, Node, NODE_LEAF, NODE_ROOT};
use byteorder::{ByteOrder, LittleEndian};
use smallvec::SmallVec;
use std::cmp::Ordering;
use tracing::trace;
use vostok_arena::Arena;
use vostok_core::{Result, VosError};

/// Search traces stay inline for any realistic tree height.
type Trace = SmallVec<[(u64, usize); 12]>;

/// Default tree order (max children per node).
pub const DEFAULT_ORDER: u16 = 20;

const META_SIZE: usize = 24;

/// Probe opcodes for `fetch` and iterator positioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Exact match
    Eq,
    /// Tightest entry at or above the key
    Ge,
    /// Tightest entry at or below the key
    Le,
    /// Smallest entry
    First,
    /// Largest entry
    Last,
}

/// Conditional update modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCond {
    /// Insert or overwrite
    Any,
    /// Fail if the key already exists
    Insert,
    /// Fail if the key does not exist
    Replace,
    /// Insert or overwrite (alias kept for callers that distinguish intent)
    Upsert,
}

/// A fetched entry.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Fixed hashed key
    pub hkey: HKey,
    /// Full key: the stored key for full-key classes, otherwise derived
    /// from the hashed key
    pub key: Vec<u8>,
    /// Record blob offset
    pub rec_off: u64,
    /// Value offset inside the arena
    pub val_off: u64,
    /// Value length
    pub val_len: u32,
}

impl Entry {
    /// Borrow the value bytes.
    pub fn value<'a>(&self, arena: &'a Arena) -> Result<&'a [u8]> {
        arena.slice(self.val_off, self.val_len as usize)
    }
}

/// Root descriptor, persisted as a 24-byte arena blob.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RootMeta {
    pub class: TreeClass,
    pub order: u16,
    pub depth: u16,
    pub root: u64,
    pub count: u64,
}

impl RootMeta {
    fn read(arena: &Arena, off: u64) -> Result<RootMeta> {
        let buf = arena.slice(off, META_SIZE)?;
        let class_id = LittleEndian::read_u32(&buf[0..4]);
        let class = TreeClass::from_id(class_id)
            .ok_or_else(|| VosError::Corrupt(format!("unknown tree class {}", class_id)))?;
        Ok(RootMeta {
            class,
            order: LittleEndian::read_u16(&buf[4..6]),
            depth: LittleEndian::read_u16(&buf[6..8]),
            root: LittleEndian::read_u64(&buf[8..16]),
            count: LittleEndian::read_u64(&buf[16..24]),
        })
    }

    fn write(&self, arena: &mut Arena, off: u64) -> Result<()> {
        let mut buf = [0u8; META_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.class.id());
        LittleEndian::write_u16(&mut buf[4..6], self.order);
        LittleEndian::write_u16(&mut buf[6..8], self.depth);
        LittleEndian::write_u64(&mut buf[8..16], self.root);
        LittleEndian::write_u64(&mut buf[16..24], self.count);
        arena.write(off, &buf)
    }
}

// =============================================================================
// Records
// =============================================================================

fn record_write(arena: &mut Arena, stored_key: &[u8], value: &[u8]) -> Result<u64> {
    let off = arena.alloc(8 + stored_key.len() + value.len())?;
    let mut header = [0u8; 8];
    LittleEndian::write_u32(&mut header[0..4], stored_key.len() as u32);
    LittleEndian::write_u32(&mut header[4..8], value.len() as u32);
    arena.write(off, &header)?;
    if !stored_key.is_empty() {
        arena.write(off + 8, stored_key)?;
    }
    arena.write(off + 8 + stored_key.len() as u64, value)?;
    Ok(off)
}

fn record_read(arena: &Arena, off: u64) -> Result<(Vec<u8>, u64, u32)> {
    let header = arena.slice(off, 8)?;
    let klen = LittleEndian::read_u32(&header[0..4]) as usize;
    let vlen = LittleEndian::read_u32(&header[4..8]);
    let key = arena.slice(off + 8, klen)?.to_vec();
    Ok((key, off + 8 + klen as u64, vlen))
}

// =============================================================================
// Cursor: a root-to-leaf trace
// =============================================================================

/// Search trace: `(node offset, index)` per level, leaf last. For internal
/// levels the index is the child taken; for the leaf it is the entry slot.
#[derive(Debug, Clone)]
pub(crate) struct Cursor {
    pub trace: Trace,
}

impl Cursor {
    fn leaf(&self) -> (u64, usize) {
        *self.trace.last().expect("cursor has a leaf level")
    }

    fn set_leaf_idx(&mut self, idx: usize) {
        self.trace.last_mut().expect("cursor has a leaf level").1 = idx;
    }
}

/// Descend towards the leftmost possible slot for `hkey`. The resulting
/// leaf index may equal `nkeys` (one past the last entry of that leaf).
fn descend_for(arena: &Arena, meta: &RootMeta, hkey: &HKey) -> Result<Cursor> {
    let mut trace = Trace::new();
    let mut off = meta.root;
    loop {
        let node = Node::read(arena, off)?;
        if node.is_leaf() {
            let idx = node.leaf_lower_bound(hkey);
            trace.push((off, idx));
            return Ok(Cursor { trace });
        }
        let idx = node.route(hkey);
        trace.push((off, idx));
        off = node.children[idx];
    }
}

/// Descend to the first (or last) entry of the tree.
pub(crate) fn descend_edge(arena: &Arena, meta: &RootMeta, last: bool) -> Result<Cursor> {
    let mut trace = Trace::new();
    let mut off = meta.root;
    loop {
        let node = Node::read(arena, off)?;
        if node.is_leaf() {
            let idx = if last { node.nkeys() - 1 } else { 0 };
            trace.push((off, idx));
            return Ok(Cursor { trace });
        }
        let idx = if last { node.nkeys() } else { 0 };
        trace.push((off, idx));
        off = node.children[idx];
    }
}

/// If the cursor points one past a leaf's entries, move it to the first
/// entry of the next leaf. Returns false when no entry follows.
pub(crate) fn normalize(arena: &Arena, cursor: &mut Cursor) -> Result<bool> {
    let (leaf_off, idx) = cursor.leaf();
    let leaf = Node::read(arena, leaf_off)?;
    if idx < leaf.nkeys() {
        return Ok(true);
    }
    ascend_next(arena, cursor)
}

/// Advance to the next entry. Returns false at the end of the tree.
pub(crate) fn step_next(arena: &Arena, cursor: &mut Cursor) -> Result<bool> {
    let (leaf_off, idx) = cursor.leaf();
    let leaf = Node::read(arena, leaf_off)?;
    if idx + 1 < leaf.nkeys() {
        cursor.set_leaf_idx(idx + 1);
        return Ok(true);
    }
    ascend_next(arena, cursor)
}

fn ascend_next(arena: &Arena, cursor: &mut Cursor) -> Result<bool> {
    cursor.trace.pop();
    while let Some(&(off, idx)) = cursor.trace.last() {
        let node = Node::read(arena, off)?;
        if idx + 1 < node.children.len() {
            cursor.trace.last_mut().unwrap().1 = idx + 1;
            let mut child = node.children[idx + 1];
            loop {
                let n = Node::read(arena, child)?;
                if n.is_leaf() {
                    cursor.trace.push((child, 0));
                    return Ok(true);
                }
                cursor.trace.push((child, 0));
                child = n.children[0];
            }
        }
        cursor.trace.pop();
    }
    Ok(false)
}

/// Step back to the previous entry. Returns false before the beginning.
pub(crate) fn step_prev(arena: &Arena, cursor: &mut Cursor) -> Result<bool> {
    let (_, idx) = cursor.leaf();
    if idx > 0 {
        cursor.set_leaf_idx(idx - 1);
        return Ok(true);
    }
    cursor.trace.pop();
    while let Some(&(off, idx)) = cursor.trace.last() {
        let node = Node::read(arena, off)?;
        if idx > 0 {
            cursor.trace.last_mut().unwrap().1 = idx - 1;
            let mut child = node.children[idx - 1];
            loop {
                let n = Node::read(arena, child)?;
                if n.is_leaf() {
                    cursor.trace.push((child, n.nkeys() - 1));
                    return Ok(true);
                }
                cursor.trace.push((child, n.nkeys()));
                child = n.children[n.nkeys()];
            }
        }
        cursor.trace.pop();
    }
    Ok(false)
}

/// Load the entry under the cursor.
pub(crate) fn entry_at(arena: &Arena, meta: &RootMeta, cursor: &Cursor) -> Result<Entry> {
    let (leaf_off, idx) = cursor.leaf();
    let leaf = Node::read(arena, leaf_off)?;
    let hkey = leaf.keys[idx];
    let rec_off = leaf.children[idx];
    let (stored_key, val_off, val_len) = record_read(arena, rec_off)?;
    let key = if meta.class.stores_full_key() {
        stored_key
    } else {
        derive_key(meta.class, &hkey)
    };
    Ok(Entry {
        hkey,
        key,
        rec_off,
        val_off,
        val_len,
    })
}

fn derive_key(class: TreeClass, hkey: &HKey) -> Vec<u8> {
    match class {
        TreeClass::Uint64 => hkey[8..].to_vec(),
        _ => hkey.to_vec(),
    }
}

/// Compare the entry under the cursor against a `(hkey, full key)` target.
/// Sets `collision` when hashed keys tie but full keys differ.
fn cmp_at(
    arena: &Arena,
    meta: &RootMeta,
    cursor: &Cursor,
    hkey: &HKey,
    full_key: &[u8],
    collision: &mut bool,
) -> Result<Ordering> {
    let (leaf_off, idx) = cursor.leaf();
    let leaf = Node::read(arena, leaf_off)?;
    match leaf.keys[idx].cmp(hkey) {
        Ordering::Equal if meta.class.stores_full_key() => {
            let (stored_key, _, _) = record_read(arena, leaf.children[idx])?;
            let ord = stored_key.as_slice().cmp(full_key);
            if ord != Ordering::Equal {
                *collision = true;
            }
            Ok(ord)
        }
        ord => Ok(ord),
    }
}

/// Position at the first entry `>=` (or `>` when `strict`) the target.
pub(crate) fn probe_raw_ge(
    arena: &Arena,
    meta: &RootMeta,
    hkey: &HKey,
    full_key: &[u8],
    strict: bool,
) -> Result<Option<Cursor>> {
    if meta.root == 0 {
        return Ok(None);
    }
    let mut cursor = descend_for(arena, meta, hkey)?;
    if !normalize(arena, &mut cursor)? {
        return Ok(None);
    }
    let mut collision = false;
    loop {
        let ord = cmp_at(arena, meta, &cursor, hkey, full_key, &mut collision)?;
        let past = if strict {
            ord == Ordering::Greater
        } else {
            ord != Ordering::Less
        };
        if past {
            return Ok(Some(cursor));
        }
        if !step_next(arena, &mut cursor)? {
            return Ok(None);
        }
    }
}

/// Position at the last entry `<=` (or `<` when `strict`) the target.
pub(crate) fn probe_raw_le(
    arena: &Arena,
    meta: &RootMeta,
    hkey: &HKey,
    full_key: &[u8],
    strict: bool,
) -> Result<Option<Cursor>> {
    match probe_raw_ge(arena, meta, hkey, full_key, !strict)? {
        None => {
            if meta.root == 0 {
                Ok(None)
            } else {
                Ok(Some(descend_edge(arena, meta, true)?))
            }
        }
        Some(mut cursor) => {
            if step_prev(arena, &mut cursor)? {
                Ok(Some(cursor))
            } else {
                Ok(None)
            }
        }
    }
}

/// Where an insert landed.
enum InsertPos {
    /// The exact key exists at the cursor
    Found(Cursor),
    /// The key is absent; insert at the cursor slot
    Absent {
        cursor: Cursor,
        /// A distinct key with the same hashed key was seen on the way
        collision: bool,
    },
}

fn probe_insert(
    arena: &Arena,
    meta: &RootMeta,
    hkey: &HKey,
    full_key: &[u8],
) -> Result<InsertPos> {
    let mut cursor = descend_for(arena, meta, hkey)?;
    let mut probe = cursor.clone();
    if !normalize(arena, &mut probe)? {
        // Past every entry: append at the end of the rightmost leaf.
        let mut end = descend_edge(arena, meta, true)?;
        let idx = end.leaf().1;
        end.set_leaf_idx(idx + 1);
        return Ok(InsertPos::Absent {
            cursor: end,
            collision: false,
        });
    }
    cursor = probe;
    let mut collision = false;
    loop {
        match cmp_at(arena, meta, &cursor, hkey, full_key, &mut collision)? {
            Ordering::Equal => return Ok(InsertPos::Found(cursor)),
            Ordering::Greater => return Ok(InsertPos::Absent { cursor, collision }),
            Ordering::Less => {
                if !step_next(arena, &mut cursor)? {
                    let mut end = descend_edge(arena, meta, true)?;
                    let idx = end.leaf().1;
                    end.set_leaf_idx(idx + 1);
                    return Ok(InsertPos::Absent {
                        cursor: end,
                        collision,
                    });
                }
            }
        }
    }
}

// =============================================================================
// Tree handle
// =============================================================================

/// Handle to a B-tree: the arena offset of its root descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Btree {
    /// Offset of the persistent root descriptor
    pub meta_off: u64,
}

impl Btree {
    /// Create an empty tree (inside a transaction) and return its handle.
    pub fn create(arena: &mut Arena, class: TreeClass, order: u16) -> Result<Btree> {
        if order < 4 {
            return Err(VosError::InvalArg(format!("tree order {} too small", order)));
        }
        arena.with_tx(|arena| {
            let meta_off = arena.alloc(META_SIZE)?;
            RootMeta {
                class,
                order,
                depth: 0,
                root: 0,
                count: 0,
            }
            .write(arena, meta_off)?;
            trace!(meta_off, ?class, order, "btree created");
            Ok(Btree { meta_off })
        })
    }

    /// Reopen a tree from its persisted descriptor offset.
    pub fn open(meta_off: u64) -> Btree {
        Btree { meta_off }
    }

    pub(crate) fn meta(&self, arena: &Arena) -> Result<RootMeta> {
        RootMeta::read(arena, self.meta_off)
    }

    /// Tree class.
    pub fn class(&self, arena: &Arena) -> Result<TreeClass> {
        Ok(self.meta(arena)?.class)
    }

    /// Number of live records.
    pub fn count(&self, arena: &Arena) -> Result<u64> {
        Ok(self.meta(arena)?.count)
    }

    /// True when the tree holds no records.
    pub fn is_empty(&self, arena: &Arena) -> Result<bool> {
        Ok(self.meta(arena)?.count == 0)
    }

    /// Point lookup / bounded search.
    pub fn fetch(&self, arena: &Arena, probe: Probe, key: &[u8]) -> Result<Option<Entry>> {
        let meta = self.meta(arena)?;
        if meta.root == 0 {
            return Ok(None);
        }
        let cursor = match probe {
            Probe::First => Some(descend_edge(arena, &meta, false)?),
            Probe::Last => Some(descend_edge(arena, &meta, true)?),
            Probe::Eq | Probe::Ge => {
                let hkey = meta.class.hkey(key)?;
                probe_raw_ge(arena, &meta, &hkey, key, false)?
            }
            Probe::Le => {
                let hkey = meta.class.hkey(key)?;
                probe_raw_le(arena, &meta, &hkey, key, false)?
            }
        };
        let cursor = match cursor {
            Some(c) => c,
            None => return Ok(None),
        };
        let entry = entry_at(arena, &meta, &cursor)?;
        if probe == Probe::Eq {
            let hkey = meta.class.hkey(key)?;
            let key_matches =
                entry.hkey == hkey && (!meta.class.stores_full_key() || entry.key == key);
            if !key_matches {
                return Ok(None);
            }
        }
        Ok(Some(entry))
    }

    /// Insert or overwrite a record. Returns the value offset.
    pub fn update(
        &self,
        arena: &mut Arena,
        key: &[u8],
        value: &[u8],
        cond: UpdateCond,
    ) -> Result<u64> {
        arena.with_tx(|arena| self.update_inner(arena, key, value, cond))
    }

    fn update_inner(
        &self,
        arena: &mut Arena,
        key: &[u8],
        value: &[u8],
        cond: UpdateCond,
    ) -> Result<u64> {
        let mut meta = self.meta(arena)?;
        let hkey = meta.class.hkey(key)?;
        let stored_key: &[u8] = if meta.class.stores_full_key() { key } else { &[] };

        if meta.root == 0 {
            if cond == UpdateCond::Replace {
                return Err(VosError::PrecondFail);
            }
            let rec_off = record_write(arena, stored_key, value)?;
            let mut leaf = Node::new(meta.order, meta.class.id(), 0, NODE_LEAF | NODE_ROOT);
            leaf.keys.push(hkey);
            leaf.children.push(rec_off);
            let leaf_off = leaf.alloc_and_write(arena)?;
            meta.root = leaf_off;
            meta.depth = 1;
            meta.count = 1;
            meta.write(arena, self.meta_off)?;
            let (_, val_off, _) = record_read(arena, rec_off)?;
            return Ok(val_off);
        }

        match probe_insert(arena, &meta, &hkey, key)? {
            InsertPos::Found(cursor) => {
                if cond == UpdateCond::Insert {
                    return Err(VosError::PrecondFail);
                }
                self.overwrite_at(arena, &meta, &cursor, stored_key, value)
            }
            InsertPos::Absent { cursor, collision } => {
                if cond == UpdateCond::Replace {
                    return Err(VosError::PrecondFail);
                }
                if collision && !meta.class.has_comparator() {
                    // No comparator registered for this class: colliding
                    // distinct keys are refused.
                    return Err(VosError::PrecondFail);
                }
                let rec_off = record_write(arena, stored_key, value)?;
                self.insert_at(arena, &mut meta, cursor, hkey, rec_off)?;
                let (_, val_off, _) = record_read(arena, rec_off)?;
                Ok(val_off)
            }
        }
    }

    fn overwrite_at(
        &self,
        arena: &mut Arena,
        meta: &RootMeta,
        cursor: &Cursor,
        stored_key: &[u8],
        value: &[u8],
    ) -> Result<u64> {
        let entry = entry_at(arena, meta, cursor)?;
        if entry.val_len as usize == value.len() {
            arena.write(entry.val_off, value)?;
            return Ok(entry.val_off);
        }
        let rec_off = record_write(arena, stored_key, value)?;
        let (leaf_off, idx) = cursor.leaf();
        let mut leaf = Node::read(arena, leaf_off)?;
        leaf.children[idx] = rec_off;
        leaf.write(arena, leaf_off)?;
        arena.free(entry.rec_off)?;
        let (_, val_off, _) = record_read(arena, rec_off)?;
        Ok(val_off)
    }

    fn insert_at(
        &self,
        arena: &mut Arena,
        meta: &mut RootMeta,
        mut cursor: Cursor,
        hkey: HKey,
        rec_off: u64,
    ) -> Result<()> {
        let (leaf_off, idx) = cursor.leaf();
        let mut leaf = Node::read(arena, leaf_off)?;
        leaf.keys.insert(idx, hkey);
        leaf.children.insert(idx, rec_off);
        if !leaf.overflows() {
            leaf.write(arena, leaf_off)?;
        } else {
            // Median split; splits propagate from leaf to root.
            let mid = leaf.nkeys() / 2;
            let mut right = Node::new(meta.order, meta.class.id(), 0, NODE_LEAF);
            right.keys = leaf.keys.split_off(mid);
            right.children = leaf.children.split_off(mid);
            leaf.flags &= !NODE_ROOT;
            let pivot = right.keys[0];
            let right_off = right.alloc_and_write(arena)?;
            leaf.write(arena, leaf_off)?;
            cursor.trace.pop();
            self.promote(arena, meta, cursor, pivot, leaf_off, right_off)?;
        }
        meta.count += 1;
        meta.write(arena, self.meta_off)
    }

    fn promote(
        &self,
        arena: &mut Arena,
        meta: &mut RootMeta,
        mut cursor: Cursor,
        pivot: HKey,
        left_off: u64,
        right_off: u64,
    ) -> Result<()> {
        let parent = cursor.trace.pop();
        match parent {
            None => {
                // Root split: a new root is allocated, depth grows by one.
                let mut root = Node::new(
                    meta.order,
                    meta.class.id(),
                    meta.depth,
                    NODE_ROOT,
                );
                root.keys.push(pivot);
                root.children.push(left_off);
                root.children.push(right_off);
                let root_off = root.alloc_and_write(arena)?;
                meta.root = root_off;
                meta.depth += 1;
                Ok(())
            }
            Some((off, idx)) => {
                let mut node = Node::read(arena, off)?;
                node.keys.insert(idx, pivot);
                node.children.insert(idx + 1, right_off);
                if !node.overflows() {
                    return node.write(arena, off);
                }
                // Internal split: the middle key moves up.
                let mid = node.nkeys() / 2;
                let up = node.keys[mid];
                let mut right = Node::new(meta.order, meta.class.id(), node.level, 0);
                right.keys = node.keys.split_off(mid + 1);
                right.children = node.children.split_off(mid + 1);
                node.keys.pop();
                node.flags &= !NODE_ROOT;
                let right_node_off = right.alloc_and_write(arena)?;
                node.write(arena, off)?;
                self.promote(arena, meta, cursor, up, off, right_node_off)
            }
        }
    }

    /// Delete a record. Returns whether a record was removed; with
    /// `must_exist`, a missing key is an error instead.
    pub fn delete(&self, arena: &mut Arena, key: &[u8], must_exist: bool) -> Result<bool> {
        arena.with_tx(|arena| {
            let mut meta = self.meta(arena)?;
            if meta.root == 0 {
                return if must_exist {
                    Err(VosError::NoKey)
                } else {
                    Ok(false)
                };
            }
            let hkey = meta.class.hkey(key)?;
            let cursor = match probe_raw_ge(arena, &meta, &hkey, key, false)? {
                Some(c) => c,
                None => {
                    return if must_exist {
                        Err(VosError::NoKey)
                    } else {
                        Ok(false)
                    }
                }
            };
            let entry = entry_at(arena, &meta, &cursor)?;
            let matches =
                entry.hkey == hkey && (!meta.class.stores_full_key() || entry.key == key);
            if !matches {
                return if must_exist {
                    Err(VosError::NoKey)
                } else {
                    Ok(false)
                };
            }
            self.delete_at(arena, &mut meta, cursor)?;
            Ok(true)
        })
    }

    pub(crate) fn delete_at(
        &self,
        arena: &mut Arena,
        meta: &mut RootMeta,
        mut cursor: Cursor,
    ) -> Result<()> {
        let (leaf_off, idx) = cursor.leaf();
        let mut leaf = Node::read(arena, leaf_off)?;
        arena.free(leaf.children[idx])?;
        leaf.keys.remove(idx);
        leaf.children.remove(idx);
        meta.count -= 1;

        if leaf.nkeys() > 0 {
            leaf.write(arena, leaf_off)?;
        } else if cursor.trace.len() == 1 {
            // Empty root leaf: the tree is empty again.
            arena.free(leaf_off)?;
            meta.root = 0;
            meta.depth = 0;
        } else {
            // Prune the empty leaf; rebalancing is lazy beyond this.
            arena.free(leaf_off)?;
            cursor.trace.pop();
            self.prune(arena, meta, cursor)?;
        }
        self.collapse_root(arena, meta)?;
        meta.write(arena, self.meta_off)
    }

    fn prune(&self, arena: &mut Arena, meta: &mut RootMeta, mut cursor: Cursor) -> Result<()> {
        let (off, idx) = match cursor.trace.pop() {
            Some(t) => t,
            None => return Ok(()),
        };
        let mut node = Node::read(arena, off)?;
        node.children.remove(idx);
        if node.nkeys() > 0 {
            node.keys.remove(if idx == 0 { 0 } else { idx - 1 });
        }
        if node.children.is_empty() {
            arena.free(off)?;
            if cursor.trace.is_empty() {
                meta.root = 0;
                meta.depth = 0;
                return Ok(());
            }
            return self.prune(arena, meta, cursor);
        }
        node.write(arena, off)
    }

    /// While the root is an internal node routing a single child, collapse
    /// a level.
    fn collapse_root(&self, arena: &mut Arena, meta: &mut RootMeta) -> Result<()> {
        loop {
            if meta.root == 0 || meta.depth <= 1 {
                return Ok(());
            }
            let root = Node::read(arena, meta.root)?;
            if root.is_leaf() || root.children.len() != 1 {
                return Ok(());
            }
            let child_off = root.children[0];
            arena.free(meta.root)?;
            let mut child = Node::read(arena, child_off)?;
            child.flags |= NODE_ROOT;
            child.write(arena, child_off)?;
            meta.root = child_off;
            meta.depth -= 1;
        }
    }

    /// Free every node and record transactionally.
    pub fn destroy(self, arena: &mut Arena) -> Result<()> {
        arena.with_tx(|arena| {
            let meta = self.meta(arena)?;
            if meta.root != 0 {
                destroy_subtree(arena, meta.root)?;
            }
            arena.free(self.meta_off)
        })
    }

    /// Current tree depth (0 = empty).
    pub fn depth(&self, arena: &Arena) -> Result<u16> {
        Ok(self.meta(arena)?.depth)
    }
}

fn destroy_subtree(arena: &mut Arena, off: u64) -> Result<()> {
    let node = Node::read(arena, off)?;
    if node.is_leaf() {
        for rec in &node.children {
            arena.free(*rec)?;
        }
    } else {
        for child in &node.children {
            destroy_subtree(arena, *child)?;
        }
    }
    arena.free(off)
}

// Keep the persistent node size honest: a default-order node must fit
// comfortably under a kilobyte.
const _: () = assert!(node_bytes(DEFAULT_ORDER) < 1024);
