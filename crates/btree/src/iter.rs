//! Tree iteration.
//!
//! Iterators walk a finite, forward or reverse sequence of entries. The
//! state machine is strict:
//!
//! ```text
//! INIT ──probe──▶ READY ⇌ READY (next) ──end──▶ FINI
//! ```
//!
//! Operations outside their legal states fail with `InvalState`. An
//! iterator borrows the arena immutably, so the tree cannot be mutated or
//! destroyed while one exists; a new iterator must be probed afresh after
//! any mutation.
//!
//! A durable anchor (a byte blob) can be taken from the current entry and
//! used later — including after reopening the pool — to resume at the
//! first entry strictly past the anchor in the iteration direction.

use crate::class::{HKey, HKEY_SIZE};
use crate::tree::{
    descend_edge, entry_at, probe_raw_ge, probe_raw_le, step_next, step_prev, Btree, Cursor,
    Entry, Probe,
};
use vostok_arena::Arena;
use vostok_core::{Result, VosError};

/// Iterator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    /// Prepared but not yet positioned
    Init,
    /// Positioned on an entry
    Ready,
    /// Exhausted (or probed past every entry)
    Fini,
}

/// Durable iteration anchor: the key material of the last-returned entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    /// Hashed key of the anchored entry
    pub hkey: HKey,
    /// Full key of the anchored entry (empty for derived-key classes)
    pub key: Vec<u8>,
}

impl Anchor {
    /// Serialize to a durable blob.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HKEY_SIZE + self.key.len());
        out.extend_from_slice(&self.hkey);
        out.extend_from_slice(&self.key);
        out
    }

    /// Rebuild from a durable blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Anchor> {
        if bytes.len() < HKEY_SIZE {
            return Err(VosError::InvalArg("anchor blob too short".into()));
        }
        let mut hkey = [0u8; HKEY_SIZE];
        hkey.copy_from_slice(&bytes[..HKEY_SIZE]);
        Ok(Anchor {
            hkey,
            key: bytes[HKEY_SIZE..].to_vec(),
        })
    }
}

/// A prepared tree iterator.
pub struct BtreeIter<'a> {
    arena: &'a Arena,
    tree: Btree,
    reverse: bool,
    state: IterState,
    cursor: Option<Cursor>,
}

impl<'a> BtreeIter<'a> {
    /// Prepare an iterator (state `Init`). `reverse` walks from largest to
    /// smallest.
    pub fn prepare(tree: Btree, arena: &'a Arena, reverse: bool) -> Self {
        BtreeIter {
            arena,
            tree,
            reverse,
            state: IterState::Init,
            cursor: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> IterState {
        self.state
    }

    /// Position the iterator. `key` is required for `Eq`/`Ge`/`Le` and
    /// ignored for `First`/`Last`. Returns whether an entry was found.
    pub fn probe(&mut self, probe: Probe, key: Option<&[u8]>) -> Result<bool> {
        if self.state == IterState::Fini {
            return Err(VosError::InvalState("iterator already finished".into()));
        }
        let meta = self.tree.meta(self.arena)?;
        let cursor = match probe {
            Probe::First | Probe::Last => {
                if meta.root == 0 {
                    None
                } else {
                    Some(descend_edge(self.arena, &meta, probe == Probe::Last)?)
                }
            }
            Probe::Eq | Probe::Ge => {
                let key = key.ok_or_else(|| VosError::InvalArg("probe requires a key".into()))?;
                let hkey = meta.class.hkey(key)?;
                let pos = probe_raw_ge(self.arena, &meta, &hkey, key, false)?;
                match (probe, pos) {
                    (Probe::Eq, Some(cursor)) => {
                        let entry = entry_at(self.arena, &meta, &cursor)?;
                        let matches = entry.hkey == hkey
                            && (!meta.class.stores_full_key() || entry.key == key);
                        if matches {
                            Some(cursor)
                        } else {
                            None
                        }
                    }
                    (_, pos) => pos,
                }
            }
            Probe::Le => {
                let key = key.ok_or_else(|| VosError::InvalArg("probe requires a key".into()))?;
                let hkey = meta.class.hkey(key)?;
                probe_raw_le(self.arena, &meta, &hkey, key, false)?
            }
        };
        match cursor {
            Some(c) => {
                self.cursor = Some(c);
                self.state = IterState::Ready;
                Ok(true)
            }
            None => {
                // A miss re-arms the iterator: a subsequent probe (e.g.
                // `ge` after a failed `eq`) continues from the next key.
                self.cursor = None;
                self.state = IterState::Init;
                Ok(false)
            }
        }
    }

    /// Resume strictly past an anchor, in the iteration direction.
    pub fn probe_anchor(&mut self, anchor: &Anchor) -> Result<bool> {
        if self.state == IterState::Fini {
            return Err(VosError::InvalState("iterator already finished".into()));
        }
        let meta = self.tree.meta(self.arena)?;
        let cursor = if self.reverse {
            probe_raw_le(self.arena, &meta, &anchor.hkey, &anchor.key, true)?
        } else {
            probe_raw_ge(self.arena, &meta, &anchor.hkey, &anchor.key, true)?
        };
        match cursor {
            Some(c) => {
                self.cursor = Some(c);
                self.state = IterState::Ready;
                Ok(true)
            }
            None => {
                self.cursor = None;
                self.state = IterState::Fini;
                Ok(false)
            }
        }
    }

    /// Advance to the next entry in the iteration direction.
    pub fn next(&mut self) -> Result<bool> {
        if self.state != IterState::Ready {
            return Err(VosError::InvalState(format!(
                "next in {:?} state",
                self.state
            )));
        }
        let cursor = self.cursor.as_mut().expect("ready iterator has a cursor");
        let moved = if self.reverse {
            step_prev(self.arena, cursor)?
        } else {
            step_next(self.arena, cursor)?
        };
        if !moved {
            self.cursor = None;
            self.state = IterState::Fini;
        }
        Ok(moved)
    }

    /// Load the entry under the iterator.
    pub fn fetch(&self) -> Result<Entry> {
        if self.state != IterState::Ready {
            return Err(VosError::InvalState(format!(
                "fetch in {:?} state",
                self.state
            )));
        }
        let meta = self.tree.meta(self.arena)?;
        entry_at(
            self.arena,
            &meta,
            self.cursor.as_ref().expect("ready iterator has a cursor"),
        )
    }

    /// Take a durable anchor for the current entry.
    pub fn anchor(&self) -> Result<Anchor> {
        let entry = self.fetch()?;
        let meta = self.tree.meta(self.arena)?;
        Ok(Anchor {
            hkey: entry.hkey,
            key: if meta.class.stores_full_key() {
                entry.key
            } else {
                Vec::new()
            },
        })
    }

    /// Terminate the iteration.
    pub fn finish(mut self) {
        self.state = IterState::Fini;
        self.cursor = None;
    }
}
