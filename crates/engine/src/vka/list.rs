//! Anchored enumeration.
//!
//! Dkeys, akeys, and array extents enumerate in tree order: lexicographic
//! for byte-string keys, numeric for integer keys, hashed-key order for
//! hashed classes, and ascending start index for extents. Every call takes
//! a snapshot epoch, an optional anchor from the previous batch, and a
//! batch bound; it returns the next batch plus a new anchor, or `None`
//! when exhausted.

use crate::ilog::{ilog_entries, ilog_visibility, IlogEntry, KeyVis};
use crate::layout::{KeyMeta, ValueKind};
use crate::pool::{dtx_visible, PoolInner};
use crate::vka::{read_chain, visible_fragments, ExtentInfo};
use crate::ObjectHandle;
use vostok_btree::{Anchor, Btree, BtreeIter, Probe, TreeClass};
use vostok_core::{Epoch, KeyBuf, Result, VosError};

impl ObjectHandle {
    /// Enumerate dkeys present at `epoch`.
    pub fn list_dkeys(
        &self,
        epoch: Epoch,
        anchor: Option<&[u8]>,
        max: usize,
    ) -> Result<(Vec<KeyBuf>, Option<Vec<u8>>)> {
        let mut inner = self.cont.pool.lock();
        let chain = match read_chain(&mut inner, self.cont.id, self.oid, None, None, epoch) {
            Ok(c) => c,
            Err(VosError::NoKey) => return Ok((Vec::new(), None)),
            Err(e) => return Err(e),
        };
        let tree = Btree::open(chain.obj.meta.dkey_root);
        let out = list_keys(&mut inner, tree, epoch, anchor, max)?;
        inner.counters.lists += 1;
        Ok(out)
    }

    /// Enumerate akeys of `dkey` present at `epoch`.
    pub fn list_akeys(
        &self,
        dkey: &KeyBuf,
        epoch: Epoch,
        anchor: Option<&[u8]>,
        max: usize,
    ) -> Result<(Vec<KeyBuf>, Option<Vec<u8>>)> {
        let mut inner = self.cont.pool.lock();
        let chain = match read_chain(
            &mut inner,
            self.cont.id,
            self.oid,
            Some(&dkey.encode()),
            None,
            epoch,
        ) {
            Ok(c) => c,
            Err(VosError::NoKey) => return Ok((Vec::new(), None)),
            Err(e) => return Err(e),
        };
        let dctx = chain.dkey.as_ref().ok_or(VosError::NoKey)?;
        let tree = Btree::open(dctx.meta.subtree);
        let out = list_keys(&mut inner, tree, epoch, anchor, max)?;
        inner.counters.lists += 1;
        Ok(out)
    }

    /// Enumerate the visible extent fragments of an array akey at
    /// `epoch`, ascending by start index. The anchor is the last returned
    /// fragment's start.
    pub fn list_recx(
        &self,
        dkey: &KeyBuf,
        akey: &KeyBuf,
        epoch: Epoch,
        anchor: Option<u64>,
        max: usize,
    ) -> Result<(Vec<ExtentInfo>, Option<u64>)> {
        let mut inner = self.cont.pool.lock();
        let chain = match read_chain(
            &mut inner,
            self.cont.id,
            self.oid,
            Some(&dkey.encode()),
            Some(&akey.encode()),
            epoch,
        ) {
            Ok(c) => c,
            Err(VosError::NoKey) => return Ok((Vec::new(), None)),
            Err(e) => return Err(e),
        };
        let meta: KeyMeta = *chain.akey_meta()?;
        match meta.kind {
            ValueKind::Array => {}
            ValueKind::Unset => return Ok((Vec::new(), None)),
            ValueKind::Single => return Err(VosError::InvalKind),
        }

        let fragments =
            visible_fragments(&mut inner, Btree::open(meta.subtree), chain.floor, epoch)?;
        let mut out = Vec::new();
        for frag in fragments {
            if let Some(a) = anchor {
                if frag.start <= a {
                    continue;
                }
            }
            out.push(frag);
            if out.len() == max {
                break;
            }
        }
        let next = if out.len() == max {
            out.last().map(|f| f.start)
        } else {
            None
        };
        inner.counters.lists += 1;
        Ok((out, next))
    }
}

/// Shared key enumeration: batch the visible keys of one tree.
fn list_keys(
    inner: &mut PoolInner,
    tree: Btree,
    epoch: Epoch,
    anchor: Option<&[u8]>,
    max: usize,
) -> Result<(Vec<KeyBuf>, Option<Vec<u8>>)> {
    if max == 0 {
        return Err(VosError::InvalArg("list batch bound is zero".into()));
    }
    let class = tree.class(&inner.arena)?;

    // Collect candidates under the shared borrow; visibility (which may
    // resolve in-doubt transactions) runs after.
    let mut candidates: Vec<(Vec<u8>, Vec<IlogEntry>)> = Vec::new();
    {
        let mut iter = BtreeIter::prepare(tree, &inner.arena, false);
        let found = match anchor {
            None => iter.probe(Probe::First, None)?,
            Some(blob) => iter.probe_anchor(&Anchor::from_bytes(blob)?)?,
        };
        if found {
            loop {
                let entry = iter.fetch()?;
                let meta = KeyMeta::decode(entry.value(&inner.arena)?)?;
                candidates.push((entry.key, ilog_entries(&inner.arena, meta.ilog)?));
                if !iter.next()? {
                    break;
                }
            }
        }
    }

    let mut out = Vec::new();
    let mut next_anchor = None;
    for (key, marks) in candidates {
        let vis = ilog_visibility(&marks, epoch, &mut |seq| dtx_visible(inner, seq, epoch))?;
        if !matches!(vis, KeyVis::Visible(_)) {
            continue;
        }
        let keybuf = match class {
            TreeClass::Uint64 => KeyBuf::Uint(
                KeyBuf::decode_uint(&key)
                    .ok_or_else(|| VosError::Corrupt("malformed integer key".into()))?,
            ),
            _ => KeyBuf::Bytes(key.clone()),
        };
        out.push(keybuf);
        if out.len() == max {
            next_anchor = Some(anchor_for(class, &key)?);
            break;
        }
    }
    Ok((out, next_anchor))
}

/// Durable anchor for a key in a tree of the given class.
fn anchor_for(class: TreeClass, key: &[u8]) -> Result<Vec<u8>> {
    Ok(Anchor {
        hkey: class.hkey(key)?,
        key: if class.stores_full_key() {
            key.to_vec()
        } else {
            Vec::new()
        },
    }
    .to_bytes())
}
