//! Min/max queries.
//!
//! One call reports the largest (or smallest) dkey under an object, the
//! largest/smallest akey under that dkey, and the largest/smallest
//! committed index in that akey, per the flag mask. Tie-breaks follow
//! tree order: lexicographic for byte-string keys, numeric for integer
//! keys. Optionally the object's maximum committed epoch is reported.

use crate::ilog::{ilog_entries, ilog_punch_floor, ilog_visibility, IlogEntry, KeyVis};
use crate::layout::{KeyMeta, ValueKind};
use crate::object::KeyCtx;
use crate::pool::{dtx_visible, PoolInner};
use crate::vka::{read_chain, visible_fragments};
use crate::ObjectHandle;
use vostok_btree::{Btree, BtreeIter, Probe, TreeClass};
use vostok_core::{Epoch, KeyBuf, Result, VosError};

/// What [`ObjectHandle::query`] should report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlags {
    /// Report the smallest visible dkey
    pub dkey_min: bool,
    /// Report the largest visible dkey
    pub dkey_max: bool,
    /// Report the smallest visible akey under the chosen dkey
    pub akey_min: bool,
    /// Report the largest visible akey under the chosen dkey
    pub akey_max: bool,
    /// Report the smallest committed index in the chosen akey
    pub recx_min: bool,
    /// Report the largest committed index in the chosen akey
    pub recx_max: bool,
    /// Report the object's maximum committed epoch
    pub max_epoch: bool,
}

/// Query result; fields answer the corresponding flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjQuery {
    /// Chosen dkey
    pub dkey: Option<KeyBuf>,
    /// Chosen akey
    pub akey: Option<KeyBuf>,
    /// `(start, nr)` of the extreme committed fragment
    pub recx: Option<(u64, u64)>,
    /// Maximum committed epoch of the object
    pub max_epoch: Option<Epoch>,
}

impl ObjectHandle {
    /// Probe the extreme keys and index of this object at `epoch`.
    pub fn query(&self, flags: QueryFlags, epoch: Epoch) -> Result<ObjQuery> {
        if flags.dkey_min && flags.dkey_max {
            return Err(VosError::InvalArg("dkey min and max both requested".into()));
        }
        if flags.akey_min && flags.akey_max {
            return Err(VosError::InvalArg("akey min and max both requested".into()));
        }
        if flags.recx_min && flags.recx_max {
            return Err(VosError::InvalArg("recx min and max both requested".into()));
        }
        let want_akey = flags.akey_min || flags.akey_max;
        let want_recx = flags.recx_min || flags.recx_max;
        if want_akey && !(flags.dkey_min || flags.dkey_max) {
            return Err(VosError::InvalArg("akey query without dkey query".into()));
        }
        if want_recx && !want_akey {
            return Err(VosError::InvalArg("recx query without akey query".into()));
        }

        let mut inner = self.cont.pool.lock();
        let chain = read_chain(&mut inner, self.cont.id, self.oid, None, None, epoch)?;

        let mut out = ObjQuery::default();
        if flags.max_epoch {
            out.max_epoch = Some(chain.obj.meta.max_epoch);
        }

        if flags.dkey_min || flags.dkey_max {
            let dkey_tree = Btree::open(chain.obj.meta.dkey_root);
            let found = extreme_visible_key(&mut inner, dkey_tree, epoch, flags.dkey_max)?;
            let (dkey, dctx) = match found {
                None => {
                    inner.counters.queries += 1;
                    return Ok(out);
                }
                Some(f) => f,
            };
            out.dkey = Some(dkey);

            if want_akey {
                let akey_tree = Btree::open(dctx.meta.subtree);
                let found =
                    extreme_visible_key(&mut inner, akey_tree, epoch, flags.akey_max)?;
                let (akey, actx) = match found {
                    None => {
                        inner.counters.queries += 1;
                        return Ok(out);
                    }
                    Some(f) => f,
                };
                out.akey = Some(akey);

                if want_recx {
                    match actx.meta.kind {
                        ValueKind::Array => {}
                        ValueKind::Unset => {
                            inner.counters.queries += 1;
                            return Ok(out);
                        }
                        ValueKind::Single => return Err(VosError::InvalKind),
                    }
                    // The chain above resolved only the object level; the
                    // chosen dkey and akey contribute their own punch
                    // floors.
                    let mut floor = chain.floor;
                    for ilog in [dctx.meta.ilog, actx.meta.ilog] {
                        let marks = ilog_entries(&inner.arena, ilog)?;
                        let punch = ilog_punch_floor(&marks, epoch, &mut |seq| {
                            dtx_visible(&mut inner, seq, epoch)
                        })?;
                        if let Some(p) = punch {
                            if floor.map(|f| p > f).unwrap_or(true) {
                                floor = Some(p);
                            }
                        }
                    }
                    let fragments = visible_fragments(
                        &mut inner,
                        Btree::open(actx.meta.subtree),
                        floor,
                        epoch,
                    )?;
                    out.recx = if flags.recx_max {
                        fragments.last().map(|f| (f.start, f.nr))
                    } else {
                        fragments.first().map(|f| (f.start, f.nr))
                    };
                }
            }
        }

        inner.counters.queries += 1;
        Ok(out)
    }
}

/// The largest (or smallest) key of a tree that is visible at `epoch`.
fn extreme_visible_key(
    inner: &mut PoolInner,
    tree: Btree,
    epoch: Epoch,
    largest: bool,
) -> Result<Option<(KeyBuf, KeyCtx)>> {
    let class = tree.class(&inner.arena)?;

    // Walk from the extreme end until a visible key turns up.
    let mut candidates: Vec<(Vec<u8>, u64, KeyMeta, Vec<IlogEntry>)> = Vec::new();
    {
        let mut iter = BtreeIter::prepare(tree, &inner.arena, largest);
        let probe = if largest { Probe::Last } else { Probe::First };
        if iter.probe(probe, None)? {
            loop {
                let entry = iter.fetch()?;
                let meta = KeyMeta::decode(entry.value(&inner.arena)?)?;
                let marks = ilog_entries(&inner.arena, meta.ilog)?;
                candidates.push((entry.key, entry.val_off, meta, marks));
                if !iter.next()? {
                    break;
                }
            }
        }
    }

    for (key, val_off, meta, marks) in candidates {
        let vis = ilog_visibility(&marks, epoch, &mut |seq| dtx_visible(inner, seq, epoch))?;
        if !matches!(vis, KeyVis::Visible(_)) {
            continue;
        }
        let keybuf = match class {
            TreeClass::Uint64 => KeyBuf::Uint(
                KeyBuf::decode_uint(&key)
                    .ok_or_else(|| VosError::Corrupt("malformed integer key".into()))?,
            ),
            _ => KeyBuf::Bytes(key),
        };
        return Ok(Some((keybuf, KeyCtx { val_off, meta })));
    }
    Ok(None)
}
