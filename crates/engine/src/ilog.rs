//! Incarnation logs.
//!
//! Every object, dkey, and akey carries an incarnation log: a small
//! epoch-sorted list of create and punch marks. The log answers two
//! questions for a reader at epoch E:
//!
//! - is the key visible at E (newest entry at or below E is a create)?
//! - what is the punch floor at E (highest punch at or below E)? Records
//!   at or below the floor are shadowed.
//!
//! The log lives in the arena as a growable blob:
//!
//! ```text
//! cap (u32) | count (u32) | entries: count × (epoch u64 | dtx u64 | op u32 | pad u32)
//! ```
//!
//! Appending into a full log reallocates the blob; the caller patches the
//! holder's descriptor with the returned offset.

use byteorder::{ByteOrder, LittleEndian};
use vostok_arena::Arena;
use vostok_core::{Epoch, Result, VosError};

/// Ilog op: the key was created (first write at this epoch).
pub const ILOG_CREATE: u32 = 1;
/// Ilog op: the key was punched at this epoch.
pub const ILOG_PUNCH: u32 = 2;

const ILOG_HDR: usize = 8;
const ENTRY_SIZE: usize = 24;
const INITIAL_CAP: u32 = 4;

/// One incarnation-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IlogEntry {
    /// Epoch of the mark
    pub epoch: Epoch,
    /// Owning DTX sequence (0 = committed outright)
    pub dtx: u64,
    /// `ILOG_CREATE` or `ILOG_PUNCH`
    pub op: u32,
}

/// Visibility of a key at some epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyVis {
    /// No mark at or below the epoch: the key does not exist yet
    Absent,
    /// Visible since the contained create epoch
    Visible(Epoch),
    /// Punched at the contained epoch
    Punched(Epoch),
}

/// Allocate an empty log (inside a transaction).
pub fn ilog_new(arena: &mut Arena) -> Result<u64> {
    let off = arena.alloc(ILOG_HDR + INITIAL_CAP as usize * ENTRY_SIZE)?;
    let mut hdr = [0u8; ILOG_HDR];
    LittleEndian::write_u32(&mut hdr[0..4], INITIAL_CAP);
    LittleEndian::write_u32(&mut hdr[4..8], 0);
    arena.write(off, &hdr)?;
    Ok(off)
}

/// Read all entries, epoch-ascending.
pub fn ilog_entries(arena: &Arena, off: u64) -> Result<Vec<IlogEntry>> {
    let hdr = arena.slice(off, ILOG_HDR)?;
    let cap = LittleEndian::read_u32(&hdr[0..4]) as usize;
    let count = LittleEndian::read_u32(&hdr[4..8]) as usize;
    if count > cap {
        return Err(VosError::Corrupt("ilog count exceeds capacity".into()));
    }
    let body = arena.slice(off + ILOG_HDR as u64, count * ENTRY_SIZE)?;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let e = &body[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE];
        out.push(IlogEntry {
            epoch: Epoch(LittleEndian::read_u64(&e[0..8])),
            dtx: LittleEndian::read_u64(&e[8..16]),
            op: LittleEndian::read_u32(&e[16..20]),
        });
    }
    Ok(out)
}

fn write_all(arena: &mut Arena, off: u64, cap: u32, entries: &[IlogEntry]) -> Result<()> {
    let mut buf = vec![0u8; ILOG_HDR + entries.len() * ENTRY_SIZE];
    LittleEndian::write_u32(&mut buf[0..4], cap);
    LittleEndian::write_u32(&mut buf[4..8], entries.len() as u32);
    for (i, e) in entries.iter().enumerate() {
        let b = &mut buf[ILOG_HDR + i * ENTRY_SIZE..ILOG_HDR + (i + 1) * ENTRY_SIZE];
        LittleEndian::write_u64(&mut b[0..8], e.epoch.0);
        LittleEndian::write_u64(&mut b[8..16], e.dtx);
        LittleEndian::write_u32(&mut b[16..20], e.op);
    }
    arena.write(off, &buf)
}

/// Append a mark (inside a transaction), keeping epoch order.
///
/// Same-epoch rules: a create over an existing create is a no-op (several
/// akeys updated at one epoch share their dkey's create); any other
/// same-epoch combination is a conflicting overlap.
///
/// Returns the (possibly moved) blob offset and whether a mark was
/// actually inserted; the caller patches its holder when the blob moved.
pub fn ilog_append(arena: &mut Arena, off: u64, entry: IlogEntry) -> Result<(u64, bool)> {
    let mut entries = ilog_entries(arena, off)?;
    let pos = entries.partition_point(|e| e.epoch < entry.epoch);
    if let Some(existing) = entries.get(pos) {
        if existing.epoch == entry.epoch {
            if existing.op == ILOG_CREATE && entry.op == ILOG_CREATE {
                return Ok((off, false));
            }
            return Err(VosError::Conflict);
        }
    }
    entries.insert(pos, entry);

    let cap = LittleEndian::read_u32(arena.slice(off, 4)?);
    if entries.len() <= cap as usize {
        write_all(arena, off, cap, &entries)?;
        return Ok((off, true));
    }
    // Grow: move the log to a doubled blob.
    let new_cap = cap * 2;
    let new_off = arena.alloc(ILOG_HDR + new_cap as usize * ENTRY_SIZE)?;
    write_all(arena, new_off, new_cap, &entries)?;
    arena.free(off)?;
    Ok((new_off, true))
}

/// Clear the DTX tag of the mark at `epoch` (inside a transaction); part
/// of committing the owning transaction.
pub fn ilog_clear_dtx(arena: &mut Arena, off: u64, epoch: Epoch) -> Result<()> {
    let mut entries = ilog_entries(arena, off)?;
    let mut changed = false;
    for e in entries.iter_mut() {
        if e.epoch == epoch && e.dtx != 0 {
            e.dtx = 0;
            changed = true;
        }
    }
    if changed {
        let cap = LittleEndian::read_u32(arena.slice(off, 4)?);
        write_all(arena, off, cap, &entries)?;
    }
    Ok(())
}

/// Remove the mark at `epoch` (inside a transaction). Returns whether an
/// entry was removed.
pub fn ilog_remove(arena: &mut Arena, off: u64, epoch: Epoch) -> Result<bool> {
    let mut entries = ilog_entries(arena, off)?;
    let before = entries.len();
    entries.retain(|e| e.epoch != epoch);
    if entries.len() == before {
        return Ok(false);
    }
    let cap = LittleEndian::read_u32(arena.slice(off, 4)?);
    write_all(arena, off, cap, &entries)?;
    Ok(true)
}

/// Resolve visibility at `at`. `dtx_visible` decides whether a mark's
/// owning transaction counts as committed for this reader.
pub fn ilog_visibility(
    entries: &[IlogEntry],
    at: Epoch,
    dtx_visible: &mut dyn FnMut(u64) -> Result<bool>,
) -> Result<KeyVis> {
    for e in entries.iter().rev() {
        if e.epoch > at {
            continue;
        }
        if !dtx_visible(e.dtx)? {
            continue;
        }
        return Ok(match e.op {
            ILOG_PUNCH => KeyVis::Punched(e.epoch),
            _ => KeyVis::Visible(e.epoch),
        });
    }
    Ok(KeyVis::Absent)
}

/// Highest punch at or below `at`: the shadow floor for value records.
pub fn ilog_punch_floor(
    entries: &[IlogEntry],
    at: Epoch,
    dtx_visible: &mut dyn FnMut(u64) -> Result<bool>,
) -> Result<Option<Epoch>> {
    for e in entries.iter().rev() {
        if e.epoch > at || e.op != ILOG_PUNCH {
            continue;
        }
        if !dtx_visible(e.dtx)? {
            continue;
        }
        return Ok(Some(e.epoch));
    }
    Ok(None)
}
