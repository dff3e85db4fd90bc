//! Distributed-transaction registry.
//!
//! A multi-step mutation opens a DTX entry identified by
//! `(leader epoch, sequence)`. Record writes made under the DTX carry its
//! sequence; readers only see them once the DTX commits, which clears the
//! sequence on every touched record inside one arena transaction. An
//! unknown nonzero sequence on a record therefore means the owning DTX
//! aborted or never committed (including across a crash) and the record is
//! invisible until a discard pass reclaims it.
//!
//! Readers that encounter a pending DTX whose leader epoch is at or below
//! their snapshot cannot proceed with an ambiguous answer: the registry
//! consults the externally supplied resolution callback, or fails with
//! `Timeout` when none is registered. Entries older than the configured
//! horizon are force-resolved the same way.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vostok_core::{DtxId, Epoch, Result, VosError};

/// Lifecycle of a DTX entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtxState {
    /// Open; its writes are invisible
    Pending,
    /// Committed at the contained epoch
    Committed(Epoch),
    /// Aborted; its writes await discard
    Aborted,
}

/// Externally supplied resolution decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtxVerdict {
    /// Treat the transaction as committed
    Commit,
    /// Treat the transaction as aborted
    Abort,
}

/// Resolution callback; consulted for in-doubt transactions.
pub type DtxResolver = Box<dyn Fn(DtxId) -> DtxVerdict + Send + Sync>;

/// What a reader should do about a record owned by a DTX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtxCheck {
    /// The record is visible
    Visible,
    /// The record is invisible at this epoch
    Invisible,
    /// The resolver decided commit: the caller must finalize the commit
    /// before trusting the record
    ResolveCommit(DtxId),
    /// The resolver decided abort: the caller must abort the entry
    ResolveAbort(DtxId),
}

#[derive(Debug)]
struct DtxEntry<T> {
    id: DtxId,
    state: DtxState,
    /// References to the dtx tag of every touched record. The caller
    /// chooses the reference representation; plain arena offsets suffice
    /// for records whose location is stable until commit.
    touched: Vec<T>,
    opened_at: Instant,
}

/// Per-pool DTX table, generic over the touched-record reference type.
pub struct DtxRegistry<T = u64> {
    entries: HashMap<u64, DtxEntry<T>>,
    next_seq: u64,
    resolver: Option<DtxResolver>,
    horizon: Duration,
    /// Leader epochs of aborted transactions, drained by the discard pass
    discard_epochs: Vec<Epoch>,
}

impl<T: Clone> DtxRegistry<T> {
    /// Create a registry with the given force-resolution horizon.
    pub fn new(horizon: Duration) -> Self {
        DtxRegistry {
            entries: HashMap::new(),
            next_seq: 1,
            resolver: None,
            horizon,
            discard_epochs: Vec::new(),
        }
    }

    /// Install the resolution callback.
    pub fn set_resolver(&mut self, resolver: DtxResolver) {
        self.resolver = Some(resolver);
    }

    /// Open a DTX led at `leader_epoch`.
    pub fn open(&mut self, leader_epoch: Epoch) -> DtxId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = DtxId { leader_epoch, seq };
        self.entries.insert(
            seq,
            DtxEntry {
                id,
                state: DtxState::Pending,
                touched: Vec::new(),
                opened_at: Instant::now(),
            },
        );
        debug!(%id, "dtx opened");
        id
    }

    /// Record that the DTX wrote a record reachable through `touch`.
    pub fn touch(&mut self, id: DtxId, touch: T) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id.seq)
            .ok_or(VosError::NoHandle)?;
        match entry.state {
            DtxState::Pending => {
                entry.touched.push(touch);
                Ok(())
            }
            DtxState::Aborted => Err(VosError::Canceled),
            DtxState::Committed(_) => {
                Err(VosError::InvalState("write under committed dtx".into()))
            }
        }
    }

    /// Start committing: returns the touched references the caller must
    /// clear inside its transaction. The entry stays pending until
    /// [`DtxRegistry::finish_commit`].
    pub fn begin_commit(&mut self, id: DtxId) -> Result<Vec<T>> {
        let entry = self.entries.get(&id.seq).ok_or(VosError::NoHandle)?;
        match entry.state {
            DtxState::Pending => Ok(entry.touched.clone()),
            DtxState::Aborted => Err(VosError::Canceled),
            DtxState::Committed(_) => {
                Err(VosError::InvalState("dtx already committed".into()))
            }
        }
    }

    /// Finalize a commit after the touched records were cleared durably.
    ///
    /// The entry stays in the table as `Committed`: readers holding stale
    /// copies of record headers must keep resolving this sequence as
    /// visible until they observe the cleared tags.
    pub fn finish_commit(&mut self, id: DtxId, commit_epoch: Epoch) -> Result<()> {
        let entry = self.entries.get_mut(&id.seq).ok_or(VosError::NoHandle)?;
        entry.state = DtxState::Committed(commit_epoch);
        entry.touched.clear();
        debug!(%id, %commit_epoch, "dtx committed");
        Ok(())
    }

    /// Abort a DTX: its writes become permanently invisible and its epoch
    /// joins the discard set. The entry stays in the table as `Aborted`
    /// until the discard pass reclaims the records.
    pub fn abort(&mut self, id: DtxId) -> Result<Epoch> {
        let entry = self.entries.get_mut(&id.seq).ok_or(VosError::NoHandle)?;
        if let DtxState::Committed(_) = entry.state {
            return Err(VosError::InvalState("dtx already committed".into()));
        }
        if !matches!(entry.state, DtxState::Aborted) {
            entry.state = DtxState::Aborted;
            entry.touched.clear();
            debug!(%id, "dtx aborted");
            self.discard_epochs.push(entry.id.leader_epoch);
        }
        Ok(id.leader_epoch)
    }

    /// Decide what a reader at `at` should do about a record carrying
    /// `seq`. Zero means the record was never under a DTX.
    pub fn check(&self, seq: u64, at: Epoch) -> Result<DtxCheck> {
        if seq == 0 {
            return Ok(DtxCheck::Visible);
        }
        match self.entries.get(&seq) {
            // Unknown sequence: aborted, or orphaned by a crash. Either
            // way the write never committed.
            None => Ok(DtxCheck::Invisible),
            Some(entry) => match entry.state {
                DtxState::Committed(ce) => {
                    if ce <= at {
                        Ok(DtxCheck::Visible)
                    } else {
                        Ok(DtxCheck::Invisible)
                    }
                }
                DtxState::Aborted => Ok(DtxCheck::Invisible),
                DtxState::Pending => {
                    if entry.id.leader_epoch > at {
                        // The transaction cannot affect this snapshot.
                        return Ok(DtxCheck::Invisible);
                    }
                    match &self.resolver {
                        None => Err(VosError::Timeout),
                        Some(resolve) => match resolve(entry.id) {
                            DtxVerdict::Commit => Ok(DtxCheck::ResolveCommit(entry.id)),
                            DtxVerdict::Abort => Ok(DtxCheck::ResolveAbort(entry.id)),
                        },
                    }
                }
            },
        }
    }

    /// Pending transactions older than the horizon, due for forced
    /// resolution.
    pub fn expired(&self) -> Vec<DtxId> {
        let now = Instant::now();
        let mut out: Vec<DtxId> = self
            .entries
            .values()
            .filter(|e| {
                matches!(e.state, DtxState::Pending)
                    && now.duration_since(e.opened_at) >= self.horizon
            })
            .map(|e| e.id)
            .collect();
        out.sort_by_key(|id| id.seq);
        if !out.is_empty() {
            warn!(count = out.len(), "dtx entries past horizon");
        }
        out
    }

    /// True when any pending DTX's leader epoch falls inside `[lo, hi]`.
    /// Aggregation and discard refuse to run over such a window.
    pub fn has_pending_in(&self, lo: Epoch, hi: Epoch) -> bool {
        self.entries.values().any(|e| {
            matches!(e.state, DtxState::Pending)
                && e.id.leader_epoch >= lo
                && e.id.leader_epoch <= hi
        })
    }

    /// Drain the epochs of aborted transactions for the next discard
    /// pass, dropping their table entries: the pass removes the records
    /// physically, and an unknown sequence already reads as invisible.
    pub fn take_discard_epochs(&mut self) -> Vec<Epoch> {
        self.entries
            .retain(|_, e| !matches!(e.state, DtxState::Aborted));
        std::mem::take(&mut self.discard_epochs)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no DTX is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DtxRegistry {
        DtxRegistry::new(Duration::from_secs(3600))
    }

    #[test]
    fn open_touch_commit_clears_entry() {
        let mut reg = registry();
        let id = reg.open(Epoch(100));
        reg.touch(id, 4096).unwrap();
        reg.touch(id, 8192).unwrap();

        let touched = reg.begin_commit(id).unwrap();
        assert_eq!(touched, vec![4096, 8192]);
        reg.finish_commit(id, Epoch(100)).unwrap();

        // The committed entry keeps resolving stale tags as visible.
        assert_eq!(reg.check(id.seq, Epoch(100)).unwrap(), DtxCheck::Visible);
        assert_eq!(reg.check(id.seq, Epoch(99)).unwrap(), DtxCheck::Invisible);

        // Cleared records carry seq 0 and are plainly visible.
        assert_eq!(reg.check(0, Epoch(1)).unwrap(), DtxCheck::Visible);
    }

    #[test]
    fn unknown_sequence_is_invisible() {
        let reg = registry();
        assert_eq!(reg.check(42, Epoch(u64::MAX)).unwrap(), DtxCheck::Invisible);
    }

    #[test]
    fn abort_feeds_the_discard_set() {
        let mut reg = registry();
        let id = reg.open(Epoch(7));
        reg.touch(id, 128).unwrap();
        let epoch = reg.abort(id).unwrap();
        assert_eq!(epoch, Epoch(7));

        // Writes under the aborted dtx surface as canceled, reads as
        // invisible.
        assert!(matches!(reg.touch(id, 256), Err(VosError::Canceled)));
        assert_eq!(reg.check(id.seq, Epoch(100)).unwrap(), DtxCheck::Invisible);

        // The discard feed drains once and purges the entry.
        assert_eq!(reg.take_discard_epochs(), vec![Epoch(7)]);
        assert!(reg.take_discard_epochs().is_empty());
        assert!(reg.is_empty());
        assert!(matches!(reg.touch(id, 512), Err(VosError::NoHandle)));
    }

    #[test]
    fn pending_below_snapshot_needs_resolution() {
        let mut reg = registry();
        let id = reg.open(Epoch(50));

        // Pending above the read epoch cannot affect the snapshot.
        assert_eq!(reg.check(id.seq, Epoch(10)).unwrap(), DtxCheck::Invisible);

        // At or below: without a resolver the reader cannot proceed.
        assert!(matches!(reg.check(id.seq, Epoch(50)), Err(VosError::Timeout)));

        reg.set_resolver(Box::new(|_| DtxVerdict::Commit));
        assert_eq!(
            reg.check(id.seq, Epoch(50)).unwrap(),
            DtxCheck::ResolveCommit(id)
        );

        reg.set_resolver(Box::new(|_| DtxVerdict::Abort));
        assert_eq!(
            reg.check(id.seq, Epoch(99)).unwrap(),
            DtxCheck::ResolveAbort(id)
        );
    }

    #[test]
    fn horizon_flags_expired_entries() {
        let mut reg: DtxRegistry = DtxRegistry::new(Duration::from_millis(0));
        let a = reg.open(Epoch(1));
        let b = reg.open(Epoch(2));
        let expired = reg.expired();
        assert_eq!(expired, vec![a, b]);
    }

    #[test]
    fn pending_window_exclusion() {
        let mut reg = registry();
        let _ = reg.open(Epoch(500));
        assert!(reg.has_pending_in(Epoch(400), Epoch(600)));
        assert!(!reg.has_pending_in(Epoch(501), Epoch(600)));
        assert!(!reg.has_pending_in(Epoch(1), Epoch(499)));
    }

    #[test]
    fn commit_then_abort_is_rejected() {
        let mut reg = registry();
        let id = reg.open(Epoch(10));
        reg.begin_commit(id).unwrap();
        reg.finish_commit(id, Epoch(10)).unwrap();
        assert!(matches!(reg.abort(id), Err(VosError::InvalState(_))));
    }
}
