//! Log Store
//!
//! A view of the replicated log combining the persisted part (behind
//! [`Storage`]) with entries and a snapshot that were accepted, but
//! not yet persisted by the driving loop.
//!
//! ```text
//!  snapshot/first.....applied....committed....stabled.....last
//!  ---------|------------------------------------------------|
//!                            log entries
//! ```
use std::cmp;

use convi::ExpectFrom;
use raftkv_api::{Entry, Snapshot, TermId};
use tracing::{debug, trace};

use crate::storage::{Storage, StorageError, StorageResult};

pub struct RaftLog<S> {
    storage: S,

    /// Entries not yet persisted; the first one is at `stabled + 1`
    unstable: Vec<Entry>,

    /// Incoming snapshot not yet persisted
    pending_snapshot: Option<Snapshot>,

    /// Highest index known to be replicated on a quorum
    committed: u64,

    /// Highest index handed to the application
    applied: u64,

    /// Highest index persisted in `storage`
    stabled: u64,
}

impl<S: Storage> RaftLog<S> {
    pub fn new(storage: S) -> StorageResult<Self> {
        let first_index = storage.first_index()?;
        let last_index = storage.last_index()?;

        Ok(Self {
            storage,
            unstable: vec![],
            pending_snapshot: None,
            committed: first_index - 1,
            applied: first_index - 1,
            stabled: last_index,
        })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn stabled(&self) -> u64 {
        self.stabled
    }

    pub fn first_index(&self) -> StorageResult<u64> {
        match &self.pending_snapshot {
            Some(snapshot) => Ok(snapshot.metadata.index + 1),
            None => self.storage.first_index(),
        }
    }

    pub fn last_index(&self) -> u64 {
        self.stabled + u64::expect_from(self.unstable.len())
    }

    pub fn last_term(&self) -> StorageResult<TermId> {
        self.term(self.last_index())
    }

    fn unstable_pos(&self, index: u64) -> usize {
        debug_assert!(self.stabled < index);
        usize::expect_from(index - self.stabled - 1)
    }

    pub fn term(&self, index: u64) -> StorageResult<TermId> {
        if self.last_index() < index {
            return Err(StorageError::Unavailable);
        }
        if self.stabled < index {
            return Ok(self.unstable[self.unstable_pos(index)].term);
        }
        if let Some(snapshot) = &self.pending_snapshot {
            let meta = &snapshot.metadata;
            if index == meta.index {
                return Ok(meta.term);
            }
            if index < meta.index {
                return Err(StorageError::Compacted);
            }
        }
        self.storage.term(index)
    }

    /// Does the entry at `index` exist and has term `term`
    pub fn match_term(&self, index: u64, term: TermId) -> bool {
        self.term(index).map(|t| t == term).unwrap_or(false)
    }

    /// Is a log ending at (`last_index`, `last_term`) at least as
    /// up-to-date as this one
    pub fn is_up_to_date(&self, last_index: u64, last_term: TermId) -> StorageResult<bool> {
        let our_term = self.last_term()?;
        Ok(our_term < last_term || (last_term == our_term && self.last_index() <= last_index))
    }

    /// Entries in range `[lo, hi)`
    pub fn entries(&self, lo: u64, hi: u64) -> StorageResult<Vec<Entry>> {
        if hi <= lo {
            return Ok(vec![]);
        }
        if lo < self.first_index()? {
            return Err(StorageError::Compacted);
        }
        if self.last_index() + 1 < hi {
            return Err(StorageError::Unavailable);
        }

        let mut entries = if lo <= self.stabled {
            self.storage.entries(lo, cmp::min(hi, self.stabled + 1))?
        } else {
            vec![]
        };

        if self.stabled + 1 < hi {
            let start = cmp::max(lo, self.stabled + 1);
            entries.extend_from_slice(
                &self.unstable[self.unstable_pos(start)..=self.unstable_pos(hi - 1)],
            );
        }
        Ok(entries)
    }

    /// All the entries starting at `lo`
    pub fn entries_from(&self, lo: u64) -> StorageResult<Vec<Entry>> {
        self.entries(lo, self.last_index() + 1)
    }

    pub fn unstable_entries(&self) -> &[Entry] {
        &self.unstable
    }

    pub fn pending_snapshot(&self) -> Option<&Snapshot> {
        self.pending_snapshot.as_ref()
    }

    /// Committed entries that weren't handed to the application yet
    pub fn next_entries(&self) -> StorageResult<Vec<Entry>> {
        let lo = cmp::max(self.applied + 1, self.first_index()?);
        self.entries(lo, self.committed + 1)
    }

    pub fn has_next_entries(&self) -> bool {
        self.applied < self.committed
    }

    /// Append entries, truncating any (uncommitted) entries they replace
    ///
    /// Returns the new last index.
    pub fn append(&mut self, entries: &[Entry]) -> u64 {
        let Some(first) = entries.first() else {
            return self.last_index();
        };
        let after = first.index - 1;
        if after < self.committed {
            panic!(
                "after {after} is out of range [committed {}]",
                self.committed
            );
        }

        if after == self.last_index() {
            self.unstable.extend_from_slice(entries);
        } else if after < self.stabled {
            debug!(
                stabled = self.stabled,
                index = first.index,
                "Truncating persisted entries"
            );
            self.stabled = after;
            self.unstable = entries.to_vec();
        } else {
            debug!(
                last_index = self.last_index(),
                index = first.index,
                "Truncating unstable entries"
            );
            let pos = usize::expect_from(after - self.stabled);
            self.unstable.truncate(pos);
            self.unstable.extend_from_slice(entries);
        }
        trace!(last_index = self.last_index(), "Appended entries");
        self.last_index()
    }

    /// Index of the first entry that doesn't match the log
    ///
    /// Returns 0 when all the entries are already in the log.
    pub fn find_conflict(&self, entries: &[Entry]) -> u64 {
        for entry in entries {
            if !self.match_term(entry.index, entry.term) {
                if entry.index <= self.last_index() {
                    debug!(
                        index = entry.index,
                        term = %entry.term,
                        existing_term = ?self.term(entry.index).ok(),
                        "Found conflicting entry"
                    );
                }
                return entry.index;
            }
        }
        0
    }

    /// Accept entries sent by the leader following (`index`, `log_term`)
    ///
    /// Returns the index of the last new entry, or `None` if the log
    /// doesn't contain the preceding entry.
    pub fn maybe_append(
        &mut self,
        index: u64,
        log_term: TermId,
        committed: u64,
        entries: &[Entry],
    ) -> Option<u64> {
        if !self.match_term(index, log_term) {
            return None;
        }

        let last_new_index = index + u64::expect_from(entries.len());
        let conflict = self.find_conflict(entries);
        if conflict != 0 {
            if conflict <= self.committed {
                panic!(
                    "entry {conflict} conflicts with committed entry [committed {}]",
                    self.committed
                );
            }
            let pos = usize::expect_from(conflict - (index + 1));
            self.append(&entries[pos..]);
        }
        self.commit_to(cmp::min(committed, last_new_index));
        Some(last_new_index)
    }

    pub fn commit_to(&mut self, to_commit: u64) {
        if self.committed < to_commit {
            if self.last_index() < to_commit {
                panic!(
                    "to_commit {to_commit} is out of range [last_index {}]",
                    self.last_index()
                );
            }
            self.committed = to_commit;
            trace!(committed = to_commit, "Committed");
        }
    }

    /// Advance the commit index to `max_index`, if the entry there is of `term`
    pub fn maybe_commit(&mut self, max_index: u64, term: TermId) -> bool {
        if self.committed < max_index && self.match_term(max_index, term) {
            self.commit_to(max_index);
            true
        } else {
            false
        }
    }

    pub fn applied_to(&mut self, index: u64) {
        if index == 0 {
            return;
        }
        if self.committed < index || index < self.applied {
            panic!(
                "applied {index} is out of range [prev_applied {}, committed {}]",
                self.applied, self.committed
            );
        }
        self.applied = index;
    }

    /// Mark entries up to `index` as persisted
    ///
    /// Ignored if the entry was replaced in the meantime.
    pub fn stable_to(&mut self, index: u64, term: TermId) {
        if self.stabled < index && self.match_term(index, term) {
            let pos = usize::expect_from(index - self.stabled);
            self.unstable.drain(..pos);
            self.stabled = index;
        }
    }

    pub fn stable_snap_to(&mut self, index: u64) {
        if self
            .pending_snapshot
            .as_ref()
            .map_or(false, |snapshot| snapshot.metadata.index == index)
        {
            self.pending_snapshot = None;
        }
    }

    pub fn snapshot(&self) -> StorageResult<Snapshot> {
        match &self.pending_snapshot {
            Some(snapshot) => Ok(snapshot.clone()),
            None => self.storage.snapshot(),
        }
    }

    /// Replace the whole log with the snapshot
    pub fn restore(&mut self, snapshot: Snapshot) {
        let index = snapshot.metadata.index;
        debug!(index, term = %snapshot.metadata.term, "Restoring log from snapshot");
        self.committed = index;
        self.stabled = index;
        self.unstable.clear();
        self.pending_snapshot = Some(snapshot);
    }
}

#[cfg(test)]
use crate::storage::MemStorage;

#[cfg(test)]
fn entry(index: u64, term: u64) -> Entry {
    Entry {
        index,
        term: TermId(term),
        ..Default::default()
    }
}

#[cfg(test)]
fn log_with(persisted: &[Entry], unstable: &[Entry]) -> RaftLog<MemStorage> {
    let storage = MemStorage::new();
    storage.append(persisted).expect("valid entries");
    let mut log = RaftLog::new(storage).expect("valid storage");
    log.append(unstable);
    log
}

#[test]
fn term_and_entries_span_storage_and_unstable() -> anyhow::Result<()> {
    let log = log_with(&[entry(1, 1), entry(2, 1)], &[entry(3, 2), entry(4, 3)]);

    assert_eq!(log.stabled(), 2);
    assert_eq!(log.last_index(), 4);
    assert_eq!(log.last_term()?, TermId(3));
    assert_eq!(log.term(0)?, TermId(0));
    assert_eq!(log.term(3)?, TermId(2));
    assert_eq!(log.term(5), Err(StorageError::Unavailable));

    assert_eq!(
        log.entries(2, 4)?,
        vec![entry(2, 1), entry(3, 2)],
    );
    assert_eq!(log.entries_from(4)?, vec![entry(4, 3)]);
    assert_eq!(log.entries(3, 3)?, vec![]);
    assert_eq!(log.entries(1, 6), Err(StorageError::Unavailable));
    Ok(())
}

#[test]
fn append_truncates_stabled_entries() {
    let mut log = log_with(&[entry(1, 1), entry(2, 1), entry(3, 1)], &[]);
    assert_eq!(log.append(&[entry(2, 2)]), 2);
    assert_eq!(log.stabled(), 1);
    assert_eq!(log.unstable_entries(), &[entry(2, 2)]);
}

#[test]
fn maybe_append_handles_conflicts() -> anyhow::Result<()> {
    let mut log = log_with(&[], &[entry(1, 1), entry(2, 2), entry(3, 2)]);

    // preceding entry mismatch
    assert_eq!(log.maybe_append(3, TermId(3), 3, &[entry(4, 3)]), None);
    // already present entries are not truncated
    assert_eq!(log.maybe_append(1, TermId(1), 1, &[entry(2, 2)]), Some(2));
    assert_eq!(log.last_index(), 3);
    assert_eq!(log.committed(), 1);

    // conflicting suffix gets replaced
    assert_eq!(
        log.maybe_append(1, TermId(1), 5, &[entry(2, 3), entry(3, 3)]),
        Some(3)
    );
    assert_eq!(log.last_term()?, TermId(3));
    assert_eq!(log.committed(), 3);
    Ok(())
}

#[test]
#[should_panic]
fn maybe_append_never_truncates_committed() {
    let mut log = log_with(&[], &[entry(1, 1), entry(2, 1)]);
    log.commit_to(2);
    log.maybe_append(1, TermId(1), 2, &[entry(2, 2)]);
}

#[test]
fn commit_requires_matching_term() -> anyhow::Result<()> {
    let mut log = log_with(&[], &[entry(1, 1), entry(2, 2)]);
    assert!(!log.maybe_commit(2, TermId(1)));
    assert!(log.maybe_commit(2, TermId(2)));
    assert_eq!(log.committed(), 2);

    assert_eq!(log.next_entries()?.len(), 2);
    log.applied_to(1);
    assert_eq!(log.next_entries()?, vec![entry(2, 2)]);
    log.applied_to(2);
    assert!(!log.has_next_entries());
    Ok(())
}

#[test]
fn up_to_date_compares_term_then_index() -> anyhow::Result<()> {
    let log = log_with(&[], &[entry(1, 1), entry(2, 2)]);
    assert!(log.is_up_to_date(1, TermId(3))?);
    assert!(log.is_up_to_date(2, TermId(2))?);
    assert!(!log.is_up_to_date(1, TermId(2))?);
    assert!(!log.is_up_to_date(5, TermId(1))?);
    Ok(())
}

#[test]
fn stable_to_ignores_replaced_entries() {
    let mut log = log_with(&[], &[entry(1, 1), entry(2, 1)]);
    log.stable_to(2, TermId(2));
    assert_eq!(log.stabled(), 0);
    log.stable_to(1, TermId(1));
    assert_eq!(log.stabled(), 1);
    assert_eq!(log.unstable_entries(), &[entry(2, 1)]);
}

#[test]
fn restore_from_snapshot() -> anyhow::Result<()> {
    use raftkv_api::SnapshotMetadata;

    let mut log = log_with(&[entry(1, 1)], &[entry(2, 1)]);
    log.restore(Snapshot {
        data: vec![],
        metadata: SnapshotMetadata {
            index: 10,
            term: TermId(4),
            ..Default::default()
        },
    });

    assert_eq!(log.first_index()?, 11);
    assert_eq!(log.last_index(), 10);
    assert_eq!(log.committed(), 10);
    assert_eq!(log.term(10)?, TermId(4));
    assert_eq!(log.term(5), Err(StorageError::Compacted));
    assert_eq!(log.entries(5, 6), Err(StorageError::Compacted));
    assert!(log.next_entries()?.is_empty());

    log.stable_snap_to(10);
    assert!(log.pending_snapshot().is_none());
    Ok(())
}
