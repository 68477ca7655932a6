//! Raft log persistence
//!
//! [`Storage`] is the contract between the consensus core and whatever
//! persists the log and the [`HardState`]. The core only ever reads through
//! it. Writing (appending entries, saving hard state, installing snapshots)
//! is done by the driving loop after it receives a [`crate::raft::Ready`].
use std::cmp;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use convi::ExpectFrom;
use raftkv_api::{ConfState, Entry, HardState, Snapshot, SnapshotMetadata, TermId};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("requested index is unavailable due to compaction")]
    Compacted,
    #[error("requested entry at index is unavailable")]
    Unavailable,
    #[error("requested index is older than the existing snapshot")]
    SnapshotOutOfDate,
    #[error("snapshot is temporarily unavailable")]
    SnapshotTemporarilyUnavailable,
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// State loaded on startup
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RaftState {
    pub hard_state: HardState,
    pub conf_state: ConfState,
}

pub trait Storage {
    /// Persisted `HardState` and membership
    fn initial_state(&self) -> StorageResult<RaftState>;

    /// Entries in range `[lo, hi)`
    fn entries(&self, lo: u64, hi: u64) -> StorageResult<Vec<Entry>>;

    /// Term of the entry at `index`
    ///
    /// The index of the latest snapshot is still answerable,
    /// even though the entry itself is gone.
    fn term(&self, index: u64) -> StorageResult<TermId>;

    /// Index of the oldest entry still retained
    fn first_index(&self) -> StorageResult<u64>;

    fn last_index(&self) -> StorageResult<u64>;

    fn snapshot(&self) -> StorageResult<Snapshot>;
}

#[derive(Debug)]
struct MemStorageCore {
    hard_state: HardState,
    conf_state: ConfState,
    snapshot: Snapshot,
    /// `entries[0]` is a dummy entry at the index (and term) of the snapshot
    entries: Vec<Entry>,
}

impl Default for MemStorageCore {
    fn default() -> Self {
        Self {
            hard_state: HardState::default(),
            conf_state: ConfState::default(),
            snapshot: Snapshot::default(),
            entries: vec![Entry::default()],
        }
    }
}

impl MemStorageCore {
    fn offset(&self) -> u64 {
        self.entries[0].index
    }

    fn first_index(&self) -> u64 {
        self.offset() + 1
    }

    fn last_index(&self) -> u64 {
        self.offset() + u64::expect_from(self.entries.len()) - 1
    }

    fn pos(&self, index: u64) -> usize {
        usize::expect_from(index - self.offset())
    }
}

/// In-memory [`Storage`]
///
/// Cloning gives another handle to the same log, so the driving
/// loop can keep writing to what the Raft node is reading from.
#[derive(Clone, Debug, Default)]
pub struct MemStorage {
    core: Arc<RwLock<MemStorageCore>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage of a fresh node bootstrapped with the given membership
    pub fn new_with_conf_state(conf_state: ConfState) -> Self {
        let storage = Self::default();
        storage.set_conf_state(conf_state);
        storage
    }

    fn rl(&self) -> RwLockReadGuard<'_, MemStorageCore> {
        self.core.read().expect("Locking failed")
    }

    fn wl(&self) -> RwLockWriteGuard<'_, MemStorageCore> {
        self.core.write().expect("Locking failed")
    }

    pub fn set_hardstate(&self, hard_state: HardState) {
        self.wl().hard_state = hard_state;
    }

    pub fn set_conf_state(&self, conf_state: ConfState) {
        self.wl().conf_state = conf_state;
    }

    /// Append entries, replacing any existing conflicting suffix
    ///
    /// Entries already covered by a snapshot are skipped.
    pub fn append(&self, entries: &[Entry]) -> StorageResult<()> {
        let Some(first_new) = entries.first() else {
            return Ok(());
        };
        let mut core = self.wl();

        let first = core.first_index();
        let last_new = first_new.index + u64::expect_from(entries.len()) - 1;
        if last_new < first {
            return Ok(());
        }

        let entries = if first > first_new.index {
            &entries[usize::expect_from(first - first_new.index)..]
        } else {
            entries
        };

        let offset = entries[0].index - core.offset();
        let len = u64::expect_from(core.entries.len());
        if offset > len {
            debug!(
                index = entries[0].index,
                last_index = core.last_index(),
                "Missing log entries before appended ones"
            );
            return Err(StorageError::Unavailable);
        }
        core.entries.truncate(usize::expect_from(offset));
        core.entries.extend_from_slice(entries);

        trace!(
            first = entries[0].index,
            last = core.last_index(),
            "Appended entries"
        );
        Ok(())
    }

    /// Replace the whole log with a snapshot
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> StorageResult<()> {
        let mut core = self.wl();
        let SnapshotMetadata {
            ref conf_state,
            index,
            term,
        } = snapshot.metadata;

        if index <= core.snapshot.metadata.index {
            return Err(StorageError::SnapshotOutOfDate);
        }

        core.entries = vec![Entry {
            term,
            index,
            ..Default::default()
        }];
        core.conf_state = conf_state.clone();
        core.hard_state.commit = cmp::max(core.hard_state.commit, index);
        if core.hard_state.term < term {
            core.hard_state.term = term;
        }
        core.snapshot = snapshot;

        debug!(index, term = %term, "Applied snapshot");
        Ok(())
    }

    /// Record a snapshot of the application state as of `index`
    pub fn create_snapshot(
        &self,
        index: u64,
        conf_state: Option<ConfState>,
        data: Vec<u8>,
    ) -> StorageResult<Snapshot> {
        let mut core = self.wl();
        if index <= core.snapshot.metadata.index {
            return Err(StorageError::SnapshotOutOfDate);
        }
        if core.last_index() < index {
            return Err(StorageError::Unavailable);
        }

        let pos = core.pos(index);
        let term = core.entries[pos].term;
        let conf_state = conf_state.unwrap_or_else(|| core.conf_state.clone());
        core.snapshot = Snapshot {
            data,
            metadata: SnapshotMetadata {
                conf_state,
                index,
                term,
            },
        };
        debug!(index, term = %term, "Created snapshot");
        Ok(core.snapshot.clone())
    }

    /// Discard all entries before `compact_index`
    ///
    /// The entry at `compact_index` becomes the new dummy entry.
    pub fn compact(&self, compact_index: u64) -> StorageResult<()> {
        let mut core = self.wl();
        if compact_index <= core.offset() {
            return Err(StorageError::Compacted);
        }
        if core.last_index() < compact_index {
            return Err(StorageError::Unavailable);
        }

        let pos = core.pos(compact_index);
        core.entries.drain(..pos);
        core.entries[0].data.clear();
        debug!(
            first_index = core.first_index(),
            last_index = core.last_index(),
            "Compacted log"
        );
        Ok(())
    }
}

impl Storage for MemStorage {
    fn initial_state(&self) -> StorageResult<RaftState> {
        let core = self.rl();
        Ok(RaftState {
            hard_state: core.hard_state,
            conf_state: core.conf_state.clone(),
        })
    }

    fn entries(&self, lo: u64, hi: u64) -> StorageResult<Vec<Entry>> {
        let core = self.rl();
        if lo <= core.offset() {
            return Err(StorageError::Compacted);
        }
        if core.last_index() + 1 < hi {
            return Err(StorageError::Unavailable);
        }
        if hi <= lo {
            return Ok(vec![]);
        }
        Ok(core.entries[core.pos(lo)..core.pos(hi)].to_vec())
    }

    fn term(&self, index: u64) -> StorageResult<TermId> {
        let core = self.rl();
        if index < core.offset() {
            return Err(StorageError::Compacted);
        }
        if core.last_index() < index {
            return Err(StorageError::Unavailable);
        }
        Ok(core.entries[core.pos(index)].term)
    }

    fn first_index(&self) -> StorageResult<u64> {
        Ok(self.rl().first_index())
    }

    fn last_index(&self) -> StorageResult<u64> {
        Ok(self.rl().last_index())
    }

    fn snapshot(&self) -> StorageResult<Snapshot> {
        Ok(self.rl().snapshot.clone())
    }
}

#[cfg(test)]
fn entry(index: u64, term: u64) -> Entry {
    Entry {
        index,
        term: TermId(term),
        ..Default::default()
    }
}

#[test]
fn mem_storage_append_truncates_conflicts() -> anyhow::Result<()> {
    let storage = MemStorage::new();
    storage.append(&[entry(1, 1), entry(2, 1), entry(3, 2)])?;
    assert_eq!(storage.last_index()?, 3);

    // overwrite from index 2 with a later term
    storage.append(&[entry(2, 3)])?;
    assert_eq!(storage.last_index()?, 2);
    assert_eq!(storage.term(2)?, TermId(3));

    // gap
    assert_eq!(
        storage.append(&[entry(5, 3)]),
        Err(StorageError::Unavailable)
    );
    Ok(())
}

#[test]
fn mem_storage_compaction() -> anyhow::Result<()> {
    let storage = MemStorage::new();
    storage.append(&[entry(1, 1), entry(2, 1), entry(3, 2), entry(4, 2)])?;

    storage.compact(3)?;
    assert_eq!(storage.first_index()?, 4);
    assert_eq!(storage.last_index()?, 4);
    // term of the dummy entry is retained
    assert_eq!(storage.term(3)?, TermId(2));
    assert_eq!(storage.term(2), Err(StorageError::Compacted));
    assert_eq!(storage.entries(3, 5), Err(StorageError::Compacted));
    assert_eq!(storage.entries(4, 5)?, vec![entry(4, 2)]);
    assert_eq!(storage.entries(4, 6), Err(StorageError::Unavailable));
    assert_eq!(storage.compact(2), Err(StorageError::Compacted));

    // appending entries partially covered by compaction keeps the new tail
    storage.append(&[entry(3, 2), entry(4, 2), entry(5, 2)])?;
    assert_eq!(storage.last_index()?, 5);
    Ok(())
}

#[test]
fn mem_storage_snapshots() -> anyhow::Result<()> {
    use raftkv_api::NodeId;

    let storage = MemStorage::new_with_conf_state(ConfState {
        nodes: vec![NodeId(1), NodeId(2), NodeId(3)],
    });
    storage.append(&[entry(1, 1), entry(2, 1), entry(3, 2)])?;

    let snapshot = storage.create_snapshot(2, None, b"state".to_vec())?;
    assert_eq!(snapshot.metadata.index, 2);
    assert_eq!(snapshot.metadata.term, TermId(1));
    assert_eq!(snapshot.metadata.conf_state.nodes.len(), 3);
    assert_eq!(
        storage.create_snapshot(2, None, vec![]),
        Err(StorageError::SnapshotOutOfDate)
    );

    let other = MemStorage::new();
    other.append(&[entry(1, 1)])?;
    other.apply_snapshot(snapshot.clone())?;
    assert_eq!(other.first_index()?, 3);
    assert_eq!(other.last_index()?, 2);
    assert_eq!(other.initial_state()?.hard_state.commit, 2);
    assert_eq!(other.initial_state()?.conf_state, snapshot.metadata.conf_state);
    assert_eq!(
        other.apply_snapshot(snapshot),
        Err(StorageError::SnapshotOutOfDate)
    );
    Ok(())
}
