//! Handing state over to the driver
//!
//! After stepping or ticking a node, the driver checks [`Raft::has_ready`],
//! takes a [`Ready`] and processes it in order: install the snapshot,
//! persist entries and hard state, send messages, apply committed entries.
//! Then it calls [`Raft::advance`] with the same `Ready`.
use raftkv_api::{Entry, HardState, Message, NodeId, Snapshot};

use super::{Raft, RaftResult, StateRole};
use crate::storage::Storage;

/// Volatile state, useful for logging and leader discovery
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SoftState {
    pub lead: Option<NodeId>,
    pub role: StateRole,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Ready {
    /// Set only if changed since the previous `Ready`
    pub soft_state: Option<SoftState>,

    /// Set only if changed since the previous `Ready`; must be
    /// persisted before sending `messages`
    pub hard_state: Option<HardState>,

    /// Entries to persist before sending `messages`
    pub entries: Vec<Entry>,

    /// Snapshot to install before persisting `entries`
    pub snapshot: Option<Snapshot>,

    /// Committed entries to apply to the application state
    pub committed_entries: Vec<Entry>,

    pub messages: Vec<Message>,
}

impl<S: Storage> Raft<S> {
    pub fn has_ready(&self) -> bool {
        self.soft_state() != self.prev_soft_state
            || self.hard_state() != self.prev_hard_state
            || !self.raft_log.unstable_entries().is_empty()
            || self.raft_log.pending_snapshot().is_some()
            || !self.msgs.is_empty()
            || self.raft_log.has_next_entries()
    }

    pub fn ready(&mut self) -> RaftResult<Ready> {
        let soft_state = self.soft_state();
        let soft_state = if soft_state != self.prev_soft_state {
            self.prev_soft_state = soft_state;
            Some(soft_state)
        } else {
            None
        };

        let hard_state = self.hard_state();
        let hard_state = (hard_state != self.prev_hard_state).then_some(hard_state);

        Ok(Ready {
            soft_state,
            hard_state,
            entries: self.raft_log.unstable_entries().to_vec(),
            snapshot: self.raft_log.pending_snapshot().cloned(),
            committed_entries: self.raft_log.next_entries()?,
            messages: self.take_messages(),
        })
    }

    /// Acknowledge that everything in `ready` was processed
    pub fn advance(&mut self, ready: Ready) {
        if let Some(hard_state) = ready.hard_state {
            self.prev_hard_state = hard_state;
        }
        if let Some(snapshot) = &ready.snapshot {
            self.raft_log.stable_snap_to(snapshot.metadata.index);
        }
        if let Some(last) = ready.entries.last() {
            self.raft_log.stable_to(last.index, last.term);
        }
        if let Some(last) = ready.committed_entries.last() {
            self.raft_log.applied_to(last.index);
        } else if let Some(snapshot) = &ready.snapshot {
            if self.raft_log.applied() < snapshot.metadata.index {
                self.raft_log.applied_to(snapshot.metadata.index);
            }
        }
    }
}
