//! Progress Tracker
//!
//! Leader-side bookkeeping of how much of the log each peer has,
//! plus the quorum arithmetic used for commits and elections.
use std::cmp;
use std::collections::{BTreeMap, BTreeSet};

use raftkv_api::{ConfState, NodeId};

/// Size of a majority of `members` nodes
pub fn quorum(members: usize) -> usize {
    members / 2 + 1
}

/// Replication progress of a single peer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    /// Highest index known to be replicated on the peer
    pub matched: u64,
    /// Index of the next entry to send to the peer
    pub next_idx: u64,
}

impl Progress {
    pub fn new(next_idx: u64) -> Self {
        Self {
            matched: 0,
            next_idx,
        }
    }

    pub fn reset(&mut self, next_idx: u64) {
        self.matched = 0;
        self.next_idx = next_idx;
    }

    /// Peer acknowledged entries up to `n`
    ///
    /// Returns `false` if the acknowledgement is outdated.
    pub fn maybe_update(&mut self, n: u64) -> bool {
        let updated = self.matched < n;
        if updated {
            self.matched = n;
        }
        self.next_idx = cmp::max(self.next_idx, n + 1);
        updated
    }

    /// Peer rejected an append following `rejected`; it has entries up to `hint`
    ///
    /// Returns `false` if the rejection is outdated.
    pub fn maybe_decr_to(&mut self, rejected: u64, hint: u64) -> bool {
        if rejected <= self.matched || self.next_idx != rejected + 1 {
            return false;
        }
        self.next_idx = cmp::max(cmp::min(rejected, hint + 1), 1);
        true
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VoteResult {
    Won,
    Lost,
    Pending,
}

/// Membership and per-peer [`Progress`]
///
/// The local node is a member like any other, but has no
/// `Progress` entry: its own match index is its last index.
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    id: NodeId,
    members: BTreeSet<NodeId>,
    progress: BTreeMap<NodeId, Progress>,
}

impl ProgressTracker {
    pub fn new(id: NodeId, members: impl IntoIterator<Item = NodeId>, next_idx: u64) -> Self {
        let mut tracker = Self {
            id,
            members: BTreeSet::new(),
            progress: BTreeMap::new(),
        };
        for member in members {
            tracker.insert(member, next_idx);
        }
        tracker
    }

    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    pub fn is_member(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    pub fn quorum(&self) -> usize {
        quorum(self.members.len())
    }

    /// Members other than the local node
    pub fn peers(&self) -> Vec<NodeId> {
        self.progress.keys().copied().collect()
    }

    pub fn get(&self, id: NodeId) -> Option<&Progress> {
        self.progress.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Progress> {
        self.progress.get_mut(&id)
    }

    /// Add a member; returns `false` if it already was one
    pub fn insert(&mut self, id: NodeId, next_idx: u64) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        if id != self.id {
            self.progress.insert(id, Progress::new(next_idx));
        }
        true
    }

    /// Remove a member; returns `false` if it wasn't one
    pub fn remove(&mut self, id: NodeId) -> bool {
        self.progress.remove(&id);
        self.members.remove(&id)
    }

    /// Forget everything known about peers, e.g. on becoming a leader
    pub fn reset_all(&mut self, last_index: u64) {
        for progress in self.progress.values_mut() {
            progress.reset(last_index + 1);
        }
    }

    /// Replace membership with the one from a snapshot
    pub fn restore(&mut self, conf_state: &ConfState, next_idx: u64) {
        self.members.clear();
        self.progress.clear();
        for &member in &conf_state.nodes {
            self.insert(member, next_idx);
        }
    }

    pub fn conf_state(&self) -> ConfState {
        ConfState {
            nodes: self.members.iter().copied().collect(),
        }
    }

    /// Highest index replicated on a quorum of members
    ///
    /// `own_last_index` stands in for the local node's match index.
    pub fn quorum_committed_index(&self, own_last_index: u64) -> u64 {
        let mut matched: Vec<u64> = self
            .members
            .iter()
            .map(|id| {
                if *id == self.id {
                    own_last_index
                } else {
                    self.progress.get(id).map_or(0, |p| p.matched)
                }
            })
            .collect();
        if matched.is_empty() {
            return 0;
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        matched[self.quorum() - 1]
    }

    /// Count votes of current members; each member counts once
    pub fn tally_votes(&self, votes: &BTreeMap<NodeId, bool>) -> VoteResult {
        let (granted, rejected) = self
            .members
            .iter()
            .filter_map(|id| votes.get(id))
            .fold((0, 0), |(granted, rejected), &vote| {
                if vote {
                    (granted + 1, rejected)
                } else {
                    (granted, rejected + 1)
                }
            });

        if self.quorum() <= granted {
            VoteResult::Won
        } else if self.quorum() <= rejected {
            VoteResult::Lost
        } else {
            VoteResult::Pending
        }
    }
}

#[test]
fn quorum_is_a_strict_majority() {
    assert_eq!(quorum(1), 1);
    assert_eq!(quorum(2), 2);
    assert_eq!(quorum(3), 2);
    assert_eq!(quorum(4), 3);
    assert_eq!(quorum(5), 3);
}

#[test]
fn progress_updates() {
    let mut p = Progress::new(5);
    assert!(p.maybe_update(4));
    assert_eq!(p, Progress { matched: 4, next_idx: 5 });
    // stale ack
    assert!(!p.maybe_update(3));
    assert_eq!(p.next_idx, 5);

    // stale rejection
    assert!(!p.maybe_decr_to(2, 2));
    assert!(!p.maybe_decr_to(4, 2));

    let mut p = Progress::new(10);
    assert!(p.maybe_decr_to(9, 3));
    assert_eq!(p.next_idx, 4);
    // rejection of something not sent anymore
    assert!(!p.maybe_decr_to(9, 3));
    assert!(p.maybe_decr_to(3, 7));
    assert_eq!(p.next_idx, 3);
}

#[test]
fn quorum_committed_index_counts_self() {
    let mut tracker = ProgressTracker::new(NodeId(1), [1, 2, 3, 4, 5].map(NodeId), 1);
    assert_eq!(tracker.peers().len(), 4);
    assert_eq!(tracker.quorum_committed_index(10), 0);

    tracker.get_mut(NodeId(2)).expect("peer").maybe_update(7);
    assert_eq!(tracker.quorum_committed_index(10), 0);
    tracker.get_mut(NodeId(3)).expect("peer").maybe_update(5);
    assert_eq!(tracker.quorum_committed_index(10), 5);

    tracker.remove(NodeId(4));
    tracker.remove(NodeId(5));
    assert_eq!(tracker.quorum_committed_index(10), 7);
}

#[test]
fn tally_counts_members_once() {
    let tracker = ProgressTracker::new(NodeId(1), [1, 2, 3].map(NodeId), 1);

    let mut votes = BTreeMap::from([(NodeId(1), true)]);
    assert_eq!(tracker.tally_votes(&votes), VoteResult::Pending);
    // non-member votes don't count
    votes.insert(NodeId(7), true);
    assert_eq!(tracker.tally_votes(&votes), VoteResult::Pending);
    votes.insert(NodeId(2), false);
    assert_eq!(tracker.tally_votes(&votes), VoteResult::Pending);
    votes.insert(NodeId(3), false);
    assert_eq!(tracker.tally_votes(&votes), VoteResult::Lost);
    votes.insert(NodeId(3), true);
    assert_eq!(tracker.tally_votes(&votes), VoteResult::Won);
}

#[test]
fn membership_changes() {
    let mut tracker = ProgressTracker::new(NodeId(1), [1, 2].map(NodeId), 1);
    assert!(!tracker.insert(NodeId(2), 5));
    assert!(tracker.insert(NodeId(3), 5));
    assert_eq!(tracker.get(NodeId(3)), Some(&Progress::new(5)));
    assert_eq!(tracker.quorum(), 2);

    assert!(tracker.remove(NodeId(1)));
    assert!(!tracker.is_member(NodeId(1)));
    assert!(!tracker.remove(NodeId(1)));
    assert_eq!(tracker.conf_state().nodes, vec![NodeId(2), NodeId(3)]);
}
