//! Raft State Machine
//!
//! [`Raft`] is a passive state machine: it never blocks, never does any IO
//! and has no notion of time other than [`Raft::tick`]. Whoever drives it
//! feeds it ticks and inbound messages via [`Raft::step`], then drains
//! outbound messages and the state to persist via [`Raft::ready`].
mod config;
mod ready;

use std::cmp;
use std::collections::BTreeMap;

use derive_more::Display;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use raftkv_api::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Message, MessageType,
    NodeId, Snapshot, TermId,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub use self::config::*;
pub use self::ready::*;
use crate::progress::{ProgressTracker, VoteResult};
use crate::raft_log::RaftLog;
use crate::storage::{RaftState, Storage, StorageError};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftError {
    #[error("raft proposal dropped")]
    ProposalDropped,
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Role of a node, without any role-specific state
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display)]
pub enum StateRole {
    #[default]
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug)]
enum Role {
    Follower,
    Candidate {
        /// Votes received in the current election, self included
        votes: BTreeMap<NodeId, bool>,
    },
    Leader {
        /// Peer leadership is being handed over to
        lead_transferee: Option<NodeId>,
    },
}

impl Role {
    fn state_role(&self) -> StateRole {
        match self {
            Role::Follower => StateRole::Follower,
            Role::Candidate { .. } => StateRole::Candidate,
            Role::Leader { .. } => StateRole::Leader,
        }
    }
}

pub struct Raft<S> {
    id: NodeId,
    term: TermId,
    vote: Option<NodeId>,
    role: Role,
    lead: Option<NodeId>,

    raft_log: RaftLog<S>,
    prs: ProgressTracker,

    /// Outbound messages, drained by the driver
    msgs: Vec<Message>,

    heartbeat_timeout: usize,
    election_timeout: usize,
    heartbeat_elapsed: usize,
    election_elapsed: usize,
    randomized_election_timeout: usize,
    rng: StdRng,

    /// Index of the last conf change proposed; a new one can be proposed
    /// only after it was applied
    pending_conf_index: u64,

    prev_soft_state: SoftState,
    prev_hard_state: HardState,
}

impl<S: Storage> Raft<S> {
    pub fn new(config: Config<S>) -> RaftResult<Self> {
        config.validate()?;
        let Config {
            id,
            peers,
            election_tick,
            heartbeat_tick,
            storage,
            applied,
            seed,
        } = config;
        let storage = storage.ok_or(ConfigError::MissingStorage)?;

        let RaftState {
            hard_state,
            conf_state,
        } = storage.initial_state()?;
        let raft_log = RaftLog::new(storage)?;
        let members = if peers.is_empty() {
            conf_state.nodes
        } else {
            peers
        };

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut raft = Self {
            id,
            term: TermId::default(),
            vote: None,
            role: Role::Follower,
            lead: None,
            raft_log,
            prs: ProgressTracker::new(id, members, 1),
            msgs: vec![],
            heartbeat_timeout: heartbeat_tick,
            election_timeout: election_tick,
            heartbeat_elapsed: 0,
            election_elapsed: 0,
            randomized_election_timeout: election_tick,
            rng,
            pending_conf_index: 0,
            prev_soft_state: SoftState::default(),
            prev_hard_state: HardState::default(),
        };

        if hard_state != HardState::default() {
            raft.load_state(hard_state);
        }
        if applied > 0 {
            raft.raft_log.applied_to(applied);
        }
        raft.become_follower(raft.term, None);
        raft.prev_soft_state = raft.soft_state();
        raft.prev_hard_state = raft.hard_state();

        info!(
            id = %raft.id,
            term = %raft.term,
            commit = raft.raft_log.committed(),
            applied = raft.raft_log.applied(),
            last_index = raft.raft_log.last_index(),
            members = ?raft.prs.members(),
            "Starting raft node"
        );
        Ok(raft)
    }

    fn load_state(&mut self, hard_state: HardState) {
        if hard_state.commit < self.raft_log.committed()
            || self.raft_log.last_index() < hard_state.commit
        {
            panic!(
                "{} state.commit {} is out of range [{}, {}]",
                self.id,
                hard_state.commit,
                self.raft_log.committed(),
                self.raft_log.last_index()
            );
        }
        self.raft_log.commit_to(hard_state.commit);
        self.term = hard_state.term;
        self.vote = hard_state.vote;
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn term(&self) -> TermId {
        self.term
    }

    pub fn vote(&self) -> Option<NodeId> {
        self.vote
    }

    pub fn lead(&self) -> Option<NodeId> {
        self.lead
    }

    pub fn state_role(&self) -> StateRole {
        self.role.state_role()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    pub fn lead_transferee(&self) -> Option<NodeId> {
        match self.role {
            Role::Leader { lead_transferee } => lead_transferee,
            _ => None,
        }
    }

    pub fn raft_log(&self) -> &RaftLog<S> {
        &self.raft_log
    }

    pub fn prs(&self) -> &ProgressTracker {
        &self.prs
    }

    pub fn randomized_election_timeout(&self) -> usize {
        self.randomized_election_timeout
    }

    pub fn election_elapsed(&self) -> usize {
        self.election_elapsed
    }

    pub fn pending_conf_index(&self) -> u64 {
        self.pending_conf_index
    }

    /// Outbound messages, not drained yet
    pub fn msgs(&self) -> &[Message] {
        &self.msgs
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.msgs)
    }

    pub fn soft_state(&self) -> SoftState {
        SoftState {
            lead: self.lead,
            role: self.state_role(),
        }
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.raft_log.committed(),
        }
    }

    /// Can this node become a leader
    fn promotable(&self) -> bool {
        self.prs.is_member(self.id)
    }

    fn past_election_timeout(&self) -> bool {
        self.randomized_election_timeout <= self.election_elapsed
    }

    fn reset_randomized_election_timeout(&mut self) {
        self.randomized_election_timeout = self
            .rng
            .gen_range(self.election_timeout..2 * self.election_timeout);
    }

    fn send(&mut self, mut msg: Message) {
        if msg.from.is_none() {
            msg.from = self.id;
        }
        // proposals are forwarded as they came in, without a term
        if msg.msg_type != MessageType::Propose {
            msg.term = self.term;
        }
        trace!(
            from = %msg.from,
            to = %msg.to,
            msg_type = ?msg.msg_type,
            term = %msg.term,
            "Sending message"
        );
        self.msgs.push(msg);
    }

    pub fn tick(&mut self) -> RaftResult<()> {
        match self.role {
            Role::Follower | Role::Candidate { .. } => self.tick_election(),
            Role::Leader { .. } => self.tick_heartbeat(),
        }
    }

    fn tick_election(&mut self) -> RaftResult<()> {
        self.election_elapsed += 1;
        if self.promotable() && self.past_election_timeout() {
            self.election_elapsed = 0;
            self.step(Message::new(MessageType::Hup, self.id, self.id))?;
        }
        Ok(())
    }

    fn tick_heartbeat(&mut self) -> RaftResult<()> {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if self.election_timeout <= self.election_elapsed {
            self.election_elapsed = 0;
            self.abort_leader_transfer();
        }

        if self.heartbeat_timeout <= self.heartbeat_elapsed {
            self.heartbeat_elapsed = 0;
            self.step(Message::new(MessageType::Beat, self.id, self.id))?;
        }
        Ok(())
    }

    fn reset(&mut self, term: TermId) {
        if self.term != term {
            self.term = term;
            self.vote = None;
        }
        self.lead = None;
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
    }

    pub fn become_follower(&mut self, term: TermId, lead: Option<NodeId>) {
        self.reset(term);
        self.reset_randomized_election_timeout();
        self.role = Role::Follower;
        self.lead = lead;
        info!(
            id = %self.id,
            term = %self.term,
            lead = ?self.lead,
            "Became follower"
        );
    }

    pub fn become_candidate(&mut self) {
        assert!(!self.is_leader(), "invalid transition [leader -> candidate]");
        self.reset(self.term.next());
        self.reset_randomized_election_timeout();
        self.vote = Some(self.id);
        self.role = Role::Candidate {
            votes: BTreeMap::from([(self.id, true)]),
        };
        info!(id = %self.id, term = %self.term, "Became candidate");
    }

    pub fn become_leader(&mut self) {
        assert!(
            !matches!(self.role, Role::Follower),
            "invalid transition [follower -> leader]"
        );
        self.reset(self.term);
        self.role = Role::Leader {
            lead_transferee: None,
        };
        self.lead = Some(self.id);

        let last_index = self.raft_log.last_index();
        self.prs.reset_all(last_index);
        self.pending_conf_index = last_index;

        // entries of previous terms can only be committed along with
        // one of the current term
        self.append_entries(vec![Entry::default()]);
        info!(id = %self.id, term = %self.term, "Became leader");
    }

    pub fn step(&mut self, msg: Message) -> RaftResult<()> {
        if msg.msg_type == MessageType::Hup {
            if self.is_leader() {
                debug!(id = %self.id, "Ignoring Hup, already a leader");
            } else {
                self.campaign()?;
            }
            return Ok(());
        }

        if !msg.term.is_local() {
            if msg.term < self.term {
                debug!(
                    id = %self.id,
                    term = %self.term,
                    msg_term = %msg.term,
                    from = %msg.from,
                    msg_type = ?msg.msg_type,
                    "Ignoring stale message"
                );
                return Ok(());
            }
            if self.term < msg.term {
                info!(
                    id = %self.id,
                    term = %self.term,
                    msg_term = %msg.term,
                    from = %msg.from,
                    msg_type = ?msg.msg_type,
                    "Received message with higher term"
                );
                let lead = if msg.msg_type == MessageType::RequestVote {
                    None
                } else {
                    Some(msg.from)
                };
                self.become_follower(msg.term, lead);
            }
        }

        match self.role {
            Role::Follower => self.step_follower(msg),
            Role::Candidate { .. } => self.step_candidate(msg),
            Role::Leader { .. } => self.step_leader(msg),
        }
    }

    fn step_follower(&mut self, mut msg: Message) -> RaftResult<()> {
        match msg.msg_type {
            MessageType::Propose => match self.lead {
                None => {
                    info!(id = %self.id, term = %self.term, "No leader, dropping proposal");
                    Err(RaftError::ProposalDropped)
                }
                Some(lead) => {
                    msg.to = lead;
                    self.send(msg);
                    Ok(())
                }
            },
            MessageType::Append => {
                self.election_elapsed = 0;
                self.lead = Some(msg.from);
                self.handle_append_entries(msg)
            }
            MessageType::Heartbeat => {
                self.election_elapsed = 0;
                self.lead = Some(msg.from);
                self.handle_heartbeat(msg);
                Ok(())
            }
            MessageType::Snapshot => {
                self.election_elapsed = 0;
                self.lead = Some(msg.from);
                self.handle_snapshot(msg);
                Ok(())
            }
            MessageType::RequestVote => self.handle_request_vote(msg),
            MessageType::TransferLeader => {
                match self.lead {
                    None => {
                        info!(id = %self.id, term = %self.term, "No leader, dropping leader transfer");
                    }
                    Some(lead) => {
                        msg.to = lead;
                        self.send(msg);
                    }
                }
                Ok(())
            }
            MessageType::TimeoutNow => {
                if self.promotable() {
                    info!(
                        id = %self.id,
                        term = %self.term,
                        from = %msg.from,
                        "Received TimeoutNow, starting election"
                    );
                    self.campaign()
                } else {
                    debug!(id = %self.id, "Ignoring TimeoutNow, not a member");
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    fn step_candidate(&mut self, msg: Message) -> RaftResult<()> {
        match msg.msg_type {
            MessageType::Propose => {
                info!(id = %self.id, term = %self.term, "No leader, dropping proposal");
                Err(RaftError::ProposalDropped)
            }
            MessageType::Append => {
                self.become_follower(self.term, Some(msg.from));
                self.handle_append_entries(msg)
            }
            MessageType::Heartbeat => {
                self.become_follower(self.term, Some(msg.from));
                self.handle_heartbeat(msg);
                Ok(())
            }
            MessageType::Snapshot => {
                self.become_follower(self.term, Some(msg.from));
                self.handle_snapshot(msg);
                Ok(())
            }
            MessageType::RequestVote => {
                self.reject_vote(&msg);
                Ok(())
            }
            MessageType::RequestVoteResponse => self.handle_vote_response(msg),
            _ => Ok(()),
        }
    }

    fn step_leader(&mut self, msg: Message) -> RaftResult<()> {
        match msg.msg_type {
            MessageType::Beat => {
                self.bcast_heartbeat();
                Ok(())
            }
            MessageType::Propose => self.handle_propose(msg),
            MessageType::AppendResponse => self.handle_append_response(msg),
            MessageType::HeartbeatResponse => self.handle_heartbeat_response(msg),
            MessageType::RequestVote => {
                self.reject_vote(&msg);
                Ok(())
            }
            MessageType::TransferLeader => self.handle_transfer_leader(msg),
            _ => Ok(()),
        }
    }

    fn campaign(&mut self) -> RaftResult<()> {
        if !self.promotable() {
            warn!(id = %self.id, "Not a member, can't campaign");
            return Ok(());
        }
        self.become_candidate();

        if self.tally_votes() == VoteResult::Won {
            // single node cluster
            self.become_leader();
            return Ok(());
        }

        let last_index = self.raft_log.last_index();
        let last_term = self.raft_log.last_term()?;
        info!(
            id = %self.id,
            term = %self.term,
            last_index,
            last_term = %last_term,
            "Starting election"
        );
        for peer in self.prs.peers() {
            self.send(Message {
                index: last_index,
                log_term: last_term,
                ..Message::new(MessageType::RequestVote, self.id, peer)
            });
        }
        Ok(())
    }

    fn tally_votes(&self) -> VoteResult {
        match &self.role {
            Role::Candidate { votes } => self.prs.tally_votes(votes),
            _ => VoteResult::Pending,
        }
    }

    fn reject_vote(&mut self, msg: &Message) {
        debug!(
            id = %self.id,
            term = %self.term,
            candidate = %msg.from,
            role = %self.state_role(),
            "Rejecting vote"
        );
        self.send(Message {
            reject: true,
            ..Message::new(MessageType::RequestVoteResponse, self.id, msg.from)
        });
    }

    fn handle_request_vote(&mut self, msg: Message) -> RaftResult<()> {
        let can_vote = self.vote.map_or(true, |vote| vote == msg.from);
        if !can_vote || !self.raft_log.is_up_to_date(msg.index, msg.log_term)? {
            self.reject_vote(&msg);
            return Ok(());
        }

        info!(
            id = %self.id,
            term = %self.term,
            candidate = %msg.from,
            "Granting vote"
        );
        self.vote = Some(msg.from);
        self.election_elapsed = 0;
        self.send(Message::new(
            MessageType::RequestVoteResponse,
            self.id,
            msg.from,
        ));
        Ok(())
    }

    fn handle_vote_response(&mut self, msg: Message) -> RaftResult<()> {
        if let Role::Candidate { votes } = &mut self.role {
            if votes.contains_key(&msg.from) {
                debug!(id = %self.id, from = %msg.from, "Ignoring duplicate vote");
                return Ok(());
            }
            votes.insert(msg.from, !msg.reject);
        }

        match self.tally_votes() {
            VoteResult::Won => {
                self.become_leader();
                self.bcast_heartbeat();
            }
            VoteResult::Lost => self.become_follower(self.term, None),
            VoteResult::Pending => {}
        }
        Ok(())
    }

    fn handle_propose(&mut self, msg: Message) -> RaftResult<()> {
        if self.lead_transferee().is_some() {
            debug!(
                id = %self.id,
                lead_transferee = ?self.lead_transferee(),
                "Leader transfer in progress, dropping proposal"
            );
            return Err(RaftError::ProposalDropped);
        }
        if !self.promotable() {
            debug!(id = %self.id, "Not a member anymore, dropping proposal");
            return Err(RaftError::ProposalDropped);
        }
        if msg.entries.is_empty() {
            return Ok(());
        }

        let mut pending_conf_index = self.pending_conf_index;
        for (entry, index) in msg.entries.iter().zip(self.raft_log.last_index() + 1..) {
            if entry.entry_type == EntryType::ConfChange {
                if self.raft_log.applied() < pending_conf_index {
                    info!(
                        id = %self.id,
                        pending_conf_index,
                        applied = self.raft_log.applied(),
                        "Conf change already pending, dropping proposal"
                    );
                    return Err(RaftError::ProposalDropped);
                }
                pending_conf_index = index;
            }
        }
        self.pending_conf_index = pending_conf_index;

        self.append_entries(msg.entries);
        self.bcast_append()
    }

    /// Append entries to the leader's own log
    fn append_entries(&mut self, mut entries: Vec<Entry>) {
        let last_index = self.raft_log.last_index();
        for (entry, index) in entries.iter_mut().zip(last_index + 1..) {
            entry.term = self.term;
            entry.index = index;
        }
        let last_index = self.raft_log.append(&entries);
        debug!(id = %self.id, term = %self.term, last_index, "Appended proposed entries");
        self.maybe_commit();
    }

    fn maybe_commit(&mut self) -> bool {
        let index = self
            .prs
            .quorum_committed_index(self.raft_log.last_index());
        let committed = self.raft_log.maybe_commit(index, self.term);
        if committed {
            debug!(id = %self.id, term = %self.term, commit = index, "Advanced commit index");
        }
        committed
    }

    fn bcast_append(&mut self) -> RaftResult<()> {
        for peer in self.prs.peers() {
            self.send_append(peer)?;
        }
        Ok(())
    }

    fn bcast_heartbeat(&mut self) {
        for peer in self.prs.peers() {
            let matched = self.prs.get(peer).map_or(0, |p| p.matched);
            self.send(Message {
                commit: cmp::min(matched, self.raft_log.committed()),
                ..Message::new(MessageType::Heartbeat, self.id, peer)
            });
        }
    }

    /// Send entries the peer is missing, or a snapshot if they're compacted
    ///
    /// Returns `false` if nothing was sent.
    fn send_append(&mut self, to: NodeId) -> RaftResult<bool> {
        let Some(progress) = self.prs.get(to) else {
            return Ok(false);
        };
        let prev_index = progress.next_idx - 1;

        let log_term = match self.raft_log.term(prev_index) {
            Ok(term) => term,
            Err(StorageError::Compacted) => return self.send_snapshot(to),
            Err(e) => return Err(e.into()),
        };
        let entries = match self.raft_log.entries_from(prev_index + 1) {
            Ok(entries) => entries,
            Err(StorageError::Compacted) => return self.send_snapshot(to),
            Err(e) => return Err(e.into()),
        };

        trace!(
            id = %self.id,
            to = %to,
            index = prev_index,
            num = entries.len(),
            "Sending entries"
        );
        self.send(Message {
            log_term,
            index: prev_index,
            entries,
            commit: self.raft_log.committed(),
            ..Message::new(MessageType::Append, self.id, to)
        });
        Ok(true)
    }

    fn send_snapshot(&mut self, to: NodeId) -> RaftResult<bool> {
        let snapshot = match self.raft_log.snapshot() {
            Ok(snapshot) => snapshot,
            Err(StorageError::SnapshotTemporarilyUnavailable) => {
                debug!(id = %self.id, to = %to, "Snapshot temporarily unavailable");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        if snapshot.is_empty() {
            warn!(id = %self.id, to = %to, "Entries compacted, but no snapshot available");
            return Ok(false);
        }

        let index = snapshot.metadata.index;
        info!(
            id = %self.id,
            to = %to,
            index,
            term = %snapshot.metadata.term,
            "Sending snapshot"
        );
        self.send(Message {
            snapshot: Some(snapshot),
            ..Message::new(MessageType::Snapshot, self.id, to)
        });
        if let Some(progress) = self.prs.get_mut(to) {
            progress.next_idx = index + 1;
        }
        Ok(true)
    }

    fn send_timeout_now(&mut self, to: NodeId) {
        info!(id = %self.id, to = %to, "Transferee caught up, sending TimeoutNow");
        self.send(Message::new(MessageType::TimeoutNow, self.id, to));
    }

    fn handle_append_response(&mut self, msg: Message) -> RaftResult<()> {
        let Some(progress) = self.prs.get_mut(msg.from) else {
            debug!(id = %self.id, from = %msg.from, "Append response from unknown peer");
            return Ok(());
        };

        if msg.reject {
            if progress.maybe_decr_to(msg.index, msg.reject_hint) {
                debug!(
                    id = %self.id,
                    from = %msg.from,
                    rejected = msg.index,
                    hint = msg.reject_hint,
                    next_idx = progress.next_idx,
                    "Append rejected, backing off"
                );
                self.send_append(msg.from)?;
            }
            return Ok(());
        }

        if !progress.maybe_update(msg.index) {
            return Ok(());
        }
        let matched = progress.matched;

        if self.maybe_commit() {
            self.bcast_append()?;
        } else if matched < self.raft_log.last_index() {
            self.send_append(msg.from)?;
        }

        if self.lead_transferee() == Some(msg.from) && matched == self.raft_log.last_index() {
            self.send_timeout_now(msg.from);
        }
        Ok(())
    }

    fn handle_heartbeat_response(&mut self, msg: Message) -> RaftResult<()> {
        let behind = self
            .prs
            .get(msg.from)
            .map_or(false, |p| p.matched < self.raft_log.last_index());
        if behind {
            self.send_append(msg.from)?;
        }
        Ok(())
    }

    fn handle_transfer_leader(&mut self, msg: Message) -> RaftResult<()> {
        let transferee = msg.from;
        if transferee == self.id {
            debug!(id = %self.id, "Already a leader, ignoring leader transfer");
            return Ok(());
        }
        let Some(matched) = self.prs.get(transferee).map(|p| p.matched) else {
            debug!(id = %self.id, transferee = %transferee, "Transferee is not a member");
            return Ok(());
        };
        if self.lead_transferee() == Some(transferee) {
            debug!(id = %self.id, transferee = %transferee, "Leader transfer already in progress");
            return Ok(());
        }

        info!(
            id = %self.id,
            term = %self.term,
            transferee = %transferee,
            "Starting leader transfer"
        );
        self.election_elapsed = 0;
        if let Role::Leader { lead_transferee } = &mut self.role {
            *lead_transferee = Some(transferee);
        }

        if matched == self.raft_log.last_index() {
            self.send_timeout_now(transferee);
        } else {
            self.send_append(transferee)?;
        }
        Ok(())
    }

    fn abort_leader_transfer(&mut self) {
        if let Role::Leader { lead_transferee } = &mut self.role {
            if let Some(transferee) = lead_transferee.take() {
                info!(id = %self.id, transferee = %transferee, "Aborting leader transfer");
            }
        }
    }

    fn handle_append_entries(&mut self, msg: Message) -> RaftResult<()> {
        let committed = self.raft_log.committed();
        if msg.index < committed {
            self.send(Message {
                index: committed,
                ..Message::new(MessageType::AppendResponse, self.id, msg.from)
            });
            return Ok(());
        }

        match self
            .raft_log
            .maybe_append(msg.index, msg.log_term, msg.commit, &msg.entries)
        {
            Some(last_new_index) => {
                self.send(Message {
                    index: last_new_index,
                    ..Message::new(MessageType::AppendResponse, self.id, msg.from)
                });
            }
            None => {
                let hint = cmp::min(msg.index.saturating_sub(1), self.raft_log.last_index());
                debug!(
                    id = %self.id,
                    log_term = %msg.log_term,
                    index = msg.index,
                    existing_term = ?self.raft_log.term(msg.index).ok(),
                    hint,
                    "Rejecting append"
                );
                self.send(Message {
                    index: msg.index,
                    reject: true,
                    reject_hint: hint,
                    ..Message::new(MessageType::AppendResponse, self.id, msg.from)
                });
            }
        }
        Ok(())
    }

    fn handle_heartbeat(&mut self, msg: Message) {
        self.raft_log.commit_to(msg.commit);
        self.send(Message::new(
            MessageType::HeartbeatResponse,
            self.id,
            msg.from,
        ));
    }

    fn handle_snapshot(&mut self, msg: Message) {
        let Some(snapshot) = msg.snapshot else {
            warn!(id = %self.id, from = %msg.from, "Snapshot message without snapshot");
            return;
        };
        let index = snapshot.metadata.index;
        let term = snapshot.metadata.term;

        let index = if self.restore(snapshot) {
            info!(id = %self.id, index, term = %term, "Restored from snapshot");
            self.raft_log.last_index()
        } else {
            debug!(id = %self.id, index, term = %term, "Ignoring stale snapshot");
            self.raft_log.committed()
        };
        self.send(Message {
            index,
            ..Message::new(MessageType::AppendResponse, self.id, msg.from)
        });
    }

    /// Returns `false` if the snapshot is not ahead of the log
    fn restore(&mut self, snapshot: Snapshot) -> bool {
        let index = snapshot.metadata.index;
        if index <= self.raft_log.committed() {
            return false;
        }
        if self.raft_log.match_term(index, snapshot.metadata.term) {
            // already have everything the snapshot covers
            self.raft_log.commit_to(index);
            return false;
        }

        self.prs
            .restore(&snapshot.metadata.conf_state, self.raft_log.last_index() + 1);
        self.raft_log.restore(snapshot);
        true
    }

    /// Apply a committed membership change
    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> RaftResult<ConfState> {
        match cc.change_type {
            ConfChangeType::AddNode => self.add_node(cc.node_id),
            ConfChangeType::RemoveNode => self.remove_node(cc.node_id)?,
        }
        Ok(self.prs.conf_state())
    }

    pub fn add_node(&mut self, id: NodeId) {
        if self.prs.insert(id, self.raft_log.last_index() + 1) {
            info!(id = %self.id, node = %id, "Added node");
        }
    }

    pub fn remove_node(&mut self, id: NodeId) -> RaftResult<()> {
        if !self.prs.remove(id) {
            return Ok(());
        }
        info!(id = %self.id, node = %id, "Removed node");

        if self.is_leader() {
            if self.lead_transferee() == Some(id) {
                self.abort_leader_transfer();
            }
            // quorum got smaller
            if self.maybe_commit() {
                self.bcast_append()?;
            }
        }
        Ok(())
    }
}
