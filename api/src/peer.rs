//! Messages exchanged between Raft peers
use binrw::binrw;

use crate::net::{parse_snapshot_opt, parse_vec, write_snapshot_opt, write_vec};
use crate::{Entry, NodeId, Snapshot, TermId};

/// Kind of a [`Message`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
#[binrw]
#[brw(repr = u8)]
pub enum MessageType {
    /// Local: start an election
    #[default]
    Hup = 0,
    /// Local: leader should broadcast a heartbeat
    Beat = 1,
    /// Client proposal (new entries), possibly forwarded to the leader
    Propose = 2,
    /// Leader replicating entries (corresponds to AppendEntries RPC)
    Append = 3,
    AppendResponse = 4,
    /// Candidate asking for a vote (corresponds to RequestVote RPC)
    RequestVote = 5,
    RequestVoteResponse = 6,
    /// Leader sending a snapshot to a follower missing compacted entries
    Snapshot = 7,
    /// Leader asserting liveness (an empty `Append`)
    Heartbeat = 8,
    HeartbeatResponse = 9,
    /// Ask the leader to hand over leadership to `from`
    TransferLeader = 10,
    /// Leader telling a caught-up transferee to campaign right away
    TimeoutNow = 11,
}

impl MessageType {
    /// Local-only messages are injected by the node itself (or its driver)
    /// and never leave the process.
    pub fn is_local(self) -> bool {
        matches!(self, MessageType::Hup | MessageType::Beat)
    }
}

/// Message envelope
///
/// Not every field is meaningful for every [`MessageType`].
/// Unused fields are left at their defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct Message {
    pub msg_type: MessageType,
    pub to: NodeId,
    pub from: NodeId,
    /// Term of the sender, [`TermId::LOCAL`] for local messages and proposals
    pub term: TermId,
    /// `Append`: term of the entry at `index`;
    /// `RequestVote`: term of the candidate's last entry
    pub log_term: TermId,
    /// `Append`: index of the entry preceding `entries`;
    /// `AppendResponse`: last index the follower has (or rejected);
    /// `RequestVote`: index of the candidate's last entry
    pub index: u64,
    #[br(parse_with(parse_vec))]
    #[bw(write_with(write_vec))]
    pub entries: Vec<Entry>,
    /// Commit index of the leader
    pub commit: u64,
    #[br(parse_with(parse_snapshot_opt))]
    #[bw(write_with(write_snapshot_opt))]
    pub snapshot: Option<Snapshot>,
    #[br(map = |b: u8| b != 0)]
    #[bw(map = |b: &bool| u8::from(*b))]
    pub reject: bool,
    /// Last index of the follower when rejecting an `Append`
    pub reject_hint: u64,
}

impl Message {
    pub fn new(msg_type: MessageType, from: NodeId, to: NodeId) -> Self {
        Self {
            msg_type,
            from,
            to,
            ..Default::default()
        }
    }
}
