//! Log datastructures
//!
//! Types describing the replicated log (list of entries),
//! the state persisted along with it, and snapshots of it.
use binrw::binrw;

use crate::net::{parse_bytes, parse_vec, write_bytes, write_vec};
use crate::{NodeId, TermId};

/// Kind of a log entry
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
#[binrw]
#[brw(repr = u8)]
pub enum EntryType {
    /// Opaque payload for the application (a batch of modifications)
    #[default]
    Normal = 0,
    /// Encoded [`ConfChange`]
    ConfChange = 1,
}

/// Log entry
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct Entry {
    pub entry_type: EntryType,
    /// Term of the leader that created the entry
    pub term: TermId,
    pub index: u64,
    #[br(parse_with(parse_bytes))]
    #[bw(write_with(write_bytes))]
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new_normal(data: Vec<u8>) -> Self {
        Self {
            entry_type: EntryType::Normal,
            data,
            ..Default::default()
        }
    }

    pub fn new_conf_change(data: Vec<u8>) -> Self {
        Self {
            entry_type: EntryType::ConfChange,
            data,
            ..Default::default()
        }
    }
}

/// State that has to be persisted before responding to any message
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: TermId,
    pub vote: Option<NodeId>,
    pub commit: u64,
}

/// Current cluster membership
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct ConfState {
    #[br(parse_with(parse_vec))]
    #[bw(write_with(write_vec))]
    pub nodes: Vec<NodeId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct SnapshotMetadata {
    /// Membership at the time of the snapshot
    pub conf_state: ConfState,
    /// Index of the last entry included in the snapshot
    pub index: u64,
    /// Term of the last entry included in the snapshot
    pub term: TermId,
}

/// Snapshot of the application state, replacing a prefix of the log
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct Snapshot {
    #[br(parse_with(parse_bytes))]
    #[bw(write_with(write_bytes))]
    pub data: Vec<u8>,
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.metadata.index == 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
#[binrw]
#[brw(repr = u8)]
pub enum ConfChangeType {
    AddNode = 0,
    RemoveNode = 1,
}

/// Membership change, carried in the log as [`EntryType::ConfChange`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[binrw]
#[brw(big)]
pub struct ConfChange {
    pub change_type: ConfChangeType,
    pub node_id: NodeId,
}

impl ConfChange {
    pub fn add_node(node_id: NodeId) -> Self {
        Self {
            change_type: ConfChangeType::AddNode,
            node_id,
        }
    }

    pub fn remove_node(node_id: NodeId) -> Self {
        Self {
            change_type: ConfChangeType::RemoveNode,
            node_id,
        }
    }
}

#[test]
fn conf_change_payload() {
    let cc = ConfChange::remove_node(NodeId(3));
    let bytes = crate::encode_conf_change(&cc).expect("can't fail");
    assert_eq!(bytes.len(), 1 + NodeId::BYTE_SIZE);
    assert_eq!(crate::decode_conf_change(&bytes).expect("valid"), cc);
    assert!(crate::decode_conf_change(&[7u8; 9]).is_err());
}
