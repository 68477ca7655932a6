#![allow(unused)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use raftkv_api::{encode_batch, Entry, HardState, Message, MessageType, Modify, NodeId, TermId};
use raftkvd::raft::{Config, Raft, RaftError, Ready};
use raftkvd::storage::MemStorage;

pub const ELECTION_TICK: usize = 10;
pub const HEARTBEAT_TICK: usize = 1;

pub fn ids(ids: &[u64]) -> Vec<NodeId> {
    ids.iter().copied().map(NodeId).collect()
}

pub fn entry(index: u64, term: u64) -> Entry {
    Entry {
        index,
        term: TermId(term),
        ..Default::default()
    }
}

pub fn msg(msg_type: MessageType, from: u64, to: u64, term: u64) -> Message {
    Message {
        term: TermId(term),
        ..Message::new(msg_type, NodeId(from), NodeId(to))
    }
}

pub fn put(key: &str, value: &str) -> Vec<u8> {
    encode_batch(vec![Modify::Put {
        cf: raftkv_api::CF_DEFAULT.into(),
        key: key.into(),
        value: value.into(),
    }])
    .expect("can't fail")
}

pub fn propose_msg(to: u64, data: Vec<u8>) -> Message {
    Message {
        entries: vec![Entry::new_normal(data)],
        ..Message::new(MessageType::Propose, NodeId(to), NodeId(to))
    }
}

/// Storage with given entries persisted, and the hard state matching them
pub fn storage_with(entries: &[Entry], term: u64, commit: u64) -> MemStorage {
    let storage = MemStorage::new();
    storage.append(entries).expect("valid entries");
    storage.set_hardstate(HardState {
        term: TermId(term),
        vote: None,
        commit,
    });
    storage
}

pub fn new_raft(id: u64, peers: &[u64]) -> Raft<MemStorage> {
    new_raft_with_storage(id, peers, MemStorage::new())
}

pub fn new_raft_with_storage(id: u64, peers: &[u64], storage: MemStorage) -> Raft<MemStorage> {
    let mut config = Config::builder()
        .id(NodeId(id))
        .peers(ids(peers))
        .election_tick(ELECTION_TICK)
        .heartbeat_tick(HEARTBEAT_TICK)
        .storage(storage)
        .build();
    config.seed = Some(id);
    Raft::new(config).expect("valid config")
}

/// Turn `raft` into a leader, with the vote of `peers[1]`
///
/// Outbound messages are discarded.
pub fn make_leader(raft: &mut Raft<MemStorage>, voter: u64) -> anyhow::Result<()> {
    raft.step(msg(MessageType::Hup, raft.id().0, raft.id().0, 0))?;
    let term = raft.term().0;
    raft.step(msg(
        MessageType::RequestVoteResponse,
        voter,
        raft.id().0,
        term,
    ))?;
    assert!(raft.is_leader());
    raft.take_messages();
    Ok(())
}

/// Persist a `Ready` the way a driver would, and acknowledge it
pub fn persist_and_advance(raft: &mut Raft<MemStorage>, storage: &MemStorage) -> anyhow::Result<Ready> {
    let ready = raft.ready()?;
    if let Some(snapshot) = &ready.snapshot {
        storage.apply_snapshot(snapshot.clone())?;
    }
    storage.append(&ready.entries)?;
    if let Some(hard_state) = ready.hard_state {
        storage.set_hardstate(hard_state);
    }
    let processed = Ready {
        soft_state: ready.soft_state,
        hard_state: ready.hard_state,
        entries: ready.entries.clone(),
        snapshot: ready.snapshot.clone(),
        committed_entries: ready.committed_entries.clone(),
        messages: ready.messages.clone(),
    };
    raft.advance(ready);
    Ok(processed)
}

/// Deterministic, synchronous network of raft nodes
///
/// Messages are delivered in order until there are none left.
/// Nothing is persisted; all the entries stay unstable.
pub struct Network {
    pub peers: BTreeMap<NodeId, Raft<MemStorage>>,
    dropped: BTreeSet<(NodeId, NodeId)>,
    ignored: BTreeSet<MessageType>,
}

impl Network {
    pub fn new(members: &[u64]) -> Self {
        Self::with_peers(members.iter().map(|&id| new_raft(id, members)).collect())
    }

    pub fn with_peers(peers: Vec<Raft<MemStorage>>) -> Self {
        Self {
            peers: peers.into_iter().map(|raft| (raft.id(), raft)).collect(),
            dropped: BTreeSet::new(),
            ignored: BTreeSet::new(),
        }
    }

    pub fn peer(&self, id: u64) -> &Raft<MemStorage> {
        self.peers.get(&NodeId(id)).expect("unknown peer")
    }

    pub fn peer_mut(&mut self, id: u64) -> &mut Raft<MemStorage> {
        self.peers.get_mut(&NodeId(id)).expect("unknown peer")
    }

    /// Drop all the messages between `a` and `b`
    pub fn cut(&mut self, a: u64, b: u64) {
        self.dropped.insert((NodeId(a), NodeId(b)));
        self.dropped.insert((NodeId(b), NodeId(a)));
    }

    pub fn isolate(&mut self, id: u64) {
        let others: Vec<u64> = self.peers.keys().map(|id| id.0).collect();
        for other in others {
            if other != id {
                self.cut(id, other);
            }
        }
    }

    pub fn ignore(&mut self, msg_type: MessageType) {
        self.ignored.insert(msg_type);
    }

    pub fn recover(&mut self) {
        self.dropped.clear();
        self.ignored.clear();
    }

    fn is_dropped(&self, msg: &Message) -> bool {
        self.dropped.contains(&(msg.from, msg.to)) || self.ignored.contains(&msg.msg_type)
    }

    /// Deliver `msgs` and everything sent in response
    pub fn send(&mut self, msgs: Vec<Message>) {
        let mut queue: VecDeque<Message> = msgs.into();
        while let Some(msg) = queue.pop_front() {
            let Some(raft) = self.peers.get_mut(&msg.to) else {
                continue;
            };
            match raft.step(msg) {
                Ok(()) | Err(RaftError::ProposalDropped) => {}
                Err(e) => panic!("step failed: {e}"),
            }
            let out = raft.take_messages();
            queue.extend(out.into_iter().filter(|m| !self.is_dropped(m)));
        }
    }

    pub fn campaign(&mut self, id: u64) {
        self.send(vec![msg(MessageType::Hup, id, id, 0)]);
    }

    pub fn propose(&mut self, id: u64, data: Vec<u8>) {
        self.send(vec![propose_msg(id, data)]);
    }

    /// Tick every node once, delivering what they send
    pub fn tick(&mut self) {
        let ids: Vec<NodeId> = self.peers.keys().copied().collect();
        for id in ids {
            let raft = self.peers.get_mut(&id).expect("exists");
            raft.tick().expect("tick");
            let out: Vec<Message> = raft
                .take_messages()
                .into_iter()
                .filter(|m| !self.is_dropped(m))
                .collect();
            self.send(out);
        }
    }

    /// All the entries of a node's log
    pub fn log(&self, id: u64) -> Vec<Entry> {
        let log = self.peer(id).raft_log();
        log.entries(1, log.last_index() + 1).expect("log entries")
    }
}
