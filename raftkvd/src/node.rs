mod cluster;
mod driver;
mod router;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use raftkv_api::{
    encode_batch, encode_conf_change, encode_message, ConfChange, Entry, Message, MessageType,
    Modify, NodeId, TermId, WireError,
};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, trace};
use typed_builder::TypedBuilder;

pub use self::cluster::*;
use self::driver::RaftDriver;
pub use self::router::*;
use crate::kv::{KvError, MemKvStorage};
use crate::raft::{Config, Raft, RaftError, SoftState};
use crate::storage::{MemStorage, StorageError};
use crate::task::AutoJoinHandle;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("raft error: {0}")]
    Raft(#[from] RaftError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("key-value error: {0}")]
    Kv(#[from] KvError),
    #[error("node stopped")]
    Stopped,
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    #[builder(default = Parameters::DEFAULT_NODE_ID)]
    pub id: NodeId,

    /// All initial members of the cluster, including `id`
    #[builder(default)]
    pub peers: Vec<NodeId>,

    /// Duration of a single raft tick
    #[builder(default = Parameters::DEFAULT_TICK_INTERVAL)]
    pub tick_interval: Duration,

    #[builder(default = Parameters::DEFAULT_ELECTION_TICK)]
    pub election_tick: usize,

    #[builder(default = Parameters::DEFAULT_HEARTBEAT_TICK)]
    pub heartbeat_tick: usize,

    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,

    /// Snapshot and compact the log every that many applied entries
    #[builder(default = Parameters::DEFAULT_SNAPSHOT_THRESHOLD)]
    pub snapshot_threshold: u64,
}

impl Parameters {
    pub const DEFAULT_NODE_ID: NodeId = NodeId(0);
    pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_ELECTION_TICK: usize = 10;
    pub const DEFAULT_HEARTBEAT_TICK: usize = 2;
    pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1000;
}

/// State of a node, as published by its driving loop
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub soft_state: SoftState,
    pub term: TermId,
    pub commit: u64,
    pub applied: u64,
}

#[derive(Clone)]
pub struct NodeCtrl {
    id: NodeId,
    is_node_shutting_down: Arc<AtomicBool>,
    inbox_tx: flume::Sender<Inbound>,
    status_rx: watch::Receiver<NodeStatus>,
}

impl NodeCtrl {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn status(&self) -> NodeStatus {
        *self.status_rx.borrow()
    }

    pub fn soft_state(&self) -> SoftState {
        self.status().soft_state
    }

    /// Propose a batch of modifications to be replicated
    ///
    /// Returns [`RaftError::ProposalDropped`] if no leader is known, or
    /// leadership is being transferred, so the caller can retry. `Ok` means
    /// the proposal was accepted locally (appended, or forwarded to the
    /// leader), not that it was committed.
    pub fn propose(&self, batch: Vec<Modify>) -> NodeResult<()> {
        let data = encode_batch(batch)?;
        self.propose_entry(Entry::new_normal(data))
    }

    /// Like [`Self::propose`], for a membership change
    pub fn propose_conf_change(&self, cc: ConfChange) -> NodeResult<()> {
        let data = encode_conf_change(&cc)?;
        self.propose_entry(Entry::new_conf_change(data))
    }

    fn propose_entry(&self, entry: Entry) -> NodeResult<()> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        self.inbox_tx
            .send(Inbound::Proposal {
                msg: Message {
                    entries: vec![entry],
                    ..Message::new(MessageType::Propose, self.id, self.id)
                },
                reply: reply_tx,
            })
            .map_err(|_| NodeError::Stopped)?;
        // the reply sender is dropped unanswered if the node stops first
        reply_rx.recv().map_err(|_| NodeError::Stopped)??;
        Ok(())
    }

    /// Ask the leader to hand leadership over to `transferee`
    pub fn transfer_leader(&self, transferee: NodeId) -> NodeResult<()> {
        self.send(Message::new(MessageType::TransferLeader, transferee, self.id))
    }

    fn send(&self, msg: Message) -> NodeResult<()> {
        let frame = encode_message(&msg)?;
        self.inbox_tx
            .send(Inbound::Frame(frame))
            .map_err(|_| NodeError::Stopped)
    }

    pub fn stop(&self) {
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.is_node_shutting_down.load(Ordering::SeqCst)
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!(id = %self.id, "Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.is_node_shutting_down))?;
        }
        Ok(())
    }
}

pub struct Node {
    id: NodeId,
    is_node_shutting_down: Arc<AtomicBool>,
    stop_on_drop: bool,
    inbox_tx: flume::Sender<Inbound>,
    status_rx: watch::Receiver<NodeStatus>,
    /// Thread running the raft driving loop
    driver: AutoJoinHandle,
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.stop_on_drop {
            self.is_node_shutting_down.store(true, Ordering::SeqCst);
        }
    }
}

impl Node {
    pub fn new(
        params: Parameters,
        storage: MemStorage,
        engine: MemKvStorage,
        router: &Router,
    ) -> anyhow::Result<Self> {
        info!(
            id = %params.id,
            peers = ?params.peers,
            tick_interval_ms = params.tick_interval.as_millis(),
            election_tick = params.election_tick,
            heartbeat_tick = params.heartbeat_tick,
            "Starting raftkv node"
        );

        let mut config = Config::builder()
            .id(params.id)
            .peers(params.peers.clone())
            .election_tick(params.election_tick)
            .heartbeat_tick(params.heartbeat_tick)
            .storage(storage.clone())
            .build();
        config.seed = params.seed;

        let is_node_shutting_down = Arc::new(AtomicBool::new(false));
        let (inbox_tx, inbox_rx) = router.register(params.id);
        let (status_tx, status_rx) = watch::channel(NodeStatus::default());

        let driver = RaftDriver {
            raft: Raft::new(config)?,
            storage,
            engine,
            router: router.clone(),
            inbox_rx,
            status_tx,
            is_node_shutting_down: is_node_shutting_down.clone(),
            tick_interval: params.tick_interval,
            snapshot_threshold: params.snapshot_threshold,
        };
        let driver = AutoJoinHandle::spawn_res(format!("raft-node-{}", params.id), move || {
            driver.run()
        })?;

        Ok(Node {
            id: params.id,
            is_node_shutting_down,
            stop_on_drop: true,
            inbox_tx,
            status_rx,
            driver,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn get_ctrl(&self) -> NodeCtrl {
        NodeCtrl {
            id: self.id,
            is_node_shutting_down: Arc::clone(&self.is_node_shutting_down),
            inbox_tx: self.inbox_tx.clone(),
            status_rx: self.status_rx.clone(),
        }
    }

    pub fn wait(mut self) {
        self.stop_on_drop = false;
        let id = self.id;
        debug!(id = %id, task = self.driver.name(), "Waiting for the driver to finish");
        drop(self);
        info!(id = %id, "Node finished");
    }
}
