//! Raft driving loop
//!
//! Single thread owning the [`Raft`] node: the only place it is
//! ticked, stepped and advanced.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use raftkv_api::{decode_batch, decode_conf_change, decode_message, Entry, EntryType, Message};
use tokio::sync::watch;
use tracing::{debug, info, trace};

use super::{Inbound, NodeResult, NodeStatus, Router};
use crate::kv::{KvStorage, MemKvStorage};
use crate::raft::{Raft, RaftError, RaftResult};
use crate::storage::{MemStorage, Storage};
use crate::task::PanicGuard;

pub(super) struct RaftDriver {
    pub(super) raft: Raft<MemStorage>,
    /// The same log `raft` reads from
    pub(super) storage: MemStorage,
    pub(super) engine: MemKvStorage,
    pub(super) router: Router,
    pub(super) inbox_rx: flume::Receiver<Inbound>,
    pub(super) status_tx: watch::Sender<NodeStatus>,
    pub(super) is_node_shutting_down: Arc<AtomicBool>,
    pub(super) tick_interval: Duration,
    pub(super) snapshot_threshold: u64,
}

impl RaftDriver {
    pub(super) fn run(mut self) -> NodeResult<()> {
        let id = self.raft.id();
        let _guard = scopeguard::guard((), |_| {
            info!(id = %id, "Raft driver is done");
        });
        let panic_guard = PanicGuard::new(
            format!("raft-driver-{id}"),
            self.is_node_shutting_down.clone(),
        );

        let mut next_tick = Instant::now() + self.tick_interval;
        while !self.is_node_shutting_down.load(Ordering::SeqCst) {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match self.inbox_rx.recv_timeout(timeout) {
                Ok(Inbound::Frame(frame)) => self.handle_frame(&frame)?,
                Ok(Inbound::Proposal { msg, reply }) => self.handle_proposal(msg, reply)?,
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }

            if next_tick <= Instant::now() {
                self.raft.tick()?;
                next_tick += self.tick_interval;
            }

            self.handle_ready()?;
        }

        self.router.unregister(id);
        panic_guard.done();
        Ok(())
    }

    fn handle_frame(&mut self, frame: &[u8]) -> NodeResult<()> {
        let msg = decode_message(frame)?;
        trace!(
            id = %self.raft.id(),
            from = %msg.from,
            msg_type = ?msg.msg_type,
            term = %msg.term,
            "Received message"
        );
        match self.raft.step(msg) {
            Ok(()) => Ok(()),
            Err(RaftError::ProposalDropped) => {
                debug!(id = %self.raft.id(), "Proposal dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn handle_proposal(
        &mut self,
        msg: Message,
        reply: flume::Sender<RaftResult<()>>,
    ) -> NodeResult<()> {
        let res = self.raft.step(msg);
        if res == Err(RaftError::ProposalDropped) {
            debug!(id = %self.raft.id(), "Proposal dropped");
        }
        // the proposer might not be waiting anymore
        let _ = reply.send(res);
        match res {
            Ok(()) | Err(RaftError::ProposalDropped) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn handle_ready(&mut self) -> NodeResult<()> {
        if !self.raft.has_ready() {
            return Ok(());
        }
        let ready = self.raft.ready()?;

        if let Some(soft_state) = ready.soft_state {
            info!(
                id = %self.raft.id(),
                term = %self.raft.term(),
                role = %soft_state.role,
                lead = ?soft_state.lead,
                "Raft state changed"
            );
        }

        if let Some(snapshot) = &ready.snapshot {
            self.engine.restore_snapshot(&snapshot.data)?;
            self.storage.apply_snapshot(snapshot.clone())?;
        }
        self.storage.append(&ready.entries)?;
        if let Some(hard_state) = ready.hard_state {
            self.storage.set_hardstate(hard_state);
        }

        for msg in &ready.messages {
            self.router.send(msg)?;
        }

        for entry in &ready.committed_entries {
            self.apply_entry(entry)?;
        }

        self.raft.advance(ready);
        self.maybe_compact()?;
        self.publish_status();
        Ok(())
    }

    fn apply_entry(&mut self, entry: &Entry) -> NodeResult<()> {
        match entry.entry_type {
            EntryType::Normal => {
                // empty entries are appended by new leaders
                if !entry.data.is_empty() {
                    self.engine.write(decode_batch(&entry.data)?)?;
                }
            }
            EntryType::ConfChange => {
                let cc = decode_conf_change(&entry.data)?;
                info!(
                    id = %self.raft.id(),
                    index = entry.index,
                    change = ?cc.change_type,
                    node = %cc.node_id,
                    "Applying conf change"
                );
                let conf_state = self.raft.apply_conf_change(&cc)?;
                self.storage.set_conf_state(conf_state);
            }
        }
        Ok(())
    }

    /// Snapshot the engine and drop the applied prefix of the log,
    /// once it grew past the threshold
    fn maybe_compact(&mut self) -> NodeResult<()> {
        let applied = self.raft.raft_log().applied();
        let first_index = self.storage.first_index()?;
        if applied < first_index + self.snapshot_threshold || self.storage.last_index()? < applied {
            return Ok(());
        }

        let conf_state = self.raft.prs().conf_state();
        self.storage
            .create_snapshot(applied, Some(conf_state), self.engine.snapshot_data()?)?;
        self.storage.compact(applied)?;
        debug!(id = %self.raft.id(), applied, "Compacted raft log");
        Ok(())
    }

    fn publish_status(&self) {
        let status = NodeStatus {
            soft_state: self.raft.soft_state(),
            term: self.raft.term(),
            commit: self.raft.raft_log().committed(),
            applied: self.raft.raft_log().applied(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
