use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use raftkv_api::{ConfState, NodeId};
use tracing::info;

use super::{Node, NodeCtrl, Parameters, Router};
use crate::kv::MemKvStorage;
use crate::raft::StateRole;
use crate::storage::MemStorage;

struct ClusterNode {
    node: Node,
    ctrl: NodeCtrl,
    engine: MemKvStorage,
}

/// Nodes running in the current process, talking through one [`Router`]
pub struct Cluster {
    router: Router,
    nodes: BTreeMap<NodeId, ClusterNode>,
}

impl Cluster {
    /// Start a node for every element of `params`
    ///
    /// Each node's log is bootstrapped with its `peers` as the membership.
    pub fn new(params: Vec<Parameters>) -> anyhow::Result<Self> {
        let mut cluster = Self {
            router: Router::new(),
            nodes: BTreeMap::new(),
        };
        for params in params {
            cluster.start_node(params)?;
        }

        info!(size = cluster.nodes.len(), "Started in-process cluster");
        Ok(cluster)
    }

    /// Start one more node, with an empty log, on the shared router
    ///
    /// Its `params.peers` should match the ones of the running nodes.
    pub fn start_node(&mut self, params: Parameters) -> anyhow::Result<()> {
        let id = params.id;
        anyhow::ensure!(!self.nodes.contains_key(&id), "node {id} is already running");
        let storage = MemStorage::new_with_conf_state(ConfState {
            nodes: params.peers.clone(),
        });
        let engine = MemKvStorage::new();
        let node = Node::new(params, storage, engine.clone(), &self.router)?;
        let ctrl = node.get_ctrl();
        self.nodes.insert(id, ClusterNode { node, ctrl, engine });
        Ok(())
    }

    /// Parameters of `size` nodes (with ids `1..=size`) all knowing each other
    pub fn params(size: u64, base: &Parameters) -> Vec<Parameters> {
        let ids: Vec<NodeId> = (1..=size).map(NodeId).collect();
        ids.iter()
            .map(|&id| Parameters {
                id,
                peers: ids.clone(),
                seed: base.seed.map(|seed| seed.wrapping_add(id.0)),
                ..base.clone()
            })
            .collect()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn ctrl(&self, id: NodeId) -> Option<NodeCtrl> {
        self.nodes.get(&id).map(|n| n.ctrl.clone())
    }

    pub fn engine(&self, id: NodeId) -> Option<&MemKvStorage> {
        self.nodes.get(&id).map(|n| &n.engine)
    }

    /// Node believing to be a leader in the highest term
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .map(|n| (n.ctrl.status(), n.ctrl.id()))
            .filter(|(status, _)| status.soft_state.role == StateRole::Leader)
            .max_by_key(|(status, _)| status.term)
            .map(|(_, id)| id)
    }

    /// Poll until `f` returns `Some`, or `timeout` passes
    pub fn wait_for<T>(&self, timeout: Duration, mut f: impl FnMut(&Self) -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(v) = f(self) {
                return Some(v);
            }
            if deadline <= Instant::now() {
                return None;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        self.wait_for(timeout, Cluster::leader)
    }

    /// Stop a single node, simulating its crash
    pub fn stop_node(&mut self, id: NodeId) {
        if let Some(n) = self.nodes.remove(&id) {
            n.ctrl.stop();
            n.node.wait();
        }
    }

    pub fn stop(&self) {
        for n in self.nodes.values() {
            n.ctrl.stop();
        }
    }

    /// Wait for all the nodes to finish, e.g. after a termination signal
    pub fn wait(self) {
        for (_, n) in self.nodes {
            n.node.wait();
        }
    }
}
