use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use raftkv_api::{encode_message, Message, NodeId, WireResult};
use tracing::trace;

use crate::raft::RaftResult;

/// Item of a node's inbox
#[derive(Debug)]
pub enum Inbound {
    /// Encoded message from a peer (or from a local control handle)
    Frame(Vec<u8>),
    /// Proposal made through a local control handle, answered with the
    /// outcome of stepping it
    Proposal {
        msg: Message,
        reply: flume::Sender<RaftResult<()>>,
    },
}

/// In-process transport between nodes
///
/// Every node registers an inbox of encoded frames. Delivery is
/// best-effort: frames to unknown or stopped nodes are dropped,
/// just like a lossy network would.
#[derive(Clone, Debug, Default)]
pub struct Router {
    inboxes: Arc<RwLock<BTreeMap<NodeId, flume::Sender<Inbound>>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) the inbox of `id`
    pub fn register(&self, id: NodeId) -> (flume::Sender<Inbound>, flume::Receiver<Inbound>) {
        let (tx, rx) = flume::unbounded();
        self.inboxes
            .write()
            .expect("Locking failed")
            .insert(id, tx.clone());
        (tx, rx)
    }

    pub fn unregister(&self, id: NodeId) {
        self.inboxes.write().expect("Locking failed").remove(&id);
    }

    /// Encode and deliver a message to its recipient
    ///
    /// Fails only if the message can't be encoded.
    pub fn send(&self, msg: &Message) -> WireResult<()> {
        let frame = encode_message(msg)?;
        let inbox = self
            .inboxes
            .read()
            .expect("Locking failed")
            .get(&msg.to)
            .cloned();
        match inbox {
            Some(inbox) if inbox.send(Inbound::Frame(frame)).is_ok() => {}
            _ => {
                trace!(from = %msg.from, to = %msg.to, msg_type = ?msg.msg_type, "Dropping message to unreachable node");
            }
        }
        Ok(())
    }
}

#[test]
fn router_delivers_encoded_frames() -> anyhow::Result<()> {
    use raftkv_api::{decode_message, MessageType};

    let router = Router::new();
    let (_tx, rx) = router.register(NodeId(2));

    let msg = Message::new(MessageType::Heartbeat, NodeId(1), NodeId(2));
    router.send(&msg)?;
    match rx.try_recv()? {
        Inbound::Frame(frame) => assert_eq!(decode_message(&frame)?, msg),
        other => panic!("unexpected inbound: {other:?}"),
    }

    // unknown recipient
    router.send(&Message::new(MessageType::Heartbeat, NodeId(1), NodeId(3)))?;

    // local messages never reach the wire
    assert!(router
        .send(&Message::new(MessageType::Beat, NodeId(1), NodeId(2)))
        .is_err());

    router.unregister(NodeId(2));
    router.send(&msg)?;
    assert!(rx.try_recv().is_err());
    Ok(())
}
