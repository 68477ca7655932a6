mod common;

use raftkv_api::{
    encode_conf_change, ConfChange, ConfState, Entry, MessageType, NodeId, TermId,
};
use raftkvd::raft::{RaftError, StateRole};
use raftkvd::storage::{MemStorage, Storage};

use common::*;

#[test]
fn proposal_is_replicated_and_committed() {
    let mut network = Network::new(&[1, 2, 3]);
    network.campaign(1);
    network.propose(1, put("a", "1"));

    for id in [1, 2, 3] {
        let log = network.peer(id).raft_log();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.committed(), 2);
        assert_eq!(network.log(id)[1].data, put("a", "1"));
    }
}

#[test]
fn follower_forwards_proposal_to_leader() -> anyhow::Result<()> {
    let mut network = Network::new(&[1, 2, 3]);
    network.campaign(1);

    let follower = network.peer_mut(2);
    follower.step(propose_msg(2, put("b", "2")))?;
    let msgs = follower.take_messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg_type, MessageType::Propose);
    assert_eq!(msgs[0].to, NodeId(1));
    assert_eq!(msgs[0].term, TermId(0));

    network.send(msgs);
    for id in [1, 2, 3] {
        assert_eq!(network.peer(id).raft_log().committed(), 2);
    }
    Ok(())
}

#[test]
fn entries_of_previous_terms_are_not_committed_by_counting() -> anyhow::Result<()> {
    let storage = storage_with(&[entry(1, 1), entry(2, 2)], 2, 0);
    let mut raft = new_raft_with_storage(1, &[1, 2, 3], storage);
    make_leader(&mut raft, 2)?;
    assert_eq!(raft.term(), TermId(3));
    assert_eq!(raft.raft_log().last_index(), 3);

    // index 2 is on a majority now, but it's of term 2
    let mut response = msg(MessageType::AppendResponse, 2, 1, 3);
    response.index = 2;
    raft.step(response)?;
    assert_eq!(raft.raft_log().committed(), 0);

    // the rest is sent right away
    let msgs = raft.take_messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg_type, MessageType::Append);
    assert_eq!(msgs[0].index, 2);
    assert_eq!(msgs[0].entries.len(), 1);

    let mut response = msg(MessageType::AppendResponse, 2, 1, 3);
    response.index = 3;
    raft.step(response)?;
    assert_eq!(raft.raft_log().committed(), 3);
    Ok(())
}

#[test]
fn follower_replaces_conflicting_suffix() -> anyhow::Result<()> {
    let storage = storage_with(&[entry(1, 1), entry(2, 1), entry(3, 1)], 1, 0);
    let mut raft = new_raft_with_storage(2, &[1, 2, 3], storage);

    let mut append = msg(MessageType::Append, 1, 2, 2);
    append.index = 1;
    append.log_term = TermId(1);
    append.entries = vec![entry(2, 2)];
    append.commit = 1;
    raft.step(append)?;

    assert_eq!(raft.term(), TermId(2));
    assert_eq!(raft.lead(), Some(NodeId(1)));
    let log = raft.raft_log();
    assert_eq!(log.last_index(), 2);
    assert_eq!(log.term(2)?, TermId(2));
    assert_eq!(log.committed(), 1);
    assert_eq!(log.stabled(), 1);

    let msgs = raft.take_messages();
    assert_eq!(msgs[0].msg_type, MessageType::AppendResponse);
    assert!(!msgs[0].reject);
    assert_eq!(msgs[0].index, 2);
    Ok(())
}

#[test]
fn follower_rejects_append_with_hint() -> anyhow::Result<()> {
    let storage = storage_with(&[entry(1, 1)], 1, 0);
    let mut raft = new_raft_with_storage(2, &[1, 2, 3], storage);

    let mut append = msg(MessageType::Append, 1, 2, 1);
    append.index = 3;
    append.log_term = TermId(1);
    append.entries = vec![entry(4, 1)];
    raft.step(append)?;

    let msgs = raft.take_messages();
    assert!(msgs[0].reject);
    assert_eq!(msgs[0].index, 3);
    assert_eq!(msgs[0].reject_hint, 1);
    assert_eq!(raft.raft_log().last_index(), 1);
    Ok(())
}

#[test]
fn leader_backs_off_to_reject_hint() -> anyhow::Result<()> {
    let storage = storage_with(&[entry(1, 1), entry(2, 1), entry(3, 1)], 1, 0);
    let mut raft = new_raft_with_storage(1, &[1, 2, 3], storage);
    make_leader(&mut raft, 2)?;
    assert_eq!(raft.prs().get(NodeId(2)).map(|p| p.next_idx), Some(4));

    let mut response = msg(MessageType::AppendResponse, 2, 1, 2);
    response.reject = true;
    response.index = 3;
    response.reject_hint = 1;
    raft.step(response.clone())?;

    let msgs = raft.take_messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg_type, MessageType::Append);
    assert_eq!(msgs[0].index, 1);
    assert_eq!(msgs[0].log_term, TermId(1));
    let indexes: Vec<u64> = msgs[0].entries.iter().map(|e| e.index).collect();
    assert_eq!(indexes, vec![2, 3, 4]);

    // the same rejection again is outdated
    raft.step(response)?;
    assert!(raft.msgs().is_empty());
    Ok(())
}

#[test]
fn heartbeat_commit_is_capped_by_match() -> anyhow::Result<()> {
    let mut network = Network::new(&[1, 2, 3]);
    network.campaign(1);
    network.isolate(3);
    network.propose(1, put("a", "1"));
    assert_eq!(network.peer(1).raft_log().committed(), 2);

    let leader = network.peer_mut(1);
    leader.step(msg(MessageType::Beat, 1, 1, 0))?;
    let msgs = leader.take_messages();
    let to_3 = msgs
        .iter()
        .find(|m| m.to == NodeId(3))
        .expect("heartbeat to 3");
    assert_eq!(to_3.msg_type, MessageType::Heartbeat);
    assert_eq!(to_3.commit, 1);

    // once reachable, the follower catches up through the heartbeat response
    network.recover();
    network.send(msgs);
    assert_eq!(network.peer(3).raft_log().committed(), 2);
    assert_eq!(network.log(3), network.log(1));
    Ok(())
}

#[test]
fn partitioned_leader_entries_are_overwritten() {
    let mut network = Network::new(&[1, 2, 3]);
    network.campaign(1);

    network.isolate(1);
    network.propose(1, put("lost", "1"));
    assert_eq!(network.peer(1).raft_log().last_index(), 2);
    assert_eq!(network.peer(1).raft_log().committed(), 1);

    network.campaign(2);
    assert!(network.peer(2).is_leader());
    assert_eq!(network.peer(2).term(), TermId(2));
    // the old leader doesn't know yet
    assert!(network.peer(1).is_leader());

    network.recover();
    network.propose(2, put("kept", "1"));

    assert_eq!(network.peer(1).state_role(), StateRole::Follower);
    assert_eq!(network.peer(1).lead(), Some(NodeId(2)));
    for id in [1, 3] {
        assert_eq!(network.log(id), network.log(2));
    }
    assert_eq!(network.peer(1).raft_log().committed(), 3);
    assert!(network
        .log(1)
        .iter()
        .all(|entry| entry.data != put("lost", "1")));
}

#[test]
fn snapshot_sent_for_compacted_entries() -> anyhow::Result<()> {
    let storage = MemStorage::new();
    storage.append(&(1..=5).map(|index| entry(index, 1)).collect::<Vec<_>>())?;
    storage.create_snapshot(
        5,
        Some(ConfState {
            nodes: ids(&[1, 2, 3]),
        }),
        b"snap".to_vec(),
    )?;
    storage.compact(5)?;
    storage.set_hardstate(raftkv_api::HardState {
        term: TermId(1),
        vote: None,
        commit: 5,
    });

    let mut leader = new_raft_with_storage(1, &[1, 2, 3], storage);
    assert_eq!(leader.raft_log().applied(), 5);
    make_leader(&mut leader, 2)?;

    let mut response = msg(MessageType::AppendResponse, 2, 1, 2);
    response.reject = true;
    response.index = 5;
    response.reject_hint = 0;
    leader.step(response)?;

    let msgs = leader.take_messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg_type, MessageType::Snapshot);
    let snapshot = msgs[0].snapshot.as_ref().expect("snapshot attached");
    assert_eq!(snapshot.metadata.index, 5);
    assert_eq!(snapshot.metadata.term, TermId(1));
    assert_eq!(snapshot.data, b"snap");
    assert_eq!(leader.prs().get(NodeId(2)).map(|p| p.next_idx), Some(6));

    // follower installs it
    let follower_storage = MemStorage::new();
    let mut follower = new_raft_with_storage(2, &[1, 2], follower_storage.clone());
    follower.step(msgs[0].clone())?;
    assert_eq!(follower.raft_log().committed(), 5);
    assert_eq!(follower.prs().conf_state().nodes, ids(&[1, 2, 3]));

    let ready = persist_and_advance(&mut follower, &follower_storage)?;
    assert_eq!(ready.snapshot.as_ref().map(|s| s.metadata.index), Some(5));
    assert!(ready.committed_entries.is_empty());
    assert_eq!(follower.raft_log().applied(), 5);
    assert_eq!(follower.raft_log().first_index()?, 6);
    assert_eq!(follower_storage.first_index()?, 6);
    assert_eq!(follower_storage.snapshot()?.data, b"snap");

    let response = ready
        .messages
        .into_iter()
        .find(|m| m.msg_type == MessageType::AppendResponse)
        .expect("snapshot acknowledged");
    assert_eq!(response.index, 5);

    // and the leader continues with regular entries
    leader.step(response)?;
    let msgs = leader.take_messages();
    assert_eq!(msgs[0].msg_type, MessageType::Append);
    assert_eq!(msgs[0].index, 5);
    assert_eq!(msgs[0].entries.len(), 1);
    Ok(())
}

#[test]
fn stale_snapshot_is_ignored() -> anyhow::Result<()> {
    let storage = storage_with(&[entry(1, 1), entry(2, 1), entry(3, 1)], 1, 3);
    let mut raft = new_raft_with_storage(2, &[1, 2, 3], storage);

    let mut snapshot_msg = msg(MessageType::Snapshot, 1, 2, 1);
    snapshot_msg.snapshot = Some(raftkv_api::Snapshot {
        data: vec![],
        metadata: raftkv_api::SnapshotMetadata {
            conf_state: ConfState {
                nodes: ids(&[1, 2, 3]),
            },
            index: 2,
            term: TermId(1),
        },
    });
    raft.step(snapshot_msg)?;

    assert!(raft.raft_log().pending_snapshot().is_none());
    let msgs = raft.take_messages();
    assert_eq!(msgs[0].msg_type, MessageType::AppendResponse);
    assert_eq!(msgs[0].index, 3);
    Ok(())
}

#[test]
fn only_one_conf_change_pending_at_a_time() -> anyhow::Result<()> {
    let storage = MemStorage::new();
    let mut raft = new_raft_with_storage(1, &[1], storage.clone());
    raft.step(msg(MessageType::Hup, 1, 1, 0))?;
    assert!(raft.is_leader());

    let conf_change = |id| {
        let data = encode_conf_change(&ConfChange::add_node(NodeId(id))).expect("can't fail");
        raftkv_api::Message {
            entries: vec![Entry::new_conf_change(data)],
            ..raftkv_api::Message::new(MessageType::Propose, NodeId(1), NodeId(1))
        }
    };

    raft.step(conf_change(2))?;
    assert_eq!(raft.pending_conf_index(), 2);
    assert!(matches!(
        raft.step(conf_change(3)),
        Err(RaftError::ProposalDropped)
    ));
    // regular proposals are fine
    raft.step(propose_msg(1, put("a", "1")))?;

    let ready = persist_and_advance(&mut raft, &storage)?;
    assert_eq!(ready.committed_entries.len(), 3);
    assert_eq!(raft.raft_log().applied(), 3);

    raft.step(conf_change(3))?;
    assert_eq!(raft.pending_conf_index(), 4);
    Ok(())
}

#[test]
fn ready_hands_over_state_once() -> anyhow::Result<()> {
    let storage = MemStorage::new();
    let mut raft = new_raft_with_storage(1, &[1], storage.clone());
    assert!(!raft.has_ready());

    raft.step(msg(MessageType::Hup, 1, 1, 0))?;
    assert!(raft.has_ready());
    let ready = persist_and_advance(&mut raft, &storage)?;
    assert_eq!(ready.soft_state.map(|s| s.role), Some(StateRole::Leader));
    assert_eq!(ready.hard_state.map(|hs| hs.term), Some(TermId(1)));
    assert_eq!(ready.entries.len(), 1);
    assert_eq!(ready.committed_entries.len(), 1);
    assert_eq!(raft.raft_log().stabled(), 1);
    assert_eq!(storage.last_index()?, 1);

    assert!(!raft.has_ready());
    Ok(())
}

#[test]
fn removing_nodes_shrinks_quorum() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    make_leader(&mut raft, 2)?;
    assert_eq!(raft.raft_log().committed(), 0);

    let conf_state = raft.apply_conf_change(&ConfChange::remove_node(NodeId(3)))?;
    assert_eq!(conf_state.nodes, ids(&[1, 2]));
    assert_eq!(raft.raft_log().committed(), 0);

    raft.apply_conf_change(&ConfChange::remove_node(NodeId(2)))?;
    assert_eq!(raft.raft_log().committed(), 1);

    // removing a non-member is a no-op
    let conf_state = raft.apply_conf_change(&ConfChange::remove_node(NodeId(7)))?;
    assert_eq!(conf_state.nodes, ids(&[1]));
    Ok(())
}

#[test]
fn added_node_gets_progress() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    make_leader(&mut raft, 2)?;

    let conf_state = raft.apply_conf_change(&ConfChange::add_node(NodeId(4)))?;
    assert_eq!(conf_state.nodes, ids(&[1, 2, 3, 4]));
    let progress = raft.prs().get(NodeId(4)).expect("tracked");
    assert_eq!(progress.matched, 0);
    assert_eq!(progress.next_idx, raft.raft_log().last_index() + 1);
    Ok(())
}

#[test]
fn removed_leader_drops_proposals() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    make_leader(&mut raft, 2)?;
    raft.apply_conf_change(&ConfChange::remove_node(NodeId(1)))?;

    assert!(matches!(
        raft.step(propose_msg(1, put("a", "1"))),
        Err(RaftError::ProposalDropped)
    ));
    Ok(())
}

#[test]
fn leader_transfer_to_up_to_date_follower() {
    let mut network = Network::new(&[1, 2, 3]);
    network.campaign(1);
    network.propose(1, put("a", "1"));

    network.send(vec![raftkv_api::Message::new(
        MessageType::TransferLeader,
        NodeId(3),
        NodeId(1),
    )]);

    assert!(network.peer(3).is_leader());
    assert_eq!(network.peer(3).term(), TermId(2));
    assert_eq!(network.peer(1).state_role(), StateRole::Follower);
    assert_eq!(network.peer(1).lead(), Some(NodeId(3)));
}

#[test]
fn leader_transfer_catches_up_transferee_first() {
    let mut network = Network::new(&[1, 2, 3]);
    network.campaign(1);
    network.isolate(3);
    network.propose(1, put("a", "1"));
    network.propose(1, put("b", "2"));
    network.recover();

    // sent to a follower, forwarded to the leader
    network.send(vec![raftkv_api::Message::new(
        MessageType::TransferLeader,
        NodeId(3),
        NodeId(2),
    )]);

    assert!(network.peer(3).is_leader());
    assert_eq!(network.peer(3).raft_log().last_index(), 4);
}

#[test]
fn leader_transfer_blocks_proposals_until_aborted() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    make_leader(&mut raft, 2)?;

    raft.step(msg(MessageType::TransferLeader, 3, 1, 0))?;
    assert_eq!(raft.lead_transferee(), Some(NodeId(3)));
    // transferee is behind, so it gets entries rather than TimeoutNow
    let msgs = raft.take_messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg_type, MessageType::Append);

    assert!(matches!(
        raft.step(propose_msg(1, put("a", "1"))),
        Err(RaftError::ProposalDropped)
    ));

    for _ in 0..ELECTION_TICK {
        raft.tick()?;
    }
    assert_eq!(raft.lead_transferee(), None);
    assert!(raft.is_leader());
    raft.step(propose_msg(1, put("a", "1")))?;
    Ok(())
}

#[test]
fn timeout_now_ignored_by_non_member() -> anyhow::Result<()> {
    let mut raft = new_raft(4, &[1, 2, 3]);
    raft.step(msg(MessageType::TimeoutNow, 1, 4, 1))?;
    assert_eq!(raft.state_role(), StateRole::Follower);
    assert_eq!(raft.term(), TermId(1));
    Ok(())
}
