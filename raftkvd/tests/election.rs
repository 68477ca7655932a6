mod common;

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use raftkv_api::{MessageType, NodeId, TermId};
use raftkvd::raft::{Config, ConfigError, Raft, RaftError, StateRole};
use raftkvd::storage::MemStorage;

use common::*;

#[test]
fn follower_campaigns_after_randomized_timeout() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    let timeout = raft.randomized_election_timeout();
    assert!((ELECTION_TICK..2 * ELECTION_TICK).contains(&timeout));

    for _ in 1..timeout {
        raft.tick()?;
    }
    assert_eq!(raft.state_role(), StateRole::Follower);
    assert!(raft.msgs().is_empty());

    raft.tick()?;
    assert_eq!(raft.state_role(), StateRole::Candidate);
    assert_eq!(raft.term(), TermId(1));
    assert_eq!(raft.vote(), Some(NodeId(1)));

    let msgs = raft.take_messages();
    assert_eq!(msgs.len(), 2);
    for (msg, to) in msgs.iter().zip([2, 3]) {
        assert_eq!(msg.msg_type, MessageType::RequestVote);
        assert_eq!(msg.to, NodeId(to));
        assert_eq!(msg.from, NodeId(1));
        assert_eq!(msg.term, TermId(1));
    }
    Ok(())
}

#[test]
fn candidate_with_majority_becomes_leader_and_sends_heartbeats() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    raft.step(msg(MessageType::Hup, 1, 1, 0))?;
    raft.take_messages();

    raft.step(msg(MessageType::RequestVoteResponse, 2, 1, 1))?;
    assert_eq!(raft.state_role(), StateRole::Leader);
    assert_eq!(raft.lead(), Some(NodeId(1)));
    assert_eq!(raft.term(), TermId(1));

    let msgs = raft.take_messages();
    let heartbeats: BTreeSet<NodeId> = msgs
        .iter()
        .filter(|m| m.msg_type == MessageType::Heartbeat)
        .map(|m| m.to)
        .collect();
    assert_eq!(heartbeats, ids(&[2, 3]).into_iter().collect::<BTreeSet<_>>());

    // late vote doesn't change anything
    raft.step(msg(MessageType::RequestVoteResponse, 3, 1, 1))?;
    assert_eq!(raft.state_role(), StateRole::Leader);
    assert!(raft.msgs().is_empty());

    // a no-op entry of the new term was appended
    assert_eq!(raft.raft_log().last_index(), 1);
    assert_eq!(raft.raft_log().last_term()?, TermId(1));
    Ok(())
}

#[test]
fn leader_steps_down_on_higher_term() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    make_leader(&mut raft, 2)?;
    assert_eq!(raft.term(), TermId(1));

    raft.step(msg(MessageType::AppendResponse, 2, 1, 2))?;
    assert_eq!(raft.state_role(), StateRole::Follower);
    assert_eq!(raft.term(), TermId(2));
    assert_eq!(raft.lead(), Some(NodeId(2)));
    assert_eq!(raft.vote(), None);
    Ok(())
}

#[test]
fn proposal_without_leader_is_dropped() {
    let mut raft = new_raft(1, &[1, 2, 3]);
    assert!(matches!(
        raft.step(propose_msg(1, put("a", "1"))),
        Err(RaftError::ProposalDropped)
    ));
    assert!(raft.msgs().is_empty());
}

#[test]
fn single_node_elects_itself_immediately() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1]);
    raft.step(msg(MessageType::Hup, 1, 1, 0))?;
    assert_eq!(raft.state_role(), StateRole::Leader);
    assert_eq!(raft.term(), TermId(1));
    assert!(raft.msgs().is_empty());
    // no-op entry is committed right away
    assert_eq!(raft.raft_log().committed(), 1);
    Ok(())
}

#[test]
fn randomized_election_timeout_stays_in_range() -> anyhow::Result<()> {
    let mut seen = BTreeSet::new();
    for seed in 0..200 {
        let mut config = Config::builder()
            .id(NodeId(1))
            .peers(ids(&[1, 2, 3]))
            .election_tick(ELECTION_TICK)
            .heartbeat_tick(HEARTBEAT_TICK)
            .storage(MemStorage::new())
            .build();
        config.seed = Some(seed);
        let mut raft = Raft::new(config)?;

        for term in 1..5 {
            let timeout = raft.randomized_election_timeout();
            assert!(ELECTION_TICK <= timeout && timeout < 2 * ELECTION_TICK);
            seen.insert(timeout);
            // re-randomized on every transition into follower
            raft.step(msg(MessageType::Heartbeat, 2, 1, term))?;
        }
    }
    assert!(1 < seen.len());
    Ok(())
}

#[test]
fn majority_of_rejections_reverts_to_follower() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3, 4, 5]);
    raft.step(msg(MessageType::Hup, 1, 1, 0))?;

    for voter in [2, 3] {
        raft.step(reject(msg(MessageType::RequestVoteResponse, voter, 1, 1)))?;
        assert_eq!(raft.state_role(), StateRole::Candidate);
    }
    raft.step(reject(msg(MessageType::RequestVoteResponse, 4, 1, 1)))?;
    assert_eq!(raft.state_role(), StateRole::Follower);
    assert_eq!(raft.term(), TermId(1));
    assert_eq!(raft.lead(), None);
    Ok(())
}

#[test]
fn duplicate_votes_are_counted_once() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3, 4, 5]);
    raft.step(msg(MessageType::Hup, 1, 1, 0))?;

    raft.step(msg(MessageType::RequestVoteResponse, 2, 1, 1))?;
    raft.step(msg(MessageType::RequestVoteResponse, 2, 1, 1))?;
    assert_eq!(raft.state_role(), StateRole::Candidate);

    // a later change of mind doesn't count either
    raft.step(reject(msg(MessageType::RequestVoteResponse, 2, 1, 1)))?;
    assert_eq!(raft.state_role(), StateRole::Candidate);

    raft.step(msg(MessageType::RequestVoteResponse, 3, 1, 1))?;
    assert_eq!(raft.state_role(), StateRole::Leader);
    Ok(())
}

#[test]
fn stale_messages_are_ignored() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    raft.step(msg(MessageType::Heartbeat, 2, 1, 2))?;
    raft.take_messages();
    assert_eq!(raft.term(), TermId(2));

    for msg_type in [
        MessageType::Append,
        MessageType::Heartbeat,
        MessageType::RequestVote,
    ] {
        raft.step(msg(msg_type, 3, 1, 1))?;
        assert!(raft.msgs().is_empty());
        assert_eq!(raft.term(), TermId(2));
        assert_eq!(raft.lead(), Some(NodeId(2)));
    }
    Ok(())
}

#[test]
fn votes_once_per_term() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);

    raft.step(msg(MessageType::RequestVote, 2, 1, 1))?;
    assert_eq!(raft.vote(), Some(NodeId(2)));
    raft.step(msg(MessageType::RequestVote, 3, 1, 1))?;
    raft.step(msg(MessageType::RequestVote, 2, 1, 1))?;

    let responses: Vec<(NodeId, bool)> = raft
        .take_messages()
        .into_iter()
        .map(|m| {
            assert_eq!(m.msg_type, MessageType::RequestVoteResponse);
            assert_eq!(m.term, TermId(1));
            (m.to, m.reject)
        })
        .collect();
    assert_eq!(
        responses,
        vec![(NodeId(2), false), (NodeId(3), true), (NodeId(2), false)]
    );

    // new term, new vote
    raft.step(msg(MessageType::RequestVote, 3, 1, 2))?;
    assert_eq!(raft.vote(), Some(NodeId(3)));
    assert_eq!(raft.lead(), None);
    Ok(())
}

#[test]
fn vote_refused_to_less_up_to_date_log() -> anyhow::Result<()> {
    let storage = storage_with(&[entry(1, 1), entry(2, 2)], 2, 0);
    let mut raft = new_raft_with_storage(1, &[1, 2, 3], storage);

    // longer log, but of an older term
    let mut request = msg(MessageType::RequestVote, 2, 1, 3);
    request.index = 5;
    request.log_term = TermId(1);
    raft.step(request)?;
    assert!(raft.take_messages()[0].reject);
    assert_eq!(raft.vote(), None);

    let mut request = msg(MessageType::RequestVote, 3, 1, 3);
    request.index = 2;
    request.log_term = TermId(2);
    raft.step(request)?;
    assert!(!raft.take_messages()[0].reject);
    assert_eq!(raft.vote(), Some(NodeId(3)));
    Ok(())
}

#[test]
fn candidate_and_leader_reject_votes_in_current_term() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    raft.step(msg(MessageType::Hup, 1, 1, 0))?;
    raft.take_messages();
    raft.step(msg(MessageType::RequestVote, 2, 1, 1))?;
    assert!(raft.take_messages()[0].reject);

    let mut raft = new_raft(1, &[1, 2, 3]);
    make_leader(&mut raft, 2)?;
    raft.step(msg(MessageType::RequestVote, 3, 1, 1))?;
    let msgs = raft.take_messages();
    assert_eq!(msgs[0].msg_type, MessageType::RequestVoteResponse);
    assert!(msgs[0].reject);
    assert!(raft.is_leader());
    Ok(())
}

#[test]
fn candidate_follows_leader_of_its_term() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    raft.step(msg(MessageType::Hup, 1, 1, 0))?;
    raft.take_messages();

    raft.step(msg(MessageType::Heartbeat, 3, 1, 1))?;
    assert_eq!(raft.state_role(), StateRole::Follower);
    assert_eq!(raft.term(), TermId(1));
    assert_eq!(raft.lead(), Some(NodeId(3)));
    // the vote of this term is kept
    assert_eq!(raft.vote(), Some(NodeId(1)));
    assert_eq!(
        raft.take_messages()[0].msg_type,
        MessageType::HeartbeatResponse
    );
    Ok(())
}

#[test]
fn hup_ignored_by_leader() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    make_leader(&mut raft, 2)?;
    raft.step(msg(MessageType::Hup, 1, 1, 0))?;
    assert!(raft.is_leader());
    assert_eq!(raft.term(), TermId(1));
    assert!(raft.msgs().is_empty());
    Ok(())
}

#[test]
fn non_member_never_campaigns() -> anyhow::Result<()> {
    let mut raft = new_raft(4, &[1, 2, 3]);
    for _ in 0..(4 * ELECTION_TICK) {
        raft.tick()?;
    }
    assert_eq!(raft.state_role(), StateRole::Follower);
    assert_eq!(raft.term(), TermId(0));
    Ok(())
}

#[test]
fn leader_heartbeats_on_heartbeat_tick() -> anyhow::Result<()> {
    let mut raft = new_raft(1, &[1, 2, 3]);
    make_leader(&mut raft, 2)?;

    raft.tick()?;
    let msgs = raft.take_messages();
    assert_eq!(msgs.len(), 2);
    assert!(msgs.iter().all(|m| m.msg_type == MessageType::Heartbeat));
    Ok(())
}

#[test]
fn invalid_config_is_rejected() {
    let config = Config::builder()
        .id(NodeId(1))
        .election_tick(2)
        .heartbeat_tick(2)
        .storage(MemStorage::new())
        .build();
    assert!(matches!(
        Raft::new(config),
        Err(RaftError::Config(ConfigError::ElectionTick))
    ));

    let config = Config::<MemStorage>::builder().id(NodeId(1)).build();
    assert!(matches!(
        Raft::new(config),
        Err(RaftError::Config(ConfigError::MissingStorage))
    ));
}

#[test]
fn network_elects_single_leader() {
    let mut network = Network::new(&[1, 2, 3]);
    network.campaign(1);

    assert!(network.peer(1).is_leader());
    for id in [2, 3] {
        assert_eq!(network.peer(id).state_role(), StateRole::Follower);
        assert_eq!(network.peer(id).lead(), Some(NodeId(1)));
        assert_eq!(network.peer(id).term(), TermId(1));
    }
}

#[test]
fn at_most_one_leader_per_term() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut network = Network::new(&[1, 2, 3, 4, 5]);
    let mut leaders: BTreeMap<TermId, BTreeSet<NodeId>> = BTreeMap::new();

    for round in 0..2000 {
        if round % 50 == 0 {
            network.recover();
            if rng.gen_bool(0.5) {
                network.isolate(rng.gen_range(1..=5));
            }
        }
        network.tick();

        for raft in network.peers.values() {
            if raft.is_leader() {
                leaders.entry(raft.term()).or_default().insert(raft.id());
            }
        }
    }

    assert!(!leaders.is_empty());
    for (term, ids) in leaders {
        assert_eq!(ids.len(), 1, "term {term} had leaders {ids:?}");
    }
}

fn reject(mut msg: raftkv_api::Message) -> raftkv_api::Message {
    msg.reject = true;
    msg
}
