//! Cluster integration tests.
//!
//! Elections are exercised two ways: directly on `Election` values with
//! hand-routed messages (deterministic, lets tests drop traffic), and
//! end-to-end through `ConsensusDriver` instances over the in-memory
//! transport. Time is logical throughout; every iteration advances a
//! fixed step and passes it as the duty-cycle clock sample.

use crate::trace::{
    capture_length, decode_new_leadership_term, decode_state_change, encoded_length,
    state_change_length,
};
use crate::transport::{Header, Publication, Subscription, Transport};

use super::driver::{
    member_channel, AllowAllAuthenticator, AuthOutcome, Authenticator, ConsensusDriver,
    CONSENSUS_STREAM_ID, SESSION_TIMEOUT_NS,
};
use super::election::{Election, ElectionState, Outbound, Target};
use super::message::{ConsensusMessage, EgressMessage, ProtocolMessage, SessionMessage};
use super::session::{EventCode, SessionState};

/// Logical duty-cycle step: 10ms.
const STEP_NS: u64 = 10_000_000;

// =========================================================================
// ELECTION-LEVEL TESTS (hand-routed messages)
// =========================================================================

fn deliver(election: &mut Election, message: ConsensusMessage, now_ns: u64) {
    match message {
        ConsensusMessage::CanvassPosition {
            log_leadership_term_id,
            log_position,
            follower_member_id,
        } => election.on_canvass_position(
            log_leadership_term_id,
            log_position,
            follower_member_id,
            now_ns,
        ),
        ConsensusMessage::RequestVote {
            leadership_term_id,
            log_position,
            candidate_member_id,
        } => election.on_request_vote(leadership_term_id, log_position, candidate_member_id, now_ns),
        ConsensusMessage::Vote {
            candidate_term_id,
            candidate_member_id,
            follower_member_id,
            vote,
            ..
        } => election.on_vote(
            candidate_term_id,
            candidate_member_id,
            follower_member_id,
            vote,
            now_ns,
        ),
        ConsensusMessage::NewLeadershipTerm {
            log_leadership_term_id,
            leadership_term_id,
            log_position,
            timestamp_ns,
            leader_member_id,
            log_session_id,
        } => election.on_new_leadership_term(
            log_leadership_term_id,
            leadership_term_id,
            log_position,
            timestamp_ns,
            leader_member_id,
            log_session_id,
            now_ns,
        ),
        ConsensusMessage::ReplayEntry {
            leadership_term_id,
            log_position,
            payload,
        } => election.on_replay_entry(leadership_term_id, log_position, payload, now_ns),
        ConsensusMessage::MemberReady {
            leadership_term_id,
            log_position,
            member_id,
        } => election.on_member_ready(leadership_term_id, log_position, member_id, now_ns),
        ConsensusMessage::CommitPosition { .. } => {}
    }
}

/// Run the elections for `iterations` steps, routing every outbound
/// message that passes `filter` to its destination in send order.
fn pump_elections_filtered(
    elections: &mut [Election],
    now_ns: &mut u64,
    iterations: usize,
    filter: &dyn Fn(&ConsensusMessage) -> bool,
) {
    let member_ids: Vec<i32> = elections.iter().map(|e| e.member_id()).collect();
    for _ in 0..iterations {
        for election in elections.iter_mut() {
            election.do_work(*now_ns);
        }

        let mut routed: Vec<(i32, ConsensusMessage)> = Vec::new();
        for election in elections.iter_mut() {
            let from = election.member_id();
            for Outbound { target, message } in election.drain_outbox() {
                if !filter(&message) {
                    continue;
                }
                match target {
                    Target::All => {
                        for &id in &member_ids {
                            if id != from {
                                routed.push((id, message.clone()));
                            }
                        }
                    }
                    Target::Member(id) => routed.push((id, message)),
                }
            }
        }
        for (id, message) in routed {
            let election = elections
                .iter_mut()
                .find(|e| e.member_id() == id)
                .expect("routed to unknown member");
            deliver(election, message, *now_ns);
        }

        *now_ns += STEP_NS;
    }
}

fn pump_elections(elections: &mut [Election], now_ns: &mut u64, iterations: usize) {
    pump_elections_filtered(elections, now_ns, iterations, &|_| true);
}

/// Test: test_election_prefers_most_advanced_then_lowest_id
///
/// 3 members with log positions [100, 100, 50] and ids [1, 2, 3].
/// Members 1 and 2 tie on position; the lower id must win the term.
/// The winner replays 50..100 so member 3 can reach ready.
#[test]
fn test_election_prefers_most_advanced_then_lowest_id() {
    let suffix = vec![(75, b"e1".to_vec()), (100, b"e2".to_vec())];
    let mut elections = vec![
        Election::new(1, 3, 0, 100, 50, suffix),
        Election::new(2, 3, 0, 100, 100, Vec::new()),
        Election::new(3, 3, 0, 50, 50, Vec::new()),
    ];
    let mut now_ns = 0;
    pump_elections(&mut elections, &mut now_ns, 50);

    for election in &elections {
        assert!(election.is_established(), "member {} not established", election.member_id());
        assert_eq!(election.leadership_term_id(), 1);
        assert_eq!(election.leader_member_id(), Some(1));
    }
    assert_eq!(elections[0].state(), ElectionState::LeaderReady);
    assert_eq!(elections[1].state(), ElectionState::FollowerReady);
    assert_eq!(elections[2].state(), ElectionState::FollowerReady);
}

/// Test: test_terms_strictly_increase_across_elections
///
/// Establish term 1, fail the leader, establish term 2. Observed
/// established terms must be strictly increasing with no repeats.
#[test]
fn test_terms_strictly_increase_across_elections() {
    let mut elections = vec![
        Election::new(1, 3, 0, 0, 0, Vec::new()),
        Election::new(2, 3, 0, 0, 0, Vec::new()),
        Election::new(3, 3, 0, 0, 0, Vec::new()),
    ];
    let mut now_ns = 0;
    pump_elections(&mut elections, &mut now_ns, 50);
    let first_term = elections[0].leadership_term_id();
    assert_eq!(first_term, 1);

    for election in elections.iter_mut() {
        election.on_leader_failure(now_ns);
    }
    pump_elections(&mut elections, &mut now_ns, 50);

    for election in &elections {
        assert!(election.is_established());
        assert_eq!(election.leadership_term_id(), 2);
    }
}

/// Test: test_failed_ballot_reuses_pending_term
///
/// Drop every RequestVote so ballots time out and the election restarts
/// from CANVASS. When traffic resumes, the established term must still
/// be previous + 1: aborted attempts leave no gap in term numbering.
#[test]
fn test_failed_ballot_reuses_pending_term() {
    let mut elections = vec![
        Election::new(1, 3, 0, 0, 0, Vec::new()),
        Election::new(2, 3, 0, 0, 0, Vec::new()),
        Election::new(3, 3, 0, 0, 0, Vec::new()),
    ];
    let mut now_ns = 0;

    // 2 logical seconds with ballots suppressed: past every deadline.
    pump_elections_filtered(&mut elections, &mut now_ns, 200, &|message| {
        !matches!(message, ConsensusMessage::RequestVote { .. })
    });
    for election in &elections {
        assert!(!election.is_established());
        assert_eq!(election.candidate_term_id(), 1, "pending term must be reused");
        assert_eq!(election.leadership_term_id(), 0);
    }

    pump_elections(&mut elections, &mut now_ns, 300);
    for election in &elections {
        assert!(election.is_established());
        assert_eq!(election.leadership_term_id(), 1);
    }
}

/// Test: test_replay_catches_up_lagging_follower
///
/// The leader holds entries beyond the follower's position. During the
/// election the follower must receive the uncommitted suffix and reach
/// the term's start position before declaring ready.
#[test]
fn test_replay_catches_up_lagging_follower() {
    let suffix = vec![
        (60, b"entry-60".to_vec()),
        (80, b"entry-80".to_vec()),
        (100, b"entry-100".to_vec()),
    ];
    let mut elections = vec![
        Election::new(1, 2, 0, 100, 40, suffix.clone()),
        Election::new(2, 2, 0, 40, 40, Vec::new()),
    ];
    let mut now_ns = 0;
    pump_elections(&mut elections, &mut now_ns, 50);

    assert!(elections[0].is_established());
    assert!(elections[1].is_established());
    assert_eq!(elections[0].leader_member_id(), Some(1));
    assert_eq!(elections[1].log_position(), 100);
    assert_eq!(elections[1].commit_position(), 100);

    let replayed = elections[1].drain_replayed();
    assert_eq!(replayed, suffix);
    // A second drain is empty.
    assert!(elections[1].drain_replayed().is_empty());
}

/// Test: test_follower_votes_once_per_term
///
/// A member grants its vote to the first candidate of a term and
/// explicitly rejects a later candidate of the same term.
#[test]
fn test_follower_votes_once_per_term() {
    let mut election = Election::new(3, 3, 0, 0, 0, Vec::new());
    election.do_work(0);
    election.drain_outbox();

    election.on_request_vote(1, 0, 1, 0);
    let outbound = election.drain_outbox();
    assert!(outbound.iter().any(|o| matches!(
        (&o.target, &o.message),
        (
            Target::Member(1),
            ConsensusMessage::Vote { candidate_member_id: 1, vote: true, .. }
        )
    )));
    assert_eq!(election.state(), ElectionState::FollowerBallot);

    election.on_request_vote(1, 0, 2, 0);
    let outbound = election.drain_outbox();
    assert!(outbound.iter().any(|o| matches!(
        (&o.target, &o.message),
        (
            Target::Member(2),
            ConsensusMessage::Vote { candidate_member_id: 2, vote: false, .. }
        )
    )));
}

/// Test: test_vote_denied_to_less_advanced_candidate
#[test]
fn test_vote_denied_to_less_advanced_candidate() {
    let mut election = Election::new(2, 3, 0, 100, 100, Vec::new());
    election.do_work(0);
    election.drain_outbox();

    // Candidate at position 50 is behind this member's 100.
    election.on_request_vote(1, 50, 3, 0);
    let outbound = election.drain_outbox();
    assert!(outbound.iter().any(|o| matches!(
        &o.message,
        ConsensusMessage::Vote { vote: false, .. }
    )));
    assert_ne!(election.state(), ElectionState::FollowerBallot);
}

/// Test: test_late_canvass_reply_keeps_ballot
///
/// Canvass replies can straggle in after nomination (healed partition,
/// slow member). They are position gossip only: a member in an open
/// ballot must keep its state and its received votes.
#[test]
fn test_late_canvass_reply_keeps_ballot() {
    let mut election = Election::new(1, 3, 0, 100, 100, Vec::new());
    election.do_work(0);
    election.on_canvass_position(0, 100, 2, 0);
    assert_eq!(election.state(), ElectionState::Nominate);
    election.do_work(0);
    assert_eq!(election.state(), ElectionState::CandidateBallot);

    // Straggler reply after the ballot opened.
    election.on_canvass_position(0, 50, 3, 0);
    assert_eq!(election.state(), ElectionState::CandidateBallot);

    // The earlier vote still counts toward the majority.
    election.on_vote(1, 1, 2, true, 0);
    assert_eq!(election.state(), ElectionState::LeaderReplay);
    election.do_work(0);
    assert_eq!(election.state(), ElectionState::LeaderReady);

    // Another straggler while awaiting readiness.
    election.on_canvass_position(0, 100, 3, 0);
    assert_eq!(election.state(), ElectionState::LeaderReady);

    election.on_member_ready(1, 100, 2, 0);
    election.on_member_ready(1, 100, 3, 0);
    assert!(election.is_established());
    assert_eq!(election.leadership_term_id(), 1);
}

/// Test: test_leader_trace_records_election_path
///
/// The winning member's recorder must hold one state-change record per
/// transition on the leader path, then a new-leadership-term record,
/// all with monotonic tags.
#[test]
fn test_leader_trace_records_election_path() {
    let mut elections = vec![
        Election::new(1, 3, 0, 0, 0, Vec::new()),
        Election::new(2, 3, 0, 0, 0, Vec::new()),
        Election::new(3, 3, 0, 0, 0, Vec::new()),
    ];
    let mut now_ns = 0;
    pump_elections(&mut elections, &mut now_ns, 50);
    assert!(elections[0].is_established());

    let transitions = [
        ("INIT", "CANVASS"),
        ("CANVASS", "NOMINATE"),
        ("NOMINATE", "CANDIDATE_BALLOT"),
        ("CANDIDATE_BALLOT", "LEADER_REPLAY"),
        ("LEADER_REPLAY", "LEADER_READY"),
    ];
    let recorder = elections[0].recorder();
    assert_eq!(recorder.record_count(), transitions.len() + 1);

    let buffer = recorder.records();
    let mut offset = 0;
    let mut previous_tag = 0;
    for (from, to) in transitions {
        let record = decode_state_change(buffer, offset).unwrap();
        assert_eq!(record.payload, format!("{from} -> {to}"));
        assert_eq!(record.member_id, 1);
        assert!(record.tag > previous_tag);
        previous_tag = record.tag;
        offset += encoded_length(capture_length(state_change_length(from, to)));
    }

    let record = decode_new_leadership_term(buffer, offset).unwrap();
    assert_eq!(record.log_leadership_term_id, 0);
    assert_eq!(record.leadership_term_id, 1);
    assert_eq!(record.leader_member_id, 1);
    assert!(record.tag > previous_tag);
}

// =========================================================================
// DRIVER-LEVEL TESTS (in-memory transport)
// =========================================================================

struct TestCluster {
    transport: Transport,
    drivers: Vec<ConsensusDriver>,
    now_ns: u64,
}

impl TestCluster {
    fn new(member_ids: &[i32]) -> Self {
        Self::with_authenticator(member_ids, || Box::new(AllowAllAuthenticator))
    }

    fn with_authenticator<F>(member_ids: &[i32], authenticator: F) -> Self
    where
        F: Fn() -> Box<dyn Authenticator>,
    {
        let transport = Transport::new();
        let drivers = member_ids
            .iter()
            .map(|&id| {
                ConsensusDriver::new(id, member_ids, transport.clone(), authenticator())
                    .expect("driver construction")
            })
            .collect();
        TestCluster {
            transport,
            drivers,
            now_ns: 0,
        }
    }

    fn pump(&mut self, iterations: usize, step_ns: u64) {
        for _ in 0..iterations {
            for driver in self.drivers.iter_mut() {
                driver.do_work(self.now_ns);
            }
            self.now_ns += step_ns;
        }
    }

    /// Pump until every member has an established term.
    fn establish(&mut self) {
        self.pump(100, STEP_NS);
        for driver in &self.drivers {
            assert!(
                driver.election().is_established(),
                "member {} failed to establish",
                driver.member_id()
            );
        }
    }

    fn leader(&mut self) -> &mut ConsensusDriver {
        self.drivers
            .iter_mut()
            .find(|d| d.is_leader())
            .expect("no leader")
    }
}

struct TestClient {
    egress: Subscription,
    to_member: Publication,
}

impl TestClient {
    fn new(
        transport: &Transport,
        member_id: i32,
        response_channel: &str,
        response_stream_id: i32,
    ) -> Self {
        let egress = transport
            .add_subscription(response_channel, response_stream_id)
            .expect("egress subscription");
        let to_member = transport
            .add_publication(&member_channel(member_id), CONSENSUS_STREAM_ID)
            .expect("ingress publication");
        TestClient { egress, to_member }
    }

    fn send(&mut self, message: SessionMessage) {
        let bytes = ProtocolMessage::Session(message).serialize();
        let result = self.to_member.offer(&bytes, 0, bytes.len());
        assert!(result >= 0, "ingress offer failed: {result}");
    }

    fn drain(&mut self) -> Vec<EgressMessage> {
        let mut events = Vec::new();
        let mut handler = |buffer: &[u8], offset: usize, length: usize, _header: &Header| {
            events.push(
                EgressMessage::deserialize(&buffer[offset..offset + length])
                    .expect("undecodable egress"),
            );
        };
        self.egress.poll(&mut handler, 64);
        events
    }
}

/// Test: test_cluster_elects_single_leader
///
/// 3 drivers over the transport converge on exactly one leader and
/// agree on the term.
#[test]
fn test_cluster_elects_single_leader() {
    let mut cluster = TestCluster::new(&[1, 2, 3]);
    cluster.establish();

    let leaders: Vec<i32> = cluster
        .drivers
        .iter()
        .filter(|d| d.is_leader())
        .map(|d| d.member_id())
        .collect();
    assert_eq!(leaders.len(), 1);
    let leader_id = leaders[0];
    for driver in &cluster.drivers {
        assert_eq!(driver.leadership_term_id(), 1);
        assert_eq!(driver.leader_member_id(), Some(leader_id));
    }
}

/// Test: test_client_session_opens_on_leader
///
/// 1. Elect a leader
/// 2. Client connects with credentials to the leader
/// 3. Client receives a SessionEvent(OK) carrying the session id
/// 4. The leader holds the session in OPEN
#[test]
fn test_client_session_opens_on_leader() {
    let mut cluster = TestCluster::new(&[1, 2, 3]);
    cluster.establish();
    let leader_id = cluster.leader().member_id();

    let mut client = TestClient::new(&cluster.transport, leader_id, "client-7", 5);
    client.send(SessionMessage::Connect {
        correlation_id: 99,
        response_stream_id: 5,
        response_channel: "client-7".to_string(),
        encoded_credentials: b"alice".to_vec(),
    });
    cluster.pump(5, STEP_NS);

    let events = client.drain();
    let session_id = match events.as_slice() {
        [EgressMessage::SessionEvent {
            correlation_id: 99,
            cluster_session_id,
            code: EventCode::Ok,
            ..
        }] => *cluster_session_id,
        other => panic!("expected SessionEvent(OK), got {other:?}"),
    };

    let leader = cluster.leader();
    let session = leader.session(session_id).expect("session missing");
    assert_eq!(session.state(), SessionState::Open);
    assert!(session.encoded_principal().is_empty());
}

/// Test: test_connect_to_follower_redirects
#[test]
fn test_connect_to_follower_redirects() {
    let mut cluster = TestCluster::new(&[1, 2, 3]);
    cluster.establish();
    let leader_id = cluster.leader().member_id();
    let follower_id = cluster
        .drivers
        .iter()
        .map(|d| d.member_id())
        .find(|&id| id != leader_id)
        .unwrap();

    let mut client = TestClient::new(&cluster.transport, follower_id, "client-8", 5);
    client.send(SessionMessage::Connect {
        correlation_id: 11,
        response_stream_id: 5,
        response_channel: "client-8".to_string(),
        encoded_credentials: Vec::new(),
    });
    cluster.pump(5, STEP_NS);

    let events = client.drain();
    match events.as_slice() {
        [EgressMessage::SessionEvent {
            correlation_id: 11,
            code: EventCode::Redirect,
            leader_member_id,
            detail,
            ..
        }] => {
            assert_eq!(*leader_member_id, leader_id);
            assert_eq!(detail, &member_channel(leader_id));
        }
        other => panic!("expected redirect, got {other:?}"),
    }
    // No session was created on the follower.
    for driver in &cluster.drivers {
        assert_eq!(driver.session_count(), 0);
    }
}

/// Test: test_session_times_out_without_keepalive
#[test]
fn test_session_times_out_without_keepalive() {
    let mut cluster = TestCluster::new(&[1, 2, 3]);
    cluster.establish();
    let leader_id = cluster.leader().member_id();

    let mut client = TestClient::new(&cluster.transport, leader_id, "client-9", 5);
    client.send(SessionMessage::Connect {
        correlation_id: 1,
        response_stream_id: 5,
        response_channel: "client-9".to_string(),
        encoded_credentials: Vec::new(),
    });
    cluster.pump(5, STEP_NS);
    assert_eq!(cluster.leader().session_count(), 1);

    // Advance past the session timeout in 1s steps; heartbeats keep the
    // term up while the idle session expires.
    cluster.pump((SESSION_TIMEOUT_NS / 1_000_000_000) as usize + 3, 1_000_000_000);
    assert_eq!(cluster.leader().session_count(), 0);
}

/// Test: test_keepalive_defers_timeout
#[test]
fn test_keepalive_defers_timeout() {
    let mut cluster = TestCluster::new(&[1, 2, 3]);
    cluster.establish();
    let leader_id = cluster.leader().member_id();

    let mut client = TestClient::new(&cluster.transport, leader_id, "client-10", 5);
    client.send(SessionMessage::Connect {
        correlation_id: 1,
        response_stream_id: 5,
        response_channel: "client-10".to_string(),
        encoded_credentials: Vec::new(),
    });
    cluster.pump(5, STEP_NS);
    let events = client.drain();
    let session_id = match events.as_slice() {
        [EgressMessage::SessionEvent {
            cluster_session_id, ..
        }] => *cluster_session_id,
        other => panic!("expected session event, got {other:?}"),
    };

    // 15 logical seconds, keepalive every second.
    for i in 0..15 {
        client.send(SessionMessage::KeepAlive {
            correlation_id: 100 + i,
            cluster_session_id: session_id,
        });
        cluster.pump(1, 1_000_000_000);
    }
    let leader = cluster.leader();
    assert_eq!(leader.session(session_id).unwrap().state(), SessionState::Open);
}

/// Test: test_client_close_removes_session
#[test]
fn test_client_close_removes_session() {
    let mut cluster = TestCluster::new(&[1]);
    cluster.establish();

    let mut client = TestClient::new(&cluster.transport, 1, "client-11", 5);
    client.send(SessionMessage::Connect {
        correlation_id: 1,
        response_stream_id: 5,
        response_channel: "client-11".to_string(),
        encoded_credentials: Vec::new(),
    });
    cluster.pump(5, STEP_NS);
    let session_id = match client.drain().as_slice() {
        [EgressMessage::SessionEvent {
            cluster_session_id, ..
        }] => *cluster_session_id,
        other => panic!("expected session event, got {other:?}"),
    };

    client.send(SessionMessage::Close {
        cluster_session_id: session_id,
    });
    cluster.pump(5, STEP_NS);
    assert_eq!(cluster.leader().session_count(), 0);
}

struct RejectingAuthenticator;

impl Authenticator for RejectingAuthenticator {
    fn on_connect_request(&mut self, _: i64, _: &[u8], _: u64) -> AuthOutcome {
        AuthOutcome::Reject {
            detail: "credentials required".to_string(),
        }
    }

    fn on_challenge_response(&mut self, _: i64, _: &[u8], _: u64) -> AuthOutcome {
        AuthOutcome::Reject {
            detail: "credentials required".to_string(),
        }
    }
}

/// Test: test_rejected_session_receives_event_before_close
///
/// A rejected client must still receive the rejection event: the
/// session's response channel stays up until the event drains, then the
/// session closes and is removed.
#[test]
fn test_rejected_session_receives_event_before_close() {
    let mut cluster =
        TestCluster::with_authenticator(&[1], || Box::new(RejectingAuthenticator));
    cluster.establish();

    let mut client = TestClient::new(&cluster.transport, 1, "client-12", 5);
    client.send(SessionMessage::Connect {
        correlation_id: 42,
        response_stream_id: 5,
        response_channel: "client-12".to_string(),
        encoded_credentials: Vec::new(),
    });
    cluster.pump(5, STEP_NS);

    let events = client.drain();
    match events.as_slice() {
        [EgressMessage::SessionEvent {
            correlation_id: 42,
            code: EventCode::AuthenticationRejected,
            detail,
            ..
        }] => assert_eq!(detail, "credentials required"),
        other => panic!("expected rejection event, got {other:?}"),
    }
    cluster.pump(5, STEP_NS);
    assert_eq!(cluster.leader().session_count(), 0);
}

/// Challenges every connect; admits only the response "open sesame".
struct PasswordAuthenticator;

impl Authenticator for PasswordAuthenticator {
    fn on_connect_request(&mut self, _: i64, _: &[u8], _: u64) -> AuthOutcome {
        AuthOutcome::Challenge {
            encoded_challenge: b"password?".to_vec(),
        }
    }

    fn on_challenge_response(&mut self, _: i64, credentials: &[u8], _: u64) -> AuthOutcome {
        if credentials == b"open sesame" {
            AuthOutcome::Authenticate {
                encoded_principal: credentials.to_vec(),
            }
        } else {
            AuthOutcome::Reject {
                detail: "bad password".to_string(),
            }
        }
    }
}

/// Test: test_challenge_roundtrip_admits_session
#[test]
fn test_challenge_roundtrip_admits_session() {
    let mut cluster = TestCluster::with_authenticator(&[1], || Box::new(PasswordAuthenticator));
    cluster.establish();

    let mut client = TestClient::new(&cluster.transport, 1, "client-13", 5);
    client.send(SessionMessage::Connect {
        correlation_id: 7,
        response_stream_id: 5,
        response_channel: "client-13".to_string(),
        encoded_credentials: Vec::new(),
    });
    cluster.pump(5, STEP_NS);

    let events = client.drain();
    let session_id = match events.as_slice() {
        [EgressMessage::Challenge {
            correlation_id: 7,
            cluster_session_id,
            encoded_challenge,
        }] => {
            assert_eq!(encoded_challenge, b"password?");
            *cluster_session_id
        }
        other => panic!("expected challenge, got {other:?}"),
    };
    assert_eq!(
        cluster.leader().session(session_id).unwrap().state(),
        SessionState::Challenged
    );

    client.send(SessionMessage::ChallengeResponse {
        correlation_id: 8,
        cluster_session_id: session_id,
        encoded_credentials: b"open sesame".to_vec(),
    });
    cluster.pump(5, STEP_NS);

    let events = client.drain();
    match events.as_slice() {
        [EgressMessage::SessionEvent {
            correlation_id: 8,
            code: EventCode::Ok,
            ..
        }] => {}
        other => panic!("expected SessionEvent(OK), got {other:?}"),
    }
    assert_eq!(
        cluster.leader().session(session_id).unwrap().state(),
        SessionState::Open
    );
}

/// Test: test_induced_election_notifies_open_sessions
///
/// Re-electing the same member for a new term must bump the term and
/// deliver a NewLeaderEvent to each open session.
#[test]
fn test_induced_election_notifies_open_sessions() {
    let mut cluster = TestCluster::new(&[1]);
    cluster.establish();
    assert_eq!(cluster.leader().leadership_term_id(), 1);

    let mut client = TestClient::new(&cluster.transport, 1, "client-14", 5);
    client.send(SessionMessage::Connect {
        correlation_id: 1,
        response_stream_id: 5,
        response_channel: "client-14".to_string(),
        encoded_credentials: Vec::new(),
    });
    cluster.pump(5, STEP_NS);
    let session_id = match client.drain().as_slice() {
        [EgressMessage::SessionEvent {
            cluster_session_id, ..
        }] => *cluster_session_id,
        other => panic!("expected session event, got {other:?}"),
    };

    let now_ns = cluster.now_ns;
    cluster.leader().trigger_election(now_ns);
    cluster.pump(20, STEP_NS);

    assert_eq!(cluster.leader().leadership_term_id(), 2);
    let events = client.drain();
    match events.as_slice() {
        [EgressMessage::NewLeaderEvent {
            leadership_term_id: 2,
            cluster_session_id,
            leader_member_id: 1,
        }] => assert_eq!(*cluster_session_id, session_id),
        other => panic!("expected NewLeaderEvent, got {other:?}"),
    }
    // The session survived the leadership change.
    assert_eq!(
        cluster.leader().session(session_id).unwrap().state(),
        SessionState::Open
    );
}

/// Test: test_backup_query_answers_and_closes
///
/// A backup query is served on a transient session: one event carrying
/// the leader, term and commit position, then the session goes away.
#[test]
fn test_backup_query_answers_and_closes() {
    let mut cluster = TestCluster::new(&[1]);
    cluster.establish();

    let mut client = TestClient::new(&cluster.transport, 1, "backup-client", 5);
    client.send(SessionMessage::BackupQuery {
        correlation_id: 3,
        response_stream_id: 5,
        response_channel: "backup-client".to_string(),
        encoded_credentials: Vec::new(),
    });
    cluster.pump(5, STEP_NS);

    let events = client.drain();
    match events.as_slice() {
        [EgressMessage::SessionEvent {
            correlation_id: 3,
            code: EventCode::Ok,
            leadership_term_id: 1,
            leader_member_id: 1,
            detail,
            ..
        }] => assert!(detail.contains("term=1"), "unexpected detail {detail:?}"),
        other => panic!("expected backup answer, got {other:?}"),
    }
    cluster.pump(5, STEP_NS);
    assert_eq!(cluster.leader().session_count(), 0);
}

/// Test: test_leadership_transfer_notifies_former_leaders_sessions
///
/// 1. Member 2 recovers the most advanced log and wins term 1
/// 2. A client opens a session against member 2
/// 3. All members induce an election; replay has equalized the logs, so
///    the tie-break hands term 2 to member 1
/// 4. The open session on member 2, now a follower, receives a
///    NewLeaderEvent naming member 1 and later times out under the
///    follower's sweep
#[test]
fn test_leadership_transfer_notifies_former_leaders_sessions() {
    let member_ids = [1, 2, 3];
    let transport = Transport::new();
    let log = vec![(50, b"cmd-a".to_vec()), (100, b"cmd-b".to_vec())];
    let mut drivers: Vec<ConsensusDriver> = member_ids
        .iter()
        .map(|&id| {
            let driver = if id == 2 {
                ConsensusDriver::recover(
                    id,
                    &member_ids,
                    transport.clone(),
                    Box::new(AllowAllAuthenticator),
                    log.clone(),
                    0,
                )
            } else {
                ConsensusDriver::new(
                    id,
                    &member_ids,
                    transport.clone(),
                    Box::new(AllowAllAuthenticator),
                )
            };
            driver.expect("driver construction")
        })
        .collect();

    let mut now_ns: u64 = 0;
    let pump = |drivers: &mut Vec<ConsensusDriver>,
                    now_ns: &mut u64,
                    iterations: usize,
                    step_ns: u64| {
        for _ in 0..iterations {
            for driver in drivers.iter_mut() {
                driver.do_work(*now_ns);
            }
            *now_ns += step_ns;
        }
    };

    pump(&mut drivers, &mut now_ns, 100, STEP_NS);
    assert!(drivers[1].is_leader(), "most advanced log must lead term 1");
    assert_eq!(drivers[1].leadership_term_id(), 1);

    let mut client = TestClient::new(&transport, 2, "client-15", 5);
    client.send(SessionMessage::Connect {
        correlation_id: 1,
        response_stream_id: 5,
        response_channel: "client-15".to_string(),
        encoded_credentials: Vec::new(),
    });
    pump(&mut drivers, &mut now_ns, 5, STEP_NS);
    let session_id = match client.drain().as_slice() {
        [EgressMessage::SessionEvent {
            cluster_session_id, ..
        }] => *cluster_session_id,
        other => panic!("expected session event, got {other:?}"),
    };

    let trigger_ns = now_ns;
    for driver in drivers.iter_mut() {
        driver.trigger_election(trigger_ns);
    }
    pump(&mut drivers, &mut now_ns, 100, STEP_NS);

    assert!(drivers[0].is_leader(), "tie on position falls to the lowest id");
    for driver in &drivers {
        assert_eq!(driver.leadership_term_id(), 2);
        assert_eq!(driver.leader_member_id(), Some(1));
    }

    let events = client.drain();
    match events.as_slice() {
        [EgressMessage::NewLeaderEvent {
            leadership_term_id: 2,
            cluster_session_id,
            leader_member_id: 1,
        }] => assert_eq!(*cluster_session_id, session_id),
        other => panic!("expected NewLeaderEvent, got {other:?}"),
    }

    // The idle session on the former leader is swept by timeout even
    // though member 2 no longer leads.
    assert_eq!(drivers[1].session_count(), 1);
    pump(&mut drivers, &mut now_ns, 13, 1_000_000_000);
    assert_eq!(drivers[1].session_count(), 0);
}

/// Test: test_unknown_member_frames_are_dropped
///
/// Consensus frames naming a member outside the configured cluster are
/// discarded before they reach the membership trackers; the election
/// proceeds normally around them.
#[test]
fn test_unknown_member_frames_are_dropped() {
    let mut cluster = TestCluster::new(&[1, 2, 3]);
    let mut rogue = cluster
        .transport
        .add_publication(&member_channel(1), CONSENSUS_STREAM_ID)
        .expect("rogue publication");

    let canvass = ProtocolMessage::Consensus(ConsensusMessage::CanvassPosition {
        log_leadership_term_id: 0,
        log_position: 1_000_000,
        follower_member_id: -5,
    })
    .serialize();
    assert!(rogue.offer(&canvass, 0, canvass.len()) > 0);

    let vote = ProtocolMessage::Consensus(ConsensusMessage::Vote {
        candidate_term_id: 1,
        log_position: 0,
        candidate_member_id: 1,
        follower_member_id: 99,
        vote: true,
    })
    .serialize();
    assert!(rogue.offer(&vote, 0, vote.len()) > 0);

    cluster.establish();
    assert_eq!(cluster.leader().leadership_term_id(), 1);
}

/// Test: test_commit_position_advances_on_followers
///
/// The leader's heartbeat must carry its commit position to followers.
#[test]
fn test_commit_position_advances_on_followers() {
    let mut cluster = TestCluster::new(&[1, 2, 3]);
    cluster.establish();
    // Many heartbeat intervals pass.
    cluster.pump(100, STEP_NS);

    let leader_commit = cluster.leader().commit_position();
    for driver in &cluster.drivers {
        assert_eq!(driver.commit_position(), leader_commit);
    }
}
