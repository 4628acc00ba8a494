//! Quorum-based leader election.
//!
//! Every member runs the same protocol: canvass log positions, nominate
//! the most advanced member, ballot for a strict majority, replay the
//! uncommitted log suffix, then establish the term once all members are
//! ready. The election is transport-free: inbound messages are fed in by
//! the driver, outbound messages accumulate in an outbox the driver
//! drains, and time only enters through the `now_ns` parameter so that
//! replaying the same inputs is deterministic.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cluster::ballot::{BallotTracker, CanvassTracker, ReadyTracker};
use crate::cluster::errors::ClusterError;
use crate::cluster::message::ConsensusMessage;
use crate::trace::EventRecorder;

/// Restart the canvass if no nomination lands within this window.
pub const CANVASS_TIMEOUT_NS: u64 = 1_000_000_000;

/// A ballot that has not won a majority by this deadline is abandoned
/// and the election restarts at CANVASS with the same pending term.
pub const BALLOT_TIMEOUT_NS: u64 = 1_000_000_000;

/// Per-member randomized addition to election deadlines, reducing the
/// chance of repeated split votes.
pub const BALLOT_JITTER_MAX_NS: u64 = 250_000_000;

/// Election protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Init,
    Canvass,
    Nominate,
    CandidateBallot,
    FollowerBallot,
    LeaderReplay,
    LeaderReady,
    FollowerReplay,
    FollowerReady,
    Closed,
}

impl ElectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ElectionState::Init => "INIT",
            ElectionState::Canvass => "CANVASS",
            ElectionState::Nominate => "NOMINATE",
            ElectionState::CandidateBallot => "CANDIDATE_BALLOT",
            ElectionState::FollowerBallot => "FOLLOWER_BALLOT",
            ElectionState::LeaderReplay => "LEADER_REPLAY",
            ElectionState::LeaderReady => "LEADER_READY",
            ElectionState::FollowerReplay => "FOLLOWER_REPLAY",
            ElectionState::FollowerReady => "FOLLOWER_READY",
            ElectionState::Closed => "CLOSED",
        }
    }
}

/// Destination of an outbound consensus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    Member(i32),
}

/// An outbound consensus message awaiting transmission by the driver.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub target: Target,
    pub message: ConsensusMessage,
}

/// The election state machine for one member.
pub struct Election {
    member_id: i32,
    member_count: u32,
    state: ElectionState,
    /// Last established term. Strictly increasing across established
    /// elections, never reused.
    leadership_term_id: i64,
    /// Pending term during an election: previous term + 1, reused across
    /// failed attempts so that no term number exists without a leader.
    candidate_term_id: i64,
    log_position: i64,
    commit_position: i64,
    leader_member_id: Option<i32>,
    log_session_id: i32,
    /// Vote cast in the current ballot attempt. Released when the
    /// attempt's deadline expires so a same-term retry can converge.
    voted_for: Option<(i64, i32)>,
    canvass: CanvassTracker,
    ballot: BallotTracker,
    ready: ReadyTracker,
    deadline_ns: u64,
    /// Follower: term and start position announced by the new leader.
    announced: Option<(i64, i64)>,
    /// Uncommitted entries between commit and log position, replayed to
    /// followers if this member wins.
    replay_suffix: Vec<(i64, Vec<u8>)>,
    /// Entries received via replay, drained by the driver into its log.
    replayed_inbox: Vec<(i64, Vec<u8>)>,
    outbox: Vec<Outbound>,
    rng: StdRng,
    recorder: EventRecorder,
    established: bool,
}

impl Election {
    /// Create the election for a member.
    ///
    /// `leadership_term_id` is the highest term this member has seen
    /// (persisted across restarts by the caller); `replay_suffix` holds
    /// the uncommitted entries between `commit_position` and
    /// `log_position`.
    pub fn new(
        member_id: i32,
        member_count: u32,
        leadership_term_id: i64,
        log_position: i64,
        commit_position: i64,
        replay_suffix: Vec<(i64, Vec<u8>)>,
    ) -> Self {
        Election {
            member_id,
            member_count,
            state: ElectionState::Init,
            leadership_term_id,
            candidate_term_id: leadership_term_id + 1,
            log_position,
            commit_position,
            leader_member_id: None,
            log_session_id: 0,
            voted_for: None,
            canvass: CanvassTracker::new(member_count),
            ballot: BallotTracker::new(member_count),
            ready: ReadyTracker::new(member_count),
            deadline_ns: 0,
            announced: None,
            replay_suffix,
            replayed_inbox: Vec::new(),
            outbox: Vec::new(),
            rng: StdRng::seed_from_u64(member_id as u64),
            recorder: EventRecorder::new(member_id),
            established: false,
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    pub fn member_id(&self) -> i32 {
        self.member_id
    }

    pub fn leadership_term_id(&self) -> i64 {
        self.leadership_term_id
    }

    pub fn candidate_term_id(&self) -> i64 {
        self.candidate_term_id
    }

    pub fn log_position(&self) -> i64 {
        self.log_position
    }

    pub fn commit_position(&self) -> i64 {
        self.commit_position
    }

    pub fn leader_member_id(&self) -> Option<i32> {
        self.leader_member_id
    }

    /// True once the pending term has been established cluster-wide
    /// from this member's point of view.
    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn is_leader(&self) -> bool {
        self.established && self.leader_member_id == Some(self.member_id)
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    /// Take the outbound messages accumulated since the last drain.
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Take entries received through replay, for the driver's log.
    pub fn drain_replayed(&mut self) -> Vec<(i64, Vec<u8>)> {
        std::mem::take(&mut self.replayed_inbox)
    }

    /// Replace the uncommitted suffix before a re-election.
    pub fn set_replay_suffix(&mut self, replay_suffix: Vec<(i64, Vec<u8>)>) {
        self.replay_suffix = replay_suffix;
    }

    fn transition(&mut self, next: ElectionState) {
        if self.state == next {
            return;
        }
        self.recorder.state_change(self.state.name(), next.name());
        self.state = next;
    }

    fn send_to_all(&mut self, message: ConsensusMessage) {
        self.outbox.push(Outbound {
            target: Target::All,
            message,
        });
    }

    fn send_to(&mut self, member_id: i32, message: ConsensusMessage) {
        self.outbox.push(Outbound {
            target: Target::Member(member_id),
            message,
        });
    }

    fn jittered(&mut self, base_ns: u64, now_ns: u64) -> u64 {
        now_ns + base_ns + self.rng.gen_range(0..BALLOT_JITTER_MAX_NS)
    }

    fn own_canvass_message(&self) -> ConsensusMessage {
        ConsensusMessage::CanvassPosition {
            log_leadership_term_id: self.leadership_term_id,
            log_position: self.log_position,
            follower_member_id: self.member_id,
        }
    }

    fn enter_canvass(&mut self, now_ns: u64) {
        self.canvass.reset();
        self.ballot.reset();
        self.ready.reset();
        self.voted_for = None;
        self.announced = None;
        self.transition(ElectionState::Canvass);
        self.canvass.record(self.member_id, self.log_position);
        let message = self.own_canvass_message();
        self.send_to_all(message);
        self.deadline_ns = self.jittered(CANVASS_TIMEOUT_NS, now_ns);
    }

    /// Advance the protocol using the driver's single clock sample for
    /// this duty-cycle iteration. Returns a work count.
    pub fn do_work(&mut self, now_ns: u64) -> usize {
        match self.state {
            ElectionState::Init => {
                self.enter_canvass(now_ns);
                1
            }
            ElectionState::Canvass => {
                if self.nominate_if_leading() {
                    return 1;
                }
                if now_ns >= self.deadline_ns {
                    self.enter_canvass(now_ns);
                    return 1;
                }
                0
            }
            ElectionState::Nominate => {
                self.begin_ballot(now_ns);
                1
            }
            ElectionState::CandidateBallot | ElectionState::FollowerBallot => {
                if now_ns >= self.deadline_ns {
                    eprintln!(
                        "Member {}: {}",
                        self.member_id,
                        ClusterError::ElectionTimeout {
                            candidate_term_id: self.candidate_term_id,
                        }
                    );
                    self.enter_canvass(now_ns);
                    return 1;
                }
                0
            }
            ElectionState::LeaderReplay => {
                self.replay_and_announce(now_ns);
                1
            }
            ElectionState::LeaderReady => {
                if !self.established && now_ns >= self.deadline_ns {
                    // Not every member became ready in time; retry the
                    // same pending term from the top.
                    self.enter_canvass(now_ns);
                    return 1;
                }
                0
            }
            ElectionState::FollowerReplay => {
                if self.is_caught_up() {
                    self.become_follower_ready(now_ns);
                    return 1;
                }
                if now_ns >= self.deadline_ns {
                    self.enter_canvass(now_ns);
                    return 1;
                }
                0
            }
            ElectionState::FollowerReady | ElectionState::Closed => 0,
        }
    }

    /// From CANVASS: nominate self once a majority has canvassed and we
    /// hold the most advanced log (lowest id on tie). In any other state
    /// a canvass reply is position gossip only; a straggler must not
    /// pull a member out of an open ballot.
    fn nominate_if_leading(&mut self) -> bool {
        if self.state != ElectionState::Canvass || !self.canvass.has_majority() {
            return false;
        }
        match self.canvass.leading_member() {
            Some((member_id, _)) if member_id == self.member_id => {
                self.transition(ElectionState::Nominate);
                true
            }
            _ => false,
        }
    }

    fn begin_ballot(&mut self, now_ns: u64) {
        self.ballot.reset();
        self.voted_for = Some((self.candidate_term_id, self.member_id));
        self.ballot.record_vote(self.member_id, true);
        let request = ConsensusMessage::RequestVote {
            leadership_term_id: self.candidate_term_id,
            log_position: self.log_position,
            candidate_member_id: self.member_id,
        };
        self.send_to_all(request);
        self.transition(ElectionState::CandidateBallot);
        self.deadline_ns = self.jittered(BALLOT_TIMEOUT_NS, now_ns);
        // Single-member cluster: our own vote is already a majority.
        if self.ballot.has_majority() {
            self.transition(ElectionState::LeaderReplay);
        }
    }

    /// Leader path: replay the uncommitted suffix, announce the term and
    /// wait for every member to report ready.
    fn replay_and_announce(&mut self, now_ns: u64) {
        for (log_position, payload) in self.replay_suffix.clone() {
            self.send_to_all(ConsensusMessage::ReplayEntry {
                leadership_term_id: self.candidate_term_id,
                log_position,
                payload,
            });
        }

        self.log_session_id = self.rng.gen();
        let announcement = ConsensusMessage::NewLeadershipTerm {
            log_leadership_term_id: self.leadership_term_id,
            leadership_term_id: self.candidate_term_id,
            log_position: self.log_position,
            timestamp_ns: now_ns,
            leader_member_id: self.member_id,
            log_session_id: self.log_session_id,
        };
        self.send_to_all(announcement);

        self.leader_member_id = Some(self.member_id);
        self.transition(ElectionState::LeaderReady);
        self.deadline_ns = self.jittered(BALLOT_TIMEOUT_NS, now_ns);
        if self.ready.record_ready(self.member_id) {
            self.conclude(now_ns);
        }
    }

    fn is_caught_up(&self) -> bool {
        match self.announced {
            Some((_, position)) => self.log_position >= position,
            None => false,
        }
    }

    fn become_follower_ready(&mut self, now_ns: u64) {
        let (term, position) = match self.announced {
            Some(pair) => pair,
            None => return,
        };
        self.transition(ElectionState::FollowerReady);
        let leader = match self.leader_member_id {
            Some(id) => id,
            None => return,
        };
        self.send_to(
            leader,
            ConsensusMessage::MemberReady {
                leadership_term_id: term,
                log_position: position,
                member_id: self.member_id,
            },
        );
        self.conclude(now_ns);
    }

    /// Establish the pending term. The term counter increments exactly
    /// once per election that reaches a ready state.
    fn conclude(&mut self, now_ns: u64) {
        let previous_term = self.leadership_term_id;
        self.leadership_term_id = self.candidate_term_id;
        // Replay completed cluster-wide; the suffix is now committed.
        self.commit_position = self.log_position;
        self.established = true;
        self.recorder.new_leadership_term(
            previous_term,
            self.leadership_term_id,
            self.log_position,
            now_ns as i64,
            self.leader_member_id.unwrap_or(-1),
            self.log_session_id,
        );
    }

    // =====================================================================
    // INBOUND PROTOCOL MESSAGES
    // =====================================================================

    pub fn on_canvass_position(
        &mut self,
        _log_leadership_term_id: i64,
        log_position: i64,
        follower_member_id: i32,
        _now_ns: u64,
    ) {
        if self.state == ElectionState::Closed {
            return;
        }
        let first_contact = !self.canvass.has(follower_member_id);
        self.canvass.record(follower_member_id, log_position);
        // Reply with our own position the first time we hear from a
        // member so late joiners still converge; replies to known
        // members would ping-pong forever.
        if first_contact {
            let message = self.own_canvass_message();
            self.send_to(follower_member_id, message);
        }
        self.nominate_if_leading();
    }

    pub fn on_request_vote(
        &mut self,
        leadership_term_id: i64,
        log_position: i64,
        candidate_member_id: i32,
        now_ns: u64,
    ) {
        if self.state == ElectionState::Closed {
            return;
        }

        let grant = leadership_term_id > self.leadership_term_id
            && log_position >= self.log_position
            && match self.voted_for {
                Some((term, member)) => {
                    term != leadership_term_id || member == candidate_member_id
                }
                None => true,
            };

        if grant {
            self.voted_for = Some((leadership_term_id, candidate_member_id));
            self.candidate_term_id = leadership_term_id;
            // Granting a vote for a newer term steps an established
            // member (leader included) back into the election.
            self.established = false;
            self.leader_member_id = None;
            self.announced = None;
            self.transition(ElectionState::FollowerBallot);
            self.deadline_ns = self.jittered(BALLOT_TIMEOUT_NS, now_ns);
        }

        self.send_to(
            candidate_member_id,
            ConsensusMessage::Vote {
                candidate_term_id: leadership_term_id,
                log_position: self.log_position,
                candidate_member_id,
                follower_member_id: self.member_id,
                vote: grant,
            },
        );
    }

    pub fn on_vote(
        &mut self,
        candidate_term_id: i64,
        candidate_member_id: i32,
        follower_member_id: i32,
        vote: bool,
        now_ns: u64,
    ) {
        if self.state != ElectionState::CandidateBallot
            || candidate_term_id != self.candidate_term_id
            || candidate_member_id != self.member_id
        {
            return;
        }

        if self.ballot.record_vote(follower_member_id, vote) {
            self.transition(ElectionState::LeaderReplay);
        } else if self.ballot.is_defeated() {
            // A majority has rejected this candidacy; no point waiting
            // for the deadline.
            self.enter_canvass(now_ns);
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_new_leadership_term(
        &mut self,
        _log_leadership_term_id: i64,
        leadership_term_id: i64,
        log_position: i64,
        _timestamp_ns: u64,
        leader_member_id: i32,
        log_session_id: i32,
        now_ns: u64,
    ) {
        if self.state == ElectionState::Closed || leadership_term_id <= self.leadership_term_id {
            return;
        }
        match self.state {
            // A leader mid-establishment only yields to a strictly newer
            // term; only one candidate can win a majority for a term.
            ElectionState::LeaderReplay | ElectionState::LeaderReady
                if leadership_term_id <= self.candidate_term_id =>
            {
                return;
            }
            _ => {}
        }

        self.established = false;
        self.candidate_term_id = leadership_term_id;
        self.leader_member_id = Some(leader_member_id);
        self.log_session_id = log_session_id;
        self.announced = Some((leadership_term_id, log_position));

        if self.log_position >= log_position {
            self.become_follower_ready(now_ns);
        } else {
            self.transition(ElectionState::FollowerReplay);
            self.deadline_ns = self.jittered(BALLOT_TIMEOUT_NS, now_ns);
        }
    }

    pub fn on_replay_entry(
        &mut self,
        leadership_term_id: i64,
        log_position: i64,
        payload: Vec<u8>,
        now_ns: u64,
    ) {
        if self.state == ElectionState::Closed
            || leadership_term_id < self.candidate_term_id
            || log_position <= self.log_position
        {
            return;
        }
        self.log_position = log_position;
        self.replayed_inbox.push((log_position, payload));

        if self.state == ElectionState::FollowerReplay && self.is_caught_up() {
            self.become_follower_ready(now_ns);
        }
    }

    pub fn on_member_ready(
        &mut self,
        leadership_term_id: i64,
        _log_position: i64,
        member_id: i32,
        now_ns: u64,
    ) {
        if self.state != ElectionState::LeaderReady
            || leadership_term_id != self.candidate_term_id
            || self.established
        {
            return;
        }
        if self.ready.record_ready(member_id) {
            self.conclude(now_ns);
        }
    }

    /// Driver detected loss of the steady-state leader: re-enter the
    /// protocol for the next term. The election object persists; only
    /// its per-attempt state resets.
    pub fn on_leader_failure(&mut self, now_ns: u64) {
        if self.state == ElectionState::Closed {
            return;
        }
        eprintln!(
            "Member {}: leader {:?} lost for term {}, starting election for term {}",
            self.member_id,
            self.leader_member_id,
            self.leadership_term_id,
            self.leadership_term_id + 1
        );
        self.established = false;
        self.leader_member_id = None;
        self.candidate_term_id = self.leadership_term_id + 1;
        self.enter_canvass(now_ns);
    }

    /// Node shutdown. Terminal.
    pub fn close(&mut self) {
        if self.state != ElectionState::Closed {
            self.transition(ElectionState::Closed);
        }
    }
}
