//! Single-threaded consensus driver.
//!
//! One driver runs per member and owns everything that member does:
//! the ingress subscription, the election state machine, the client
//! session table and the steady-state leader duties. `do_work` is the
//! duty cycle; it samples the clock once per iteration (the caller
//! passes `now_ns`) so a run can be replayed deterministically from the
//! same message sequence and timestamps.

use std::collections::{HashMap, VecDeque};

use crate::cluster::election::{Election, Outbound, Target};
use crate::cluster::errors::ClusterError;
use crate::cluster::message::{
    ConsensusMessage, EgressMessage, ProtocolMessage, SessionMessage,
};
use crate::cluster::session::{
    CloseReason, ClusterSession, EventCode, SessionState, MAX_ENCODED_MEMBERSHIP_QUERY_LENGTH,
};
use crate::transport::{Publication, Subscription, Transport, TransportError, BACK_PRESSURED};

/// Stream id carrying consensus and ingress traffic between members.
pub const CONSENSUS_STREAM_ID: i32 = 100;

/// Sessions without client activity for this long are closed with
/// `CloseReason::Timeout`.
pub const SESSION_TIMEOUT_NS: u64 = 10_000_000_000;

/// Interval at which an established leader broadcasts its commit
/// position as a liveness heartbeat.
pub const HEARTBEAT_INTERVAL_NS: u64 = 200_000_000;

/// A follower that has not heard from its leader for this long starts
/// an election for the next term.
pub const LEADER_LIVENESS_TIMEOUT_NS: u64 = 1_500_000_000;

const FRAGMENT_LIMIT: usize = 16;

/// Ingress channel descriptor for a member.
pub fn member_channel(member_id: i32) -> String {
    format!("member-{member_id}")
}

/// Outcome of an authentication step.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// Admit the session, binding the encoded principal to it.
    Authenticate { encoded_principal: Vec<u8> },
    /// Demand proof before admitting.
    Challenge { encoded_challenge: Vec<u8> },
    /// Refuse the session with a diagnostic for the client.
    Reject { detail: String },
}

/// Pluggable session authentication.
pub trait Authenticator {
    fn on_connect_request(
        &mut self,
        session_id: i64,
        encoded_credentials: &[u8],
        now_ns: u64,
    ) -> AuthOutcome;

    fn on_challenge_response(
        &mut self,
        session_id: i64,
        encoded_credentials: &[u8],
        now_ns: u64,
    ) -> AuthOutcome;
}

/// Admits every session, carrying the supplied credentials through as
/// the principal.
#[derive(Debug, Default)]
pub struct AllowAllAuthenticator;

impl Authenticator for AllowAllAuthenticator {
    fn on_connect_request(
        &mut self,
        _session_id: i64,
        encoded_credentials: &[u8],
        _now_ns: u64,
    ) -> AuthOutcome {
        AuthOutcome::Authenticate {
            encoded_principal: encoded_credentials.to_vec(),
        }
    }

    fn on_challenge_response(
        &mut self,
        _session_id: i64,
        encoded_credentials: &[u8],
        _now_ns: u64,
    ) -> AuthOutcome {
        AuthOutcome::Authenticate {
            encoded_principal: encoded_credentials.to_vec(),
        }
    }
}

fn map_transport_error(error: TransportError) -> ClusterError {
    match error {
        TransportError::InvalidChannel { channel } => ClusterError::InvalidChannel { channel },
    }
}

/// The per-member consensus and session driver.
pub struct ConsensusDriver {
    member_id: i32,
    transport: Transport,
    ingress: Subscription,
    peers: HashMap<i32, Publication>,
    election: Election,
    authenticator: Box<dyn Authenticator>,
    sessions: HashMap<i64, ClusterSession>,
    session_order: Vec<i64>,
    next_session_id: i64,
    pending_egress: VecDeque<(i64, EgressMessage)>,
    /// Committed log entries as (position, payload).
    log: Vec<(i64, Vec<u8>)>,
    commit_position: i64,
    last_heartbeat_sent_ns: u64,
    last_leader_seen_ns: u64,
    /// Last term for which leader-change bookkeeping has run.
    last_term_handled: i64,
    closed: bool,
}

impl ConsensusDriver {
    /// Create the driver for a member with an empty log, wiring the
    /// ingress subscription and a publication to each peer.
    pub fn new(
        member_id: i32,
        member_ids: &[i32],
        transport: Transport,
        authenticator: Box<dyn Authenticator>,
    ) -> Result<Self, ClusterError> {
        Self::recover(member_id, member_ids, transport, authenticator, Vec::new(), 0)
    }

    /// Create the driver for a member restarting with a persisted log.
    ///
    /// `log` holds (position, payload) entries in position order; the
    /// entries above `commit_position` form the uncommitted suffix
    /// replayed to followers if this member wins the election.
    pub fn recover(
        member_id: i32,
        member_ids: &[i32],
        transport: Transport,
        authenticator: Box<dyn Authenticator>,
        log: Vec<(i64, Vec<u8>)>,
        commit_position: i64,
    ) -> Result<Self, ClusterError> {
        let ingress = transport
            .add_subscription(&member_channel(member_id), CONSENSUS_STREAM_ID)
            .map_err(map_transport_error)?;

        let mut peers = HashMap::new();
        for &peer_id in member_ids {
            if peer_id == member_id {
                continue;
            }
            let publication = transport
                .add_publication(&member_channel(peer_id), CONSENSUS_STREAM_ID)
                .map_err(map_transport_error)?;
            peers.insert(peer_id, publication);
        }

        let log_position = log.last().map(|(position, _)| *position).unwrap_or(0);
        let suffix: Vec<(i64, Vec<u8>)> = log
            .iter()
            .filter(|(position, _)| *position > commit_position)
            .cloned()
            .collect();
        let election = Election::new(
            member_id,
            member_ids.len() as u32,
            0,
            log_position,
            commit_position,
            suffix,
        );

        Ok(ConsensusDriver {
            member_id,
            transport,
            ingress,
            peers,
            election,
            authenticator,
            sessions: HashMap::new(),
            session_order: Vec::new(),
            next_session_id: 1,
            pending_egress: VecDeque::new(),
            log,
            commit_position,
            last_heartbeat_sent_ns: 0,
            last_leader_seen_ns: 0,
            last_term_handled: 0,
            closed: false,
        })
    }

    pub fn member_id(&self) -> i32 {
        self.member_id
    }

    pub fn election(&self) -> &Election {
        &self.election
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn leadership_term_id(&self) -> i64 {
        self.election.leadership_term_id()
    }

    pub fn leader_member_id(&self) -> Option<i32> {
        self.election.leader_member_id()
    }

    pub fn commit_position(&self) -> i64 {
        self.commit_position
    }

    pub fn session(&self, session_id: i64) -> Option<&ClusterSession> {
        self.sessions.get(&session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// One duty-cycle iteration. Returns the amount of work done so an
    /// outer loop can idle-strategy on zero.
    pub fn do_work(&mut self, now_ns: u64) -> usize {
        if self.closed {
            return 0;
        }
        let mut work = 0;

        work += self.poll_ingress(now_ns);
        work += self.election.do_work(now_ns);
        work += self.flush_outbox();
        work += self.absorb_replayed();

        if self.election.is_established() {
            self.on_term_established(now_ns);
            if self.election.is_leader() {
                work += self.heartbeat(now_ns);
            } else if now_ns.saturating_sub(self.last_leader_seen_ns)
                > LEADER_LIVENESS_TIMEOUT_NS
            {
                self.start_reelection(now_ns);
                work += 1;
            }
        }
        // Sessions are swept regardless of role: a member that lost
        // leadership still times out and reaps what it holds.
        work += self.sweep_sessions(now_ns);

        work += self.offer_new_leader_events();
        work += self.flush_egress();
        work
    }

    /// Close every session and the election. Terminal.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for session in self.sessions.values_mut() {
            session.close(CloseReason::ServiceAction);
        }
        self.election.close();
        self.closed = true;
    }

    // =====================================================================
    // INGRESS
    // =====================================================================

    fn poll_ingress(&mut self, now_ns: u64) -> usize {
        let member_id = self.member_id;
        let mut inbound = Vec::new();
        let mut handler = |buffer: &[u8], offset: usize, length: usize, _header: &_| {
            match ProtocolMessage::deserialize(&buffer[offset..offset + length]) {
                Ok(message) => inbound.push(message),
                Err(error) => {
                    eprintln!("Member {member_id}: undecodable ingress frame: {error}")
                }
            }
        };
        let polled = self.ingress.poll(&mut handler, FRAGMENT_LIMIT);

        for message in inbound {
            match message {
                ProtocolMessage::Consensus(message) => self.on_consensus(message, now_ns),
                ProtocolMessage::Session(message) => self.on_session(message, now_ns),
            }
        }
        polled
    }

    fn is_member(&self, id: i32) -> bool {
        id == self.member_id || self.peers.contains_key(&id)
    }

    fn on_consensus(&mut self, message: ConsensusMessage, now_ns: u64) {
        // Sender ids feed fixed-size membership bitsets; a frame naming
        // a member outside the configured cluster is dropped whole.
        let sender = match &message {
            ConsensusMessage::CanvassPosition {
                follower_member_id, ..
            } => *follower_member_id,
            ConsensusMessage::RequestVote {
                candidate_member_id, ..
            } => *candidate_member_id,
            ConsensusMessage::Vote {
                follower_member_id, ..
            } => *follower_member_id,
            ConsensusMessage::NewLeadershipTerm {
                leader_member_id, ..
            } => *leader_member_id,
            ConsensusMessage::ReplayEntry { .. } => self.member_id,
            ConsensusMessage::MemberReady { member_id, .. } => *member_id,
            ConsensusMessage::CommitPosition {
                leader_member_id, ..
            } => *leader_member_id,
        };
        if !self.is_member(sender) {
            eprintln!(
                "Member {}: dropping consensus frame from unknown member {sender}",
                self.member_id
            );
            return;
        }

        match message {
            ConsensusMessage::CanvassPosition {
                log_leadership_term_id,
                log_position,
                follower_member_id,
            } => self.election.on_canvass_position(
                log_leadership_term_id,
                log_position,
                follower_member_id,
                now_ns,
            ),
            ConsensusMessage::RequestVote {
                leadership_term_id,
                log_position,
                candidate_member_id,
            } => self.election.on_request_vote(
                leadership_term_id,
                log_position,
                candidate_member_id,
                now_ns,
            ),
            ConsensusMessage::Vote {
                candidate_term_id,
                candidate_member_id,
                follower_member_id,
                vote,
                ..
            } => self.election.on_vote(
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
            } => self.election.on_new_leadership_term(
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
            } => self
                .election
                .on_replay_entry(leadership_term_id, log_position, payload, now_ns),
            ConsensusMessage::MemberReady {
                leadership_term_id,
                log_position,
                member_id,
            } => self
                .election
                .on_member_ready(leadership_term_id, log_position, member_id, now_ns),
            ConsensusMessage::CommitPosition {
                leadership_term_id,
                log_position,
                leader_member_id,
            } => {
                if self.election.is_established()
                    && leadership_term_id == self.election.leadership_term_id()
                    && Some(leader_member_id) == self.election.leader_member_id()
                {
                    self.commit_position = self.commit_position.max(log_position);
                    self.last_leader_seen_ns = now_ns;
                }
            }
        }
    }

    // =====================================================================
    // SESSIONS
    // =====================================================================

    fn on_session(&mut self, message: SessionMessage, now_ns: u64) {
        if !self.election.is_established() {
            // No established term: clients must retry once the cluster
            // has a leader.
            return;
        }

        if !self.election.is_leader() {
            match message {
                SessionMessage::Connect {
                    correlation_id,
                    response_stream_id,
                    response_channel,
                    ..
                }
                | SessionMessage::BackupQuery {
                    correlation_id,
                    response_stream_id,
                    response_channel,
                    ..
                } => self.redirect(correlation_id, response_stream_id, &response_channel),
                _ => {}
            }
            return;
        }

        match message {
            SessionMessage::Connect {
                correlation_id,
                response_stream_id,
                response_channel,
                encoded_credentials,
            } => self.on_connect(
                correlation_id,
                response_stream_id,
                &response_channel,
                &encoded_credentials,
                now_ns,
            ),
            SessionMessage::ChallengeResponse {
                correlation_id,
                cluster_session_id,
                encoded_credentials,
            } => self.on_challenge_response(
                correlation_id,
                cluster_session_id,
                &encoded_credentials,
                now_ns,
            ),
            SessionMessage::KeepAlive {
                correlation_id,
                cluster_session_id,
            } => {
                if let Some(session) = self.sessions.get_mut(&cluster_session_id) {
                    session.last_activity_ns(now_ns, correlation_id);
                }
            }
            SessionMessage::Close { cluster_session_id } => {
                if let Some(session) = self.sessions.get_mut(&cluster_session_id) {
                    session.close(CloseReason::ClientAction);
                }
            }
            SessionMessage::BackupQuery {
                correlation_id,
                response_stream_id,
                response_channel,
                encoded_credentials,
            } => self.on_backup_query(
                correlation_id,
                response_stream_id,
                &response_channel,
                &encoded_credentials,
                now_ns,
            ),
        }
    }

    /// Point a client that reached a follower at the leader.
    fn redirect(&self, correlation_id: i64, response_stream_id: i32, response_channel: &str) {
        let leader_member_id = match self.election.leader_member_id() {
            Some(id) => id,
            None => return,
        };
        let mut publication =
            match self.transport.add_publication(response_channel, response_stream_id) {
                Ok(publication) => publication,
                Err(_) => return,
            };
        let event = EgressMessage::SessionEvent {
            correlation_id,
            cluster_session_id: -1,
            leadership_term_id: self.election.leadership_term_id(),
            leader_member_id,
            code: EventCode::Redirect,
            detail: member_channel(leader_member_id),
        };
        let bytes = event.serialize();
        // Best effort: a backpressured redirect is simply retried by the
        // client's next connect attempt.
        publication.offer(&bytes, 0, bytes.len());
    }

    fn on_connect(
        &mut self,
        correlation_id: i64,
        response_stream_id: i32,
        response_channel: &str,
        encoded_credentials: &[u8],
        now_ns: u64,
    ) {
        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let mut session = ClusterSession::new(session_id, response_stream_id, response_channel);
        session.last_activity_ns(now_ns, correlation_id);
        if let Err(error) = session.connect(&self.transport) {
            eprintln!("Member {}: session connect failed: {error}", self.member_id);
            return;
        }
        if session.state() != SessionState::Connected {
            // Unresolvable response channel; nothing to answer on.
            eprintln!(
                "Member {}: dropping connect with invalid response channel {response_channel:?}",
                self.member_id
            );
            return;
        }

        let outcome = self
            .authenticator
            .on_connect_request(session_id, encoded_credentials, now_ns);
        self.sessions.insert(session_id, session);
        self.session_order.push(session_id);
        self.apply_auth_outcome(session_id, correlation_id, outcome, now_ns);
    }

    /// Serve a backup query on a transient flagged session. The session
    /// is swept away once the answer has drained.
    fn on_backup_query(
        &mut self,
        correlation_id: i64,
        response_stream_id: i32,
        response_channel: &str,
        encoded_credentials: &[u8],
        now_ns: u64,
    ) {
        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let mut session = ClusterSession::new(session_id, response_stream_id, response_channel);
        session.last_activity_ns(now_ns, correlation_id);
        session.set_backup_query(true);
        if let Err(error) = session.connect(&self.transport) {
            eprintln!("Member {}: backup query connect failed: {error}", self.member_id);
            return;
        }
        if session.state() != SessionState::Connected {
            eprintln!(
                "Member {}: dropping backup query with invalid response channel {response_channel:?}",
                self.member_id
            );
            return;
        }
        self.sessions.insert(session_id, session);
        self.session_order.push(session_id);

        if encoded_credentials.len() > MAX_ENCODED_MEMBERSHIP_QUERY_LENGTH {
            let error = ClusterError::EncodingTooLarge {
                length: encoded_credentials.len(),
                max: MAX_ENCODED_MEMBERSHIP_QUERY_LENGTH,
            };
            self.reject_session(session_id, correlation_id, EventCode::Error, &error.to_string());
            return;
        }

        let detail = format!(
            "leader={} term={} commit={}",
            self.member_id,
            self.election.leadership_term_id(),
            self.commit_position
        );
        self.pending_egress.push_back((
            session_id,
            EgressMessage::SessionEvent {
                correlation_id,
                cluster_session_id: session_id,
                leadership_term_id: self.election.leadership_term_id(),
                leader_member_id: self.member_id,
                code: EventCode::Ok,
                detail,
            },
        ));
    }

    fn on_challenge_response(
        &mut self,
        correlation_id: i64,
        cluster_session_id: i64,
        encoded_credentials: &[u8],
        now_ns: u64,
    ) {
        let challenged = self
            .sessions
            .get(&cluster_session_id)
            .map(|s| s.state() == SessionState::Challenged)
            .unwrap_or(false);
        if !challenged {
            return;
        }
        let outcome =
            self.authenticator
                .on_challenge_response(cluster_session_id, encoded_credentials, now_ns);
        self.apply_auth_outcome(cluster_session_id, correlation_id, outcome, now_ns);
    }

    fn apply_auth_outcome(
        &mut self,
        session_id: i64,
        correlation_id: i64,
        outcome: AuthOutcome,
        now_ns: u64,
    ) {
        let leadership_term_id = self.election.leadership_term_id();
        let leader_member_id = self.election.leader_member_id().unwrap_or(-1);
        let log_position = self.log.last().map(|(p, _)| *p).unwrap_or(0);

        let session = match self.sessions.get_mut(&session_id) {
            Some(session) => session,
            None => return,
        };
        session.last_activity_ns(now_ns, correlation_id);

        match outcome {
            AuthOutcome::Authenticate { encoded_principal } => {
                let admitted = session
                    .authenticate(&encoded_principal)
                    .and_then(|_| session.open(log_position));
                match admitted {
                    Ok(()) => self.pending_egress.push_back((
                        session_id,
                        EgressMessage::SessionEvent {
                            correlation_id,
                            cluster_session_id: session_id,
                            leadership_term_id,
                            leader_member_id,
                            code: EventCode::Ok,
                            detail: String::new(),
                        },
                    )),
                    Err(error) => {
                        eprintln!(
                            "Member {}: rejecting session {session_id}: {error}",
                            self.member_id
                        );
                        self.reject_session(
                            session_id,
                            correlation_id,
                            EventCode::Error,
                            &error.to_string(),
                        );
                    }
                }
            }
            AuthOutcome::Challenge { encoded_challenge } => match session.challenge() {
                Ok(()) => self.pending_egress.push_back((
                    session_id,
                    EgressMessage::Challenge {
                        correlation_id,
                        cluster_session_id: session_id,
                        encoded_challenge,
                    },
                )),
                Err(error) => {
                    eprintln!(
                        "Member {}: challenge on session {session_id} invalid: {error}",
                        self.member_id
                    );
                    session.close(CloseReason::Error);
                }
            },
            AuthOutcome::Reject { detail } => {
                self.reject_session(
                    session_id,
                    correlation_id,
                    EventCode::AuthenticationRejected,
                    &detail,
                );
            }
        }
    }

    fn reject_session(
        &mut self,
        session_id: i64,
        correlation_id: i64,
        code: EventCode,
        detail: &str,
    ) {
        let leadership_term_id = self.election.leadership_term_id();
        let leader_member_id = self.election.leader_member_id().unwrap_or(-1);

        if let Some(session) = self.sessions.get_mut(&session_id) {
            if let Err(error) = session.reject(code, detail) {
                eprintln!(
                    "Member {}: reject on session {session_id} invalid: {error}",
                    self.member_id
                );
            }
            // The session stays in Rejected until the event has drained;
            // closing now would tear down the response channel first.
            self.pending_egress.push_back((
                session_id,
                EgressMessage::SessionEvent {
                    correlation_id,
                    cluster_session_id: session_id,
                    leadership_term_id,
                    leader_member_id,
                    code,
                    detail: detail.to_string(),
                },
            ));
        }
    }

    /// Close idle sessions and drop closed sessions whose egress has
    /// fully drained.
    fn sweep_sessions(&mut self, now_ns: u64) -> usize {
        let mut work = 0;
        for session in self.sessions.values_mut() {
            if session.state() != SessionState::Closed
                && now_ns.saturating_sub(session.time_of_last_activity_ns()) > SESSION_TIMEOUT_NS
            {
                eprintln!(
                    "Member {}: session {} timed out",
                    self.member_id,
                    session.id()
                );
                session.close(CloseReason::Timeout);
                work += 1;
            }
        }

        let pending: Vec<i64> = self.pending_egress.iter().map(|(id, _)| *id).collect();
        for session in self.sessions.values_mut() {
            // A served backup query closes once its answer is out.
            if session.is_backup_query()
                && session.state() == SessionState::Connected
                && !pending.contains(&session.id())
            {
                session.close(CloseReason::ServiceAction);
                work += 1;
                continue;
            }
            // A rejected session closes once its rejection event is out.
            if session.state() == SessionState::Rejected && !pending.contains(&session.id()) {
                let reason = match session.event_code() {
                    Some(EventCode::AuthenticationRejected) => {
                        CloseReason::AuthenticationRejected
                    }
                    _ => CloseReason::Error,
                };
                session.close(reason);
                work += 1;
            }
        }

        let sessions = &mut self.sessions;
        self.session_order.retain(|id| {
            let drop = sessions
                .get(id)
                .map(|s| s.state() == SessionState::Closed && !pending.contains(id))
                .unwrap_or(true);
            if drop {
                sessions.remove(id);
            }
            !drop
        });
        work
    }

    // =====================================================================
    // STEADY STATE
    // =====================================================================

    /// Bookkeeping that runs once per newly established term.
    fn on_term_established(&mut self, now_ns: u64) {
        let term = self.election.leadership_term_id();
        if term == self.last_term_handled {
            return;
        }
        self.last_term_handled = term;
        self.last_leader_seen_ns = now_ns;
        self.commit_position = self.commit_position.max(self.election.log_position());

        // Every open session learns the new leader, whether this member
        // won or lost the election.
        for session in self.sessions.values_mut() {
            if session.state() == SessionState::Open {
                session.set_new_leader_event_pending(true);
            }
        }
        eprintln!(
            "Member {}: term {} established, leader {:?}",
            self.member_id,
            term,
            self.election.leader_member_id()
        );
    }

    fn heartbeat(&mut self, now_ns: u64) -> usize {
        if now_ns.saturating_sub(self.last_heartbeat_sent_ns) < HEARTBEAT_INTERVAL_NS {
            return 0;
        }
        self.last_heartbeat_sent_ns = now_ns;
        let message = ProtocolMessage::Consensus(ConsensusMessage::CommitPosition {
            leadership_term_id: self.election.leadership_term_id(),
            log_position: self.commit_position,
            leader_member_id: self.member_id,
        });
        let bytes = message.serialize();
        for publication in self.peers.values_mut() {
            publication.offer(&bytes, 0, bytes.len());
        }
        1
    }

    /// Force an election for the next term, as an operator tool would
    /// when inducing a leadership change.
    pub fn trigger_election(&mut self, now_ns: u64) {
        self.start_reelection(now_ns);
    }

    fn start_reelection(&mut self, now_ns: u64) {
        let suffix: Vec<(i64, Vec<u8>)> = self
            .log
            .iter()
            .filter(|(position, _)| *position > self.commit_position)
            .cloned()
            .collect();
        self.election.set_replay_suffix(suffix);
        self.election.on_leader_failure(now_ns);
    }

    // =====================================================================
    // OUTBOUND
    // =====================================================================

    fn flush_outbox(&mut self) -> usize {
        let outbound = self.election.drain_outbox();
        let count = outbound.len();
        for Outbound { target, message } in outbound {
            let bytes = ProtocolMessage::Consensus(message).serialize();
            match target {
                Target::All => {
                    for publication in self.peers.values_mut() {
                        // Consensus traffic is timeout-driven; a dropped
                        // frame is recovered by the next attempt.
                        publication.offer(&bytes, 0, bytes.len());
                    }
                }
                Target::Member(member_id) => {
                    if let Some(publication) = self.peers.get_mut(&member_id) {
                        publication.offer(&bytes, 0, bytes.len());
                    }
                }
            }
        }
        count
    }

    fn absorb_replayed(&mut self) -> usize {
        let replayed = self.election.drain_replayed();
        let count = replayed.len();
        self.log.extend(replayed);
        count
    }

    /// Deliver pending new-leader notifications, leaving the pending
    /// flag set on backpressure so delivery retries next cycle.
    fn offer_new_leader_events(&mut self) -> usize {
        let leadership_term_id = self.election.leadership_term_id();
        let leader_member_id = self.election.leader_member_id().unwrap_or(-1);
        let mut work = 0;
        for session in self.sessions.values_mut() {
            if !session.has_new_leader_event_pending() {
                continue;
            }
            let event = EgressMessage::NewLeaderEvent {
                leadership_term_id,
                cluster_session_id: session.id(),
                leader_member_id,
            };
            let bytes = event.serialize();
            let result = session.offer(&bytes, 0, bytes.len());
            if result >= 0 {
                session.set_new_leader_event_pending(false);
                work += 1;
            } else if result != BACK_PRESSURED {
                // Response channel gone; the liveness sweep will close
                // the session.
                session.set_new_leader_event_pending(false);
            }
        }
        work
    }

    /// Drain queued egress in FIFO order, stopping at the first
    /// backpressured frame to preserve per-session ordering.
    fn flush_egress(&mut self) -> usize {
        let mut work = 0;
        while let Some((session_id, event)) = self.pending_egress.front().cloned() {
            let session = match self.sessions.get_mut(&session_id) {
                Some(session) => session,
                None => {
                    self.pending_egress.pop_front();
                    continue;
                }
            };
            let bytes = event.serialize();
            let result = session.offer(&bytes, 0, bytes.len());
            if result == BACK_PRESSURED {
                break;
            }
            // Sent, or the channel is gone and the event is abandoned.
            self.pending_egress.pop_front();
            work += 1;
        }
        work
    }
}
