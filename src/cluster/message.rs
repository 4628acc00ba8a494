//! Wire protocol for member-to-member consensus and client sessions.
//!
//! Messages are bincode-encoded over the transport. Application command
//! payloads stay opaque byte blobs throughout.

use serde::{Deserialize, Serialize};

use crate::cluster::session::EventCode;

/// Member-to-member election and leadership messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConsensusMessage {
    /// Canvass gossip: a member advertises its log progress so the
    /// cluster can determine who holds the most advanced log.
    CanvassPosition {
        /// Term of the last entry in the sender's log.
        log_leadership_term_id: i64,
        /// Sender's log position.
        log_position: i64,
        /// Sender's member id.
        follower_member_id: i32,
    },

    /// A candidate requests votes for a term.
    RequestVote {
        /// The term being contested (previous established term + 1).
        leadership_term_id: i64,
        /// Candidate's log position; voters only grant a vote to a
        /// candidate at least as advanced as themselves.
        log_position: i64,
        candidate_member_id: i32,
    },

    /// A vote cast in a ballot. `vote == false` rejects a later
    /// candidate of a term already voted in.
    Vote {
        candidate_term_id: i64,
        log_position: i64,
        candidate_member_id: i32,
        follower_member_id: i32,
        vote: bool,
    },

    /// The winning leader announces the new term. Followers validate the
    /// log stream for the term against `log_session_id`.
    NewLeadershipTerm {
        /// Term of the log up to `log_position` (the previous term).
        log_leadership_term_id: i64,
        /// The newly established term.
        leadership_term_id: i64,
        /// Position at which the new term starts.
        log_position: i64,
        /// Leader's clock sample when the term was announced.
        timestamp_ns: u64,
        leader_member_id: i32,
        log_session_id: i32,
    },

    /// One uncommitted log entry replayed to followers between the
    /// previous commit position and the new term's start position.
    ReplayEntry {
        leadership_term_id: i64,
        log_position: i64,
        payload: Vec<u8>,
    },

    /// A member reports it has completed replay and reached its ready
    /// state for the term.
    MemberReady {
        leadership_term_id: i64,
        log_position: i64,
        member_id: i32,
    },

    /// Steady-state leader heartbeat carrying the commit position.
    /// Its absence beyond the liveness timeout triggers a new election.
    CommitPosition {
        leadership_term_id: i64,
        log_position: i64,
        leader_member_id: i32,
    },
}

/// Client-to-cluster session messages (ingress).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Request to attach a new session, naming the response address.
    Connect {
        correlation_id: i64,
        response_stream_id: i32,
        response_channel: String,
        /// Opaque credentials for the authenticator.
        encoded_credentials: Vec<u8>,
    },

    /// Answer to a previously issued challenge.
    ChallengeResponse {
        correlation_id: i64,
        cluster_session_id: i64,
        encoded_credentials: Vec<u8>,
    },

    /// Liveness signal; also carries the request correlation for
    /// response matching.
    KeepAlive {
        correlation_id: i64,
        cluster_session_id: i64,
    },

    /// Client-initiated close.
    Close { cluster_session_id: i64 },

    /// One-shot query of cluster state for backup tooling. Answered with
    /// a session event carrying the leader, term and commit position;
    /// the transient session closes once the answer drains.
    BackupQuery {
        correlation_id: i64,
        response_stream_id: i32,
        response_channel: String,
        encoded_credentials: Vec<u8>,
    },
}

/// Cluster-to-client session messages (egress).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EgressMessage {
    /// Outcome of a session request, including rejections.
    SessionEvent {
        correlation_id: i64,
        cluster_session_id: i64,
        leadership_term_id: i64,
        leader_member_id: i32,
        code: EventCode,
        detail: String,
    },

    /// Authentication challenge with an opaque payload.
    Challenge {
        correlation_id: i64,
        cluster_session_id: i64,
        encoded_challenge: Vec<u8>,
    },

    /// Notifies an open session that leadership has changed.
    NewLeaderEvent {
        leadership_term_id: i64,
        cluster_session_id: i64,
        leader_member_id: i32,
    },
}

/// Everything a member's ingress subscription can deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolMessage {
    Consensus(ConsensusMessage),
    Session(SessionMessage),
}

impl ProtocolMessage {
    /// Serialize to bytes using bincode.
    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("ProtocolMessage serialization should not fail")
    }

    /// Deserialize from bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

impl EgressMessage {
    /// Serialize to bytes using bincode.
    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("EgressMessage serialization should not fail")
    }

    /// Deserialize from bytes.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
