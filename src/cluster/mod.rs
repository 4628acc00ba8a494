//! Consensus and Session Management Layer.
//!
//! This module implements leader election and client session handling:
//! - Members canvass log positions and nominate the most advanced member
//! - A candidate wins a leadership term with a strict majority of votes
//! - The leader replays its uncommitted suffix and establishes the term
//!   once every member reports ready
//! - Client sessions attach to the leader through an authenticated
//!   lifecycle and are timed out by a liveness sweep
//!
//! # Invariants
//!
//! 1. **Strictly Increasing Terms**: An established leadership term id is
//!    never reused; failed attempts retry the same pending id.
//! 2. **One Vote per Term**: A member grants at most one candidate its
//!    vote for a given term within a ballot attempt.
//! 3. **Single Clock Sample**: Each duty-cycle iteration observes one
//!    timestamp, keeping runs replayable.
//! 4. **Terminal Close**: A closed session accepts no further
//!    transitions; the first close reason is kept.

pub mod ballot;
pub mod driver;
pub mod election;
pub mod errors;
pub mod message;
pub mod session;

#[cfg(test)]
mod tests;

pub use ballot::{quorum_size, BallotTracker, CanvassTracker, MemberBitset, ReadyTracker};
pub use driver::{
    member_channel, AllowAllAuthenticator, AuthOutcome, Authenticator, ConsensusDriver,
    CONSENSUS_STREAM_ID, HEARTBEAT_INTERVAL_NS, LEADER_LIVENESS_TIMEOUT_NS, SESSION_TIMEOUT_NS,
};
pub use election::{Election, ElectionState, Outbound, Target, BALLOT_TIMEOUT_NS, CANVASS_TIMEOUT_NS};
pub use errors::ClusterError;
pub use message::{ConsensusMessage, EgressMessage, ProtocolMessage, SessionMessage};
pub use session::{CloseReason, ClusterSession, EventCode, SessionState};
