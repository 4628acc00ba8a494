//! Per-client cluster session state machine.
//!
//! A session tracks one client's journey through connection,
//! authentication, activation and closure. All transitions go through
//! named operations that validate the current state first; the session
//! itself never reads a clock and never times anything out — liveness is
//! the driver's job, fed by `last_activity_ns`.

use serde::{Deserialize, Serialize};

use crate::cluster::errors::ClusterError;
use crate::transport::{BufferClaim, Publication, Transport, NOT_CONNECTED};

/// Maximum encoded authentication principal accepted from a client.
pub const MAX_ENCODED_PRINCIPAL_LENGTH: usize = 4 * 1024;

/// Maximum encoded membership-query payload accepted from a client.
pub const MAX_ENCODED_MEMBERSHIP_QUERY_LENGTH: usize = 4 * 1024;

/// Sentinel for `opened_log_position` before the session is OPEN.
pub const NULL_POSITION: i64 = -1;

/// Session lifecycle states.
///
/// `Closed` is terminal: every transition attempted out of it is a
/// silent no-op rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connected,
    Challenged,
    Authenticated,
    Rejected,
    Open,
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Init => "INIT",
            SessionState::Connected => "CONNECTED",
            SessionState::Challenged => "CHALLENGED",
            SessionState::Authenticated => "AUTHENTICATED",
            SessionState::Rejected => "REJECTED",
            SessionState::Open => "OPEN",
            SessionState::Closed => "CLOSED",
        }
    }
}

/// Wire-visible reason recorded when a session reaches `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    None,
    ClientAction,
    Timeout,
    Error,
    ServiceAction,
    AuthenticationRejected,
    StandbySnapshot,
}

/// Wire-visible diagnostic code carried on session events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCode {
    Ok,
    Error,
    Redirect,
    AuthenticationRejected,
    Closed,
}

/// The explicit session transition graph.
///
/// `Closed` as a source is handled by the caller (no-op); it never
/// appears on the left here.
fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    match (from, to) {
        (_, Closed) => true,
        (Init, Connected) => true,
        (Connected, Challenged) => true,
        (Connected, Authenticated) => true,
        (Challenged, Authenticated) => true,
        (Authenticated, Open) => true,
        // Any pre-OPEN state may be rejected; re-rejecting refreshes the
        // diagnostic payload.
        (Init | Connected | Challenged | Authenticated | Rejected, Rejected) => true,
        _ => false,
    }
}

/// A single client session attached to the cluster.
pub struct ClusterSession {
    id: i64,
    correlation_id: i64,
    opened_log_position: i64,
    time_of_last_activity_ns: u64,
    response_stream_id: i32,
    response_channel: String,
    response_publication: Option<Publication>,
    state: SessionState,
    close_reason: CloseReason,
    encoded_principal: Vec<u8>,
    event_code: Option<EventCode>,
    response_detail: Option<String>,
    has_new_leader_event_pending: bool,
    is_backup_query: bool,
}

impl ClusterSession {
    pub fn new(session_id: i64, response_stream_id: i32, response_channel: &str) -> Self {
        ClusterSession {
            id: session_id,
            correlation_id: 0,
            opened_log_position: NULL_POSITION,
            time_of_last_activity_ns: 0,
            response_stream_id,
            response_channel: response_channel.to_string(),
            response_publication: None,
            state: SessionState::Init,
            close_reason: CloseReason::None,
            encoded_principal: Vec::new(),
            event_code: None,
            response_detail: None,
            has_new_leader_event_pending: false,
            is_backup_query: false,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn close_reason(&self) -> CloseReason {
        self.close_reason
    }

    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    pub fn opened_log_position(&self) -> i64 {
        self.opened_log_position
    }

    pub fn time_of_last_activity_ns(&self) -> u64 {
        self.time_of_last_activity_ns
    }

    pub fn response_stream_id(&self) -> i32 {
        self.response_stream_id
    }

    pub fn response_channel(&self) -> &str {
        &self.response_channel
    }

    pub fn encoded_principal(&self) -> &[u8] {
        &self.encoded_principal
    }

    pub fn event_code(&self) -> Option<EventCode> {
        self.event_code
    }

    pub fn response_detail(&self) -> Option<&str> {
        self.response_detail.as_deref()
    }

    pub fn has_new_leader_event_pending(&self) -> bool {
        self.has_new_leader_event_pending
    }

    pub fn set_new_leader_event_pending(&mut self, pending: bool) {
        self.has_new_leader_event_pending = pending;
    }

    pub fn is_backup_query(&self) -> bool {
        self.is_backup_query
    }

    pub fn set_backup_query(&mut self, is_backup_query: bool) {
        self.is_backup_query = is_backup_query;
    }

    pub fn is_response_connected(&self) -> bool {
        self.response_publication
            .as_ref()
            .map(|p| p.is_connected())
            .unwrap_or(false)
    }

    /// Apply a validated transition. From `Closed` everything is a no-op.
    fn transition(&mut self, to: SessionState) -> Result<(), ClusterError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if !is_valid_transition(self.state, to) {
            return Err(ClusterError::InvalidTransition {
                from: self.state.name(),
                to: to.name(),
            });
        }
        self.state = to;
        Ok(())
    }

    /// Establish the outbound response channel.
    ///
    /// An unresolvable channel descriptor is non-fatal: the session keeps
    /// no response publication and the call is a no-op that may be
    /// retried. Calling connect on an already-connected session is a
    /// programmer error.
    pub fn connect(&mut self, transport: &Transport) -> Result<(), ClusterError> {
        if self.response_publication.is_some() {
            return Err(ClusterError::AlreadyConnected { session_id: self.id });
        }

        match transport.add_publication(&self.response_channel, self.response_stream_id) {
            Ok(publication) => {
                self.response_publication = Some(publication);
                if self.state == SessionState::Init {
                    self.transition(SessionState::Connected)?;
                }
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    /// Release the response channel without changing state. Safe to call
    /// on an already-disconnected session.
    pub fn disconnect(&mut self) {
        if let Some(mut publication) = self.response_publication.take() {
            publication.close();
        }
    }

    /// Mark the session as awaiting a challenge response.
    pub fn challenge(&mut self) -> Result<(), ClusterError> {
        self.transition(SessionState::Challenged)
    }

    /// Accept the client's identity. Only valid from `Connected` or
    /// `Challenged`. An oversized principal fails without touching state;
    /// the caller is expected to reject the session separately.
    pub fn authenticate(&mut self, encoded_principal: &[u8]) -> Result<(), ClusterError> {
        if encoded_principal.len() > MAX_ENCODED_PRINCIPAL_LENGTH {
            return Err(ClusterError::EncodingTooLarge {
                length: encoded_principal.len(),
                max: MAX_ENCODED_PRINCIPAL_LENGTH,
            });
        }
        if self.state == SessionState::Closed {
            return Ok(());
        }
        match self.state {
            SessionState::Connected | SessionState::Challenged => {
                self.transition(SessionState::Authenticated)?;
                self.encoded_principal = encoded_principal.to_vec();
                Ok(())
            }
            from => Err(ClusterError::InvalidTransition {
                from: from.name(),
                to: SessionState::Authenticated.name(),
            }),
        }
    }

    /// Admit the session into the replicated log at `log_position`.
    ///
    /// The principal is only needed during the handshake and is cleared
    /// here unconditionally.
    pub fn open(&mut self, log_position: i64) -> Result<(), ClusterError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.transition(SessionState::Open)?;
        self.opened_log_position = log_position;
        self.encoded_principal = Vec::new();
        Ok(())
    }

    /// Move a pre-OPEN session to `Rejected`, recording the diagnostic
    /// payload returned to the client before closure.
    pub fn reject(&mut self, code: EventCode, detail: &str) -> Result<(), ClusterError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.transition(SessionState::Rejected)?;
        self.event_code = Some(code);
        self.response_detail = Some(detail.to_string());
        Ok(())
    }

    /// Terminal transition. Idempotent: closing an already-closed session
    /// leaves the recorded reason untouched.
    pub fn close(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.close_reason = reason;
        self.disconnect();
    }

    /// Reserve space on the response channel. Returns the transport's
    /// result code, or NOT_CONNECTED when no channel is established.
    pub fn try_claim(&mut self, length: usize, claim: &mut BufferClaim) -> i64 {
        match self.response_publication.as_mut() {
            Some(publication) => publication.try_claim(length, claim),
            None => NOT_CONNECTED,
        }
    }

    /// Offer bytes on the response channel. Returns the transport's
    /// result code, or NOT_CONNECTED when no channel is established.
    pub fn offer(&mut self, buffer: &[u8], offset: usize, length: usize) -> i64 {
        match self.response_publication.as_mut() {
            Some(publication) => publication.offer(buffer, offset, length),
            None => NOT_CONNECTED,
        }
    }

    /// Record observed client activity for the driver's liveness sweep.
    pub fn last_activity_ns(&mut self, time_ns: u64, correlation_id: i64) {
        self.time_of_last_activity_ns = time_ns;
        self.correlation_id = correlation_id;
    }
}
