use std::fmt;

/// Closed set of errors surfaced by the consensus and session core.
///
/// Callers pattern-match on the kind: `AlreadyConnected` and
/// `InvalidTransition` are programmer/protocol errors fatal to the
/// affected session; the rest are recoverable runtime conditions.
#[derive(Debug, PartialEq, Eq)]
pub enum ClusterError {
    /// Response-channel descriptor could not be resolved.
    /// Non-fatal: the session stays without a response channel and can
    /// be retried or timed out externally.
    InvalidChannel { channel: String },

    /// An opaque payload (principal, membership query) exceeds its limit.
    /// The caller must reject the session, not fail the node.
    EncodingTooLarge { length: usize, max: usize },

    /// connect() called on a session that already has a response channel.
    AlreadyConnected { session_id: i64 },

    /// An election attempt failed to gather a majority before its
    /// deadline. Retried automatically with the same pending term.
    ElectionTimeout { candidate_term_id: i64 },

    /// A named transition was attempted from a state that does not
    /// permit it.
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl ClusterError {
    /// Programmer/protocol errors that signal a design violation rather
    /// than an expected runtime condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClusterError::AlreadyConnected { .. } | ClusterError::InvalidTransition { .. }
        )
    }
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::InvalidChannel { channel } => {
                write!(f, "invalid response channel: '{}'", channel)
            }
            ClusterError::EncodingTooLarge { length, max } => {
                write!(f, "encoded length {} exceeds max {}", length, max)
            }
            ClusterError::AlreadyConnected { session_id } => {
                write!(f, "session {}: response publication already exists", session_id)
            }
            ClusterError::ElectionTimeout { candidate_term_id } => {
                write!(
                    f,
                    "no majority for candidate term {} before deadline",
                    candidate_term_id
                )
            }
            ClusterError::InvalidTransition { from, to } => {
                write!(f, "invalid session transition {} -> {}", from, to)
            }
        }
    }
}

impl std::error::Error for ClusterError {}
