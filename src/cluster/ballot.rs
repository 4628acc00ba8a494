//! Vote and readiness tracking for elections.
//!
//! Uses a fixed-size bitset keyed by member id for O(1) tracking with
//! popcount-based tallies.

use std::collections::HashMap;

/// Maximum supported cluster size (64 members, one bit each).
pub const MAX_CLUSTER_SIZE: u32 = 64;

/// A compact bitset of member ids.
#[derive(Clone, Copy, Default)]
pub struct MemberBitset(u64);

impl MemberBitset {
    #[inline]
    pub fn new() -> Self {
        MemberBitset(0)
    }

    #[inline]
    pub fn insert(&mut self, member_id: i32) {
        debug_assert!((member_id as u32) < MAX_CLUSTER_SIZE, "member_id exceeds MAX_CLUSTER_SIZE");
        self.0 |= 1u64 << member_id;
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub fn contains(&self, member_id: i32) -> bool {
        debug_assert!((member_id as u32) < MAX_CLUSTER_SIZE, "member_id exceeds MAX_CLUSTER_SIZE");
        (self.0 & (1u64 << member_id)) != 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Strict majority of the full membership.
pub fn quorum_size(member_count: u32) -> u32 {
    (member_count / 2) + 1
}

/// Collects canvass responses and determines which member holds the most
/// advanced log. Ties break toward the lowest member id.
pub struct CanvassTracker {
    member_count: u32,
    responded: MemberBitset,
    positions: HashMap<i32, i64>,
}

impl CanvassTracker {
    pub fn new(member_count: u32) -> Self {
        assert!(
            member_count <= MAX_CLUSTER_SIZE,
            "member_count {} exceeds MAX_CLUSTER_SIZE {}",
            member_count,
            MAX_CLUSTER_SIZE
        );
        CanvassTracker {
            member_count,
            responded: MemberBitset::new(),
            positions: HashMap::new(),
        }
    }

    pub fn record(&mut self, member_id: i32, log_position: i64) {
        self.responded.insert(member_id);
        self.positions.insert(member_id, log_position);
    }

    pub fn has(&self, member_id: i32) -> bool {
        self.responded.contains(member_id)
    }

    /// True once a strict majority of members (including self) have
    /// advertised their positions.
    pub fn has_majority(&self) -> bool {
        self.responded.count() >= quorum_size(self.member_count)
    }

    /// The member that should nominate itself: highest log position,
    /// lowest member id on a tie. None until anyone has responded.
    pub fn leading_member(&self) -> Option<(i32, i64)> {
        self.positions
            .iter()
            .map(|(&id, &position)| (id, position))
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
    }

    pub fn reset(&mut self) {
        self.responded.clear();
        self.positions.clear();
    }
}

/// Tallies votes for one candidate term.
pub struct BallotTracker {
    member_count: u32,
    votes_for: MemberBitset,
    votes_against: MemberBitset,
}

impl BallotTracker {
    pub fn new(member_count: u32) -> Self {
        BallotTracker {
            member_count,
            votes_for: MemberBitset::new(),
            votes_against: MemberBitset::new(),
        }
    }

    /// Record a vote. Returns true if the ballot has reached a winning
    /// majority.
    pub fn record_vote(&mut self, member_id: i32, vote: bool) -> bool {
        if vote {
            self.votes_for.insert(member_id);
        } else {
            self.votes_against.insert(member_id);
        }
        self.has_majority()
    }

    pub fn has_majority(&self) -> bool {
        self.votes_for.count() >= quorum_size(self.member_count)
    }

    /// A majority against means this attempt can never win.
    pub fn is_defeated(&self) -> bool {
        self.votes_against.count() >= quorum_size(self.member_count)
    }

    pub fn votes_for(&self) -> u32 {
        self.votes_for.count()
    }

    pub fn reset(&mut self) {
        self.votes_for.clear();
        self.votes_against.clear();
    }
}

/// Tracks which members have reached their ready state for a term.
/// The term is only established once every member is ready.
pub struct ReadyTracker {
    member_count: u32,
    ready: MemberBitset,
}

impl ReadyTracker {
    pub fn new(member_count: u32) -> Self {
        ReadyTracker {
            member_count,
            ready: MemberBitset::new(),
        }
    }

    /// Record a ready member. Returns true once all members are ready.
    pub fn record_ready(&mut self, member_id: i32) -> bool {
        self.ready.insert(member_id);
        self.all_ready()
    }

    pub fn all_ready(&self) -> bool {
        self.ready.count() >= self.member_count
    }

    pub fn reset(&mut self) {
        self.ready.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_size() {
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(5), 3);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(1), 1);
    }

    #[test]
    fn test_canvass_tie_breaks_to_lowest_id() {
        let mut canvass = CanvassTracker::new(3);
        canvass.record(1, 100);
        canvass.record(2, 100);
        canvass.record(3, 50);
        assert!(canvass.has_majority());
        assert_eq!(canvass.leading_member(), Some((1, 100)));
    }

    #[test]
    fn test_canvass_prefers_highest_position() {
        let mut canvass = CanvassTracker::new(3);
        canvass.record(1, 10);
        canvass.record(3, 90);
        assert_eq!(canvass.leading_member(), Some((3, 90)));
    }

    #[test]
    fn test_canvass_majority_threshold() {
        let mut canvass = CanvassTracker::new(5);
        canvass.record(0, 1);
        canvass.record(1, 2);
        assert!(!canvass.has_majority());
        canvass.record(2, 3);
        assert!(canvass.has_majority());
    }

    #[test]
    fn test_ballot_majority() {
        let mut ballot = BallotTracker::new(3);
        assert!(!ballot.record_vote(0, true));
        assert!(ballot.record_vote(1, true));
        assert!(ballot.has_majority());
        assert_eq!(ballot.votes_for(), 2);
    }

    #[test]
    fn test_ballot_defeat() {
        let mut ballot = BallotTracker::new(3);
        ballot.record_vote(1, false);
        ballot.record_vote(2, false);
        assert!(ballot.is_defeated());
        assert!(!ballot.has_majority());
    }

    #[test]
    fn test_ready_requires_all_members() {
        let mut ready = ReadyTracker::new(3);
        assert!(!ready.record_ready(0));
        assert!(!ready.record_ready(1));
        assert!(ready.record_ready(2));
    }
}
