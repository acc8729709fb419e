use std::collections::HashSet;

/// "No data yet": the next sync request must ask for a full snapshot.
pub const SEQUENCE_SENTINEL: i64 = -1;

/// Tracks the monotonic sequence number of applied sync responses and
/// detects gaps in the delta stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTracker {
    last_sequence: i64,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self {
            last_sequence: SEQUENCE_SENTINEL,
        }
    }

    /// Whether the next poll must request a full snapshot.
    pub fn wants_full(&self) -> bool {
        self.last_sequence == SEQUENCE_SENTINEL
    }

    pub fn last_sequence(&self) -> i64 {
        self.last_sequence
    }

    /// Apply a response's sequence number. Returns `true` when the response
    /// continues the stream; a gap resets to the sentinel so the next poll
    /// requests a full snapshot.
    pub fn observe(&mut self, sequence: i64) -> bool {
        if sequence == self.last_sequence + 1 {
            self.last_sequence = sequence;
            true
        } else {
            self.last_sequence = SEQUENCE_SENTINEL;
            false
        }
    }
}

impl Default for SyncTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Symmetric difference of two rosters: joins are names present now but not
/// before, leaves the opposite. Input order is preserved.
pub fn diff_roster(previous: &[String], current: &[String]) -> (Vec<String>, Vec<String>) {
    let before: HashSet<&str> = previous.iter().map(String::as_str).collect();
    let now: HashSet<&str> = current.iter().map(String::as_str).collect();

    let joins = current
        .iter()
        .filter(|name| !before.contains(name.as_str()))
        .cloned()
        .collect();
    let leaves = previous
        .iter()
        .filter(|name| !now.contains(name.as_str()))
        .cloned()
        .collect();
    (joins, leaves)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_response_after_sentinel_is_accepted() {
        let mut tracker = SyncTracker::new();
        assert!(tracker.wants_full());
        assert!(tracker.observe(0));
        assert_eq!(tracker.last_sequence(), 0);
        assert!(!tracker.wants_full());
    }

    #[test]
    fn test_consecutive_sequences_advance() {
        let mut tracker = SyncTracker::new();
        assert!(tracker.observe(0));
        assert!(tracker.observe(1));
        assert!(tracker.observe(2));
        assert_eq!(tracker.last_sequence(), 2);
    }

    #[test]
    fn test_gap_forces_full_resync() {
        let mut tracker = SyncTracker::new();
        assert!(tracker.observe(0));
        assert!(tracker.observe(1));
        assert!(tracker.observe(2));

        // seq 5 when lastSequence == 2: gap.
        assert!(!tracker.observe(5));
        assert_eq!(tracker.last_sequence(), SEQUENCE_SENTINEL);
        assert!(tracker.wants_full());

        // Recovery: the full snapshot restarts the stream at 0.
        assert!(tracker.observe(0));
        assert!(!tracker.wants_full());
    }

    #[test]
    fn test_replayed_sequence_is_a_gap() {
        let mut tracker = SyncTracker::new();
        assert!(tracker.observe(0));
        assert!(tracker.observe(1));
        assert!(!tracker.observe(1));
        assert!(tracker.wants_full());
    }

    #[test]
    fn test_diff_roster_joins_and_leaves() {
        let (joins, leaves) = diff_roster(&names(&["Alice", "Bob"]), &names(&["Alice", "Carol"]));
        assert_eq!(joins, names(&["Carol"]));
        assert_eq!(leaves, names(&["Bob"]));
    }

    #[test]
    fn test_diff_roster_no_changes() {
        let roster = names(&["Alice", "Bob"]);
        let (joins, leaves) = diff_roster(&roster, &roster);
        assert!(joins.is_empty());
        assert!(leaves.is_empty());
    }

    #[test]
    fn test_diff_roster_from_empty() {
        let (joins, leaves) = diff_roster(&[], &names(&["Alice"]));
        assert_eq!(joins, names(&["Alice"]));
        assert!(leaves.is_empty());
    }

    #[test]
    fn test_diff_roster_to_empty() {
        let (joins, leaves) = diff_roster(&names(&["Alice", "Bob"]), &[]);
        assert!(joins.is_empty());
        assert_eq!(leaves, names(&["Alice", "Bob"]));
    }

    #[test]
    fn test_diff_roster_is_symmetric_difference() {
        let before = names(&["a", "b", "c", "d"]);
        let after = names(&["c", "d", "e", "f"]);
        let (joins, leaves) = diff_roster(&before, &after);
        assert_eq!(joins, names(&["e", "f"]));
        assert_eq!(leaves, names(&["a", "b"]));
    }
}
