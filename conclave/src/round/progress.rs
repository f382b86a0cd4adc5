//! Loop-progress detection across rounds.
//!
//! Tracks fingerprints of the implementation summary and the review
//! signature. When consecutive rounds repeat both fingerprints, the task is
//! looping: the tracker first proposes strategy shifts (scope narrowing,
//! diagnostics), and gives up with `loop_no_progress` once the configured
//! number of shifts changed nothing.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Strategy hints injected into the next round's discussion seed, in
/// escalation order.
const SHIFT_HINTS: &[&str] = &[
    "narrow the scope to the single failing area and leave the rest untouched",
    "add diagnostics first and act only on what they show",
    "revert the speculative changes and take the smallest possible fix",
];

/// Decision after observing one round's fingerprints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressDecision {
    /// Fingerprints changed; the loop is moving.
    Progressing,
    /// Same fingerprints again; shift strategy with this hint.
    Shift { hint: String },
    /// Shifts exhausted without change.
    NoProgress,
}

/// Per-task tracker, fed once per completed round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressTracker {
    last_fingerprint: Option<String>,
    shifts: u32,
    shift_limit: u32,
    pending_hint: Option<String>,
}

impl ProgressTracker {
    pub fn new(shift_limit: u32) -> Self {
        Self {
            last_fingerprint: None,
            shifts: 0,
            shift_limit,
            pending_hint: None,
        }
    }

    /// Observe a round's implementation summary and review signature.
    pub fn observe(&mut self, implementation_summary: &str, review_signature: &str) -> ProgressDecision {
        let fingerprint = round_fingerprint(implementation_summary, review_signature);
        let repeated = self.last_fingerprint.as_deref() == Some(fingerprint.as_str());
        self.last_fingerprint = Some(fingerprint);

        if !repeated {
            self.shifts = 0;
            self.pending_hint = None;
            return ProgressDecision::Progressing;
        }

        if self.shifts >= self.shift_limit {
            return ProgressDecision::NoProgress;
        }
        let hint = SHIFT_HINTS[(self.shifts as usize).min(SHIFT_HINTS.len() - 1)].to_string();
        self.shifts += 1;
        self.pending_hint = Some(hint.clone());
        ProgressDecision::Shift { hint }
    }

    /// Hint to seed into the next discussion, if a shift is pending.
    pub fn pending_hint(&self) -> Option<&str> {
        self.pending_hint.as_deref()
    }

    pub fn shifts(&self) -> u32 {
        self.shifts
    }
}

fn round_fingerprint(implementation_summary: &str, review_signature: &str) -> String {
    let mut hasher = Sha256::new();
    // Whitespace-insensitive over the summary so cosmetic rewording does
    // not mask a stuck loop.
    for token in implementation_summary.split_whitespace() {
        hasher.update(token.as_bytes());
        hasher.update([0]);
    }
    hasher.update([1]);
    hasher.update(review_signature.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changing_rounds_progress() {
        let mut tracker = ProgressTracker::new(2);
        assert_eq!(
            tracker.observe("implemented retry", "sig-a"),
            ProgressDecision::Progressing
        );
        assert_eq!(
            tracker.observe("fixed the flaky test", "sig-b"),
            ProgressDecision::Progressing
        );
        assert_eq!(tracker.shifts(), 0);
    }

    #[test]
    fn test_repeat_triggers_shift_then_no_progress() {
        let mut tracker = ProgressTracker::new(2);
        tracker.observe("same summary", "sig-a");

        let first = tracker.observe("same summary", "sig-a");
        assert!(matches!(first, ProgressDecision::Shift { .. }));
        assert!(tracker.pending_hint().is_some());

        let second = tracker.observe("same summary", "sig-a");
        assert!(matches!(second, ProgressDecision::Shift { .. }));

        // Both shifts spent without change.
        assert_eq!(
            tracker.observe("same summary", "sig-a"),
            ProgressDecision::NoProgress
        );
    }

    #[test]
    fn test_progress_resets_shift_counter() {
        let mut tracker = ProgressTracker::new(2);
        tracker.observe("same", "sig-a");
        tracker.observe("same", "sig-a"); // shift 1
        assert_eq!(tracker.shifts(), 1);

        tracker.observe("different now", "sig-b");
        assert_eq!(tracker.shifts(), 0);
        assert!(tracker.pending_hint().is_none());
    }

    #[test]
    fn test_whitespace_insensitive_fingerprint() {
        let mut tracker = ProgressTracker::new(1);
        tracker.observe("fix  the   parser", "sig");
        let decision = tracker.observe("fix the parser", "sig");
        assert!(matches!(decision, ProgressDecision::Shift { .. }));
    }

    #[test]
    fn test_single_passing_round_never_shifts() {
        let mut tracker = ProgressTracker::new(2);
        assert_eq!(
            tracker.observe("done", "sig"),
            ProgressDecision::Progressing
        );
        assert_eq!(tracker.shifts(), 0);
    }
}
