//! Approval types for human-in-the-loop workflow runs.
//!
//! These types live in `ensemble-core` so that the workflow engine (which
//! suspends runs) and any external approval transport (CLI prompt, message
//! queue, chat bot) can share them without circular deps. Resumption is a
//! first-class operation keyed by [`ContinuationToken`], not a callback.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque handle identifying one suspended approval point of a workflow run.
///
/// Issued when a run enters its approval wait; redeemed exactly once by
/// `resume`. A run that loops back to a new draft issues a fresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(Uuid);

impl ContinuationToken {
    /// Generates a fresh token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContinuationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The decision delivered for a suspended run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// Whether the reviewer accepted the draft.
    pub approved: bool,
    /// Reviewer feedback; on rejection, feedback requests another draft while
    /// its absence rejects the run outright.
    pub feedback: Option<String>,
}

impl ApprovalDecision {
    /// An approving decision.
    pub fn approve() -> Self {
        Self {
            approved: true,
            feedback: None,
        }
    }

    /// A rejecting decision carrying reviewer feedback.
    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: Some(feedback.into()),
        }
    }

    /// A rejecting decision without feedback (terminal for the run).
    pub fn reject_final() -> Self {
        Self {
            approved: false,
            feedback: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_round_trip_serde() {
        let a = ContinuationToken::new();
        let b = ContinuationToken::new();
        assert_ne!(a, b);

        let json = serde_json::to_string(&a).unwrap();
        let back: ContinuationToken = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }

    #[test]
    fn test_decision_constructors() {
        assert!(ApprovalDecision::approve().approved);
        let rejected = ApprovalDecision::reject("tighten the summary");
        assert!(!rejected.approved);
        assert_eq!(rejected.feedback.as_deref(), Some("tighten the summary"));
        assert!(ApprovalDecision::reject_final().feedback.is_none());
    }
}
