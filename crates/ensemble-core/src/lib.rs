//! Core types and error definitions for the Ensemble orchestration engine.
//!
//! This crate provides the foundational pieces shared across all Ensemble
//! crates: the unified error taxonomy, the abstract capability traits the
//! engine consumes, and the approval types used by suspended workflow runs.
//!
//! # Main types
//!
//! - [`EnsembleError`] — Unified error enum for all Ensemble subsystems.
//! - [`EnsembleResult`] — Convenience alias for `Result<T, EnsembleError>`.
//! - [`capability::CompletionCapability`] — Abstract text-completion seam.
//! - [`capability::AgentInvocationCapability`] — Abstract agent-invocation seam.
//! - [`approval::ContinuationToken`] — Handle for resuming a suspended run.

/// Approval types for human-in-the-loop workflow runs.
pub mod approval;
/// Abstract capability traits consumed by the engine.
pub mod capability;
/// Tracing subscriber initialization.
pub mod telemetry;

pub use approval::{ApprovalDecision, ContinuationToken};
pub use capability::{AgentInvocationCapability, CompletionCapability};

// --- Error types ---

/// Top-level error type for the Ensemble orchestration engine.
///
/// Run-terminal variants (`Routing`, `Synthesis`, `ApprovalRejected`,
/// `ApprovalTimeout`) surface to callers; step-level variants are handled by
/// the workflow engine's retry policy and recorded against the failing step.
#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    /// No viable agent or strategy could be selected for a request.
    #[error("Routing failure: {0}")]
    Routing(String),

    /// An agent invocation exceeded its per-step timeout.
    #[error("Invocation timed out after {timeout_ms}ms")]
    InvocationTimeout {
        /// The step timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// An agent invocation failed terminally.
    #[error("Invocation error: {0}")]
    Invocation(String),

    /// Step outputs could not be merged into a final response.
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// The durable memory backend could not be reached.
    #[error("Memory backend unavailable: {0}")]
    MemoryBackendUnavailable(String),

    /// A human reviewer rejected the run without requesting changes.
    #[error("Approval rejected: {0}")]
    ApprovalRejected(String),

    /// The approval retry budget was exhausted.
    #[error("Approval retries exhausted: {0}")]
    ApprovalTimeout(String),

    /// An upstream capability throttled the call.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// An upstream capability timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An upstream capability is temporarily unreachable.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The capability rejected the input as invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A referenced entity (agent, run, token) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnsembleError {
    /// Whether this error belongs to the network/timeout class that the
    /// engine's per-step retry policy is allowed to retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EnsembleError::InvocationTimeout { .. }
                | EnsembleError::RateLimited(_)
                | EnsembleError::Timeout(_)
                | EnsembleError::ServiceUnavailable(_)
        )
    }
}

/// A convenience `Result` alias using [`EnsembleError`].
pub type EnsembleResult<T> = Result<T, EnsembleError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification_covers_network_and_timeout_classes() {
        assert!(EnsembleError::InvocationTimeout { timeout_ms: 60_000 }.is_transient());
        assert!(EnsembleError::RateLimited("429".into()).is_transient());
        assert!(EnsembleError::Timeout("upstream".into()).is_transient());
        assert!(EnsembleError::ServiceUnavailable("embedding".into()).is_transient());
    }

    #[test]
    fn test_terminal_errors_are_not_transient() {
        assert!(!EnsembleError::InvalidRequest("empty input".into()).is_transient());
        assert!(!EnsembleError::Routing("no candidates".into()).is_transient());
        assert!(!EnsembleError::Invocation("agent crashed".into()).is_transient());
        assert!(!EnsembleError::ApprovalRejected("not good enough".into()).is_transient());
    }

    #[test]
    fn test_error_messages_name_their_subsystem() {
        let err = EnsembleError::MemoryBackendUnavailable("disk full".into());
        assert_eq!(err.to_string(), "Memory backend unavailable: disk full");

        let err = EnsembleError::InvocationTimeout { timeout_ms: 500 };
        assert_eq!(err.to_string(), "Invocation timed out after 500ms");
    }
}
