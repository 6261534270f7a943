//! Abstract capability traits consumed by the orchestration engine.
//!
//! Concrete providers (hosted completion APIs, agent runtimes) live outside
//! this workspace; the engine only ever sees these seams. All agent variants
//! are dispatched through the single [`AgentInvocationCapability`] method and
//! resolved by descriptor metadata, never by concrete types.

use crate::EnsembleResult;
use async_trait::async_trait;
use uuid::Uuid;

/// A black-box text-completion service.
///
/// Used by the router for structured strategy decisions and by the
/// synthesizer for merging step outputs. May fail with
/// [`RateLimited`](crate::EnsembleError::RateLimited),
/// [`Timeout`](crate::EnsembleError::Timeout) or
/// [`InvalidRequest`](crate::EnsembleError::InvalidRequest); callers degrade
/// to deterministic fallbacks on any error.
#[async_trait]
pub trait CompletionCapability: Send + Sync {
    /// Produces a completion for the given prompt context.
    async fn complete(&self, prompt: &str) -> EnsembleResult<String>;
}

/// A black-box agent runtime.
///
/// The engine hands over an agent id and an input string and observes only
/// success output or failure; whatever tools the agent uses internally are
/// invisible here.
#[async_trait]
pub trait AgentInvocationCapability: Send + Sync {
    /// Invokes the agent identified by `agent_id` with `input`.
    async fn invoke(&self, agent_id: Uuid, input: &str) -> EnsembleResult<String>;
}
