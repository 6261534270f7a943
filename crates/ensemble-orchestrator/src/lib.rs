//! Workflow orchestration for the Ensemble engine.
//!
//! Takes a free-text request through the full pipeline: the capability
//! router picks agents and an execution strategy, the workflow engine runs
//! the plan (with per-step timeouts, transient-failure retries, cancellation
//! and human-approval suspension), and the result synthesizer merges the
//! step outputs into one response recorded in memory. The [`Orchestrator`]
//! facade ties these together behind a single submit/poll/resume surface.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Facade: submit requests, poll runs, resume or
//!   cancel them, query memory.
//! - [`OrchestratorBuilder`] — Wires registry, memory and capabilities.
//! - [`CapabilityRouter`] — Chooses agents and strategy per request.
//! - [`WorkflowEngine`] — Executes plans and tracks run state.
//! - [`ResultSynthesizer`] — Merges step outputs, writes the memory record.
//! - [`WorkflowPlan`] / [`WorkflowRun`] — A routed plan and its live state.
//! - [`OrchestratorConfig`] — TOML-loadable tunables for all of the above.

/// Configuration types for router, engine and memory, loadable from TOML.
pub mod config;
/// Workflow execution: strategies, retries, timeouts, approval suspension.
pub mod engine;
/// The top-level orchestrator facade and its builder.
pub mod facade;
/// Request routing: capability matching, strategy choice, fallback scoring.
pub mod router;
/// Merging of step outputs into a final recorded response.
pub mod synthesizer;
/// Plan, run, and step types shared across the crate.
pub mod types;

pub use config::{EngineConfig, MemoryConfig, OrchestratorConfig, RetryPolicy, RouterConfig};
pub use engine::WorkflowEngine;
pub use facade::{Orchestrator, OrchestratorBuilder, RunOutcome, RunStatus};
pub use router::CapabilityRouter;
pub use synthesizer::{ResultSynthesizer, SynthesisOutput};
pub use types::{
    Contribution, InputTransform, RunError, RunErrorKind, RunRecord, RunState, StepResult,
    Strategy, Transcript, TranscriptTurn, WorkflowPlan, WorkflowRun, WorkflowStep,
};
