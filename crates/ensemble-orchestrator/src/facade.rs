use std::sync::Arc;

use ensemble_core::{
    AgentInvocationCapability, ApprovalDecision, CompletionCapability, ContinuationToken,
    EnsembleError, EnsembleResult,
};
use ensemble_memory::{
    EphemeralMemoryStore, HashingEmbedder, MemoryFilter, MemoryRecord, MemoryStore,
};
use ensemble_registry::AgentRegistry;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::engine::WorkflowEngine;
use crate::router::CapabilityRouter;
use crate::synthesizer::ResultSynthesizer;
use crate::types::{Contribution, RunError, RunErrorKind, RunRecord, RunState, Strategy};

/// Externally visible status of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub request_id: Uuid,
    pub state: RunState,
    pub strategy: Strategy,
    /// Token to redeem via `resume` while the run awaits approval.
    pub continuation: Option<ContinuationToken>,
}

/// Result of a run as observed through the facade.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The run has not reached a terminal state yet.
    Pending { state: RunState },
    /// The run finished with a synthesized response.
    Completed {
        final_response: String,
        memory_record_id: Option<Uuid>,
        requires_review: bool,
    },
    /// The run ended without a final response. Successful step outputs
    /// gathered before the failure are preserved in `partial`.
    Failed {
        error: RunError,
        partial: Vec<Contribution>,
    },
}

/// Assembles an [`Orchestrator`] from its collaborators.
///
/// Only the agent invoker is mandatory; registry and memory default to fresh
/// in-process instances and the completion capability stays absent, leaving
/// routing and synthesis on their deterministic fallbacks.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    registry: Option<Arc<AgentRegistry>>,
    memory: Option<Arc<dyn MemoryStore>>,
    invoker: Option<Arc<dyn AgentInvocationCapability>>,
    completion: Option<Arc<dyn CompletionCapability>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn invoker(mut self, invoker: Arc<dyn AgentInvocationCapability>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn completion(mut self, completion: Arc<dyn CompletionCapability>) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Wires router, engine and synthesizer together.
    pub fn build(self) -> EnsembleResult<Orchestrator> {
        let invoker = self.invoker.ok_or_else(|| {
            EnsembleError::Config("an agent invocation capability is required".into())
        })?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(AgentRegistry::new()));
        let memory = self.memory.unwrap_or_else(|| {
            Arc::new(EphemeralMemoryStore::with_capacity(
                Arc::new(HashingEmbedder::default()),
                self.config.memory.capacity,
            ))
        });

        let mut router = CapabilityRouter::new(
            Arc::clone(&registry),
            Arc::clone(&memory),
            self.config.router.clone(),
        );
        let mut synthesizer =
            ResultSynthesizer::new(Arc::clone(&registry), Arc::clone(&memory));
        if let Some(completion) = self.completion {
            router = router.with_completion(Arc::clone(&completion));
            synthesizer = synthesizer.with_completion(completion);
        }

        let engine = WorkflowEngine::new(
            Arc::clone(&registry),
            invoker,
            Arc::new(synthesizer),
            self.config.engine.clone(),
        );

        Ok(Orchestrator {
            registry,
            memory,
            router,
            engine,
        })
    }
}

/// Single entry point for clients of the orchestration engine.
///
/// Owns the full pipeline: requests submitted here are routed to a plan,
/// executed in a background task, synthesized, and recorded in memory.
/// Callers observe progress through [`get_status`](Self::get_status) and
/// [`get_result`](Self::get_result) and steer suspended runs through
/// [`resume`](Self::resume) and [`cancel`](Self::cancel).
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    memory: Arc<dyn MemoryStore>,
    router: CapabilityRouter,
    engine: WorkflowEngine,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Starts a builder with default configuration.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Routes the request and starts executing it in the background.
    ///
    /// `context` scopes the prior interactions the router may recall while
    /// deciding; pass [`MemoryFilter::any`] to recall across everything.
    /// Returns the request id to poll. Routing happens before this returns:
    /// an unroutable request fails here and no run is created for it.
    pub async fn submit(
        &self,
        request_text: &str,
        context: &MemoryFilter,
    ) -> EnsembleResult<Uuid> {
        if request_text.trim().is_empty() {
            return Err(EnsembleError::InvalidRequest("request text is empty".into()));
        }
        let request_id = Uuid::new_v4();
        info!(request_id = %request_id, "Request submitted");

        let plan = self.router.route(request_id, request_text, context).await?;
        self.engine.begin(request_text, plan).await?;

        let engine = self.engine.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.drive(request_id).await {
                warn!(request_id = %request_id, error = %err, "Run driver exited with error");
            }
        });
        Ok(request_id)
    }

    /// Current state of a run.
    pub async fn get_status(&self, request_id: Uuid) -> EnsembleResult<RunStatus> {
        let run = self
            .engine
            .get_run(request_id)
            .await
            .ok_or_else(|| EnsembleError::NotFound(format!("run {request_id}")))?;
        Ok(RunStatus {
            request_id,
            state: run.state,
            strategy: run.plan.strategy,
            continuation: run.pending_approval,
        })
    }

    /// Outcome of a run: pending, completed, or failed with partial results.
    pub async fn get_result(&self, request_id: Uuid) -> EnsembleResult<RunOutcome> {
        let run = self
            .engine
            .get_run(request_id)
            .await
            .ok_or_else(|| EnsembleError::NotFound(format!("run {request_id}")))?;

        let outcome = match run.state {
            RunState::Completed => RunOutcome::Completed {
                final_response: run.final_response.clone().unwrap_or_default(),
                memory_record_id: run.memory_record_id,
                requires_review: run.requires_review,
            },
            RunState::Failed => RunOutcome::Failed {
                error: run
                    .error
                    .clone()
                    .unwrap_or_else(|| RunError::new(RunErrorKind::Invocation, "run failed")),
                partial: run.successful_contributions(),
            },
            RunState::Cancelled => RunOutcome::Failed {
                error: run.error.clone().unwrap_or_else(|| {
                    RunError::new(RunErrorKind::Cancelled, "cancelled by caller")
                }),
                partial: run.successful_contributions(),
            },
            state => RunOutcome::Pending { state },
        };
        Ok(outcome)
    }

    /// Delivers an approval decision for a run suspended in
    /// `AwaitingApproval`.
    pub async fn resume(
        &self,
        token: ContinuationToken,
        decision: ApprovalDecision,
    ) -> EnsembleResult<()> {
        self.engine
            .resume(token, decision.approved, decision.feedback)
            .await
    }

    /// Requests cancellation of an active run.
    pub async fn cancel(&self, request_id: Uuid) -> EnsembleResult<()> {
        self.engine.cancel(request_id).await
    }

    /// Lists memory records matching the filter, newest first.
    pub async fn query_memory(&self, filter: &MemoryFilter) -> EnsembleResult<Vec<MemoryRecord>> {
        self.memory.list(filter).await
    }

    /// Exports the audit record of a terminal run.
    pub async fn export_run(&self, request_id: Uuid) -> EnsembleResult<RunRecord> {
        let run = self
            .engine
            .get_run(request_id)
            .await
            .ok_or_else(|| EnsembleError::NotFound(format!("run {request_id}")))?;
        if !run.state.is_terminal() {
            return Err(EnsembleError::InvalidRequest(format!(
                "run {request_id} is still active"
            )));
        }
        Ok(run.to_record())
    }

    /// The shared agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The shared memory store.
    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        &self.memory
    }
}
