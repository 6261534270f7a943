use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ensemble_core::{
    AgentInvocationCapability, ApprovalDecision, ContinuationToken, EnsembleError, EnsembleResult,
};
use ensemble_registry::AgentRegistry;
use tokio::sync::{oneshot, watch, RwLock, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::synthesizer::ResultSynthesizer;
use crate::types::{
    Contribution, InputTransform, RunError, RunErrorKind, RunState, StepResult, Strategy,
    Transcript, WorkflowPlan, WorkflowRun, WorkflowStep,
};

struct PendingApproval {
    request_id: Uuid,
    sender: oneshot::Sender<ApprovalDecision>,
}

/// Executes workflow plans: invokes agents per strategy, tracks run state,
/// and hands successful outputs to the synthesizer.
///
/// The engine is cheap to clone; clones share the same run table, so a
/// cloned handle can drive a run in a spawned task while the original
/// observes it.
#[derive(Clone)]
pub struct WorkflowEngine {
    registry: Arc<AgentRegistry>,
    invoker: Arc<dyn AgentInvocationCapability>,
    synthesizer: Arc<ResultSynthesizer>,
    config: EngineConfig,
    runs: Arc<RwLock<HashMap<Uuid, WorkflowRun>>>,
    pending: Arc<RwLock<HashMap<ContinuationToken, PendingApproval>>>,
    cancels: Arc<RwLock<HashMap<Uuid, watch::Sender<bool>>>>,
}

impl WorkflowEngine {
    /// Builds an engine over the given registry, invoker, and synthesizer.
    pub fn new(
        registry: Arc<AgentRegistry>,
        invoker: Arc<dyn AgentInvocationCapability>,
        synthesizer: Arc<ResultSynthesizer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            invoker,
            synthesizer,
            config,
            runs: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            cancels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a run for the plan without executing it yet.
    ///
    /// At most one non-terminal run may exist per request id; a second
    /// `begin` for the same id is rejected until the first reaches a
    /// terminal state.
    pub async fn begin(&self, request_text: &str, plan: WorkflowPlan) -> EnsembleResult<Uuid> {
        let request_id = plan.request_id;
        {
            let mut runs = self.runs.write().await;
            if let Some(existing) = runs.get(&request_id) {
                if !existing.state.is_terminal() {
                    return Err(EnsembleError::InvalidRequest(format!(
                        "run {request_id} is already in progress"
                    )));
                }
            }
            runs.insert(request_id, WorkflowRun::new(request_text, plan));
        }
        let (cancel_tx, _) = watch::channel(false);
        self.cancels.write().await.insert(request_id, cancel_tx);
        debug!(request_id = %request_id, "Run created");
        Ok(request_id)
    }

    /// Drives a previously begun run to a terminal state and returns the
    /// final snapshot.
    pub async fn drive(&self, request_id: Uuid) -> EnsembleResult<WorkflowRun> {
        let (request_text, plan) = {
            let runs = self.runs.read().await;
            let run = runs
                .get(&request_id)
                .ok_or_else(|| EnsembleError::NotFound(format!("run {request_id}")))?;
            if run.state != RunState::Created {
                return Err(EnsembleError::InvalidRequest(format!(
                    "run {request_id} was already driven"
                )));
            }
            (run.request_text.clone(), run.plan.clone())
        };
        let cancel_rx = {
            let cancels = self.cancels.read().await;
            cancels
                .get(&request_id)
                .map(watch::Sender::subscribe)
                .ok_or_else(|| EnsembleError::NotFound(format!("run {request_id}")))?
        };

        self.update_run(request_id, |run| run.state = RunState::Executing)
            .await;
        info!(
            request_id = %request_id,
            strategy = %plan.strategy,
            steps = plan.steps.len(),
            "Run executing"
        );
        let started = Instant::now();

        let exec = self
            .execute_strategy(request_id, &request_text, &plan, cancel_rx.clone())
            .await;

        let cancelled = *cancel_rx.borrow();
        if cancelled {
            self.finalize(request_id, |run| {
                run.state = RunState::Cancelled;
                run.error = Some(RunError::new(RunErrorKind::Cancelled, "cancelled by caller"));
            })
            .await;
            info!(request_id = %request_id, "Run cancelled");
        } else {
            match exec {
                Ok(contributions) => {
                    self.update_run(request_id, |run| run.state = RunState::Synthesizing)
                        .await;
                    debug!(
                        request_id = %request_id,
                        contributions = contributions.len(),
                        "Synthesizing"
                    );
                    match self
                        .synthesizer
                        .synthesize(request_id, &request_text, plan.strategy, &contributions)
                        .await
                    {
                        Ok(synthesis) => {
                            self.finalize(request_id, |run| {
                                run.state = RunState::Completed;
                                run.final_response = Some(synthesis.final_response);
                                run.memory_record_id = synthesis.memory_record_id;
                                run.requires_review = synthesis.requires_review;
                            })
                            .await;
                            info!(
                                request_id = %request_id,
                                duration_ms = started.elapsed().as_millis() as u64,
                                "Run completed"
                            );
                        }
                        Err(err) => {
                            warn!(request_id = %request_id, error = %err, "Synthesis failed");
                            self.finalize(request_id, |run| {
                                run.state = RunState::Failed;
                                run.error = Some(RunError::from_error(&err));
                            })
                            .await;
                        }
                    }
                }
                Err(err) => {
                    warn!(request_id = %request_id, error = %err, "Run failed");
                    self.finalize(request_id, |run| {
                        run.state = RunState::Failed;
                        run.error = Some(RunError::from_error(&err));
                    })
                    .await;
                }
            }
        }

        self.cancels.write().await.remove(&request_id);
        let runs = self.runs.read().await;
        runs.get(&request_id)
            .cloned()
            .ok_or_else(|| EnsembleError::NotFound(format!("run {request_id}")))
    }

    /// Convenience wrapper: `begin` followed by `drive`.
    pub async fn run(
        &self,
        request_text: &str,
        plan: WorkflowPlan,
    ) -> EnsembleResult<WorkflowRun> {
        let request_id = self.begin(request_text, plan).await?;
        self.drive(request_id).await
    }

    /// Snapshot of a run, if one exists for the id.
    pub async fn get_run(&self, request_id: Uuid) -> Option<WorkflowRun> {
        self.runs.read().await.get(&request_id).cloned()
    }

    /// Delivers an approval decision for a suspended run.
    ///
    /// Each token is redeemable exactly once; an unknown (or already
    /// redeemed) token fails with `NotFound`.
    pub async fn resume(
        &self,
        token: ContinuationToken,
        approved: bool,
        feedback: Option<String>,
    ) -> EnsembleResult<()> {
        let entry = {
            let mut pending = self.pending.write().await;
            pending.remove(&token)
        }
        .ok_or_else(|| EnsembleError::NotFound(format!("continuation token {token}")))?;

        info!(
            request_id = %entry.request_id,
            token = %token,
            approved,
            "Approval decision received"
        );
        entry
            .sender
            .send(ApprovalDecision { approved, feedback })
            .map_err(|_| {
                EnsembleError::NotFound(format!(
                    "run {} is no longer awaiting approval",
                    entry.request_id
                ))
            })
    }

    /// Requests cancellation of an active run.
    ///
    /// In-flight invocations stop being awaited (remote abort is best
    /// effort) and the run settles in `Cancelled`. Terminal runs cannot be
    /// cancelled.
    pub async fn cancel(&self, request_id: Uuid) -> EnsembleResult<()> {
        {
            let cancels = self.cancels.read().await;
            let Some(tx) = cancels.get(&request_id) else {
                return Err(EnsembleError::NotFound(format!(
                    "no active run {request_id}"
                )));
            };
            let _ = tx.send(true);
        }
        // Wake any approval wait by dropping its sender.
        {
            let mut pending = self.pending.write().await;
            pending.retain(|_, entry| entry.request_id != request_id);
        }
        info!(request_id = %request_id, "Cancellation requested");
        Ok(())
    }

    async fn execute_strategy(
        &self,
        request_id: Uuid,
        request_text: &str,
        plan: &WorkflowPlan,
        cancel: watch::Receiver<bool>,
    ) -> EnsembleResult<Vec<Contribution>> {
        if plan.steps.is_empty() {
            return Err(EnsembleError::InvalidRequest("plan has no steps".into()));
        }
        let run_timeout = Duration::from_millis(self.config.run_timeout_ms);
        match plan.strategy {
            // Concurrent manages the run deadline itself so branches that
            // finished in time keep their results.
            Strategy::Concurrent => {
                let results = self
                    .fan_out(request_id, request_text, &plan.steps, 0, cancel)
                    .await?;
                self.join_contributions(results)
            }
            // The approval wait must not be bounded by the execution budget.
            Strategy::HumanInLoop => {
                return self
                    .run_human_in_loop(request_id, request_text, plan, cancel)
                    .await;
            }
            Strategy::Single | Strategy::Sequential => {
                let chain =
                    self.sequential_chain(request_id, request_text, &plan.steps, 0, &cancel);
                return match tokio::time::timeout(run_timeout, chain).await {
                    Ok(result) => result.map(|(contributions, _)| contributions),
                    Err(_) => Err(self.run_timeout_error()),
                };
            }
            Strategy::RoundRobin => {
                let discussion =
                    self.run_round_robin(request_id, request_text, &plan.steps, &cancel);
                return match tokio::time::timeout(run_timeout, discussion).await {
                    Ok(result) => result,
                    Err(_) => Err(self.run_timeout_error()),
                };
            }
            Strategy::Hierarchical => {
                let pipeline = self.run_hierarchical(request_id, request_text, plan, cancel);
                return match tokio::time::timeout(run_timeout, pipeline).await {
                    Ok(result) => result,
                    Err(_) => Err(self.run_timeout_error()),
                };
            }
        }
    }

    fn run_timeout_error(&self) -> EnsembleError {
        EnsembleError::InvocationTimeout {
            timeout_ms: self.config.run_timeout_ms,
        }
    }

    /// Invokes one agent with timeout and transient-error retries. Returns a
    /// step result rather than an error: failures are data here.
    async fn invoke_step(
        &self,
        agent_id: Uuid,
        input: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> StepResult {
        let step_timeout = Duration::from_millis(self.config.step_timeout_ms);
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if *cancel.borrow() {
                return StepResult::failure(agent_id, "run cancelled", elapsed_ms(started));
            }
            let outcome: EnsembleResult<String> = tokio::select! {
                _ = wait_cancelled(&mut cancel) => {
                    Err(EnsembleError::Invocation("run cancelled".into()))
                }
                invoked = tokio::time::timeout(step_timeout, self.invoker.invoke(agent_id, input)) => {
                    match invoked {
                        Ok(result) => result,
                        Err(_) => Err(EnsembleError::InvocationTimeout {
                            timeout_ms: self.config.step_timeout_ms,
                        }),
                    }
                }
            };
            match outcome {
                Ok(output) => {
                    debug!(
                        agent_id = %agent_id,
                        attempt,
                        duration_ms = elapsed_ms(started),
                        "Step succeeded"
                    );
                    return StepResult::success(agent_id, output, elapsed_ms(started));
                }
                Err(err) => {
                    if *cancel.borrow() {
                        return StepResult::failure(
                            agent_id,
                            "run cancelled",
                            elapsed_ms(started),
                        );
                    }
                    if err.is_transient() && attempt < self.config.retry.max_retries {
                        let delay = self.config.retry.delay_ms(attempt);
                        warn!(
                            agent_id = %agent_id,
                            attempt,
                            delay_ms = delay,
                            error = %err,
                            "Transient step failure; retrying"
                        );
                        tokio::select! {
                            _ = wait_cancelled(&mut cancel) => {
                                return StepResult::failure(
                                    agent_id,
                                    "run cancelled",
                                    elapsed_ms(started),
                                );
                            }
                            () = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        }
                        attempt += 1;
                        continue;
                    }
                    warn!(agent_id = %agent_id, attempt, error = %err, "Step failed");
                    return StepResult::failure(agent_id, err.to_string(), elapsed_ms(started));
                }
            }
        }
    }

    /// Runs steps strictly in order, each seeing the previous output.
    /// Returns the successful contributions and the final chain output.
    async fn sequential_chain(
        &self,
        request_id: Uuid,
        request_text: &str,
        steps: &[WorkflowStep],
        base_index: usize,
        cancel: &watch::Receiver<bool>,
    ) -> EnsembleResult<(Vec<Contribution>, String)> {
        let mut contributions = Vec::new();
        let mut previous: Option<String> = None;

        for (offset, step) in steps.iter().enumerate() {
            let index = base_index + offset;
            let input = match (step.input, &previous) {
                (InputTransform::PriorOutput, Some(prior)) => {
                    format!("{prior}\n\nOriginal request: {request_text}")
                }
                _ => request_text.to_string(),
            };

            let result = self.invoke_step(step.agent_id, &input, cancel.clone()).await;
            self.record_step(request_id, index, result.clone()).await;
            if *cancel.borrow() {
                return Err(EnsembleError::Invocation("run cancelled".into()));
            }

            match (result.output, result.error) {
                (Some(output), _) => {
                    contributions.push(Contribution::new(step.agent_id, output.clone()));
                    previous = Some(output);
                }
                (None, Some(error)) if self.config.continue_on_error => {
                    previous = Some(format!("[step {index} failed: {error}]"));
                }
                (None, error) => {
                    return Err(EnsembleError::Invocation(format!(
                        "step {index} failed: {}",
                        error.unwrap_or_else(|| "unknown error".into())
                    )));
                }
            }
        }

        let last = previous.unwrap_or_default();
        Ok((contributions, last))
    }

    /// Starts every step at once, bounded by the worker pool, and joins them
    /// under the run deadline. Branches still running at the deadline are
    /// aborted; finished branches keep their results.
    async fn fan_out(
        &self,
        request_id: Uuid,
        request_text: &str,
        steps: &[WorkflowStep],
        base_index: usize,
        cancel: watch::Receiver<bool>,
    ) -> EnsembleResult<Vec<StepResult>> {
        let permits = steps.len().min(self.config.max_workers).max(1);
        let pool = Arc::new(Semaphore::new(permits));
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.run_timeout_ms);

        let mut handles = Vec::with_capacity(steps.len());
        for (offset, step) in steps.iter().enumerate() {
            let engine = self.clone();
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            let input = request_text.to_string();
            let agent_id = step.agent_id;
            let handle = tokio::spawn(async move {
                let _permit = match pool.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return StepResult::failure(agent_id, "worker pool closed", 0);
                    }
                };
                engine.invoke_step(agent_id, &input, cancel).await
            });
            handles.push((base_index + offset, agent_id, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (index, agent_id, handle) in handles {
            let abort = handle.abort_handle();
            let result = match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(step_result)) => step_result,
                Ok(Err(join_err)) => {
                    warn!(request_id = %request_id, index, error = %join_err, "Branch crashed");
                    StepResult::failure(agent_id, format!("branch crashed: {join_err}"), 0)
                }
                Err(_) => {
                    abort.abort();
                    warn!(request_id = %request_id, index, "Branch hit the run deadline");
                    StepResult::failure(
                        agent_id,
                        format!("run timeout after {} ms", self.config.run_timeout_ms),
                        self.config.run_timeout_ms,
                    )
                }
            };
            self.record_step(request_id, index, result.clone()).await;
            results.push(result);
        }
        Ok(results)
    }

    /// Applies the concurrent partial-failure policy to joined branches.
    fn join_contributions(&self, results: Vec<StepResult>) -> EnsembleResult<Vec<Contribution>> {
        let contributions: Vec<Contribution> = results
            .iter()
            .filter_map(|result| {
                result
                    .output
                    .as_ref()
                    .map(|output| Contribution::new(result.agent_id, output.clone()))
            })
            .collect();
        if contributions.is_empty() {
            return Err(EnsembleError::Invocation(format!(
                "all {} branches failed",
                results.len()
            )));
        }
        Ok(contributions)
    }

    /// Fixed rounds of turns over a shared transcript, registration order
    /// within each round.
    async fn run_round_robin(
        &self,
        request_id: Uuid,
        request_text: &str,
        steps: &[WorkflowStep],
        cancel: &watch::Receiver<bool>,
    ) -> EnsembleResult<Vec<Contribution>> {
        let mut ordered: Vec<WorkflowStep> = steps.to_vec();
        ordered.sort_by_key(|step| {
            self.registry
                .get_any(step.agent_id)
                .map(|agent| agent.seq)
                .unwrap_or(u64::MAX)
        });

        let per_round = ordered.len();
        let mut transcript = Transcript::new();
        let mut contributions = Vec::new();

        for round in 0..self.config.rounds.max(1) {
            for (position, step) in ordered.iter().enumerate() {
                let index = round * per_round + position;
                let agent_name = self.agent_name(step.agent_id);
                let input = if transcript.is_empty() {
                    format!("{request_text}\n\nYou open the discussion as {agent_name}.")
                } else {
                    format!(
                        "{request_text}\n\nDiscussion so far:\n{}\n\nAdd your contribution as {agent_name}.",
                        transcript.render()
                    )
                };

                let result = self.invoke_step(step.agent_id, &input, cancel.clone()).await;
                self.record_step(request_id, index, result.clone()).await;
                if *cancel.borrow() {
                    return Err(EnsembleError::Invocation("run cancelled".into()));
                }

                if let Some(output) = result.output {
                    transcript.push(agent_name, output.clone());
                    contributions.push(Contribution::new(step.agent_id, output));
                } else {
                    debug!(
                        request_id = %request_id,
                        agent_id = %step.agent_id,
                        round,
                        "Turn failed; transcript unchanged"
                    );
                }
            }
        }

        if contributions.is_empty() {
            return Err(EnsembleError::Invocation(format!(
                "no turn succeeded across {} rounds",
                self.config.rounds.max(1)
            )));
        }
        Ok(contributions)
    }

    /// Coordinator decomposes, workers fan out, coordinator summarizes.
    /// The summary is the sole pre-synthesis contribution.
    async fn run_hierarchical(
        &self,
        request_id: Uuid,
        request_text: &str,
        plan: &WorkflowPlan,
        cancel: watch::Receiver<bool>,
    ) -> EnsembleResult<Vec<Contribution>> {
        let Some((coordinator, workers)) = plan.steps.split_first() else {
            return Err(EnsembleError::InvalidRequest("plan has no steps".into()));
        };
        if workers.is_empty() {
            return Err(EnsembleError::InvalidRequest(
                "hierarchical plan needs at least one worker".into(),
            ));
        }
        let coordinator_id = coordinator.agent_id;

        // First coordinator pass: decompose into sub-tasks.
        let decompose_input = self.decompose_prompt(request_text, workers);
        let decomposition = self
            .invoke_step(coordinator_id, &decompose_input, cancel.clone())
            .await;
        self.record_step(request_id, 0, decomposition.clone()).await;
        let Some(decomposition_output) = decomposition.output else {
            return Err(EnsembleError::Invocation(format!(
                "coordinator failed to decompose: {}",
                decomposition.error.unwrap_or_else(|| "unknown error".into())
            )));
        };

        let sub_tasks = self.parse_sub_tasks(&decomposition_output, workers);
        let sub_tasks = if sub_tasks.is_empty() {
            warn!(
                request_id = %request_id,
                "Unparseable decomposition; dispatching the request to every worker"
            );
            workers
                .iter()
                .map(|step| (step.agent_id, request_text.to_string()))
                .collect()
        } else {
            sub_tasks
        };

        // Dispatch sub-tasks as a concurrent step set.
        let results = self
            .fan_out_with_inputs(request_id, &sub_tasks, 1, cancel.clone())
            .await?;
        let worker_outputs = self.join_contributions(results)?;
        debug!(
            request_id = %request_id,
            workers = sub_tasks.len(),
            succeeded = worker_outputs.len(),
            "Sub-tasks joined"
        );

        // Second coordinator pass: combine sub-task outputs.
        let summary_index = 1 + sub_tasks.len();
        let summary_input = self.summary_prompt(request_text, &worker_outputs);
        let summary = self
            .invoke_step(coordinator_id, &summary_input, cancel)
            .await;
        self.record_step(request_id, summary_index, summary.clone())
            .await;
        match summary.output {
            Some(output) => Ok(vec![Contribution::new(coordinator_id, output)]),
            None => Err(EnsembleError::Invocation(format!(
                "coordinator failed to combine results: {}",
                summary.error.unwrap_or_else(|| "unknown error".into())
            ))),
        }
    }

    /// Variant of [`fan_out`] with a distinct input per step, used for
    /// hierarchical sub-task dispatch.
    async fn fan_out_with_inputs(
        &self,
        request_id: Uuid,
        tasks: &[(Uuid, String)],
        base_index: usize,
        cancel: watch::Receiver<bool>,
    ) -> EnsembleResult<Vec<StepResult>> {
        let permits = tasks.len().min(self.config.max_workers).max(1);
        let pool = Arc::new(Semaphore::new(permits));
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.run_timeout_ms);

        let mut handles = Vec::with_capacity(tasks.len());
        for (offset, (agent_id, input)) in tasks.iter().enumerate() {
            let engine = self.clone();
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            let agent_id = *agent_id;
            let input = input.clone();
            let handle = tokio::spawn(async move {
                let _permit = match pool.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return StepResult::failure(agent_id, "worker pool closed", 0),
                };
                engine.invoke_step(agent_id, &input, cancel).await
            });
            handles.push((base_index + offset, agent_id, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (index, agent_id, handle) in handles {
            let abort = handle.abort_handle();
            let result = match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(step_result)) => step_result,
                Ok(Err(join_err)) => {
                    StepResult::failure(agent_id, format!("branch crashed: {join_err}"), 0)
                }
                Err(_) => {
                    abort.abort();
                    StepResult::failure(
                        agent_id,
                        format!("run timeout after {} ms", self.config.run_timeout_ms),
                        self.config.run_timeout_ms,
                    )
                }
            };
            self.record_step(request_id, index, result.clone()).await;
            results.push(result);
        }
        Ok(results)
    }

    /// Sequential draft, then suspend for approval; rejection with feedback
    /// buys a revision until the rejection budget runs out.
    async fn run_human_in_loop(
        &self,
        request_id: Uuid,
        request_text: &str,
        plan: &WorkflowPlan,
        mut cancel: watch::Receiver<bool>,
    ) -> EnsembleResult<Vec<Contribution>> {
        let run_timeout = Duration::from_millis(self.config.run_timeout_ms);
        let chain = self.sequential_chain(request_id, request_text, &plan.steps, 0, &cancel);
        let (_, mut draft) = match tokio::time::timeout(run_timeout, chain).await {
            Ok(result) => result?,
            Err(_) => return Err(self.run_timeout_error()),
        };

        let wrapped_agent = plan
            .steps
            .last()
            .map(|step| step.agent_id)
            .ok_or_else(|| EnsembleError::InvalidRequest("plan has no steps".into()))?;
        let mut rejections: u32 = 0;
        let mut next_index = plan.steps.len();

        loop {
            let token = ContinuationToken::new();
            let (tx, rx) = oneshot::channel();
            {
                let mut pending = self.pending.write().await;
                pending.insert(
                    token,
                    PendingApproval {
                        request_id,
                        sender: tx,
                    },
                );
            }
            self.update_run(request_id, |run| {
                run.state = RunState::AwaitingApproval;
                run.pending_approval = Some(token);
            })
            .await;
            info!(request_id = %request_id, token = %token, "Run awaiting approval");

            let decision = tokio::select! {
                _ = wait_cancelled(&mut cancel) => {
                    let mut pending = self.pending.write().await;
                    pending.remove(&token);
                    return Err(EnsembleError::Invocation("run cancelled".into()));
                }
                received = rx => match received {
                    Ok(decision) => decision,
                    // Sender dropped without a decision; happens when the
                    // run is cancelled while suspended.
                    Err(_) => return Err(EnsembleError::Invocation("run cancelled".into())),
                }
            };

            self.update_run(request_id, |run| {
                run.state = RunState::Executing;
                run.pending_approval = None;
            })
            .await;

            if decision.approved {
                info!(request_id = %request_id, "Draft approved");
                return Ok(vec![Contribution::new(wrapped_agent, draft)]);
            }

            let Some(feedback) = decision.feedback else {
                return Err(EnsembleError::ApprovalRejected(
                    "draft rejected without feedback".into(),
                ));
            };
            rejections += 1;
            warn!(request_id = %request_id, rejections, "Draft rejected with feedback");
            if rejections >= self.config.approval_max_retries.max(1) {
                return Err(EnsembleError::ApprovalTimeout(format!(
                    "draft rejected {rejections} times"
                )));
            }

            let input = format!(
                "{request_text}\n\nPrevious draft:\n{draft}\n\nReviewer feedback:\n{feedback}\n\nRevise the draft accordingly."
            );
            let revision = self
                .invoke_step(wrapped_agent, &input, cancel.clone())
                .await;
            self.record_step(request_id, next_index, revision.clone())
                .await;
            next_index += 1;
            match revision.output {
                Some(new_draft) => draft = new_draft,
                None => {
                    return Err(EnsembleError::Invocation(format!(
                        "revision failed: {}",
                        revision.error.unwrap_or_else(|| "unknown error".into())
                    )));
                }
            }
        }
    }

    fn decompose_prompt(&self, request_text: &str, workers: &[WorkflowStep]) -> String {
        let mut worker_lines = String::new();
        for step in workers {
            if let Some(agent) = self.registry.get_any(step.agent_id) {
                let tags: Vec<&str> = agent.capability_tags.iter().map(String::as_str).collect();
                worker_lines.push_str(&format!(
                    "- {} (id: {}, tags: {})\n",
                    agent.name,
                    agent.id,
                    tags.join(", ")
                ));
            } else {
                worker_lines.push_str(&format!("- unknown (id: {})\n", step.agent_id));
            }
        }
        format!(
            "You coordinate a team of specialists.\n\n\
             Request:\n{request_text}\n\n\
             Specialists:\n{worker_lines}\n\
             Split the request into one sub-task per relevant specialist. \
             Respond with only a JSON array:\n\
             [{{\"agent\": \"name or id\", \"instructions\": \"...\"}}]"
        )
    }

    fn summary_prompt(&self, request_text: &str, outputs: &[Contribution]) -> String {
        let mut output_lines = String::new();
        for contribution in outputs {
            output_lines.push_str(&format!(
                "### {}\n{}\n\n",
                self.agent_name(contribution.agent_id),
                contribution.output
            ));
        }
        format!(
            "Original request:\n{request_text}\n\n\
             Sub-task results:\n{output_lines}\
             Combine these results into one answer to the original request."
        )
    }

    /// Extracts `[{agent, instructions}]` pairs from the coordinator's
    /// decomposition, resolving agents against the planned workers. Unknown
    /// agents are skipped; an empty result means the caller falls back.
    fn parse_sub_tasks(&self, raw: &str, workers: &[WorkflowStep]) -> Vec<(Uuid, String)> {
        let Some(start) = raw.find('[') else {
            return Vec::new();
        };
        let Some(end) = raw.rfind(']') else {
            return Vec::new();
        };
        if end < start {
            return Vec::new();
        }
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw[start..=end]) else {
            return Vec::new();
        };
        let Some(entries) = value.as_array() else {
            return Vec::new();
        };

        let mut sub_tasks = Vec::new();
        for entry in entries {
            let Some(key) = entry["agent"].as_str() else {
                continue;
            };
            let Some(instructions) = entry["instructions"].as_str() else {
                continue;
            };
            let resolved = workers.iter().find(|step| {
                if let Ok(id) = Uuid::parse_str(key.trim()) {
                    return step.agent_id == id;
                }
                self.registry
                    .get_any(step.agent_id)
                    .is_some_and(|agent| agent.name.eq_ignore_ascii_case(key.trim()))
            });
            match resolved {
                Some(step) => sub_tasks.push((step.agent_id, instructions.to_string())),
                None => warn!(agent = key, "Decomposition named an unplanned agent; skipping"),
            }
        }
        sub_tasks
    }

    fn agent_name(&self, agent_id: Uuid) -> String {
        match self.registry.get_any(agent_id) {
            Some(agent) => agent.name,
            None => format!("agent-{}", &agent_id.to_string()[..8]),
        }
    }

    async fn record_step(&self, request_id: Uuid, index: usize, result: StepResult) {
        let mut runs = self.runs.write().await;
        if let Some(run) = runs.get_mut(&request_id) {
            run.step_results.insert(index, result);
        }
    }

    async fn update_run(&self, request_id: Uuid, apply: impl FnOnce(&mut WorkflowRun)) {
        let mut runs = self.runs.write().await;
        if let Some(run) = runs.get_mut(&request_id) {
            apply(run);
        }
    }

    async fn finalize(&self, request_id: Uuid, apply: impl FnOnce(&mut WorkflowRun)) {
        let mut runs = self.runs.write().await;
        if let Some(run) = runs.get_mut(&request_id) {
            apply(run);
            run.pending_approval = None;
            run.finished_at = Some(chrono::Utc::now());
        }
    }
}

/// Resolves when cancellation is signalled; pends forever when the sender is
/// gone (a dropped sender means no cancel can ever arrive).
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
