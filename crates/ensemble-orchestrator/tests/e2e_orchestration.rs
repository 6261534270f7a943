#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end orchestration tests.
//!
//! Drives the full submit -> route -> execute -> synthesize -> record
//! pipeline through the public facade with scripted invokers and canned
//! completion replies. Covers fallback routing determinism, concurrent
//! partial failure, sequential chaining, round-robin transcripts,
//! hierarchical decomposition, approval flows, cancellation, and memory
//! grounding across consecutive runs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use ensemble_core::{
    AgentInvocationCapability, ApprovalDecision, CompletionCapability, ContinuationToken,
    EnsembleError, EnsembleResult,
};
use ensemble_memory::{DurableMemoryStore, HashingEmbedder, MemoryFilter, MemoryStore};
use ensemble_orchestrator::{
    EngineConfig, Orchestrator, OrchestratorConfig, RunErrorKind, RunOutcome, RunState, Strategy,
};
use ensemble_registry::{AgentRegistry, NewAgent};

// ---------------------------------------------------------------------------
// Scripted invoker: fixed reply per agent, every call recorded
// ---------------------------------------------------------------------------

struct ScriptedInvoker {
    replies: Mutex<HashMap<Uuid, String>>,
    calls: Mutex<Vec<(Uuid, String)>>,
}

impl ScriptedInvoker {
    fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn reply(&self, agent_id: Uuid, output: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(agent_id, output.to_string());
    }

    fn calls(&self) -> Vec<(Uuid, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentInvocationCapability for ScriptedInvoker {
    async fn invoke(&self, agent_id: Uuid, input: &str) -> EnsembleResult<String> {
        self.calls
            .lock()
            .unwrap()
            .push((agent_id, input.to_string()));
        let replies = self.replies.lock().unwrap();
        match replies.get(&agent_id) {
            Some(output) => Ok(output.clone()),
            None => Err(EnsembleError::Invocation("no script for agent".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Sequenced invoker: per-agent reply queues for multi-pass strategies
// ---------------------------------------------------------------------------

struct SequencedInvoker {
    scripts: Mutex<HashMap<Uuid, VecDeque<String>>>,
}

impl SequencedInvoker {
    fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
        }
    }

    fn push(&self, agent_id: Uuid, output: &str) {
        self.scripts
            .lock()
            .unwrap()
            .entry(agent_id)
            .or_default()
            .push_back(output.to_string());
    }
}

#[async_trait]
impl AgentInvocationCapability for SequencedInvoker {
    async fn invoke(&self, agent_id: Uuid, _input: &str) -> EnsembleResult<String> {
        let mut scripts = self.scripts.lock().unwrap();
        scripts
            .get_mut(&agent_id)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| EnsembleError::Invocation("script exhausted".into()))
    }
}

struct StallingInvoker;

#[async_trait]
impl AgentInvocationCapability for StallingInvoker {
    async fn invoke(&self, _agent_id: Uuid, _input: &str) -> EnsembleResult<String> {
        tokio::time::sleep(Duration::from_secs(120)).await;
        Ok("far too late".into())
    }
}

struct CannedCompletion {
    reply: String,
}

#[async_trait]
impl CompletionCapability for CannedCompletion {
    async fn complete(&self, _prompt: &str) -> EnsembleResult<String> {
        Ok(self.reply.clone())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Registers the three incident-handling specialists used across these tests.
fn specialist_registry() -> (Arc<AgentRegistry>, Uuid, Uuid, Uuid) {
    let registry = Arc::new(AgentRegistry::new());
    let priority = registry.register(
        NewAgent::new("priority", "You assess incident priority.").with_tags(["urgency"]),
    );
    let team = registry.register(
        NewAgent::new("team", "You identify the owning team.").with_tags(["ownership"]),
    );
    let effort = registry.register(
        NewAgent::new("effort", "You estimate remediation effort.").with_tags(["estimate"]),
    );
    (registry, priority, team, effort)
}

const OUTAGE_REQUEST: &str =
    "Production outage affecting payments, who owns this and how urgent?";

async fn wait_terminal(orchestrator: &Orchestrator, request_id: Uuid) -> RunOutcome {
    for _ in 0..600 {
        match orchestrator.get_result(request_id).await.unwrap() {
            RunOutcome::Pending { .. } => tokio::time::sleep(Duration::from_millis(5)).await,
            outcome => return outcome,
        }
    }
    panic!("run {request_id} never reached a terminal state");
}

/// Polls until the run suspends with a token different from `prior`. The old
/// token can still be visible for a moment after a resume, so waiting for the
/// next draft means waiting for a fresh one.
async fn wait_for_approval(
    orchestrator: &Orchestrator,
    request_id: Uuid,
    prior: Option<ContinuationToken>,
) -> ContinuationToken {
    for _ in 0..600 {
        let status = orchestrator.get_status(request_id).await.unwrap();
        if status.state == RunState::AwaitingApproval {
            if let Some(token) = status.continuation {
                if Some(token) != prior {
                    return token;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run {request_id} never reached AwaitingApproval");
}

fn completed_response(outcome: RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed { final_response, .. } => final_response,
        other => panic!("expected completion, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Test: a request matching no capability tag consults every specialist
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_e2e_no_signal_consults_all_specialists() {
    let (registry, priority, team, effort) = specialist_registry();
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.reply(priority, "Sev-1, page the on-call now.");
    invoker.reply(team, "Payments platform owns checkout.");
    invoker.reply(effort, "Half a day including verification.");

    let orchestrator = Orchestrator::builder()
        .registry(Arc::clone(&registry))
        .invoker(Arc::clone(&invoker) as Arc<dyn AgentInvocationCapability>)
        .build()
        .unwrap();

    let request_id = orchestrator.submit(OUTAGE_REQUEST, &MemoryFilter::any()).await.unwrap();
    let response = completed_response(wait_terminal(&orchestrator, request_id).await);

    // Every specialist contributed a labeled section, in registration order.
    let p = response.find("## priority").unwrap();
    let t = response.find("## team").unwrap();
    let e = response.find("## effort").unwrap();
    assert!(p < t && t < e);
    assert!(response.contains("Sev-1"));
    assert!(response.contains("Payments platform"));
    assert!(response.contains("Half a day"));

    let record = orchestrator.export_run(request_id).await.unwrap();
    assert_eq!(record.strategy, Strategy::Concurrent);
    assert_eq!(record.step_results.len(), 3);
    assert_eq!(record.agent_ids, vec![priority, team, effort]);

    // Exactly one memory record, tagged with the request and every agent.
    let records = orchestrator.query_memory(&MemoryFilter::any()).await.unwrap();
    assert_eq!(records.len(), 1);
    let memory = &records[0];
    assert!(memory.tags.contains(&request_id.to_string()));
    assert!(memory.tags.contains(&priority.to_string()));
    assert!(memory.tags.contains(&team.to_string()));
    assert!(memory.tags.contains(&effort.to_string()));
    assert!(memory.tags.contains("priority"));
}

// ---------------------------------------------------------------------------
// Test: memory from a finished run grounds the next identical request
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_e2e_second_identical_request_is_grounded_by_memory() {
    let (registry, priority, team, effort) = specialist_registry();
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.reply(priority, "Sev-1.");
    invoker.reply(team, "Payments platform.");
    invoker.reply(effort, "Half a day.");

    let orchestrator = Orchestrator::builder()
        .registry(Arc::clone(&registry))
        .invoker(Arc::clone(&invoker) as Arc<dyn AgentInvocationCapability>)
        .build()
        .unwrap();

    // First run has nothing to ground the disagreeing answers against.
    let first = orchestrator.submit(OUTAGE_REQUEST, &MemoryFilter::any()).await.unwrap();
    match wait_terminal(&orchestrator, first).await {
        RunOutcome::Completed { requires_review, .. } => assert!(requires_review),
        other => panic!("expected completion, got {other:?}"),
    }

    // The record written by the first run grounds every agent on the second.
    let second = orchestrator.submit(OUTAGE_REQUEST, &MemoryFilter::any()).await.unwrap();
    match wait_terminal(&orchestrator, second).await {
        RunOutcome::Completed { requires_review, .. } => assert!(!requires_review),
        other => panic!("expected completion, got {other:?}"),
    }

    let records = orchestrator.query_memory(&MemoryFilter::any()).await.unwrap();
    assert_eq!(records.len(), 2);
}

// ---------------------------------------------------------------------------
// Test: completion-routed sequential chain passes prior output forward
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_e2e_completion_routes_sequential_chain() {
    let registry = Arc::new(AgentRegistry::new());
    let researcher = registry.register(
        NewAgent::new("researcher", "You gather sources.").with_tags(["research"]),
    );
    let writer =
        registry.register(NewAgent::new("writer", "You write prose.").with_tags(["writing"]));

    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.reply(researcher, "three sources on embedded caching");
    invoker.reply(writer, "a readable article");

    let orchestrator = Orchestrator::builder()
        .registry(Arc::clone(&registry))
        .invoker(Arc::clone(&invoker) as Arc<dyn AgentInvocationCapability>)
        .completion(Arc::new(CannedCompletion {
            reply: r#"{"strategy": "sequential", "agents": ["researcher", "writer"]}"#.into(),
        }))
        .build()
        .unwrap();

    let request_id = orchestrator
        .submit("research embedded caching and write it up", &MemoryFilter::any())
        .await
        .unwrap();
    wait_terminal(&orchestrator, request_id).await;

    let calls = invoker.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, researcher);
    assert_eq!(calls[1].0, writer);
    // The writer saw the researcher's output before the original request.
    assert!(calls[1].1.contains("three sources on embedded caching"));
    assert!(calls[1].1.contains("research embedded caching"));

    let record = orchestrator.export_run(request_id).await.unwrap();
    assert_eq!(record.strategy, Strategy::Sequential);
    assert_eq!(record.rationale, "completion decision");
}

// ---------------------------------------------------------------------------
// Test: without a completion capability, routing is deterministic
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_e2e_fallback_routing_is_deterministic() {
    let (registry, priority, team, effort) = specialist_registry();
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.reply(priority, "p");
    invoker.reply(team, "t");
    invoker.reply(effort, "e");

    let orchestrator = Orchestrator::builder()
        .registry(Arc::clone(&registry))
        .invoker(Arc::clone(&invoker) as Arc<dyn AgentInvocationCapability>)
        .build()
        .unwrap();

    let first = orchestrator.submit(OUTAGE_REQUEST, &MemoryFilter::any()).await.unwrap();
    wait_terminal(&orchestrator, first).await;
    let second = orchestrator.submit(OUTAGE_REQUEST, &MemoryFilter::any()).await.unwrap();
    wait_terminal(&orchestrator, second).await;

    let a = orchestrator.export_run(first).await.unwrap();
    let b = orchestrator.export_run(second).await.unwrap();
    assert_eq!(a.strategy, b.strategy);
    assert_eq!(a.agent_ids, b.agent_ids);
}

// ---------------------------------------------------------------------------
// Test: a concurrent run records every branch and survives one failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_e2e_concurrent_tolerates_partial_branch_failure() {
    let (registry, priority, team, effort) = specialist_registry();
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.reply(priority, "Sev-1.");
    invoker.reply(effort, "Half a day.");
    // team has no script and fails its branch
    let _ = team;

    let orchestrator = Orchestrator::builder()
        .registry(Arc::clone(&registry))
        .invoker(Arc::clone(&invoker) as Arc<dyn AgentInvocationCapability>)
        .build()
        .unwrap();

    let request_id = orchestrator.submit(OUTAGE_REQUEST, &MemoryFilter::any()).await.unwrap();
    let response = completed_response(wait_terminal(&orchestrator, request_id).await);
    assert!(response.contains("Sev-1"));
    assert!(response.contains("Half a day"));

    let record = orchestrator.export_run(request_id).await.unwrap();
    assert_eq!(record.state, RunState::Completed);
    assert_eq!(record.step_results.len(), 3);
    let successes = record
        .step_results
        .iter()
        .filter(|step| step.is_success())
        .count();
    assert_eq!(successes, 2);
}

// ---------------------------------------------------------------------------
// Test: round-robin turns share one growing transcript
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_e2e_round_robin_transcript_flows_between_turns() {
    let registry = Arc::new(AgentRegistry::new());
    let optimist = registry.register(
        NewAgent::new("optimist", "You argue for shipping.").with_tags(["debate"]),
    );
    let skeptic = registry.register(
        NewAgent::new("skeptic", "You argue for waiting.").with_tags(["debate"]),
    );

    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.reply(optimist, "ship it this week");
    invoker.reply(skeptic, "wait for the soak test");

    let config = OrchestratorConfig {
        engine: EngineConfig {
            rounds: 2,
            ..EngineConfig::default()
        },
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::builder()
        .config(config)
        .registry(Arc::clone(&registry))
        .invoker(Arc::clone(&invoker) as Arc<dyn AgentInvocationCapability>)
        .completion(Arc::new(CannedCompletion {
            reply: r#"{"strategy": "round_robin", "agents": ["optimist", "skeptic"]}"#.into(),
        }))
        .build()
        .unwrap();

    let request_id = orchestrator
        .submit("should we release before the holidays?", &MemoryFilter::any())
        .await
        .unwrap();
    wait_terminal(&orchestrator, request_id).await;

    let calls = invoker.calls();
    assert_eq!(calls.len(), 4, "two agents, two rounds");
    assert_eq!(calls[0].0, optimist);
    assert_eq!(calls[1].0, skeptic);
    // Later turns see earlier turns through the transcript.
    assert!(calls[1].1.contains("[optimist]: ship it this week"));
    assert!(calls[2].1.contains("[skeptic]: wait for the soak test"));

    let record = orchestrator.export_run(request_id).await.unwrap();
    assert_eq!(record.strategy, Strategy::RoundRobin);
    assert_eq!(record.step_results.len(), 4);
}

// ---------------------------------------------------------------------------
// Test: hierarchical decomposition, worker fan-out, coordinator summary
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_e2e_hierarchical_pipeline() {
    let registry = Arc::new(AgentRegistry::new());
    let lead = registry.register(
        NewAgent::new("lead", "You coordinate specialists.").with_tags(["coordination"]),
    );
    let analyst = registry.register(
        NewAgent::new("analyst", "You analyze data.").with_tags(["analysis"]),
    );
    let editor =
        registry.register(NewAgent::new("editor", "You polish text.").with_tags(["editing"]));

    let invoker = Arc::new(SequencedInvoker::new());
    invoker.push(
        lead,
        r#"[{"agent": "analyst", "instructions": "pull the quarterly numbers"},
            {"agent": "editor", "instructions": "polish the executive summary"}]"#,
    );
    invoker.push(analyst, "numbers pulled and charted");
    invoker.push(editor, "summary polished");
    invoker.push(lead, "Quarterly report: numbers charted, summary polished.");

    let orchestrator = Orchestrator::builder()
        .registry(Arc::clone(&registry))
        .invoker(Arc::clone(&invoker) as Arc<dyn AgentInvocationCapability>)
        .completion(Arc::new(CannedCompletion {
            reply: r#"{"strategy": "hierarchical", "agents": ["lead", "analyst", "editor"]}"#
                .into(),
        }))
        .build()
        .unwrap();

    let request_id = orchestrator
        .submit("prepare the quarterly report", &MemoryFilter::any())
        .await
        .unwrap();
    let response = completed_response(wait_terminal(&orchestrator, request_id).await);
    assert_eq!(
        response,
        "Quarterly report: numbers charted, summary polished."
    );

    let record = orchestrator.export_run(request_id).await.unwrap();
    assert_eq!(record.strategy, Strategy::Hierarchical);
    // decompose + two workers + summary
    assert_eq!(record.step_results.len(), 4);
}

// ---------------------------------------------------------------------------
// Test: rejecting a draft twice exhausts the approval budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_e2e_rejected_twice_fails_with_approval_timeout() {
    let registry = Arc::new(AgentRegistry::new());
    let drafter = registry.register(
        NewAgent::new("drafter", "You draft announcements.").with_tags(["announcement"]),
    );
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.reply(drafter, "draft text");

    let orchestrator = Orchestrator::builder()
        .registry(Arc::clone(&registry))
        .invoker(Arc::clone(&invoker) as Arc<dyn AgentInvocationCapability>)
        .completion(Arc::new(CannedCompletion {
            reply: r#"{"strategy": "human_in_loop", "agents": ["drafter"]}"#.into(),
        }))
        .build()
        .unwrap();

    let request_id = orchestrator
        .submit("draft the maintenance announcement", &MemoryFilter::any())
        .await
        .unwrap();

    let first = wait_for_approval(&orchestrator, request_id, None).await;
    orchestrator
        .resume(first, ApprovalDecision::reject("mention the start time"))
        .await
        .unwrap();

    let second = wait_for_approval(&orchestrator, request_id, Some(first)).await;
    assert_ne!(first, second);
    orchestrator
        .resume(second, ApprovalDecision::reject("still missing the time"))
        .await
        .unwrap();

    match wait_terminal(&orchestrator, request_id).await {
        RunOutcome::Failed { error, .. } => {
            assert_eq!(error.kind, RunErrorKind::ApprovalTimeout);
        }
        other => panic!("expected approval exhaustion, got {other:?}"),
    }

    // One initial draft plus one revision between the rejections.
    assert_eq!(invoker.calls().len(), 2);

    // A redeemed token cannot be redeemed again.
    let err = orchestrator
        .resume(second, ApprovalDecision::approve())
        .await
        .unwrap_err();
    assert!(matches!(err, EnsembleError::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Test: cancellation settles the run and keeps it exportable
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_e2e_cancel_then_export() {
    let registry = Arc::new(AgentRegistry::new());
    registry.register(NewAgent::new("slow", "You take forever.").with_tags(["anything"]));

    let orchestrator = Orchestrator::builder()
        .registry(Arc::clone(&registry))
        .invoker(Arc::new(StallingInvoker))
        .build()
        .unwrap();

    let request_id = orchestrator
        .submit("take all the time you need", &MemoryFilter::any())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.cancel(request_id).await.unwrap();

    match wait_terminal(&orchestrator, request_id).await {
        RunOutcome::Failed { error, .. } => assert_eq!(error.kind, RunErrorKind::Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }

    let record = orchestrator.export_run(request_id).await.unwrap();
    assert_eq!(record.state, RunState::Cancelled);
    assert!(record.finished_at.is_some());
}

// ---------------------------------------------------------------------------
// Test: runs recorded through a durable store survive a restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_e2e_durable_memory_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("memory.jsonl");

    let registry = Arc::new(AgentRegistry::new());
    let billing = registry.register(
        NewAgent::new("billing", "You handle refunds.").with_tags(["invoice"]),
    );
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.reply(billing, "refund issued");

    let request_id = {
        let memory: Arc<dyn MemoryStore> = Arc::new(
            DurableMemoryStore::new(path.clone(), Arc::new(HashingEmbedder::default()))
                .await
                .unwrap(),
        );
        let orchestrator = Orchestrator::builder()
            .registry(Arc::clone(&registry))
            .memory(memory)
            .invoker(Arc::clone(&invoker) as Arc<dyn AgentInvocationCapability>)
            .build()
            .unwrap();

        let request_id = orchestrator
            .submit("please check this invoice", &MemoryFilter::any())
            .await
            .unwrap();
        wait_terminal(&orchestrator, request_id).await;
        request_id
    };

    // A fresh store over the same file still holds the interaction.
    let reopened = DurableMemoryStore::new(path, Arc::new(HashingEmbedder::default()))
        .await
        .unwrap();
    let records = reopened
        .list(&MemoryFilter::any().with_tag(request_id.to_string()))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].response_text, "refund issued");
    assert!(records[0].tags.contains("billing"));
}
