use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ensemble_core::ContinuationToken;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution strategy chosen by the router for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One agent answers the request on its own.
    Single,
    /// Agents run one after another, each seeing the previous output.
    Sequential,
    /// Agents run in parallel on the original request.
    Concurrent,
    /// Agents take turns over a shared transcript for a fixed number of rounds.
    RoundRobin,
    /// A coordinator decomposes the request, workers execute, the coordinator summarizes.
    Hierarchical,
    /// A sequential draft is gated by an external approval before synthesis.
    HumanInLoop,
}

impl Strategy {
    /// Parses a strategy name leniently, accepting the casing and separator
    /// variants that completion models tend to produce.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "single" => Some(Strategy::Single),
            "sequential" => Some(Strategy::Sequential),
            "concurrent" | "parallel" => Some(Strategy::Concurrent),
            "roundrobin" => Some(Strategy::RoundRobin),
            "hierarchical" => Some(Strategy::Hierarchical),
            "humaninloop" | "humanintheloop" => Some(Strategy::HumanInLoop),
            _ => None,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Single => write!(f, "single"),
            Strategy::Sequential => write!(f, "sequential"),
            Strategy::Concurrent => write!(f, "concurrent"),
            Strategy::RoundRobin => write!(f, "round_robin"),
            Strategy::Hierarchical => write!(f, "hierarchical"),
            Strategy::HumanInLoop => write!(f, "human_in_loop"),
        }
    }
}

/// How a step derives its input text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputTransform {
    /// The step receives the original request text.
    Original,
    /// The step receives the previous step's output plus the original request.
    PriorOutput,
    /// The step receives the original request plus the shared transcript so far.
    Transcript,
}

/// One planned agent invocation inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub agent_id: Uuid,
    pub input: InputTransform,
}

impl WorkflowStep {
    pub fn new(agent_id: Uuid, input: InputTransform) -> Self {
        Self { agent_id, input }
    }
}

/// The router's output: which agents run, in what shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub request_id: Uuid,
    pub strategy: Strategy,
    pub steps: Vec<WorkflowStep>,
    /// How the plan was produced, for operators reading run exports.
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

impl WorkflowPlan {
    pub fn new(request_id: Uuid, strategy: Strategy, steps: Vec<WorkflowStep>) -> Self {
        Self {
            request_id,
            strategy,
            steps,
            rationale: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    /// Distinct agent ids in step order.
    pub fn agent_ids(&self) -> Vec<Uuid> {
        let mut seen = Vec::new();
        for step in &self.steps {
            if !seen.contains(&step.agent_id) {
                seen.push(step.agent_id);
            }
        }
        seen
    }
}

/// Lifecycle of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Routing,
    Executing,
    AwaitingApproval,
    Synthesizing,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Created => "created",
            RunState::Routing => "routing",
            RunState::Executing => "executing",
            RunState::AwaitingApproval => "awaiting_approval",
            RunState::Synthesizing => "synthesizing",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Broad classification of what sank a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    Routing,
    Invocation,
    InvocationTimeout,
    Synthesis,
    ApprovalRejected,
    ApprovalTimeout,
    Cancelled,
}

/// A run-terminal error with its classification preserved for callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub kind: RunErrorKind,
    pub detail: String,
}

impl RunError {
    pub fn new(kind: RunErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Maps an engine error onto the run-level classification.
    pub fn from_error(err: &ensemble_core::EnsembleError) -> Self {
        use ensemble_core::EnsembleError;
        let kind = match err {
            EnsembleError::Routing(_) => RunErrorKind::Routing,
            EnsembleError::InvocationTimeout { .. } | EnsembleError::Timeout(_) => {
                RunErrorKind::InvocationTimeout
            }
            EnsembleError::Synthesis(_) => RunErrorKind::Synthesis,
            EnsembleError::ApprovalRejected(_) => RunErrorKind::ApprovalRejected,
            EnsembleError::ApprovalTimeout(_) => RunErrorKind::ApprovalTimeout,
            _ => RunErrorKind::Invocation,
        };
        Self::new(kind, err.to_string())
    }
}

/// Outcome of one agent invocation within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub agent_id: Uuid,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn success(agent_id: Uuid, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            agent_id,
            output: Some(output.into()),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(agent_id: Uuid, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            agent_id,
            output: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.output.is_some()
    }
}

/// A successful step output carried into synthesis, with its source agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub agent_id: Uuid,
    pub output: String,
}

impl Contribution {
    pub fn new(agent_id: Uuid, output: impl Into<String>) -> Self {
        Self {
            agent_id,
            output: output.into(),
        }
    }
}

/// One turn in a shared round-robin discussion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub agent_name: String,
    pub content: String,
}

/// Append-only discussion transcript shared by round-robin participants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    turns: Vec<TranscriptTurn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, agent_name: impl Into<String>, content: impl Into<String>) {
        self.turns.push(TranscriptTurn {
            agent_name: agent_name.into(),
            content: content.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &[TranscriptTurn] {
        &self.turns
    }

    /// Renders the transcript as labeled turns, oldest first.
    pub fn render(&self) -> String {
        self.turns
            .iter()
            .map(|turn| format!("[{}]: {}", turn.agent_name, turn.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Mutable state of a workflow run tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub request_id: Uuid,
    pub request_text: String,
    pub plan: WorkflowPlan,
    pub state: RunState,
    /// Results keyed by step index; sparse until the run finishes.
    pub step_results: BTreeMap<usize, StepResult>,
    pub final_response: Option<String>,
    pub memory_record_id: Option<Uuid>,
    /// Whether the synthesizer flagged conflicting outputs for review.
    pub requires_review: bool,
    pub error: Option<RunError>,
    /// Set while the run is suspended waiting for an approval decision.
    pub pending_approval: Option<ContinuationToken>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(request_text: impl Into<String>, plan: WorkflowPlan) -> Self {
        Self {
            request_id: plan.request_id,
            request_text: request_text.into(),
            plan,
            state: RunState::Created,
            step_results: BTreeMap::new(),
            final_response: None,
            memory_record_id: None,
            requires_review: false,
            error: None,
            pending_approval: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Successful step outputs in step-index order.
    pub fn successful_contributions(&self) -> Vec<Contribution> {
        self.step_results
            .values()
            .filter_map(|step| {
                step.output
                    .as_ref()
                    .map(|output| Contribution::new(step.agent_id, output.clone()))
            })
            .collect()
    }

    /// Flattens the run into an export record for audit trails.
    pub fn to_record(&self) -> RunRecord {
        RunRecord {
            request_id: self.request_id,
            request_text: self.request_text.clone(),
            strategy: self.plan.strategy,
            rationale: self.plan.rationale.clone(),
            state: self.state,
            agent_ids: self.plan.agent_ids(),
            step_results: self.step_results.values().cloned().collect(),
            final_response: self.final_response.clone(),
            memory_record_id: self.memory_record_id,
            requires_review: self.requires_review,
            error: self.error.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Serializable snapshot of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub request_id: Uuid,
    pub request_text: String,
    pub strategy: Strategy,
    pub rationale: String,
    pub state: RunState,
    pub agent_ids: Vec<Uuid>,
    pub step_results: Vec<StepResult>,
    pub final_response: Option<String>,
    pub memory_record_id: Option<Uuid>,
    pub requires_review: bool,
    pub error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
