use std::collections::BTreeSet;
use std::sync::Arc;

use ensemble_core::{CompletionCapability, EnsembleError, EnsembleResult};
use ensemble_memory::{MemoryFilter, MemoryStore, ScoredRecord};
use ensemble_registry::{AgentDescriptor, AgentRegistry};
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RouterConfig;
use crate::types::{InputTransform, Strategy, WorkflowPlan, WorkflowStep};

/// Decides which agents handle a request and under which strategy.
///
/// Routing first consults the completion capability (when one is wired in)
/// with the candidate agents, their personas, and recent memory as context.
/// If that capability is missing, errors, or answers unparseably, a pure
/// keyword scorer takes over so routing stays deterministic and explainable.
pub struct CapabilityRouter {
    registry: Arc<AgentRegistry>,
    memory: Arc<dyn MemoryStore>,
    completion: Option<Arc<dyn CompletionCapability>>,
    config: RouterConfig,
}

impl CapabilityRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        memory: Arc<dyn MemoryStore>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            memory,
            completion: None,
            config,
        }
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionCapability>) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Produces an immutable [`WorkflowPlan`] for the request.
    ///
    /// Fails with [`EnsembleError::Routing`] only when the registry holds no
    /// active agent at all; every other degradation falls back to a coarser
    /// but still viable plan.
    pub async fn route(
        &self,
        request_id: Uuid,
        request_text: &str,
        context: &MemoryFilter,
    ) -> EnsembleResult<WorkflowPlan> {
        let recalled = self
            .memory
            .search(request_text, self.config.memory_top_k, context)
            .await;

        let words = request_words(request_text);
        let word_refs: Vec<&str> = words.iter().map(String::as_str).collect();
        let mut candidates = self.registry.find_by_capability(&word_refs);
        if candidates.is_empty() {
            // No tag intersects the request; every active agent is a candidate.
            candidates = self.registry.list();
        }
        if candidates.is_empty() {
            return Err(EnsembleError::Routing(
                "no active agents registered".into(),
            ));
        }

        if let Some(completion) = &self.completion {
            let prompt = decision_prompt(request_text, &candidates, &recalled.hits);
            match completion.complete(&prompt).await {
                Ok(raw) => {
                    if let Some((strategy, agents)) = self.parse_decision(&raw) {
                        info!(
                            request_id = %request_id,
                            strategy = %strategy,
                            agents = agents.len(),
                            "Routing decision from completion capability"
                        );
                        return Ok(WorkflowPlan::new(
                            request_id,
                            strategy,
                            build_steps(strategy, &agents),
                        )
                        .with_rationale("completion decision"));
                    }
                    warn!(
                        request_id = %request_id,
                        "Unparseable completion decision; using fallback scorer"
                    );
                }
                Err(err) => {
                    warn!(
                        request_id = %request_id,
                        error = %err,
                        "Completion routing failed; using fallback scorer"
                    );
                }
            }
        }

        self.fallback_plan(request_id, request_text, candidates)
    }

    /// Pure keyword-scoring fallback. Given the same request text and
    /// registry snapshot it always yields the same plan.
    fn fallback_plan(
        &self,
        request_id: Uuid,
        request_text: &str,
        candidates: Vec<AgentDescriptor>,
    ) -> EnsembleResult<WorkflowPlan> {
        let mut scored: Vec<(usize, AgentDescriptor)> = candidates
            .into_iter()
            .map(|agent| (keyword_score(request_text, &agent.capability_tags), agent))
            .collect();
        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b.cmp(score_a).then(a.seq.cmp(&b.seq))
        });

        let positive: Vec<&(usize, AgentDescriptor)> =
            scored.iter().filter(|(score, _)| *score > 0).collect();

        let (strategy, agents, rationale) = if !positive.is_empty() {
            let top_score = positive[0].0;
            let runner_up = positive.get(1).map(|(score, _)| *score).unwrap_or(0);
            if positive.len() == 1 || top_score - runner_up >= self.config.dominance_margin {
                (
                    Strategy::Single,
                    vec![positive[0].1.clone()],
                    format!("dominant keyword match (score {top_score})"),
                )
            } else {
                (
                    Strategy::Concurrent,
                    positive.iter().map(|(_, agent)| agent.clone()).collect(),
                    format!("competing keyword matches (top score {top_score})"),
                )
            }
        } else {
            let default = self
                .config
                .default_agent
                .as_deref()
                .and_then(|name| self.find_active_by_name(name));
            if self.config.default_agent.is_some() && default.is_none() {
                warn!(
                    request_id = %request_id,
                    default_agent = self.config.default_agent.as_deref().unwrap_or_default(),
                    "Configured default agent is not active; ignoring it"
                );
            }
            if let Some(agent) = default {
                (
                    Strategy::Single,
                    vec![agent],
                    "default agent (no keyword signal)".to_string(),
                )
            } else if scored.len() == 1 {
                (
                    Strategy::Single,
                    vec![scored[0].1.clone()],
                    "sole active agent (no keyword signal)".to_string(),
                )
            } else {
                // Nothing in the request points at a specialist, so consult
                // every active agent and let synthesis reconcile the answers.
                (
                    Strategy::Concurrent,
                    scored.iter().map(|(_, agent)| agent.clone()).collect(),
                    "no keyword signal; consulting all active agents".to_string(),
                )
            }
        };

        info!(
            request_id = %request_id,
            strategy = %strategy,
            agents = agents.len(),
            "Routing decision from fallback scorer"
        );
        Ok(WorkflowPlan::new(request_id, strategy, build_steps(strategy, &agents))
            .with_rationale(rationale))
    }

    /// Extracts `{strategy, agents}` from a completion response. Returns
    /// `None` for anything that cannot be resolved against active agents.
    fn parse_decision(&self, raw: &str) -> Option<(Strategy, Vec<AgentDescriptor>)> {
        let start = raw.find('{')?;
        let end = raw.rfind('}')?;
        if end < start {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(&raw[start..=end]).ok()?;

        let strategy = Strategy::parse_loose(value["strategy"].as_str()?)?;
        let listed = value["agents"]
            .as_array()
            .or_else(|| value["agent_ids"].as_array())?;

        let active = self.registry.list();
        let mut selected: Vec<AgentDescriptor> = Vec::new();
        for entry in listed {
            let Some(key) = entry.as_str() else { continue };
            match resolve_agent(key, &active) {
                Some(agent) => {
                    if !selected.iter().any(|chosen| chosen.id == agent.id) {
                        selected.push(agent);
                    }
                }
                None => warn!(agent = key, "Completion named an unknown agent; skipping"),
            }
        }
        if selected.is_empty() {
            return None;
        }

        // A coordinator or a discussion needs company; demote to Single.
        let strategy = match strategy {
            Strategy::Hierarchical | Strategy::RoundRobin if selected.len() < 2 => {
                Strategy::Single
            }
            other => other,
        };
        // Single means exactly one invocation; keep the first listed agent.
        if strategy == Strategy::Single && selected.len() > 1 {
            warn!(
                listed = selected.len(),
                kept = %selected[0].name,
                "Completion listed several agents for a single run; keeping the first"
            );
            selected.truncate(1);
        }
        Some((strategy, selected))
    }

    fn find_active_by_name(&self, name: &str) -> Option<AgentDescriptor> {
        self.registry
            .list()
            .into_iter()
            .find(|agent| agent.name.eq_ignore_ascii_case(name))
    }
}

/// Lowercased alphanumeric tokens of the request, deduplicated in order.
fn request_words(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut words: Vec<String> = Vec::new();
    for token in lowered.split(|c: char| !c.is_alphanumeric()) {
        if token.len() > 1 && !words.iter().any(|w| w == token) {
            words.push(token.to_string());
        }
    }
    words
}

/// Counts case-insensitive whole-word occurrences of each tag in the text.
fn keyword_score(request_text: &str, tags: &BTreeSet<String>) -> usize {
    tags.iter()
        .map(|tag| {
            match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(tag))) {
                Ok(re) => re.find_iter(request_text).count(),
                Err(_) => 0,
            }
        })
        .sum()
}

fn build_steps(strategy: Strategy, agents: &[AgentDescriptor]) -> Vec<WorkflowStep> {
    agents
        .iter()
        .enumerate()
        .map(|(index, agent)| {
            let input = match strategy {
                Strategy::Single | Strategy::Concurrent | Strategy::Hierarchical => {
                    InputTransform::Original
                }
                Strategy::Sequential | Strategy::HumanInLoop => {
                    if index == 0 {
                        InputTransform::Original
                    } else {
                        InputTransform::PriorOutput
                    }
                }
                Strategy::RoundRobin => InputTransform::Transcript,
            };
            WorkflowStep::new(agent.id, input)
        })
        .collect()
}

fn resolve_agent(key: &str, active: &[AgentDescriptor]) -> Option<AgentDescriptor> {
    let trimmed = key.trim();
    if let Ok(id) = Uuid::parse_str(trimmed) {
        return active.iter().find(|agent| agent.id == id).cloned();
    }
    active
        .iter()
        .find(|agent| agent.name.eq_ignore_ascii_case(trimmed))
        .cloned()
}

fn decision_prompt(
    request_text: &str,
    candidates: &[AgentDescriptor],
    recalled: &[ScoredRecord],
) -> String {
    let mut agent_lines = String::new();
    for agent in candidates {
        let tags: Vec<&str> = agent.capability_tags.iter().map(String::as_str).collect();
        agent_lines.push_str(&format!(
            "- {} (tags: {}): {}\n",
            agent.name,
            tags.join(", "),
            agent.persona
        ));
    }

    let mut memory_lines = String::new();
    for hit in recalled {
        memory_lines.push_str(&format!(
            "- ({:.2}) {} => {}\n",
            hit.score,
            truncate(&hit.record.request_text, 160),
            truncate(&hit.record.response_text, 160),
        ));
    }
    if memory_lines.is_empty() {
        memory_lines.push_str("(none)\n");
    }

    format!(
        "You route requests to specialist agents.\n\n\
         Request:\n{request_text}\n\n\
         Available agents:\n{agent_lines}\n\
         Related prior interactions:\n{memory_lines}\n\
         Pick an execution strategy from: single, sequential, concurrent, \
         round_robin, hierarchical, human_in_loop. For hierarchical, list the \
         coordinator first. Respond with only a JSON object:\n\
         {{\"strategy\": \"...\", \"agents\": [\"name\", ...]}}"
    )
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
