use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ensemble_core::{CompletionCapability, EnsembleError, EnsembleResult};
use ensemble_memory::{MemoryFilter, MemoryStore};
use ensemble_registry::AgentRegistry;
use futures_util::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Contribution, Strategy};

/// What synthesis produced for a run.
#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    pub final_response: String,
    /// Id of the memory record written for this run, if the write succeeded.
    pub memory_record_id: Option<Uuid>,
    /// Set when conflicting outputs could not be reconciled against memory.
    pub requires_review: bool,
}

/// Merges step outputs into one response and records the interaction.
///
/// Uses the completion capability with a fixed merge template when available;
/// otherwise concatenates outputs labeled by agent name so no content is ever
/// dropped. When outputs disagree, the one backed by the most recent memory
/// grounding leads; with no grounding at all the response is flagged for
/// review instead of picking a winner.
pub struct ResultSynthesizer {
    registry: Arc<AgentRegistry>,
    memory: Arc<dyn MemoryStore>,
    completion: Option<Arc<dyn CompletionCapability>>,
}

struct Section {
    agent_id: Uuid,
    agent_name: String,
    output: String,
    grounded_at: Option<DateTime<Utc>>,
}

impl ResultSynthesizer {
    pub fn new(registry: Arc<AgentRegistry>, memory: Arc<dyn MemoryStore>) -> Self {
        Self {
            registry,
            memory,
            completion: None,
        }
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionCapability>) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Produces the final response for a run and writes exactly one memory
    /// record for it. A failing memory backend downgrades to a warning; only
    /// an empty contribution set is a synthesis failure.
    pub async fn synthesize(
        &self,
        request_id: Uuid,
        request_text: &str,
        strategy: Strategy,
        contributions: &[Contribution],
    ) -> EnsembleResult<SynthesisOutput> {
        if contributions.is_empty() {
            return Err(EnsembleError::Synthesis(
                "no successful step outputs to merge".into(),
            ));
        }

        let mut sections = self.grounded_sections(request_text, contributions).await;
        // Grounded outputs lead, freshest grounding first; ungrounded keep
        // their step order after them.
        sections.sort_by(|a, b| match (b.grounded_at, a.grounded_at) {
            (Some(tb), Some(ta)) => tb.cmp(&ta),
            (Some(_), None) => std::cmp::Ordering::Greater,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (None, None) => std::cmp::Ordering::Equal,
        });

        let distinct_agents: Vec<Uuid> = {
            let mut seen = Vec::new();
            for section in &sections {
                if !seen.contains(&section.agent_id) {
                    seen.push(section.agent_id);
                }
            }
            seen
        };
        let requires_review =
            distinct_agents.len() >= 2 && sections.iter().all(|s| s.grounded_at.is_none());

        let final_response = match self.merge(request_text, &sections, requires_review).await {
            Some(merged) => merged,
            None => concatenate(&sections, requires_review),
        };

        let memory_record_id = self
            .record_interaction(
                request_id,
                request_text,
                &final_response,
                &sections,
                &distinct_agents,
            )
            .await;

        info!(
            request_id = %request_id,
            strategy = %strategy,
            sections = sections.len(),
            requires_review,
            "Synthesis complete"
        );

        Ok(SynthesisOutput {
            final_response,
            memory_record_id,
            requires_review,
        })
    }

    /// Resolves agent names and looks up each agent's most recent memory
    /// grounding for this request.
    async fn grounded_sections(
        &self,
        request_text: &str,
        contributions: &[Contribution],
    ) -> Vec<Section> {
        let lookups = contributions.iter().map(|contribution| {
            let memory = Arc::clone(&self.memory);
            let agent_id = contribution.agent_id;
            async move {
                let filter = MemoryFilter::any().with_tag(agent_id.to_string());
                let outcome = memory.search(request_text, 1, &filter).await;
                outcome
                    .hits
                    .first()
                    .filter(|hit| hit.score > 0.0)
                    .map(|hit| hit.record.created_at)
            }
        });
        let groundings = join_all(lookups).await;

        contributions
            .iter()
            .zip(groundings)
            .map(|(contribution, grounded_at)| Section {
                agent_id: contribution.agent_id,
                agent_name: self.agent_name(contribution.agent_id),
                output: contribution.output.clone(),
                grounded_at,
            })
            .collect()
    }

    fn agent_name(&self, agent_id: Uuid) -> String {
        match self.registry.get_any(agent_id) {
            Some(descriptor) => descriptor.name,
            None => format!("agent-{}", &agent_id.to_string()[..8]),
        }
    }

    /// Attempts the completion-backed merge. `None` means "use the fallback".
    async fn merge(
        &self,
        request_text: &str,
        sections: &[Section],
        requires_review: bool,
    ) -> Option<String> {
        let completion = self.completion.as_ref()?;
        if sections.len() == 1 {
            // Nothing to merge; normalization is enough.
            return None;
        }
        let prompt = merge_prompt(request_text, sections, requires_review);
        match completion.complete(&prompt).await {
            Ok(merged) if !merged.trim().is_empty() => Some(merged.trim().to_string()),
            Ok(_) => {
                warn!("Completion merge returned empty text; using concatenation");
                None
            }
            Err(err) => {
                warn!(error = %err, "Completion merge failed; using concatenation");
                None
            }
        }
    }

    /// Writes the single memory record for the run. Backend trouble is logged
    /// and swallowed so a finished run still completes.
    async fn record_interaction(
        &self,
        request_id: Uuid,
        request_text: &str,
        final_response: &str,
        sections: &[Section],
        distinct_agents: &[Uuid],
    ) -> Option<Uuid> {
        let mut tags: BTreeSet<String> = BTreeSet::new();
        tags.insert(request_id.to_string());
        for section in sections {
            tags.insert(section.agent_id.to_string());
            tags.insert(section.agent_name.clone());
        }
        let source_agent_id = match distinct_agents {
            [only] => Some(*only),
            _ => None,
        };

        match self
            .memory
            .insert(request_text, final_response, source_agent_id, tags)
            .await
        {
            Ok(record) => Some(record.id),
            Err(err) => {
                warn!(
                    request_id = %request_id,
                    error = %err,
                    "Could not record synthesized interaction"
                );
                None
            }
        }
    }
}

/// Deterministic fallback: every output survives, labeled by its agent.
fn concatenate(sections: &[Section], requires_review: bool) -> String {
    if sections.len() == 1 {
        return sections[0].output.trim().to_string();
    }
    let mut merged = sections
        .iter()
        .map(|section| format!("## {}\n\n{}", section.agent_name, section.output.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");
    if requires_review {
        merged.push_str(
            "\n\nNote: these answers could not be reconciled against prior \
             interactions and may conflict; requires review.",
        );
    }
    merged
}

fn merge_prompt(request_text: &str, sections: &[Section], requires_review: bool) -> String {
    let mut output_lines = String::new();
    for section in sections {
        let grounding = match section.grounded_at {
            Some(at) => format!("grounded by memory from {at}"),
            None => "no memory grounding".to_string(),
        };
        output_lines.push_str(&format!(
            "### {} ({grounding})\n{}\n\n",
            section.agent_name, section.output
        ));
    }
    let conflict_note = if requires_review {
        "None of the outputs is grounded in prior interactions. If they \
         disagree on a fact, keep both versions and mark the answer with \
         'requires review'."
    } else {
        "If outputs disagree on a fact, prefer the one grounded by the most \
         recent memory."
    };
    format!(
        "Combine the agent outputs below into one coherent answer to the \
         request. Do not drop substantive content.\n\n\
         Request:\n{request_text}\n\n\
         Agent outputs:\n{output_lines}\
         {conflict_note}"
    )
}
