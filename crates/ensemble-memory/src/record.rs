//! Record, filter and search result types for interaction memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Tag attached to records whose embedding could not be computed.
///
/// Such records carry a zero vector and never rank above genuine matches, but
/// they remain listable and their presence is visible to auditing.
pub const DEGRADED_TAG: &str = "degraded=true";

/// One immutable interaction record.
///
/// Created once by a step completion or by the synthesizer; never mutated,
/// only superseded by newer records. The embedding is computed exactly once
/// at insert time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique record identifier.
    pub id: Uuid,
    /// The agent that produced the response, or `None` for synthesized
    /// whole-workflow records.
    pub source_agent_id: Option<Uuid>,
    /// The request text this interaction answered.
    pub request_text: String,
    /// The response text produced.
    pub response_text: String,
    /// Fixed-length embedding of the interaction, zero-filled when degraded.
    pub embedding: Vec<f32>,
    /// Free-form tags (agent names, workflow ids, degradation markers).
    pub tags: BTreeSet<String>,
    /// UTC timestamp of record creation.
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Builds a record with a fresh id and the current timestamp.
    pub fn new(
        request_text: impl Into<String>,
        response_text: impl Into<String>,
        source_agent_id: Option<Uuid>,
        tags: BTreeSet<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_agent_id,
            request_text: request_text.into(),
            response_text: response_text.into(),
            embedding,
            tags,
            created_at: Utc::now(),
        }
    }

    /// Whether this record was stored without a usable embedding.
    pub fn is_degraded(&self) -> bool {
        self.tags.contains(DEGRADED_TAG)
    }
}

/// Constraints applied to searches and listings.
///
/// All required tags must be present on a record for it to match; date bounds
/// are inclusive on `after` and exclusive on `before`. An empty filter
/// matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFilter {
    /// Tags a record must all carry.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Only records created at or after this instant.
    #[serde(default)]
    pub after: Option<DateTime<Utc>>,
    /// Only records created strictly before this instant.
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
}

impl MemoryFilter {
    /// A filter matching every record.
    pub fn any() -> Self {
        Self::default()
    }

    /// Requires `tag` on matching records.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Restricts matches to records created at or after `instant`.
    pub fn created_after(mut self, instant: DateTime<Utc>) -> Self {
        self.after = Some(instant);
        self
    }

    /// Restricts matches to records created strictly before `instant`.
    pub fn created_before(mut self, instant: DateTime<Utc>) -> Self {
        self.before = Some(instant);
        self
    }

    /// Whether `record` satisfies every constraint.
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if !self.tags.is_subset(&record.tags) {
            return false;
        }
        if let Some(after) = self.after {
            if record.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.before {
            if record.created_at >= before {
                return false;
            }
        }
        true
    }
}

/// A record paired with its similarity score for one query.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    /// The matching record.
    pub record: MemoryRecord,
    /// Cosine similarity against the query embedding, in `[-1, 1]`.
    pub score: f32,
}

/// The outcome of a similarity search.
///
/// `degraded` is set instead of an error when the backend or the embedding
/// capability was unavailable; callers treat the hits as best-effort either
/// way.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    /// Matching records, best first.
    pub hits: Vec<ScoredRecord>,
    /// Whether the search ran without its backend or query embedding.
    pub degraded: bool,
}

impl SearchOutcome {
    /// An empty outcome with the degradation flag raised. Store
    /// implementations return this whenever the backend or the query
    /// embedding is unavailable.
    pub fn degraded() -> Self {
        Self {
            hits: Vec::new(),
            degraded: true,
        }
    }
}
