//! Store contract and the ephemeral ring-buffer backend.

use crate::embedding::EmbeddingCapability;
use crate::record::{MemoryFilter, MemoryRecord, ScoredRecord, SearchOutcome, DEGRADED_TAG};
use async_trait::async_trait;
use ensemble_core::EnsembleResult;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Contract shared by every memory backend.
///
/// `insert` computes the embedding internally; the in-process backend never
/// fails it (embedding trouble degrades to a zero-vector record tagged
/// [`DEGRADED_TAG`]), the durable backend may fail with
/// `MemoryBackendUnavailable`. `search` never fails: backend trouble yields
/// an empty, `degraded`-flagged outcome instead.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Stores one interaction and returns the created record.
    async fn insert(
        &self,
        request_text: &str,
        response_text: &str,
        source_agent_id: Option<Uuid>,
        tags: BTreeSet<String>,
    ) -> EnsembleResult<MemoryRecord>;

    /// Returns the `top_k` records most similar to `query_text`, constrained
    /// by `filter`; ties broken by most-recent first.
    async fn search(&self, query_text: &str, top_k: usize, filter: &MemoryFilter)
        -> SearchOutcome;

    /// Lists matching records, newest first.
    async fn list(&self, filter: &MemoryFilter) -> EnsembleResult<Vec<MemoryRecord>>;

    /// Number of records currently held.
    async fn count(&self) -> EnsembleResult<usize>;
}

/// Cosine similarity between two vectors.
///
/// Length mismatches and zero-norm vectors score 0.0, which keeps degraded
/// zero-vector records below every genuine match.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Scores, filters and ranks `(insertion_seq, record)` pairs against a query
/// embedding. Both backends rank through here so their semantics stay
/// identical: score descending, then newest first, then latest insert first.
pub(crate) fn rank_records<'a, I>(
    records: I,
    query: &[f32],
    top_k: usize,
    filter: &MemoryFilter,
) -> Vec<ScoredRecord>
where
    I: Iterator<Item = (u64, &'a MemoryRecord)>,
{
    let mut scored: Vec<(u64, ScoredRecord)> = records
        .filter(|(_, r)| filter.matches(r))
        .map(|(seq, r)| {
            let score = cosine_similarity(query, &r.embedding);
            (
                seq,
                ScoredRecord {
                    record: r.clone(),
                    score,
                },
            )
        })
        .collect();

    scored.sort_by(|(seq_a, a), (seq_b, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.record.created_at.cmp(&a.record.created_at))
            .then_with(|| seq_b.cmp(seq_a))
    });
    scored.truncate(top_k);
    scored.into_iter().map(|(_, hit)| hit).collect()
}

/// Embeds `text`, degrading to a zero vector plus [`DEGRADED_TAG`] on failure.
pub(crate) async fn embed_or_degrade(
    embedder: &Arc<dyn EmbeddingCapability>,
    text: &str,
    tags: &mut BTreeSet<String>,
) -> Vec<f32> {
    match embedder.embed(text).await {
        Ok(vector) => vector,
        Err(err) => {
            warn!(error = %err, "Embedding failed; storing zero-vector record");
            tags.insert(DEGRADED_TAG.to_string());
            vec![0.0; embedder.dimension()]
        }
    }
}

/// Bounded in-process backend.
///
/// A FIFO ring buffer: when capacity is exceeded the oldest record is
/// evicted. Reads clone snapshots under a shared lock; inserts serialize
/// behind the write lock.
pub struct EphemeralMemoryStore {
    embedder: Arc<dyn EmbeddingCapability>,
    inner: RwLock<Ring>,
    capacity: usize,
}

struct Ring {
    records: VecDeque<(u64, MemoryRecord)>,
    next_seq: u64,
}

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 10_000;

impl EphemeralMemoryStore {
    /// Creates a store with [`DEFAULT_CAPACITY`].
    pub fn new(embedder: Arc<dyn EmbeddingCapability>) -> Self {
        Self::with_capacity(embedder, DEFAULT_CAPACITY)
    }

    /// Creates a store bounded at `capacity` records (minimum 1).
    pub fn with_capacity(embedder: Arc<dyn EmbeddingCapability>, capacity: usize) -> Self {
        Self {
            embedder,
            inner: RwLock::new(Ring {
                records: VecDeque::new(),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl MemoryStore for EphemeralMemoryStore {
    async fn insert(
        &self,
        request_text: &str,
        response_text: &str,
        source_agent_id: Option<Uuid>,
        mut tags: BTreeSet<String>,
    ) -> EnsembleResult<MemoryRecord> {
        let embedding = embed_or_degrade(&self.embedder, request_text, &mut tags).await;
        let record =
            MemoryRecord::new(request_text, response_text, source_agent_id, tags, embedding);

        let mut ring = self.inner.write().await;
        let seq = ring.next_seq;
        ring.next_seq += 1;
        ring.records.push_back((seq, record.clone()));
        while ring.records.len() > self.capacity {
            if let Some((_, evicted)) = ring.records.pop_front() {
                debug!(record = %evicted.id, "Evicted oldest memory record");
            }
        }
        Ok(record)
    }

    async fn search(
        &self,
        query_text: &str,
        top_k: usize,
        filter: &MemoryFilter,
    ) -> SearchOutcome {
        let query = match self.embedder.embed(query_text).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!(error = %err, "Query embedding failed; memory search degraded");
                return SearchOutcome::degraded();
            }
        };

        let ring = self.inner.read().await;
        let hits = rank_records(
            ring.records.iter().map(|(seq, r)| (*seq, r)),
            &query,
            top_k,
            filter,
        );
        SearchOutcome {
            hits,
            degraded: false,
        }
    }

    async fn list(&self, filter: &MemoryFilter) -> EnsembleResult<Vec<MemoryRecord>> {
        let ring = self.inner.read().await;
        Ok(ring
            .records
            .iter()
            .rev()
            .filter(|(_, r)| filter.matches(r))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn count(&self) -> EnsembleResult<usize> {
        Ok(self.inner.read().await.records.len())
    }
}
