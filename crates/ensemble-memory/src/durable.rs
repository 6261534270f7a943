//! Durable JSON-lines backend.

use crate::embedding::EmbeddingCapability;
use crate::record::{MemoryFilter, MemoryRecord, SearchOutcome};
use crate::store::{embed_or_degrade, rank_records, MemoryStore};
use async_trait::async_trait;
use ensemble_core::{EnsembleError, EnsembleResult};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// File-backed memory store, one JSON record per line.
///
/// Inserts append to the file; searches and listings scan it. Unlike the
/// ephemeral backend this one is allowed to fail: an unreachable file
/// surfaces as `MemoryBackendUnavailable` on insert and as a degraded
/// outcome on search, per the engine's degradation policy. Capacity is
/// bounded by the filesystem, not by a ring.
pub struct DurableMemoryStore {
    path: PathBuf,
    embedder: Arc<dyn EmbeddingCapability>,
    // Serializes appends so concurrent inserts cannot interleave lines.
    write_guard: Mutex<()>,
}

impl DurableMemoryStore {
    /// Opens (or prepares to create) the store at `path`.
    ///
    /// Parent directories are created eagerly; a directory that cannot be
    /// created reports `MemoryBackendUnavailable` right away rather than on
    /// first insert.
    pub async fn new(
        path: impl Into<PathBuf>,
        embedder: Arc<dyn EmbeddingCapability>,
    ) -> EnsembleResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EnsembleError::MemoryBackendUnavailable(format!(
                    "cannot create {}: {e}",
                    parent.display()
                ))
            })?;
        }
        Ok(Self {
            path,
            embedder,
            write_guard: Mutex::new(()),
        })
    }

    /// Loads every parseable record with its line index as insertion order.
    async fn load(&self) -> EnsembleResult<Vec<(u64, MemoryRecord)>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EnsembleError::MemoryBackendUnavailable(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )))
            }
        };

        let mut records = Vec::new();
        for (index, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MemoryRecord>(line) {
                Ok(record) => records.push((index as u64, record)),
                Err(e) => {
                    // A corrupt line loses one record, not the whole store.
                    warn!(line = index + 1, error = %e, "Skipping unparseable memory line");
                }
            }
        }
        Ok(records)
    }

    async fn append(&self, record: &MemoryRecord) -> EnsembleResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_guard.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                EnsembleError::MemoryBackendUnavailable(format!(
                    "cannot open {}: {e}",
                    self.path.display()
                ))
            })?;
        file.write_all(line.as_bytes()).await.map_err(|e| {
            EnsembleError::MemoryBackendUnavailable(format!(
                "cannot append to {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for DurableMemoryStore {
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
        self.append(&record).await?;
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

        let records = match self.load().await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "Memory backend unavailable; search degraded");
                return SearchOutcome::degraded();
            }
        };

        let hits = rank_records(
            records.iter().map(|(seq, r)| (*seq, r)),
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
        let records = self.load().await?;
        Ok(records
            .into_iter()
            .rev()
            .map(|(_, r)| r)
            .filter(|r| filter.matches(r))
            .collect())
    }

    async fn count(&self) -> EnsembleResult<usize> {
        Ok(self.load().await?.len())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    async fn open_store(path: PathBuf) -> DurableMemoryStore {
        DurableMemoryStore::new(path, Arc::new(HashingEmbedder::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_records_survive_reopening() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("memory.jsonl");

        {
            let store = open_store(path.clone()).await;
            store
                .insert("first interaction", "one", None, BTreeSet::new())
                .await
                .unwrap();
            store
                .insert("second interaction", "two", None, BTreeSet::new())
                .await
                .unwrap();
        }

        let reopened = open_store(path).await;
        assert_eq!(reopened.count().await.unwrap(), 2);
        let outcome = reopened
            .search("first interaction", 1, &MemoryFilter::any())
            .await;
        assert_eq!(outcome.hits[0].record.response_text, "one");
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path().join("nothing-yet.jsonl")).await;
        assert_eq!(store.count().await.unwrap(), 0);
        let outcome = store.search("anything at all", 5, &MemoryFilter::any()).await;
        assert!(!outcome.degraded);
        assert!(outcome.hits.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("memory.jsonl");

        let store = open_store(path.clone()).await;
        store
            .insert("good record here", "kept", None, BTreeSet::new())
            .await
            .unwrap();

        // Corrupt the file by hand.
        let mut data = tokio::fs::read_to_string(&path).await.unwrap();
        data.push_str("{not json at all\n");
        tokio::fs::write(&path, data).await.unwrap();

        let reopened = open_store(path).await;
        assert_eq!(reopened.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_insert_and_degrades_search() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory where the store expects a file.
        let path = tmp.path().join("occupied");
        tokio::fs::create_dir_all(&path).await.unwrap();

        let store = open_store(path).await;
        let err = store
            .insert("request", "response", None, BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EnsembleError::MemoryBackendUnavailable(_)));

        let outcome = store.search("request", 5, &MemoryFilter::any()).await;
        assert!(outcome.degraded);
        assert!(outcome.hits.is_empty());
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_filterable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path().join("memory.jsonl")).await;

        let mut tags = BTreeSet::new();
        tags.insert("workflow:alpha".to_string());
        store.insert("older", "1", None, tags.clone()).await.unwrap();
        store.insert("newer", "2", None, tags).await.unwrap();
        store.insert("other", "3", None, BTreeSet::new()).await.unwrap();

        let filtered = store
            .list(&MemoryFilter::any().with_tag("workflow:alpha"))
            .await
            .unwrap();
        let texts: Vec<&str> = filtered.iter().map(|r| r.request_text.as_str()).collect();
        assert_eq!(texts, vec!["newer", "older"]);
    }
}
