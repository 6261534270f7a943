//! Concurrent agent descriptor store.

use crate::descriptor::{AgentDescriptor, AgentStatus, NewAgent};
use chrono::Utc;
use ensemble_core::{EnsembleError, EnsembleResult};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

/// Central registry for all worker agents.
///
/// Read-mostly: routing reads take a shared lock and return cloned snapshots;
/// `register`/`retire` writes are serialized behind the same lock. Share it
/// across tasks as `Arc<AgentRegistry>`.
pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
}

struct RegistryInner {
    agents: HashMap<Uuid, AgentDescriptor>,
    // Active agents only; retired names become reusable.
    by_name: HashMap<String, Uuid>,
    next_seq: u64,
}

impl AgentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                agents: HashMap::new(),
                by_name: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Registers an agent, reusing any Active descriptor with the same name.
    ///
    /// Returns the existing id unchanged when an Active agent already carries
    /// `new.name` (idempotent reuse); otherwise assigns a fresh id and stores
    /// the descriptor as Active. Capability tags are trimmed and lowercased.
    pub fn register(&self, new: NewAgent) -> Uuid {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_name.get(&new.name) {
            debug!(agent = %new.name, %id, "Reusing registered agent");
            return id;
        }

        let id = Uuid::new_v4();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let descriptor = AgentDescriptor {
            id,
            name: new.name.clone(),
            capability_tags: normalize_tags(&new.capability_tags),
            persona: new.persona,
            status: AgentStatus::Active,
            seq,
            registered_at: Utc::now(),
        };
        inner.by_name.insert(new.name.clone(), id);
        inner.agents.insert(id, descriptor);
        info!(agent = %new.name, %id, "Registered agent");
        id
    }

    /// Retires an agent, excluding it from future routing.
    ///
    /// The descriptor remains resolvable via [`get_any`](Self::get_any); its
    /// name becomes available for re-registration under a new id.
    pub fn retire(&self, id: Uuid) -> EnsembleResult<()> {
        let mut inner = self.inner.write();
        let name = {
            let agent = inner
                .agents
                .get_mut(&id)
                .ok_or_else(|| EnsembleError::NotFound(format!("agent {id}")))?;
            agent.status = AgentStatus::Retired;
            agent.name.clone()
        };
        if inner.by_name.get(&name) == Some(&id) {
            inner.by_name.remove(&name);
        }
        info!(agent = %name, %id, "Retired agent");
        Ok(())
    }

    /// Returns Active agents whose capability tags intersect `tags`,
    /// ordered by match count descending, then registration order ascending.
    ///
    /// Query tags are matched after the same lowercase normalization applied
    /// at registration. Agents with no matching tag are omitted.
    pub fn find_by_capability(&self, tags: &[&str]) -> Vec<AgentDescriptor> {
        let query: BTreeSet<String> = tags.iter().map(|t| t.trim().to_lowercase()).collect();
        let inner = self.inner.read();

        let mut matched: Vec<(usize, AgentDescriptor)> = inner
            .agents
            .values()
            .filter(|a| a.is_active())
            .filter_map(|a| {
                let count = a.capability_tags.intersection(&query).count();
                (count > 0).then(|| (count, a.clone()))
            })
            .collect();
        matched.sort_by(|(ca, a), (cb, b)| cb.cmp(ca).then(a.seq.cmp(&b.seq)));
        matched.into_iter().map(|(_, a)| a).collect()
    }

    /// Looks up an Active agent by id.
    ///
    /// Retired or unknown ids fail with `NotFound`; historical callers that
    /// must resolve retired agents use [`get_any`](Self::get_any) instead.
    pub fn get(&self, id: Uuid) -> EnsembleResult<AgentDescriptor> {
        let inner = self.inner.read();
        inner
            .agents
            .get(&id)
            .filter(|a| a.is_active())
            .cloned()
            .ok_or_else(|| EnsembleError::NotFound(format!("agent {id}")))
    }

    /// Looks up an agent by id regardless of status.
    pub fn get_any(&self, id: Uuid) -> Option<AgentDescriptor> {
        self.inner.read().agents.get(&id).cloned()
    }

    /// All Active agents in registration order.
    pub fn list(&self) -> Vec<AgentDescriptor> {
        let inner = self.inner.read();
        let mut agents: Vec<AgentDescriptor> = inner
            .agents
            .values()
            .filter(|a| a.is_active())
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.seq);
        agents
    }

    /// Number of descriptors ever registered, retired ones included.
    pub fn len(&self) -> usize {
        self.inner.read().agents.len()
    }

    /// Whether the registry holds no descriptors at all.
    pub fn is_empty(&self) -> bool {
        self.inner.read().agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_tags(tags: &BTreeSet<String>) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
