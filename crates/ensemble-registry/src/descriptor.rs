//! Agent descriptor and registration request types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Eligible for routing and invocation.
    Active,
    /// Excluded from routing; still resolvable for historical records.
    Retired,
}

/// A registered worker agent.
///
/// Created by [`AgentRegistry::register`](crate::AgentRegistry::register) and
/// immutable afterwards except for `status`. Descriptors are never physically
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique identifier assigned at registration.
    pub id: Uuid,
    /// Unique name, used for idempotent reuse lookups.
    pub name: String,
    /// Capability tags, normalized to lowercase.
    pub capability_tags: BTreeSet<String>,
    /// Instruction text describing how the agent should behave.
    pub persona: String,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Registration sequence number; orders deterministic tie-breaks.
    pub seq: u64,
    /// UTC timestamp of registration.
    pub registered_at: DateTime<Utc>,
}

impl AgentDescriptor {
    /// Whether this agent is eligible for routing.
    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// A registration request for a new agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    /// Unique agent name.
    pub name: String,
    /// Capability tags; normalized to lowercase on registration.
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,
    /// Instruction text for the agent.
    #[serde(default)]
    pub persona: String,
}

impl NewAgent {
    /// Creates a registration request with the given name and persona.
    pub fn new(name: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability_tags: BTreeSet::new(),
            persona: persona.into(),
        }
    }

    /// Adds capability tags to the request.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capability_tags
            .extend(tags.into_iter().map(|t| t.into()));
        self
    }
}
