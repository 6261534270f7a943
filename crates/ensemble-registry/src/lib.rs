//! Agent registry for the Ensemble orchestration engine.
//!
//! Holds the descriptors of every worker agent known to the system: identity,
//! capability tags and persona. Registration is idempotent by name, retired
//! agents stay resolvable for historical records, and capability lookups
//! return deterministic orderings so routing stays reproducible.
//!
//! # Main types
//!
//! - [`AgentDescriptor`] — Identity, tags and persona of one agent.
//! - [`NewAgent`] — Registration request.
//! - [`AgentRegistry`] — Concurrent, read-mostly descriptor store.

/// Agent descriptor and registration request types.
pub mod descriptor;
/// The registry itself.
pub mod registry;

pub use descriptor::{AgentDescriptor, AgentStatus, NewAgent};
pub use registry::AgentRegistry;
