//! Vector-based interaction memory for the Ensemble orchestration engine.
//!
//! Stores immutable records of past interactions together with their
//! embeddings and answers similarity queries over them. Two interchangeable
//! backends share one contract: a bounded in-process ring buffer and a
//! durable JSON-lines file store. Both degrade instead of failing the caller
//! when the embedding capability or the backing store is unavailable, so
//! routing and synthesis can always proceed without memory.
//!
//! # Main types
//!
//! - [`MemoryStore`] — Backend contract: insert, similarity search, listing.
//! - [`EphemeralMemoryStore`] — Bounded FIFO ring buffer backend.
//! - [`DurableMemoryStore`] — JSON-lines file backend.
//! - [`MemoryRecord`] — One immutable interaction record.
//! - [`MemoryFilter`] — Tag and date-range constraints for queries.
//! - [`EmbeddingCapability`] — Abstract embedding seam.
//! - [`HashingEmbedder`] — Deterministic local embedder for tests and
//!   offline operation.

/// Durable JSON-lines backend.
pub mod durable;
/// Embedding capability trait and the local deterministic implementation.
pub mod embedding;
/// Record, filter and search result types.
pub mod record;
/// Store contract and the ephemeral backend.
pub mod store;

pub use durable::DurableMemoryStore;
pub use embedding::{EmbeddingCapability, HashingEmbedder};
pub use record::{MemoryFilter, MemoryRecord, ScoredRecord, SearchOutcome, DEGRADED_TAG};
pub use store::{EphemeralMemoryStore, MemoryStore};
