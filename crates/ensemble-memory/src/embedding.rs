//! Embedding capability trait and the local deterministic implementation.

use async_trait::async_trait;
use ensemble_core::{EnsembleError, EnsembleResult};
use std::collections::HashMap;

/// A service that turns text into fixed-length vectors.
///
/// May fail with [`Timeout`](EnsembleError::Timeout) or
/// [`ServiceUnavailable`](EnsembleError::ServiceUnavailable); memory stores
/// degrade to zero-vector records instead of propagating those failures.
#[async_trait]
pub trait EmbeddingCapability: Send + Sync {
    /// Computes the embedding vector for a single text.
    async fn embed(&self, text: &str) -> EnsembleResult<Vec<f32>>;

    /// Computes embeddings for a batch of texts.
    async fn embed_batch(&self, texts: &[&str]) -> EnsembleResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    /// Dimension of the vectors this capability produces.
    fn dimension(&self) -> usize;
}

/// Deterministic hashed bag-of-words embedder.
///
/// Tokenizes to lowercase alphanumeric words, hashes each token into a small
/// number of vector positions with decaying weights, and L2-normalizes the
/// result. No I/O and no randomness: identical text always yields the
/// identical vector, which the engine's routing and memory tests rely on.
pub struct HashingEmbedder {
    dimension: usize,
}

// Probe seeds keep the three positions per token independent.
const PROBE_SEEDS: [u32; 3] = [0, 0x9e37_79b9, 0x85eb_ca6b];
const PROBE_WEIGHTS: [f32; 3] = [1.0, 0.6, 0.4];

impl HashingEmbedder {
    /// Creates an embedder producing vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 1)
            .map(str::to_string)
            .collect()
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingCapability for HashingEmbedder {
    async fn embed(&self, text: &str) -> EnsembleResult<Vec<f32>> {
        let tokens = Self::tokenize(text);
        if tokens.is_empty() {
            return Err(EnsembleError::InvalidRequest(
                "text has no embeddable tokens".to_string(),
            ));
        }

        let mut counts: HashMap<&str, f32> = HashMap::new();
        for token in &tokens {
            *counts.entry(token.as_str()).or_insert(0.0) += 1.0;
        }

        let mut vector = vec![0.0f32; self.dimension];
        for (token, count) in &counts {
            for (seed, weight) in PROBE_SEEDS.iter().zip(PROBE_WEIGHTS.iter()) {
                let slot = fnv1a(token.as_bytes(), *seed) as usize % self.dimension;
                vector[slot] += count * weight;
            }
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// FNV-1a with a per-probe seed folded into the offset basis.
fn fnv1a(data: &[u8], seed: u32) -> u32 {
    let mut hash: u32 = 0x811c_9dc5 ^ seed;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
