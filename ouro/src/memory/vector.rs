//! Optional vector index for semantic search.
//!
//! The index is pluggable and may be absent at runtime; the engine then
//! serves keyword-only results with a flag. The in-memory implementation
//! scores by cosine similarity and is good enough for single-node use and
//! tests.

use async_trait::async_trait;
use dashmap::DashMap;

use super::MemoryError;

/// One semantic hit.
#[derive(Clone, Debug)]
pub struct VectorHit {
    pub id: String,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// A vector index over chunk ids.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        id: &str,
        vector: Vec<f32>,
        content: String,
        metadata: serde_json::Value,
    ) -> Result<(), MemoryError>;

    async fn remove(&self, id: &str) -> Result<(), MemoryError>;

    /// Top `limit` entries by similarity to `query`, best first.
    async fn query(&self, query: &[f32], limit: usize) -> Result<Vec<VectorHit>, MemoryError>;
}

#[derive(Clone)]
struct Entry {
    vector: Vec<f32>,
    content: String,
    metadata: serde_json::Value,
}

/// Pure in-memory vector index. Lost on drop.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: DashMap<String, Entry>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns 0.0 when either vector has zero magnitude.
    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(
        &self,
        id: &str,
        vector: Vec<f32>,
        content: String,
        metadata: serde_json::Value,
    ) -> Result<(), MemoryError> {
        self.entries.insert(
            id.to_string(),
            Entry {
                vector,
                content,
                metadata,
            },
        );
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), MemoryError> {
        self.entries.remove(id);
        Ok(())
    }

    async fn query(&self, query: &[f32], limit: usize) -> Result<Vec<VectorHit>, MemoryError> {
        let mut hits: Vec<VectorHit> = self
            .entries
            .iter()
            .map(|entry| VectorHit {
                id: entry.key().clone(),
                score: Self::cosine_similarity(query, &entry.value().vector),
                content: entry.value().content.clone(),
                metadata: entry.value().metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}
