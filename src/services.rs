//! Interfaces of the external collaborators the retrieval core talks to.
//!
//! The embedding model and the vector-similarity store live outside this
//! crate. They are reached through the traits below, always wrapped in a
//! [`ResilientServiceClient`](crate::resilience::ResilientServiceClient) so
//! that deadlines, retries and circuit breaking apply uniformly.

use std::{collections::HashMap, future::Future};

use parking_lot::RwLock;

use crate::{
    filter::{Metadata, MetadataFilter},
    text_util::tokenize,
};

/// Typed failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// The service could not be reached or answered with a server fault.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete before its deadline.
    #[error("service call timed out")]
    Timeout,

    /// The service refused the request itself (bad input, wrong dimension).
    /// Retrying will not help and the service is not unhealthy.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ServiceError {
    /// Whether the failure says something about the service's health.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Unavailable(_) | ServiceError::Timeout)
    }
}

/// Turns text into dense vectors.
///
/// Implementations must be deterministic for a given
/// [`model_version`](EmbeddingService::model_version): the embedding cache
/// keys records by `(model_version, text)`.
pub trait EmbeddingService: Send + Sync {
    fn model_version(&self) -> &str;

    fn embed(
        &self,
        text: &str,
    ) -> impl Future<Output = Result<Vec<f32>, ServiceError>> + Send;

    /// Embed several texts at once. The output preserves input order.
    fn embed_batch(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, ServiceError>> + Send;
}

/// A single match returned by a vector store, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub doc_id: u64,
    pub score: f32,
}

/// A vector-similarity store keyed by document id.
pub trait VectorStore: Send + Sync {
    fn upsert(
        &self,
        id: u64,
        vector: Vec<f32>,
        metadata: Metadata,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Return at most `k` hits matching `filters`, ordered best first.
    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filters: &MetadataFilter,
    ) -> impl Future<Output = Result<Vec<VectorHit>, ServiceError>> + Send;

    fn delete(
        &self,
        id: u64,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

/// Brute-force cosine-similarity store held in memory.
///
/// Good enough for small local corpora and as a stand-in during tests.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<HashMap<u64, (Vec<f32>, Metadata)>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        id: u64,
        vector: Vec<f32>,
        metadata: Metadata,
    ) -> Result<(), ServiceError> {
        let mut entries = self.entries.write();
        if let Some((existing, _)) = entries.values().next()
            && existing.len() != vector.len()
        {
            return Err(ServiceError::Rejected(format!(
                "dimension mismatch: store holds {}, got {}",
                existing.len(),
                vector.len()
            )));
        }
        entries.insert(id, (vector, metadata));
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filters: &MetadataFilter,
    ) -> Result<Vec<VectorHit>, ServiceError> {
        let entries = self.entries.read();
        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter(|(_, (v, meta))| {
                v.len() == vector.len() && filters.matches(meta)
            })
            .map(|(&doc_id, (v, _))| VectorHit {
                doc_id,
                score: cosine_similarity(vector, v),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, id: u64) -> Result<(), ServiceError> {
        self.entries.write().remove(&id);
        Ok(())
    }
}

/// Feature-hashing bag-of-words embedder.
///
/// Each token is hashed to a bucket and a sign; the vector is L2
/// normalized. No model download, fully deterministic, and texts sharing
/// tokens land close together. Useful offline and as a stand-in for a real
/// model service.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_version: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_version: format!("hashing-bow-{dimension}"),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let digest = blake3::hash(token.as_bytes());
            let bytes = digest.as_bytes();
            let bucket = u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
                bytes[6], bytes[7],
            ]) % self.dimension as u64;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket as usize] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl EmbeddingService for HashingEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ServiceError> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

/// Cosine similarity, `0.0` when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
