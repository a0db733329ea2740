//! Keyword plus vector retrieval, fused with Reciprocal Rank Fusion.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{
    config::RetrievalConfig,
    doc_id::ContentHash,
    embedding_cache::EmbeddingCache,
    error::{Error, Result},
    filter::MetadataFilter,
    fusion::{RankedResult, reciprocal_rank_fusion},
    keyword_index::IncrementalKeywordIndex,
    resilience::ResilientServiceClient,
    services::{EmbeddingService, VectorStore},
    session::SessionId,
    text_util::tokenize,
};

/// Which sources a query consults.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    KeywordOnly,
    VectorOnly,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalSource {
    Keyword,
    Vector,
}

/// Fused results plus whether a source was missing from them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub results: Vec<RankedResult>,
    /// At least one consulted source failed.
    pub partial: bool,
    pub failed_sources: Vec<RetrievalSource>,
}

pub struct HybridRetriever<E, V> {
    keyword: Arc<IncrementalKeywordIndex>,
    embedder: Arc<E>,
    vectors: Arc<V>,
    embed_client: Arc<ResilientServiceClient>,
    vector_client: Arc<ResilientServiceClient>,
    embedding_cache: Option<Arc<EmbeddingCache>>,
    strategy: RetrievalStrategy,
    rrf_constant: usize,
    candidate_depth: usize,
}

impl<E, V> HybridRetriever<E, V>
where
    E: EmbeddingService,
    V: VectorStore,
{
    pub fn new(
        keyword: Arc<IncrementalKeywordIndex>,
        embedder: Arc<E>,
        vectors: Arc<V>,
        config: &RetrievalConfig,
    ) -> Self {
        let client = |name: &str| {
            Arc::new(ResilientServiceClient::new(
                name,
                config.breaker.clone(),
                config.retry.clone(),
            ))
        };
        Self {
            keyword,
            embedder,
            vectors,
            embed_client: client("embedding"),
            vector_client: client("vector_store"),
            embedding_cache: None,
            strategy: config.strategy,
            rrf_constant: config.rrf_constant,
            candidate_depth: config.candidate_depth,
        }
    }

    /// Look up and store query embeddings in `cache`.
    pub fn with_embedding_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.embedding_cache = Some(cache);
        self
    }

    pub fn strategy(&self) -> RetrievalStrategy {
        self.strategy
    }

    pub fn keyword_index(&self) -> &Arc<IncrementalKeywordIndex> {
        &self.keyword
    }

    pub fn embedder(&self) -> &Arc<E> {
        &self.embedder
    }

    pub fn vector_store(&self) -> &Arc<V> {
        &self.vectors
    }

    pub fn embed_client(&self) -> &Arc<ResilientServiceClient> {
        &self.embed_client
    }

    pub fn vector_client(&self) -> &Arc<ResilientServiceClient> {
        &self.vector_client
    }

    /// Top `k` fused results for `text`.
    ///
    /// Sources run concurrently. Each fetches `max(candidate_depth, k)`
    /// candidates with `filters` applied at the source. A failed source is
    /// dropped from fusion and marks the outcome `partial`; if every
    /// consulted source fails the query fails with `NoRetrievalSource`.
    #[instrument(skip(self, text, filters), fields(strategy = ?self.strategy))]
    pub async fn query(
        &self,
        session: &SessionId,
        text: &str,
        k: usize,
        filters: &MetadataFilter,
    ) -> Result<RetrievalOutcome> {
        if k == 0 {
            return Ok(RetrievalOutcome::default());
        }
        let depth = self.candidate_depth.max(k);

        let (keyword, vector) = match self.strategy {
            RetrievalStrategy::KeywordOnly => {
                (Some(self.keyword_ranking(text, depth, filters)), None)
            }
            RetrievalStrategy::VectorOnly => {
                (None, Some(self.vector_ranking(text, depth, filters).await))
            }
            RetrievalStrategy::Hybrid => {
                let (keyword, vector) = tokio::join!(
                    async { self.keyword_ranking(text, depth, filters) },
                    self.vector_ranking(text, depth, filters),
                );
                (Some(keyword), Some(vector))
            }
        };

        let mut failed_sources = Vec::new();
        let mut consulted = 0;
        let mut take =
            |source: RetrievalSource, ranking: Option<Result<Vec<u64>>>| {
                match ranking {
                    None => Vec::new(),
                    Some(Ok(ids)) => {
                        consulted += 1;
                        ids
                    }
                    Some(Err(err)) => {
                        consulted += 1;
                        warn!(?source, %err, "retrieval source failed, degrading");
                        failed_sources.push(source);
                        Vec::new()
                    }
                }
            };
        let keyword_ids = take(RetrievalSource::Keyword, keyword);
        let vector_ids = take(RetrievalSource::Vector, vector);

        if failed_sources.len() == consulted {
            return Err(Error::NoRetrievalSource);
        }

        let mut results =
            reciprocal_rank_fusion(&keyword_ids, &vector_ids, self.rrf_constant);
        results.truncate(k);

        debug!(
            keyword_candidates = keyword_ids.len(),
            vector_candidates = vector_ids.len(),
            returned = results.len(),
            "query fused"
        );

        Ok(RetrievalOutcome {
            results,
            partial: !failed_sources.is_empty(),
            failed_sources,
        })
    }

    fn keyword_ranking(
        &self,
        text: &str,
        depth: usize,
        filters: &MetadataFilter,
    ) -> Result<Vec<u64>> {
        let hits = self
            .keyword
            .search_filtered(&tokenize(text), depth, filters)?;
        Ok(hits.into_iter().map(|h| h.doc_id).collect())
    }

    async fn vector_ranking(
        &self,
        text: &str,
        depth: usize,
        filters: &MetadataFilter,
    ) -> Result<Vec<u64>> {
        let embedding = self.embed_query(text).await?;
        let hits = self
            .vector_client
            .call(|| self.vectors.query(&embedding, depth, filters))
            .await?;
        Ok(hits.into_iter().map(|h| h.doc_id).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let hash = ContentHash::of(self.embedder.model_version(), text);
        if let Some(cache) = &self.embedding_cache
            && let Some(vector) = cache.get(&hash)
        {
            return Ok(vector);
        }

        let vector = self.embed_client.call(|| self.embedder.embed(text)).await?;
        if let Some(cache) = &self.embedding_cache {
            cache.put(&hash, &vector);
        }
        Ok(vector)
    }
}

impl<E, V> std::fmt::Debug for HybridRetriever<E, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridRetriever")
            .field("strategy", &self.strategy)
            .field("rrf_constant", &self.rrf_constant)
            .field("candidate_depth", &self.candidate_depth)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        embedding_cache::EmbeddingCacheConfig,
        filter::Metadata,
        keyword_index::{Bm25Params, CheckpointConfig},
        resilience::RetryPolicy,
        services::{HashingEmbedder, InMemoryVectorStore, ServiceError},
    };

    /// Wraps an embedder, counting calls and optionally failing them.
    struct CountingEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingEmbedder {
        fn new(fail: bool) -> Self {
            Self {
                inner: HashingEmbedder::new(128),
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    impl EmbeddingService for CountingEmbedder {
        fn model_version(&self) -> &str {
            self.inner.model_version()
        }

        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ServiceError::Unavailable("model offline".into()));
            }
            self.inner.embed(text).await
        }

        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, ServiceError> {
            self.inner.embed_batch(texts).await
        }
    }

    const DOCS: [(u64, &str); 3] = [
        (1, "cat sat mat"),
        (2, "dog ran fast"),
        (3, "cat and dog played"),
    ];

    async fn build(
        strategy: RetrievalStrategy,
        embedder_fails: bool,
        keyword: Arc<IncrementalKeywordIndex>,
    ) -> HybridRetriever<CountingEmbedder, InMemoryVectorStore> {
        let helper = HashingEmbedder::new(128);
        let store = InMemoryVectorStore::new();
        for (id, text) in DOCS {
            keyword.add_document(id, &tokenize(text)).unwrap();
            store
                .upsert(id, helper.embed(text).await.unwrap(), Metadata::new())
                .await
                .unwrap();
        }

        let config = RetrievalConfig {
            strategy,
            retry: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
            ..RetrievalConfig::default()
        };
        HybridRetriever::new(
            keyword,
            Arc::new(CountingEmbedder::new(embedder_fails)),
            Arc::new(store),
            &config,
        )
    }

    fn memory_index() -> Arc<IncrementalKeywordIndex> {
        Arc::new(IncrementalKeywordIndex::in_memory(Bm25Params::default()))
    }

    fn session() -> SessionId {
        SessionId::new("tester").unwrap()
    }

    fn ids(outcome: &RetrievalOutcome) -> Vec<u64> {
        outcome.results.iter().map(|r| r.doc_id).collect()
    }

    #[tokio::test]
    async fn hybrid_uses_both_sources() {
        let retriever = build(RetrievalStrategy::Hybrid, false, memory_index()).await;
        let outcome = retriever
            .query(&session(), "cat dog", 2, &MetadataFilter::new())
            .await
            .unwrap();

        assert!(!outcome.partial);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].doc_id, 3);
        let top = &outcome.results[0].component_scores;
        assert_eq!(top.keyword_rank, Some(1));
        assert!(top.vector_rank.is_some());
    }

    #[tokio::test]
    async fn keyword_only_never_embeds() {
        let retriever =
            build(RetrievalStrategy::KeywordOnly, false, memory_index()).await;
        let outcome = retriever
            .query(&session(), "cat dog", 2, &MetadataFilter::new())
            .await
            .unwrap();

        assert_eq!(ids(&outcome), vec![3, 1]);
        assert_eq!(retriever.embedder().calls.load(Ordering::SeqCst), 0);
        assert!(outcome.results.iter().all(|r| r.component_scores.vector_rank.is_none()));
    }

    #[tokio::test]
    async fn failing_vector_side_degrades_to_keyword() {
        let retriever = build(RetrievalStrategy::Hybrid, true, memory_index()).await;
        let outcome = retriever
            .query(&session(), "cat dog", 2, &MetadataFilter::new())
            .await
            .unwrap();

        assert!(outcome.partial);
        assert_eq!(outcome.failed_sources, vec![RetrievalSource::Vector]);
        assert_eq!(ids(&outcome), vec![3, 1]);
    }

    #[tokio::test]
    async fn index_awaiting_rebuild_degrades_to_vector() {
        let tmp = tempfile::tempdir().unwrap();
        let index = IncrementalKeywordIndex::open(
            tmp.path(),
            Bm25Params::default(),
            &CheckpointConfig::default(),
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("checkpoint-00000000000000000001.ckpt"),
            b"not a checkpoint",
        )
        .unwrap();
        assert!(index.recover().is_err());

        let retriever =
            build(RetrievalStrategy::Hybrid, false, Arc::new(index)).await;
        let outcome = retriever
            .query(&session(), "cat dog", 3, &MetadataFilter::new())
            .await
            .unwrap();

        assert!(outcome.partial);
        assert_eq!(outcome.failed_sources, vec![RetrievalSource::Keyword]);
        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results.iter().all(|r| r.component_scores.keyword_rank.is_none()));
    }

    #[tokio::test]
    async fn all_sources_failing_is_an_error() {
        let retriever =
            build(RetrievalStrategy::VectorOnly, true, memory_index()).await;
        let err = retriever
            .query(&session(), "cat", 2, &MetadataFilter::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRetrievalSource));
    }

    #[tokio::test]
    async fn zero_k_returns_nothing() {
        let retriever = build(RetrievalStrategy::Hybrid, false, memory_index()).await;
        let outcome = retriever
            .query(&session(), "cat", 0, &MetadataFilter::new())
            .await
            .unwrap();
        assert!(outcome.results.is_empty());
        assert!(!outcome.partial);
    }

    #[tokio::test]
    async fn query_embeddings_are_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            EmbeddingCache::open(tmp.path(), &EmbeddingCacheConfig::default())
                .unwrap(),
        );
        let retriever = build(RetrievalStrategy::VectorOnly, false, memory_index())
            .await
            .with_embedding_cache(cache);

        for _ in 0..3 {
            retriever
                .query(&session(), "cat dog", 2, &MetadataFilter::new())
                .await
                .unwrap();
        }
        assert_eq!(retriever.embedder().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn strategy_serializes_snake_case() {
        let json = serde_json::to_string(&RetrievalStrategy::KeywordOnly).unwrap();
        assert_eq!(json, "\"keyword_only\"");
    }
}
