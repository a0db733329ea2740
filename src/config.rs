//! Tuning knobs for the retrieval core.
//!
//! Reading configuration files is the host application's job; this module
//! only defines the typed configuration, its defaults, and a JSON parser so
//! hosts can hand over whatever they loaded.

use serde::{Deserialize, Serialize};

use crate::{
    embedding_cache::EmbeddingCacheConfig,
    error::{Error, Result},
    fusion::RRF_K,
    governor::GovernorConfig,
    keyword_index::{Bm25Params, CheckpointConfig},
    query_cache::QueryCacheConfig,
    resilience::{BreakerConfig, RetryPolicy},
    retriever::RetrievalStrategy,
    session::SessionConfig,
};

/// Minimum number of candidates requested from each source before fusion.
pub const DEFAULT_CANDIDATE_DEPTH: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub strategy: RetrievalStrategy,
    /// The `C` in `1 / (rank + C)`.
    pub rrf_constant: usize,
    /// Candidates fetched per source; the effective depth is
    /// `max(candidate_depth, k)`.
    pub candidate_depth: usize,
    pub bm25: Bm25Params,
    pub query_cache: QueryCacheConfig,
    pub embedding_cache: EmbeddingCacheConfig,
    pub checkpoint: CheckpointConfig,
    /// Breaker applied to each external service independently.
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub governor: GovernorConfig,
    pub session: SessionConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            strategy: RetrievalStrategy::Hybrid,
            rrf_constant: RRF_K,
            candidate_depth: DEFAULT_CANDIDATE_DEPTH,
            bm25: Bm25Params::default(),
            query_cache: QueryCacheConfig::default(),
            embedding_cache: EmbeddingCacheConfig::default(),
            checkpoint: CheckpointConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            governor: GovernorConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl RetrievalConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrecall::config::RetrievalConfig;
    /// use docrecall::retriever::RetrievalStrategy;
    ///
    /// let config = RetrievalConfig::from_json_str(
    ///     r#"{ "strategy": "keyword_only", "bm25": { "k1": 1.5 } }"#,
    /// )
    /// .unwrap();
    /// assert_eq!(config.strategy, RetrievalStrategy::KeywordOnly);
    /// assert_eq!(config.bm25.k1, 1.5);
    /// assert_eq!(config.bm25.b, 0.75);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid config JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a component misbehave.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.rrf_constant == 0 {
            return fail("rrf_constant must be positive");
        }
        if self.candidate_depth == 0 {
            return fail("candidate_depth must be positive");
        }
        if self.bm25.k1.is_nan() || self.bm25.k1 < 0.0 {
            return fail("bm25.k1 must be non-negative");
        }
        if !(0.0..=1.0).contains(&self.bm25.b) {
            return fail("bm25.b must lie in [0, 1]");
        }
        if self.query_cache.max_entries == 0 || self.query_cache.shards == 0 {
            return fail("query_cache capacity and shard count must be positive");
        }
        if self.checkpoint.retain == 0 || self.checkpoint.channel_capacity == 0
        {
            return fail("checkpoint retain and channel_capacity must be positive");
        }
        if self.checkpoint.interval.is_zero()
            || self.session.sweep_interval.is_zero()
        {
            return fail("checkpoint and sweep intervals must be non-zero");
        }
        if self.breaker.failure_threshold == 0 {
            return fail("breaker.failure_threshold must be positive");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be positive");
        }
        let g = &self.governor;
        if g.min_batch_size == 0
            || g.min_batch_size > g.max_batch_size
            || !(g.min_batch_size..=g.max_batch_size)
                .contains(&g.initial_batch_size)
        {
            return fail(
                "governor batch sizes must satisfy 0 < min <= initial <= max",
            );
        }
        Ok(())
    }
}

/// Serialize a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
