//! The retrieval core: sessions, caches, index and retriever wired together.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    background::{BackgroundTasks, CheckpointHandle},
    config::RetrievalConfig,
    data_dir::DataDir,
    embedding_cache::EmbeddingCache,
    error::{Error, Result},
    filter::MetadataFilter,
    governor::ResourceGovernor,
    ingestion::{self, Chunk, IngestReport},
    keyword_index::{CheckpointInfo, IncrementalKeywordIndex, RecoveryOutcome},
    query_cache::{QueryParams, QueryResultCache},
    retriever::{HybridRetriever, RetrievalOutcome},
    services::{EmbeddingService, VectorStore},
    session::{SessionId, SessionKeyspace},
    text_util::normalize_query,
};

/// What one maintenance sweep cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_sessions: usize,
    pub invalidated_entries: usize,
    pub purged_entries: usize,
}

/// Owns every retrieval component. Share it behind an `Arc`.
pub struct RetrievalCore<E, V> {
    config: RetrievalConfig,
    data_dir: DataDir,
    sessions: SessionKeyspace,
    query_cache: QueryResultCache,
    embedding_cache: Arc<EmbeddingCache>,
    retriever: HybridRetriever<E, V>,
    governor: ResourceGovernor,
    /// Bumped on every corpus change. Cache writes hold the read side so a
    /// result computed before a change can never land after the
    /// invalidation that follows it.
    corpus_generation: RwLock<u64>,
    recovery: Option<RecoveryOutcome>,
    checkpoints: Mutex<Option<CheckpointHandle>>,
}

impl<E, V> RetrievalCore<E, V>
where
    E: EmbeddingService,
    V: VectorStore,
{
    /// Open the core over `data_dir`, recovering the keyword index from its
    /// newest valid checkpoint.
    ///
    /// When no checkpoint verifies, the core still opens: the keyword source
    /// reports itself unavailable (queries degrade to vector results) until
    /// the host calls
    /// [`IncrementalKeywordIndex::reset_for_rebuild`] and re-ingests.
    pub fn open(
        data_dir: DataDir,
        config: RetrievalConfig,
        embedder: Arc<E>,
        vector_store: Arc<V>,
    ) -> Result<Self> {
        config.validate()?;

        let keyword = Arc::new(IncrementalKeywordIndex::open(
            &data_dir.checkpoints_dir()?,
            config.bm25,
            &config.checkpoint,
        )?);
        let recovery = match keyword.recover() {
            Ok(outcome) => Some(outcome),
            Err(Error::RebuildRequired { rejected }) => {
                warn!(
                    rejected,
                    "keyword index must be rebuilt, serving vector results only"
                );
                None
            }
            Err(err) => return Err(err),
        };

        let embedding_cache = Arc::new(EmbeddingCache::open(
            &data_dir.embeddings_dir()?,
            &config.embedding_cache,
        )?);
        let retriever =
            HybridRetriever::new(keyword, embedder, vector_store, &config)
                .with_embedding_cache(Arc::clone(&embedding_cache));

        info!(
            data_dir = %data_dir.root().display(),
            strategy = ?config.strategy,
            "retrieval core opened"
        );

        Ok(Self {
            sessions: SessionKeyspace::new(&config.session),
            query_cache: QueryResultCache::new(&config.query_cache),
            governor: ResourceGovernor::new(config.governor.clone()),
            embedding_cache,
            retriever,
            corpus_generation: RwLock::new(0),
            recovery,
            checkpoints: Mutex::new(None),
            data_dir,
            config,
        })
    }

    /// Top `k` results for `query` on behalf of `session_id`.
    ///
    /// Served from the session's query cache when possible. Complete results
    /// are cached; partial ones are not, so the next query retries the
    /// failed source.
    #[instrument(skip(self, session_id, query, filters), fields(session = %session_id))]
    pub async fn retrieve(
        &self,
        session_id: &SessionId,
        query: &str,
        k: usize,
        filters: &MetadataFilter,
    ) -> Result<RetrievalOutcome> {
        let scope = self.sessions.resolve(session_id);
        let params = QueryParams {
            k,
            filters: filters.clone(),
            strategy: self.retriever.strategy(),
        };

        if let Some(results) = self.query_cache.get(&scope, query, &params) {
            debug!("query cache hit");
            return Ok(RetrievalOutcome {
                results,
                partial: false,
                failed_sources: Vec::new(),
            });
        }

        let generation = *self.corpus_generation.read();
        let normalized = normalize_query(query);
        let outcome = self
            .retriever
            .query(session_id, &normalized, k, filters)
            .await?;

        if !outcome.partial {
            let current = self.corpus_generation.read();
            if *current == generation {
                self.query_cache.put(
                    &scope,
                    query,
                    &params,
                    outcome.results.clone(),
                );
            }
        }
        Ok(outcome)
    }

    /// Add or replace `chunks` in both sources.
    ///
    /// Every cached query result is invalidated before this returns, whether
    /// or not ingestion succeeded, since earlier batches may have landed.
    /// When the keyword index awaits a rebuild this fails with
    /// `RebuildRequired` until [`IncrementalKeywordIndex::reset_for_rebuild`]
    /// has been called.
    pub async fn ingest(&self, chunks: &[Chunk]) -> Result<IngestReport> {
        let result = ingestion::ingest(
            &self.retriever,
            Some(self.embedding_cache.as_ref()),
            &self.governor,
            chunks,
        )
        .await;
        self.corpus_changed();
        result
    }

    /// Remove a document from both sources. Returns whether the keyword
    /// index held it.
    pub async fn remove_document(&self, doc_id: u64) -> Result<bool> {
        let removed = self.retriever.keyword_index().remove_document(doc_id)?;
        let deleted = self
            .retriever
            .vector_client()
            .call(|| self.retriever.vector_store().delete(doc_id))
            .await;
        self.corpus_changed();
        deleted?;
        Ok(removed)
    }

    /// Forget a session and everything cached for it.
    pub fn end_session(&self, session_id: &SessionId) -> bool {
        let removed = self.query_cache.invalidate(session_id);
        let existed = self.sessions.end(session_id);
        debug!(session = %session_id, removed, "session ended");
        existed
    }

    /// Expire idle sessions (dropping their cache entries) and purge
    /// expired cache entries.
    pub fn sweep(&self) -> SweepReport {
        let expired = self.sessions.expire_inactive();
        let invalidated_entries =
            expired.iter().map(|id| self.query_cache.invalidate(id)).sum();
        let purged_entries = self.query_cache.purge_expired();

        let report = SweepReport {
            expired_sessions: expired.len(),
            invalidated_entries,
            purged_entries,
        };
        if report != SweepReport::default() {
            debug!(?report, "maintenance sweep");
        }
        report
    }

    /// Write a keyword-index checkpoint now.
    pub fn checkpoint(&self) -> Result<CheckpointInfo> {
        self.retriever.keyword_index().checkpoint()
    }

    /// Invalidate every session's cached results and tell the checkpoint
    /// worker the index moved.
    fn corpus_changed(&self) {
        let mut generation = self.corpus_generation.write();
        *generation += 1;
        self.query_cache.clear();
        drop(generation);

        debug!(sessions = self.sessions.len(), "corpus changed, query cache cleared");
        if let Some(handle) = self.checkpoints.lock().as_ref() {
            handle.notify_mutation();
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    /// How the keyword index was restored at open, or `None` if it needs a
    /// rebuild.
    pub fn recovery(&self) -> Option<&RecoveryOutcome> {
        self.recovery.as_ref()
    }

    pub fn sessions(&self) -> &SessionKeyspace {
        &self.sessions
    }

    pub fn query_cache(&self) -> &QueryResultCache {
        &self.query_cache
    }

    pub fn embedding_cache(&self) -> &EmbeddingCache {
        &self.embedding_cache
    }

    pub fn keyword_index(&self) -> &Arc<IncrementalKeywordIndex> {
        self.retriever.keyword_index()
    }

    pub fn retriever(&self) -> &HybridRetriever<E, V> {
        &self.retriever
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }
}

impl<E, V> RetrievalCore<E, V>
where
    E: EmbeddingService + 'static,
    V: VectorStore + 'static,
{
    /// Spawn the checkpoint and maintenance workers on the current tokio
    /// runtime. Mutations made through this core are forwarded to the
    /// checkpoint worker from now on.
    pub fn start_background(self: &Arc<Self>) -> BackgroundTasks {
        let tasks = BackgroundTasks::spawn(Arc::clone(self));
        *self.checkpoints.lock() = Some(tasks.checkpoint_handle());
        tasks
    }
}

impl<E, V> std::fmt::Debug for RetrievalCore<E, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalCore")
            .field("data_dir", &self.data_dir)
            .field("retriever", &self.retriever)
            .finish_non_exhaustive()
    }
}
