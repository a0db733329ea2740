use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    doc_id::{ContentHash, DocumentId},
    embedding_cache::EmbeddingCache,
    error::{Error, Result},
    filter::Metadata,
    governor::{MemoryFootprint, ResourceGovernor},
    retriever::HybridRetriever,
    services::{EmbeddingService, ServiceError, VectorStore},
    text_util::tokenize,
};

/// Metadata key holding the collection of a chunk built by
/// [`Chunk::from_path`].
pub const COLLECTION_KEY: &str = "collection";

/// Metadata key holding the relative path of a chunk built by
/// [`Chunk::from_path`].
pub const PATH_KEY: &str = "path";

/// A passage produced by the host's parser/chunker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub doc_id: u64,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Chunk {
    pub fn new(doc_id: u64, text: impl Into<String>) -> Self {
        Self {
            doc_id,
            text: text.into(),
            metadata: Metadata::new(),
        }
    }

    /// A chunk whose id is derived from where it came from.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrecall::doc_id::DocumentId;
    /// use docrecall::ingestion::Chunk;
    ///
    /// let chunk = Chunk::from_path("notes", "pets/cats.md", "cats sleep a lot");
    /// assert_eq!(chunk.doc_id, DocumentId::new("notes", "pets/cats.md").numeric);
    /// assert_eq!(chunk.metadata["collection"], "notes");
    /// ```
    pub fn from_path(
        collection: &str,
        relative_path: &str,
        text: impl Into<String>,
    ) -> Self {
        Self::new(DocumentId::new(collection, relative_path).numeric, text)
            .with_metadata(COLLECTION_KEY, collection)
            .with_metadata(PATH_KEY, relative_path)
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl MemoryFootprint for Chunk {
    fn footprint_bytes(&self) -> u64 {
        let metadata: usize =
            self.metadata.iter().map(|(k, v)| k.len() + v.len()).sum();
        (self.text.len() + metadata) as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub chunks: usize,
    /// Vectors served from the embedding cache.
    pub cache_hits: usize,
    /// Vectors computed by the embedding service.
    pub embedded: usize,
    /// Chunks whose keyword entry actually changed.
    pub keyword_updates: usize,
    pub batches: usize,
}

/// Embed, store and index `chunks` in governor-sized batches.
///
/// Per batch: vectors come from the embedding cache where possible and from
/// the embedding service otherwise (new ones are written back to the cache),
/// then each chunk is upserted into the vector store and added to the
/// keyword index. A service failure aborts the run; batches already
/// processed stay applied. While the keyword index awaits a rebuild nothing
/// is written and `RebuildRequired` is returned.
pub async fn ingest<E, V>(
    retriever: &HybridRetriever<E, V>,
    cache: Option<&EmbeddingCache>,
    governor: &ResourceGovernor,
    chunks: &[Chunk],
) -> Result<IngestReport>
where
    E: EmbeddingService,
    V: VectorStore,
{
    retriever.keyword_index().ensure_usable()?;

    let report = Mutex::new(IngestReport::default());
    let totals = &report;

    let batches = governor
        .run_batched(chunks, move |batch| {
            async move {
                let (vectors, hits) =
                    embed_with_cache(retriever, cache, batch).await?;

                for (chunk, vector) in batch.iter().zip(vectors) {
                    retriever
                        .vector_client()
                        .call(|| {
                            retriever.vector_store().upsert(
                                chunk.doc_id,
                                vector.clone(),
                                chunk.metadata.clone(),
                            )
                        })
                        .await?;
                }

                let mut changed = 0;
                for chunk in batch {
                    if retriever.keyword_index().add_document_with_metadata(
                        chunk.doc_id,
                        &tokenize(&chunk.text),
                        chunk.metadata.clone(),
                    )? {
                        changed += 1;
                    }
                }

                let mut totals = totals.lock();
                totals.chunks += batch.len();
                totals.cache_hits += hits;
                totals.embedded += batch.len() - hits;
                totals.keyword_updates += changed;
                debug!(size = batch.len(), hits, "ingested batch");
                Ok::<(), Error>(())
            }
        })
        .await?;

    let mut report = report.into_inner();
    report.batches = batches;
    info!(
        chunks = report.chunks,
        cache_hits = report.cache_hits,
        embedded = report.embedded,
        batches,
        "ingestion finished"
    );
    Ok(report)
}

/// Vectors for `batch` in order, and how many came from the cache.
async fn embed_with_cache<E, V>(
    retriever: &HybridRetriever<E, V>,
    cache: Option<&EmbeddingCache>,
    batch: &[Chunk],
) -> Result<(Vec<Vec<f32>>, usize)>
where
    E: EmbeddingService,
    V: VectorStore,
{
    let embedder = retriever.embedder();
    let hashes: Vec<ContentHash> = batch
        .iter()
        .map(|c| ContentHash::of(embedder.model_version(), &c.text))
        .collect();

    let mut vectors: Vec<Option<Vec<f32>>> = match cache {
        Some(cache) => cache.get_many(&hashes),
        None => vec![None; batch.len()],
    };

    let missing: Vec<usize> = vectors
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.is_none().then_some(i))
        .collect();
    let hits = batch.len() - missing.len();

    if !missing.is_empty() {
        let texts: Vec<String> =
            missing.iter().map(|&i| batch[i].text.clone()).collect();
        let computed = retriever
            .embed_client()
            .call(|| embedder.embed_batch(&texts))
            .await?;
        if computed.len() != texts.len() {
            return Err(Error::Service(ServiceError::Rejected(format!(
                "embedding service returned {} vectors for {} texts",
                computed.len(),
                texts.len()
            ))));
        }

        for (&i, vector) in missing.iter().zip(computed) {
            if let Some(cache) = cache {
                cache.put(&hashes[i], &vector);
            }
            vectors[i] = Some(vector);
        }
    }

    Ok((vectors.into_iter().flatten().collect(), hits))
}
