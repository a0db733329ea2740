//! docrecall - a session-isolated hybrid retrieval core for local document
//! question answering.
//!
//! docrecall keeps a BM25 keyword index and an external vector store in
//! step, fuses their rankings with Reciprocal Rank Fusion, and caches both
//! embeddings (on disk, content addressed) and query results (in memory,
//! per session). Calls to the embedding and vector services go through a
//! circuit breaker with bounded retries; when one source is down, queries
//! degrade to the other and say so.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docrecall::services::{HashingEmbedder, InMemoryVectorStore};
//! use docrecall::{Chunk, DataDir, MetadataFilter, RetrievalConfig, RetrievalCore, SessionId};
//!
//! # async fn run() -> docrecall::Result<()> {
//! let core = RetrievalCore::open(
//!     DataDir::resolve(None)?,
//!     RetrievalConfig::default(),
//!     Arc::new(HashingEmbedder::new(256)),
//!     Arc::new(InMemoryVectorStore::new()),
//! )?;
//!
//! core.ingest(&[
//!     Chunk::from_path("notes", "pets.md", "the cat sat on the mat"),
//!     Chunk::from_path("notes", "walks.md", "the dog ran fast"),
//! ])
//! .await?;
//!
//! let session = SessionId::new("alice")?;
//! let outcome = core
//!     .retrieve(&session, "cat", 5, &MetadataFilter::new())
//!     .await?;
//! for result in &outcome.results {
//!     println!("{} (score: {:.4})", result.doc_id, result.fused_score);
//! }
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod checkpoint;
pub mod config;
pub mod data_dir;
pub mod doc_id;
pub mod embedding_cache;
pub mod engine;
pub mod error;
pub mod filter;
pub mod fusion;
pub mod governor;
pub mod ingestion;
pub mod keyword_index;
pub mod logging;
pub mod query_cache;
pub mod resilience;
pub mod retriever;
pub mod services;
pub mod session;
pub mod text_util;

pub use background::BackgroundTasks;
pub use config::RetrievalConfig;
pub use data_dir::DataDir;
pub use doc_id::{ContentHash, DocumentId};
pub use embedding_cache::EmbeddingCache;
pub use engine::{RetrievalCore, SweepReport};
pub use error::{Error, Result};
pub use filter::{Metadata, MetadataFilter};
pub use fusion::RankedResult;
pub use governor::ResourceGovernor;
pub use ingestion::Chunk;
pub use keyword_index::IncrementalKeywordIndex;
pub use query_cache::QueryResultCache;
pub use resilience::ResilientServiceClient;
pub use retriever::{HybridRetriever, RetrievalOutcome, RetrievalStrategy};
pub use session::{SessionId, SessionKeyspace};
