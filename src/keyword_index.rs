//! Incrementally updated BM25 keyword index.
//!
//! Readers clone an `Arc<IndexSnapshot>` and search it without locks. The
//! single writer builds the next snapshot copy-on-write (posting lists are
//! `Arc`-shared and only the touched ones are cloned) and swaps it in.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{
        CheckpointDocument,
        CheckpointFile,
        CheckpointStore,
        IndexCheckpoint,
    },
    error::{Error, Result},
    filter::{Metadata, MetadataFilter},
};

pub const DEFAULT_K1: f64 = 1.2;
pub const DEFAULT_B: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f64,
    /// Length normalization, 0 (none) to 1 (full).
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: DEFAULT_K1,
            b: DEFAULT_B,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Period of the background checkpoint task.
    #[serde(rename = "interval_ms", with = "crate::config::duration_ms")]
    pub interval: Duration,
    /// Verified checkpoint files kept on disk.
    pub retain: usize,
    /// Capacity of the worker's command channel.
    pub channel_capacity: usize,
    /// Checkpoint early once this many mutations are pending.
    pub mutation_threshold: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            retain: 2,
            channel_capacity: 64,
            mutation_threshold: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: u64,
    pub term_frequency: u32,
}

/// Postings for one term, ascending by doc id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostingList {
    postings: Vec<Posting>,
}

impl PostingList {
    pub fn postings(&self) -> &[Posting] {
        &self.postings
    }

    /// Number of documents containing the term.
    pub fn document_frequency(&self) -> usize {
        self.postings.len()
    }

    fn upsert(&mut self, doc_id: u64, term_frequency: u32) {
        match self.postings.binary_search_by_key(&doc_id, |p| p.doc_id) {
            Ok(i) => self.postings[i].term_frequency = term_frequency,
            Err(i) => self.postings.insert(
                i,
                Posting {
                    doc_id,
                    term_frequency,
                },
            ),
        }
    }

    fn remove(&mut self, doc_id: u64) {
        if let Ok(i) = self.postings.binary_search_by_key(&doc_id, |p| p.doc_id)
        {
            self.postings.remove(i);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DocumentEntry {
    length: u32,
    /// Distinct terms with their frequency, ascending.
    terms: Vec<(String, u32)>,
    metadata: Metadata,
}

/// An immutable view of the index at one version.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    version: u64,
    postings: BTreeMap<String, Arc<PostingList>>,
    documents: BTreeMap<u64, Arc<DocumentEntry>>,
    total_length: u64,
}

/// A keyword match, best first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeywordHit {
    pub doc_id: u64,
    pub score: f64,
    /// 1-based.
    pub rank: usize,
}

impl IndexSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    pub fn average_document_length(&self) -> f64 {
        if self.documents.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.documents.len() as f64
        }
    }

    pub fn contains(&self, doc_id: u64) -> bool {
        self.documents.contains_key(&doc_id)
    }

    pub fn posting_list(&self, term: &str) -> Option<&PostingList> {
        self.postings.get(term).map(Arc::as_ref)
    }

    pub fn metadata(&self, doc_id: u64) -> Option<&Metadata> {
        self.documents.get(&doc_id).map(|d| &d.metadata)
    }

    /// Top `k` documents by BM25 over the distinct `query_terms`.
    ///
    /// Ties are broken by ascending doc id. Documents failing `filter` are
    /// skipped before truncation, so up to `k` matching hits come back.
    pub fn search(
        &self,
        params: &Bm25Params,
        query_terms: &[impl AsRef<str>],
        k: usize,
        filter: &MetadataFilter,
    ) -> Vec<KeywordHit> {
        if k == 0 || self.documents.is_empty() {
            return Vec::new();
        }

        let n = self.documents.len() as f64;
        let avgdl = self.average_document_length().max(f64::EPSILON);
        let mut seen = HashSet::new();
        let mut scores: HashMap<u64, f64> = HashMap::new();

        for term in query_terms {
            let term = term.as_ref();
            if !seen.insert(term) {
                continue;
            }
            let Some(list) = self.postings.get(term) else {
                continue;
            };

            let df = list.document_frequency() as f64;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();

            for posting in list.postings() {
                let Some(doc) = self.documents.get(&posting.doc_id) else {
                    continue;
                };
                let tf = f64::from(posting.term_frequency);
                let dl = f64::from(doc.length);
                let norm =
                    params.k1 * (1.0 - params.b + params.b * dl / avgdl);
                *scores.entry(posting.doc_id).or_default() +=
                    idf * tf * (params.k1 + 1.0) / (tf + norm);
            }
        }

        let mut ranked: Vec<(u64, f64)> = scores
            .into_iter()
            .filter(|(doc_id, _)| {
                filter.is_empty()
                    || self
                        .documents
                        .get(doc_id)
                        .is_some_and(|d| filter.matches(&d.metadata))
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(k);

        ranked
            .into_iter()
            .enumerate()
            .map(|(i, (doc_id, score))| KeywordHit {
                doc_id,
                score,
                rank: i + 1,
            })
            .collect()
    }

    fn to_checkpoint(&self) -> IndexCheckpoint {
        IndexCheckpoint {
            version: self.version,
            total_length: self.total_length,
            documents: self
                .documents
                .iter()
                .map(|(&doc_id, doc)| CheckpointDocument {
                    doc_id,
                    length: doc.length,
                    metadata: doc.metadata.clone(),
                })
                .collect(),
            postings: self
                .postings
                .iter()
                .map(|(term, list)| (term.clone(), list.postings.clone()))
                .collect(),
        }
    }

    fn from_checkpoint(checkpoint: IndexCheckpoint) -> Self {
        let mut terms_by_doc: HashMap<u64, Vec<(String, u32)>> = HashMap::new();
        for (term, list) in &checkpoint.postings {
            for posting in list {
                terms_by_doc
                    .entry(posting.doc_id)
                    .or_default()
                    .push((term.clone(), posting.term_frequency));
            }
        }

        let documents = checkpoint
            .documents
            .into_iter()
            .map(|doc| {
                // BTreeMap iteration already yields terms in ascending order.
                let terms = terms_by_doc.remove(&doc.doc_id).unwrap_or_default();
                (
                    doc.doc_id,
                    Arc::new(DocumentEntry {
                        length: doc.length,
                        terms,
                        metadata: doc.metadata,
                    }),
                )
            })
            .collect();

        let postings = checkpoint
            .postings
            .into_iter()
            .map(|(term, postings)| (term, Arc::new(PostingList { postings })))
            .collect();

        Self {
            version: checkpoint.version,
            postings,
            documents,
            total_length: checkpoint.total_length,
        }
    }

    fn remove_entry(&mut self, doc_id: u64) -> Option<Arc<DocumentEntry>> {
        let old = self.documents.remove(&doc_id)?;
        for (term, _) in &old.terms {
            if let Some(list) = self.postings.get_mut(term) {
                Arc::make_mut(list).remove(doc_id);
                if list.postings.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.total_length -= u64::from(old.length);
        Some(old)
    }

    fn insert_entry(&mut self, doc_id: u64, entry: DocumentEntry) {
        for (term, tf) in &entry.terms {
            Arc::make_mut(self.postings.entry(term.clone()).or_default())
                .upsert(doc_id, *tf);
        }
        self.total_length += u64::from(entry.length);
        self.documents.insert(doc_id, Arc::new(entry));
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexStats {
    pub documents: usize,
    pub terms: usize,
    pub average_document_length: f64,
    pub version: u64,
    /// Version captured by the last committed checkpoint, if any.
    pub checkpointed_version: Option<u64>,
    pub needs_rebuild: bool,
}

impl IndexStats {
    /// Whether the in-memory index has changed since the last checkpoint.
    pub fn is_dirty(&self) -> bool {
        self.checkpointed_version != Some(self.version)
            && (self.version > 0 || self.checkpointed_version.is_some())
    }
}

/// What `recover` found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No checkpoint files exist; the index starts empty.
    Empty,
    Restored {
        sequence: u64,
        version: u64,
        documents: usize,
    },
}

/// Result of a committed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub file: CheckpointFile,
    pub version: u64,
    pub documents: usize,
    pub checksum: [u8; 32],
}

/// BM25 inverted index with single-writer snapshot swapping and durable
/// checkpoints.
pub struct IncrementalKeywordIndex {
    params: Bm25Params,
    snapshot: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
    checkpoint_lock: Mutex<Option<u64>>,
    store: Option<CheckpointStore>,
    needs_rebuild: AtomicBool,
    rejected_checkpoints: AtomicUsize,
}

impl IncrementalKeywordIndex {
    /// An index that never touches disk. `checkpoint` and `recover` fail.
    pub fn in_memory(params: Bm25Params) -> Self {
        Self::with_store(params, None)
    }

    /// An index checkpointing into `dir`. Call [`recover`](Self::recover)
    /// to load existing state.
    pub fn open(
        dir: &Path,
        params: Bm25Params,
        config: &CheckpointConfig,
    ) -> Result<Self> {
        let store = CheckpointStore::open(dir, config.retain)?;
        Ok(Self::with_store(params, Some(store)))
    }

    fn with_store(params: Bm25Params, store: Option<CheckpointStore>) -> Self {
        Self {
            params,
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
            writer: Mutex::new(()),
            checkpoint_lock: Mutex::new(None),
            store,
            needs_rebuild: AtomicBool::new(false),
            rejected_checkpoints: AtomicUsize::new(0),
        }
    }

    pub fn params(&self) -> &Bm25Params {
        &self.params
    }

    /// The current snapshot. Holding it does not block writers.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Index `tokens` under `doc_id`, replacing any previous content.
    ///
    /// Re-adding identical content is a no-op and leaves the version
    /// unchanged. Returns whether the index changed. Fails with
    /// `RebuildRequired` while the index awaits a rebuild, since
    /// [`reset_for_rebuild`](Self::reset_for_rebuild) would discard the
    /// write.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrecall::filter::MetadataFilter;
    /// use docrecall::keyword_index::{Bm25Params, IncrementalKeywordIndex};
    ///
    /// let index = IncrementalKeywordIndex::in_memory(Bm25Params::default());
    /// assert!(index.add_document(1, &["cat", "sat"]).unwrap());
    /// assert!(!index.add_document(1, &["cat", "sat"]).unwrap());
    ///
    /// let hits = index.search(&["cat"], 10).unwrap();
    /// assert_eq!(hits[0].doc_id, 1);
    /// ```
    pub fn add_document(
        &self,
        doc_id: u64,
        tokens: &[impl AsRef<str>],
    ) -> Result<bool> {
        self.add_document_with_metadata(doc_id, tokens, Metadata::new())
    }

    pub fn add_document_with_metadata(
        &self,
        doc_id: u64,
        tokens: &[impl AsRef<str>],
        metadata: Metadata,
    ) -> Result<bool> {
        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        for token in tokens {
            *counts.entry(token.as_ref().to_string()).or_default() += 1;
        }
        let entry = DocumentEntry {
            length: u32::try_from(tokens.len()).unwrap_or(u32::MAX),
            terms: counts.into_iter().collect(),
            metadata,
        };

        let _writer = self.writer.lock();
        self.ensure_usable()?;
        let current = self.snapshot();
        if current
            .documents
            .get(&doc_id)
            .is_some_and(|existing| **existing == entry)
        {
            return Ok(false);
        }

        let mut next = (*current).clone();
        next.remove_entry(doc_id);
        next.insert_entry(doc_id, entry);
        next.version += 1;
        debug!(doc_id, version = next.version, "document indexed");
        *self.snapshot.write() = Arc::new(next);
        Ok(true)
    }

    /// Returns `false` if the document was not indexed. Refused while the
    /// index awaits a rebuild, like `add_document`.
    pub fn remove_document(&self, doc_id: u64) -> Result<bool> {
        let _writer = self.writer.lock();
        self.ensure_usable()?;
        let current = self.snapshot();
        if !current.contains(doc_id) {
            return Ok(false);
        }

        let mut next = (*current).clone();
        next.remove_entry(doc_id);
        next.version += 1;
        debug!(doc_id, version = next.version, "document removed");
        *self.snapshot.write() = Arc::new(next);
        Ok(true)
    }

    pub fn search(
        &self,
        query_terms: &[impl AsRef<str>],
        k: usize,
    ) -> Result<Vec<KeywordHit>> {
        self.search_filtered(query_terms, k, &MetadataFilter::default())
    }

    /// Fails with `RebuildRequired` while the index awaits a rebuild.
    pub fn search_filtered(
        &self,
        query_terms: &[impl AsRef<str>],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<KeywordHit>> {
        self.ensure_usable()?;
        Ok(self.snapshot().search(&self.params, query_terms, k, filter))
    }

    /// Write the current snapshot as a new checkpoint.
    pub fn checkpoint(&self) -> Result<CheckpointInfo> {
        let store = self.store()?;
        self.ensure_usable()?;

        let mut last = self.checkpoint_lock.lock();
        let snapshot = self.snapshot();
        let image = snapshot.to_checkpoint();
        let checksum = image.checksum();
        let file = store.write(&image)?;
        *last = Some(snapshot.version);

        Ok(CheckpointInfo {
            file,
            version: snapshot.version,
            documents: snapshot.document_count(),
            checksum,
        })
    }

    /// Checkpoint only if something changed since the last one.
    pub fn checkpoint_if_dirty(&self) -> Result<Option<CheckpointInfo>> {
        if self.stats().is_dirty() {
            self.checkpoint().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Replace the in-memory state with the newest valid checkpoint.
    ///
    /// Corrupt checkpoints are skipped in favour of older ones. When files
    /// exist but none verify, the index is emptied, flagged as needing a
    /// rebuild, and `RebuildRequired` is returned.
    pub fn recover(&self) -> Result<RecoveryOutcome> {
        let store = self.store()?;
        let _writer = self.writer.lock();
        let mut last = self.checkpoint_lock.lock();

        match store.load_newest_valid() {
            Ok(None) => {
                *self.snapshot.write() = Arc::new(IndexSnapshot::default());
                *last = None;
                self.needs_rebuild.store(false, Ordering::SeqCst);
                info!("no keyword index checkpoint found, starting empty");
                Ok(RecoveryOutcome::Empty)
            }
            Ok(Some((file, checkpoint))) => {
                let snapshot = IndexSnapshot::from_checkpoint(checkpoint);
                let outcome = RecoveryOutcome::Restored {
                    sequence: file.sequence,
                    version: snapshot.version,
                    documents: snapshot.document_count(),
                };
                *last = Some(snapshot.version);
                *self.snapshot.write() = Arc::new(snapshot);
                self.needs_rebuild.store(false, Ordering::SeqCst);
                info!(?outcome, "keyword index recovered");
                Ok(outcome)
            }
            Err(Error::RebuildRequired { rejected }) => {
                *self.snapshot.write() = Arc::new(IndexSnapshot::default());
                *last = None;
                self.rejected_checkpoints.store(rejected, Ordering::SeqCst);
                self.needs_rebuild.store(true, Ordering::SeqCst);
                warn!(rejected, "no checkpoint verified, full rebuild required");
                Err(Error::RebuildRequired { rejected })
            }
            Err(err) => Err(err),
        }
    }

    /// Clear the rebuild flag and start from an empty index. The caller is
    /// expected to re-add every document afterwards.
    pub fn reset_for_rebuild(&self) {
        let _writer = self.writer.lock();
        *self.checkpoint_lock.lock() = None;
        *self.snapshot.write() = Arc::new(IndexSnapshot::default());
        self.needs_rebuild.store(false, Ordering::SeqCst);
        info!("keyword index reset for rebuild");
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> IndexStats {
        let snapshot = self.snapshot();
        IndexStats {
            documents: snapshot.document_count(),
            terms: snapshot.term_count(),
            average_document_length: snapshot.average_document_length(),
            version: snapshot.version,
            checkpointed_version: *self.checkpoint_lock.lock(),
            needs_rebuild: self.needs_rebuild(),
        }
    }

    /// Checksum a checkpoint of the current state would carry.
    pub fn content_checksum(&self) -> [u8; 32] {
        self.snapshot().to_checkpoint().checksum()
    }

    fn store(&self) -> Result<&CheckpointStore> {
        self.store.as_ref().ok_or_else(|| {
            Error::Config("keyword index has no checkpoint directory".into())
        })
    }

    /// Fails with `RebuildRequired` while the index awaits a rebuild.
    pub fn ensure_usable(&self) -> Result<()> {
        if self.needs_rebuild() {
            return Err(Error::RebuildRequired {
                rejected: self.rejected_checkpoints.load(Ordering::SeqCst),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for IncrementalKeywordIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalKeywordIndex")
            .field("params", &self.params)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
