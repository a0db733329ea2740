use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::SystemTime,
};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    doc_id::ContentHash,
    error::{Error, Result},
};

/// Magic bytes at the start of every record.
pub const RECORD_MAGIC: [u8; 4] = *b"DRVC";

/// Current record schema version.
pub const RECORD_VERSION: u16 = 1;

/// Header size: 4 magic + 2 version + 2 reserved + 4 dimension + 32 content hash.
const HEADER_SIZE: usize = 44;

/// Trailing BLAKE3 checksum over header and payload.
const CHECKSUM_SIZE: usize = 32;

/// File extension of cache records.
const RECORD_EXT: &str = "vec";

/// Eviction trims the store down to this fraction of `max_bytes` so that a
/// full cache does not rescan the directory on every insert.
const EVICTION_LOW_WATERMARK: f64 = 0.9;

pub const DEFAULT_MAX_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingCacheConfig {
    pub max_bytes: u64,
}

impl Default for EmbeddingCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// Durable, content-addressed embedding cache.
///
/// One file per content hash, sharded into two-hex-character
/// subdirectories. Binary format per record (all integers little-endian):
/// - 4 bytes: magic `DRVC`
/// - 2 bytes: schema version (u16)
/// - 2 bytes: reserved, zero
/// - 4 bytes: vector dimension D (u32)
/// - 32 bytes: the content hash the record was written for
/// - D * 4 bytes: f32 values
/// - 32 bytes: BLAKE3 checksum of everything above
///
/// Records are immutable: a hash always maps to the same vector, so an
/// existing record is never rewritten. Every failure (I/O, corruption)
/// degrades to a cache miss and the caller recomputes the vector.
pub struct EmbeddingCache {
    root: PathBuf,
    max_bytes: u64,
    total_bytes: AtomicU64,
    eviction: Mutex<()>,
    counters: Counters,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    corrupt: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbeddingCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub corrupt: u64,
    pub writes: u64,
    pub evictions: u64,
    pub total_bytes: u64,
}

impl EmbeddingCache {
    /// Open or create a cache rooted at `dir`.
    ///
    /// Scans existing records to learn the store size and removes temp files
    /// left behind by an interrupted write.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use docrecall::doc_id::ContentHash;
    /// use docrecall::embedding_cache::{EmbeddingCache, EmbeddingCacheConfig};
    ///
    /// let cache =
    ///     EmbeddingCache::open(tmp.path(), &EmbeddingCacheConfig::default())
    ///         .unwrap();
    /// let hash = ContentHash::of("model-v1", "hello");
    /// assert!(cache.get(&hash).is_none());
    /// cache.put(&hash, &[0.5, -0.25]);
    /// assert_eq!(cache.get(&hash), Some(vec![0.5, -0.25]));
    /// ```
    pub fn open(dir: &Path, config: &EmbeddingCacheConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut total = 0u64;
        for entry in walk_records(dir)? {
            if entry.is_temp {
                debug!(path = %entry.path.display(), "removing stale temp file");
                let _ = std::fs::remove_file(&entry.path);
            } else {
                total += entry.len;
            }
        }

        Ok(Self {
            root: dir.to_path_buf(),
            max_bytes: config.max_bytes,
            total_bytes: AtomicU64::new(total),
            eviction: Mutex::new(()),
            counters: Counters::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Look up a vector. Corrupt or unreadable records are a miss.
    pub fn get(&self, hash: &ContentHash) -> Option<Vec<f32>> {
        match self.try_get(hash) {
            Ok(Some(vector)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(vector)
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                if let Error::CacheCorruption { path, .. } = &err {
                    self.counters.corrupt.fetch_add(1, Ordering::Relaxed);
                    warn!(%err, "discarding corrupt embedding record");
                    self.discard(path);
                } else {
                    warn!(%err, hash = %hash, "embedding cache read failed");
                }
                None
            }
        }
    }

    /// Look up several vectors in parallel, preserving input order.
    pub fn get_many(&self, hashes: &[ContentHash]) -> Vec<Option<Vec<f32>>> {
        hashes.par_iter().map(|h| self.get(h)).collect()
    }

    /// Store a vector. Failures are logged and otherwise ignored.
    pub fn put(&self, hash: &ContentHash, vector: &[f32]) {
        if let Err(err) = self.try_put(hash, vector) {
            warn!(%err, hash = %hash, "embedding cache write failed");
        }
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.record_path(hash).is_file()
    }

    /// Delete a record. Returns `false` if there was none.
    pub fn remove(&self, hash: &ContentHash) -> Result<bool> {
        let path = self.record_path(hash);
        match std::fs::metadata(&path) {
            Ok(meta) => {
                std::fs::remove_file(&path)?;
                self.total_bytes.fetch_sub(meta.len(), Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        EmbeddingCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            corrupt: self.counters.corrupt.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            total_bytes: self.total_bytes(),
        }
    }

    /// Path of the record for `hash`: `<root>/<hex[0..2]>/<hex>.vec`.
    pub fn record_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root
            .join(&hex[..2])
            .join(format!("{hex}.{RECORD_EXT}"))
    }

    fn try_get(&self, hash: &ContentHash) -> Result<Option<Vec<f32>>> {
        let path = self.record_path(hash);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        decode_record(hash, &bytes).map(Some).map_err(|reason| {
            Error::CacheCorruption { path, reason }
        })
    }

    fn try_put(&self, hash: &ContentHash, vector: &[f32]) -> Result<()> {
        let path = self.record_path(hash);
        if path.is_file() {
            return Ok(());
        }

        let record = encode_record(hash, vector)?;
        let shard_dir = path
            .parent()
            .ok_or_else(|| Error::DataDir(path.clone()))?;
        std::fs::create_dir_all(shard_dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(shard_dir)?;
        tmp.write_all(&record)?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => {}
            // A concurrent writer stored the same content first.
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                return Ok(());
            }
            Err(e) => return Err(e.error.into()),
        }

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        let total = self
            .total_bytes
            .fetch_add(record.len() as u64, Ordering::Relaxed)
            + record.len() as u64;

        if total > self.max_bytes {
            self.evict(&path)?;
        }
        Ok(())
    }

    /// Remove least recently modified records until the store is under the
    /// low watermark. `keep` (the record just written) is never evicted.
    fn evict(&self, keep: &Path) -> Result<()> {
        let _guard = self.eviction.lock();
        let target = (self.max_bytes as f64 * EVICTION_LOW_WATERMARK) as u64;
        if self.total_bytes() <= target {
            return Ok(());
        }

        let mut records: Vec<RecordFile> = walk_records(&self.root)?
            .into_iter()
            .filter(|r| !r.is_temp && r.path != keep)
            .collect();
        records.sort_by(|a, b| {
            a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path))
        });

        let mut evicted = 0u64;
        for record in records {
            if self.total_bytes() <= target {
                break;
            }
            match std::fs::remove_file(&record.path) {
                Ok(()) => {
                    self.total_bytes.fetch_sub(record.len, Ordering::Relaxed);
                    evicted += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(
            evicted,
            total_bytes = self.total_bytes(),
            "embedding cache trimmed"
        );
        Ok(())
    }

    fn discard(&self, path: &Path) {
        if let Ok(meta) = std::fs::metadata(path)
            && std::fs::remove_file(path).is_ok()
        {
            self.total_bytes.fetch_sub(meta.len(), Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("root", &self.root)
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

/// Serialize a vector into the fixed record format.
pub fn encode_record(hash: &ContentHash, vector: &[f32]) -> Result<Vec<u8>> {
    let dimension = u32::try_from(vector.len()).map_err(|_| {
        Error::Config(format!("vector dimension {} too large", vector.len()))
    })?;

    let mut buf =
        Vec::with_capacity(HEADER_SIZE + vector.len() * 4 + CHECKSUM_SIZE);
    buf.extend_from_slice(&RECORD_MAGIC);
    buf.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(&dimension.to_le_bytes());
    buf.extend_from_slice(hash.as_bytes());
    for v in vector {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    let checksum = blake3::hash(&buf);
    buf.extend_from_slice(checksum.as_bytes());
    Ok(buf)
}

/// Validate and decode a record written for `hash`.
///
/// The checksum is verified before any payload byte is interpreted.
/// Returns a human-readable reason on failure.
pub fn decode_record(
    hash: &ContentHash,
    bytes: &[u8],
) -> std::result::Result<Vec<f32>, String> {
    if bytes.len() < HEADER_SIZE + CHECKSUM_SIZE {
        return Err(format!("record too short ({} bytes)", bytes.len()));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
    if blake3::hash(body).as_bytes() != trailer {
        return Err("checksum mismatch".into());
    }

    if body[0..4] != RECORD_MAGIC {
        return Err("bad magic bytes".into());
    }
    let version = u16::from_le_bytes([body[4], body[5]]);
    if version != RECORD_VERSION {
        return Err(format!("unsupported schema version {version}"));
    }
    let dimension =
        u32::from_le_bytes([body[8], body[9], body[10], body[11]]) as usize;
    if &body[12..HEADER_SIZE] != hash.as_bytes() {
        return Err("record belongs to a different content hash".into());
    }

    let payload = &body[HEADER_SIZE..];
    if payload.len() != dimension * 4 {
        return Err(format!(
            "payload is {} bytes, dimension {dimension} needs {}",
            payload.len(),
            dimension * 4
        ));
    }

    Ok(payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

struct RecordFile {
    path: PathBuf,
    len: u64,
    modified: SystemTime,
    is_temp: bool,
}

fn walk_records(root: &Path) -> Result<Vec<RecordFile>> {
    let mut out = Vec::new();
    for shard in std::fs::read_dir(root)? {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(shard.path())? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let path = entry.path();
            let is_record =
                path.extension().is_some_and(|ext| ext == RECORD_EXT);
            let is_temp = entry.file_name().to_string_lossy().starts_with(".tmp");
            if !is_record && !is_temp {
                continue;
            }
            out.push(RecordFile {
                path,
                len: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                is_temp,
            });
        }
    }
    Ok(out)
}
