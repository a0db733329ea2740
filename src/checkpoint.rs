//! Durable keyword-index checkpoints.
//!
//! A checkpoint file is immutable once written. New checkpoints get the next
//! sequence number, so the previous checkpoint is never touched until a
//! newer one has been committed and re-read successfully.

use std::{
    collections::BTreeMap,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    filter::Metadata,
    keyword_index::Posting,
};

/// Magic bytes at the start of every checkpoint file.
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"DRCK";

/// Current on-disk schema version.
pub const CHECKPOINT_SCHEMA: u32 = 1;

const CHECKSUM_SIZE: usize = 32;
const FILE_PREFIX: &str = "checkpoint-";
const FILE_EXT: &str = "ckpt";

/// One indexed document as stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDocument {
    pub doc_id: u64,
    pub length: u32,
    pub metadata: Metadata,
}

/// A complete, self-consistent image of the keyword index.
///
/// Binary format (integers little-endian, strings length-prefixed UTF-8):
/// - 4 bytes: magic `DRCK`
/// - 4 bytes: schema version (u32)
/// - 8 bytes: index version (u64)
/// - 8 bytes: document count (u64)
/// - 8 bytes: total document length in tokens (u64)
/// - 8 bytes: term count (u64)
/// - documents, ascending by id: id u64, length u32, metadata pair count
///   u32, then key/value strings
/// - terms, ascending: term string, posting count u32, then
///   (doc_id u64, term_frequency u32) ascending by doc id
/// - 32 bytes: BLAKE3 checksum of everything above
///
/// Encoding is deterministic, so two indexes holding the same documents
/// produce byte-identical checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCheckpoint {
    pub version: u64,
    pub total_length: u64,
    pub documents: Vec<CheckpointDocument>,
    pub postings: BTreeMap<String, Vec<Posting>>,
}

impl IndexCheckpoint {
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn average_document_length(&self) -> f64 {
        if self.documents.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.documents.len() as f64
        }
    }

    /// Serialize, appending the checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&CHECKPOINT_MAGIC);
        buf.extend_from_slice(&CHECKPOINT_SCHEMA.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(self.documents.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.total_length.to_le_bytes());
        buf.extend_from_slice(&(self.postings.len() as u64).to_le_bytes());

        for doc in &self.documents {
            buf.extend_from_slice(&doc.doc_id.to_le_bytes());
            buf.extend_from_slice(&doc.length.to_le_bytes());
            buf.extend_from_slice(&(doc.metadata.len() as u32).to_le_bytes());
            for (key, value) in &doc.metadata {
                put_str(&mut buf, key);
                put_str(&mut buf, value);
            }
        }

        for (term, postings) in &self.postings {
            put_str(&mut buf, term);
            buf.extend_from_slice(&(postings.len() as u32).to_le_bytes());
            for posting in postings {
                buf.extend_from_slice(&posting.doc_id.to_le_bytes());
                buf.extend_from_slice(&posting.term_frequency.to_le_bytes());
            }
        }

        let checksum = blake3::hash(&buf);
        buf.extend_from_slice(checksum.as_bytes());
        buf
    }

    /// The checksum `encode` would append.
    pub fn checksum(&self) -> [u8; 32] {
        let bytes = self.encode();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes[bytes.len() - CHECKSUM_SIZE..]);
        out
    }

    /// Verify the checksum, then parse and cross-check the structure.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < CHECKSUM_SIZE {
            return Err(format!("file too short ({} bytes)", bytes.len()));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
        if blake3::hash(body).as_bytes() != trailer {
            return Err("checksum mismatch".into());
        }

        let mut r = Reader::new(body);
        if r.take(4)? != CHECKPOINT_MAGIC {
            return Err("bad magic bytes".into());
        }
        let schema = r.u32()?;
        if schema != CHECKPOINT_SCHEMA {
            return Err(format!("unsupported schema version {schema}"));
        }
        let version = r.u64()?;
        let doc_count = r.u64()?;
        let total_length = r.u64()?;
        let term_count = r.u64()?;

        let mut documents: Vec<CheckpointDocument> = Vec::new();
        for _ in 0..doc_count {
            let doc_id = r.u64()?;
            let length = r.u32()?;
            let pairs = r.u32()?;
            let mut metadata = Metadata::new();
            for _ in 0..pairs {
                let key = r.string()?;
                let value = r.string()?;
                metadata.insert(key, value);
            }
            if documents.last().is_some_and(|prev| prev.doc_id >= doc_id) {
                return Err("documents are not strictly ascending".into());
            }
            documents.push(CheckpointDocument {
                doc_id,
                length,
                metadata,
            });
        }

        let mut postings = BTreeMap::new();
        for _ in 0..term_count {
            let term = r.string()?;
            let count = r.u32()?;
            let mut list: Vec<Posting> = Vec::new();
            for _ in 0..count {
                let posting = Posting {
                    doc_id: r.u64()?,
                    term_frequency: r.u32()?,
                };
                if posting.term_frequency == 0 {
                    return Err(format!("zero term frequency for '{term}'"));
                }
                if list.last().is_some_and(|p| p.doc_id >= posting.doc_id) {
                    return Err(format!("postings for '{term}' out of order"));
                }
                list.push(posting);
            }
            if list.is_empty() {
                return Err(format!("empty posting list for '{term}'"));
            }
            if postings.insert(term, list).is_some() {
                return Err("duplicate term".into());
            }
        }

        if !r.is_empty() {
            return Err(format!("{} trailing bytes", r.remaining()));
        }

        let checkpoint = Self {
            version,
            total_length,
            documents,
            postings,
        };
        checkpoint.check_consistency()?;
        Ok(checkpoint)
    }

    /// Every posting must point at a stored document and the term
    /// frequencies of a document must add up to its length.
    fn check_consistency(&self) -> std::result::Result<(), String> {
        let mut tf_sums: BTreeMap<u64, u64> = self
            .documents
            .iter()
            .map(|d| (d.doc_id, 0))
            .collect();

        for (term, list) in &self.postings {
            for posting in list {
                let sum = tf_sums.get_mut(&posting.doc_id).ok_or_else(|| {
                    format!("'{term}' references unknown doc {}", posting.doc_id)
                })?;
                *sum += u64::from(posting.term_frequency);
            }
        }

        let mut total = 0u64;
        for doc in &self.documents {
            if tf_sums.get(&doc.doc_id) != Some(&u64::from(doc.length)) {
                return Err(format!(
                    "doc {} length does not match its postings",
                    doc.doc_id
                ));
            }
            total += u64::from(doc.length);
        }
        if total != self.total_length {
            return Err("total length does not match documents".into());
        }
        Ok(())
    }
}

/// A checkpoint file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFile {
    pub sequence: u64,
    pub path: PathBuf,
}

/// Directory of numbered checkpoint files.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
    retain: usize,
}

impl CheckpointStore {
    pub fn open(dir: &Path, retain: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            retain: retain.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{sequence:020}.{FILE_EXT}"))
    }

    /// Checkpoint files, newest first. Temp files are ignored.
    pub fn list(&self) -> Result<Vec<CheckpointFile>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(sequence) = parse_sequence(&name.to_string_lossy()) else {
                continue;
            };
            files.push(CheckpointFile {
                sequence,
                path: entry.path(),
            });
        }
        files.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(files)
    }

    /// Commit `checkpoint` as the newest file.
    ///
    /// Temp file, fsync, rename, fsync the directory, then re-read and
    /// verify. Older files beyond the retention count are pruned only after
    /// verification succeeds.
    pub fn write(&self, checkpoint: &IndexCheckpoint) -> Result<CheckpointFile> {
        let sequence = self.list()?.first().map_or(1, |f| f.sequence + 1);
        let path = self.path_for(sequence);
        let bytes = checkpoint.encode();

        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-checkpoint-")
            .tempfile_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(&path).map_err(|e| e.error)?;
        sync_dir(&self.dir)?;

        let written = std::fs::read(&path)?;
        if written != bytes {
            return Err(Error::CheckpointCorrupt {
                path,
                reason: "read-back differs from written bytes".into(),
            });
        }

        let file = CheckpointFile { sequence, path };
        info!(
            sequence,
            version = checkpoint.version,
            documents = checkpoint.document_count(),
            "keyword index checkpoint committed"
        );
        self.prune()?;
        Ok(file)
    }

    /// Load and verify one file.
    pub fn load(path: &Path) -> Result<IndexCheckpoint> {
        let bytes = std::fs::read(path)?;
        IndexCheckpoint::decode(&bytes).map_err(|reason| {
            Error::CheckpointCorrupt {
                path: path.to_path_buf(),
                reason,
            }
        })
    }

    /// Newest checkpoint that verifies, falling back to older ones.
    ///
    /// `Ok(None)` when there are no checkpoint files at all;
    /// `Error::RebuildRequired` when files exist but none verify.
    pub fn load_newest_valid(
        &self,
    ) -> Result<Option<(CheckpointFile, IndexCheckpoint)>> {
        let files = self.list()?;
        if files.is_empty() {
            return Ok(None);
        }

        let mut rejected = 0;
        for file in files {
            match Self::load(&file.path) {
                Ok(checkpoint) => {
                    if rejected > 0 {
                        warn!(
                            rejected,
                            sequence = file.sequence,
                            "fell back to an older checkpoint"
                        );
                    }
                    return Ok(Some((file, checkpoint)));
                }
                Err(err) => {
                    warn!(%err, "skipping checkpoint");
                    rejected += 1;
                }
            }
        }
        Err(Error::RebuildRequired { rejected })
    }

    /// Keep the newest `retain` files that verify. A file that fails
    /// verification only counts as stale once a newer file verifies.
    fn prune(&self) -> Result<()> {
        let mut verified = 0;
        for file in self.list()? {
            if verified < self.retain {
                match Self::load(&file.path) {
                    Ok(_) => {
                        verified += 1;
                        continue;
                    }
                    Err(_) if verified == 0 => continue,
                    Err(err) => {
                        warn!(%err, "pruning unverifiable checkpoint");
                    }
                }
            } else {
                debug!(sequence = file.sequence, "pruning old checkpoint");
            }
            std::fs::remove_file(&file.path)?;
        }
        Ok(())
    }
}

fn parse_sequence(name: &str) -> Option<u64> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_EXT)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

fn sync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    File::open(path)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Bounds-checked cursor over a checkpoint body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| format!("truncated at byte {}", self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> std::result::Result<u64, String> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn string(&mut self) -> std::result::Result<String, String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| "invalid UTF-8".into())
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
