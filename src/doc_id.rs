/// A stable document identifier derived from (collection_name, relative_path).
///
/// Ids are persisted in index checkpoints and in the vector store, so the
/// hash must not change between compiler releases. BLAKE3 is used instead
/// of `std`'s `DefaultHasher` for that reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentId {
    /// The numeric ID used by the keyword index and the vector store.
    pub numeric: u64,
    /// The short hex string for human display (e.g. "a1b2c3").
    pub short: String,
}

impl DocumentId {
    /// Generate a stable document ID from collection name and relative path.
    pub fn new(collection: &str, relative_path: &str) -> Self {
        let numeric = Self::hash_pair(collection, relative_path);
        let short = Self::short_hex(numeric, 6);
        Self { numeric, short }
    }

    fn hash_pair(collection: &str, relative_path: &str) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(collection.len() as u64).to_le_bytes());
        hasher.update(collection.as_bytes());
        hasher.update(relative_path.as_bytes());
        let digest = hasher.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(first)
    }

    fn short_hex(value: u64, len: usize) -> String {
        format!("{value:016x}")[..len].to_string()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.short)
    }
}

/// Content address of a piece of text under a given embedding model.
///
/// Two chunks with the same text embedded by the same model version share a
/// hash, so the embedding is computed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(model_version: &str, text: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(model_version.len() as u64).to_le_bytes());
        hasher.update(model_version.as_bytes());
        hasher.update(text.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, 64 characters. Used as the on-disk record name.
    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    /// Parse the hex form produced by [`ContentHash::to_hex`].
    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex)
            .ok()
            .map(|h| Self(*h.as_bytes()))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}
