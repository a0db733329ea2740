use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Free-form document metadata (collection, path, language, ...).
///
/// A `BTreeMap` keeps iteration order stable, which matters for checkpoint
/// checksums and for hashing filters into cache keys.
pub type Metadata = BTreeMap<String, String>;

/// Equality filters over document metadata. Every clause must match.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct MetadataFilter {
    clauses: BTreeMap<String, String>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to equal `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> impl Iterator<Item = (&str, &str)> {
        self.clauses.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns `true` when every clause is satisfied by `metadata`.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrecall::filter::{Metadata, MetadataFilter};
    ///
    /// let mut meta = Metadata::new();
    /// meta.insert("collection".into(), "notes".into());
    ///
    /// assert!(MetadataFilter::new().matches(&meta));
    /// assert!(MetadataFilter::new().with("collection", "notes").matches(&meta));
    /// assert!(!MetadataFilter::new().with("collection", "docs").matches(&meta));
    /// ```
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.clauses
            .iter()
            .all(|(k, v)| metadata.get(k).is_some_and(|have| have == v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_key_does_not_match() {
        let filter = MetadataFilter::new().with("lang", "en");
        assert!(!filter.matches(&meta(&[("collection", "notes")])));
    }

    #[test]
    fn all_clauses_required() {
        let filter = MetadataFilter::new()
            .with("collection", "notes")
            .with("lang", "en");
        assert!(filter.matches(&meta(&[("collection", "notes"), ("lang", "en")])));
        assert!(!filter.matches(&meta(&[("collection", "notes"), ("lang", "de")])));
    }

    #[test]
    fn later_clause_overrides_same_key() {
        let filter = MetadataFilter::new().with("lang", "en").with("lang", "de");
        assert_eq!(filter.clauses().count(), 1);
        assert!(filter.matches(&meta(&[("lang", "de")])));
    }
}
