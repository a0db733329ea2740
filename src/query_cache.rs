//! Session-scoped, bounded, TTL-based cache of fused retrieval results.
//!
//! Keys are [`ScopedKey`]s built from `(session, normalized query, params)`,
//! so one session can never observe another session's entries. Storage is
//! split into independently locked LRU shards to keep unrelated keys from
//! contending on one mutex.

use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{
    error::Error,
    filter::MetadataFilter,
    fusion::RankedResult,
    retriever::RetrievalStrategy,
    session::{ScopedKey, SessionId, SessionScope},
    text_util::normalize_query,
};

pub const DEFAULT_MAX_ENTRIES: usize = 1024;
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    pub max_entries: usize,
    #[serde(rename = "ttl_ms", with = "crate::config::duration_ms")]
    pub ttl: Duration,
    pub shards: usize,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: DEFAULT_TTL,
            shards: DEFAULT_SHARDS,
        }
    }
}

/// The retrieval parameters that, together with the query text, determine
/// a result list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueryParams {
    pub k: usize,
    pub filters: MetadataFilter,
    pub strategy: RetrievalStrategy,
}

/// A cached value with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<K, V> {
    pub key: K,
    pub value: V,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub ttl: Duration,
    pub size_bytes: usize,
}

impl<K, V> CacheEntry<K, V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

type Entry = CacheEntry<ScopedKey, Vec<RankedResult>>;

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

pub struct QueryResultCache {
    shards: Vec<Mutex<LruCache<ScopedKey, Entry>>>,
    ttl: Duration,
    counters: Counters,
}

impl QueryResultCache {
    /// Shard capacities sum to exactly `max_entries`; there are never more
    /// shards than entries.
    pub fn new(config: &QueryCacheConfig) -> Self {
        let max_entries = config.max_entries.max(1);
        let shard_count = config.shards.clamp(1, max_entries);
        let base = max_entries / shard_count;
        let remainder = max_entries % shard_count;

        Self {
            shards: (0..shard_count)
                .map(|i| {
                    let capacity = base + usize::from(i < remainder);
                    Mutex::new(LruCache::new(
                        NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
                    ))
                })
                .collect(),
            ttl: config.ttl,
            counters: Counters::default(),
        }
    }

    /// Look up the results cached for `query` within `scope`.
    pub fn get(
        &self,
        scope: &SessionScope,
        query: &str,
        params: &QueryParams,
    ) -> Option<Vec<RankedResult>> {
        self.get_at(scope, query, params, Instant::now())
    }

    pub(crate) fn get_at(
        &self,
        scope: &SessionScope,
        query: &str,
        params: &QueryParams,
        now: Instant,
    ) -> Option<Vec<RankedResult>> {
        let key = cache_key(scope, query, params);
        let mut shard = self.shard(&key).lock();

        let expired = match shard.get_mut(&key) {
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                if let Err(err) = ensure_owner(&entry.key, scope.session_id())
                {
                    report_violation(&err);
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                entry.last_accessed = now;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        };

        if expired {
            shard.pop(&key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `results` for `query` within `scope`, replacing any previous
    /// entry and evicting the shard's least recently used entry when full.
    pub fn put(
        &self,
        scope: &SessionScope,
        query: &str,
        params: &QueryParams,
        results: Vec<RankedResult>,
    ) {
        self.put_at(scope, query, params, results, Instant::now());
    }

    pub(crate) fn put_at(
        &self,
        scope: &SessionScope,
        query: &str,
        params: &QueryParams,
        results: Vec<RankedResult>,
        now: Instant,
    ) {
        let key = cache_key(scope, query, params);
        let size_bytes = std::mem::size_of::<Entry>()
            + results.len() * std::mem::size_of::<RankedResult>();
        let entry = CacheEntry {
            key: key.clone(),
            value: results,
            created_at: now,
            last_accessed: now,
            ttl: self.ttl,
            size_bytes,
        };

        let mut shard = self.shard(&key).lock();
        if let Some((evicted, _)) = shard.push(key.clone(), entry)
            && evicted != key
        {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every entry belonging to `session_id`. Returns how many were
    /// removed.
    ///
    /// Must be called whenever the corpus behind that session changes; once
    /// it returns, no later `get` for the session can see pre-change data.
    pub fn invalidate(&self, session_id: &SessionId) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let doomed: Vec<ScopedKey> = shard
                .iter()
                .filter(|(k, _)| k.belongs_to(session_id))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                shard.pop(&key);
                removed += 1;
            }
        }
        debug!(session = %session_id, removed, "query cache invalidated");
        removed
    }

    /// Remove expired entries from every shard.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub(crate) fn purge_expired_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let doomed: Vec<ScopedKey> = shard
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                shard.pop(&key);
                removed += 1;
            }
        }
        self.counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueryCacheStats {
        QueryCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn shard(&self, key: &ScopedKey) -> &Mutex<LruCache<ScopedKey, Entry>> {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&key.digest()[..8]);
        let idx = u64::from_le_bytes(prefix) % self.shards.len() as u64;
        &self.shards[idx as usize]
    }
}

impl std::fmt::Debug for QueryResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResultCache")
            .field("shards", &self.shards.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn cache_key(
    scope: &SessionScope,
    query: &str,
    params: &QueryParams,
) -> ScopedKey {
    let normalized = normalize_query(query);
    let mut logical = Vec::with_capacity(normalized.len() + 32);
    push_field(&mut logical, normalized.as_bytes());
    logical.extend_from_slice(&(params.k as u64).to_le_bytes());
    for (key, value) in params.filters.clauses() {
        push_field(&mut logical, key.as_bytes());
        push_field(&mut logical, value.as_bytes());
    }
    logical.push(match params.strategy {
        RetrievalStrategy::KeywordOnly => 0,
        RetrievalStrategy::VectorOnly => 1,
        RetrievalStrategy::Hybrid => 2,
    });
    scope.scoped_key(&logical)
}

/// Length-prefixed so adjacent fields cannot run into each other.
fn push_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn ensure_owner(key: &ScopedKey, reader: &SessionId) -> Result<(), Error> {
    if key.belongs_to(reader) {
        Ok(())
    } else {
        Err(Error::SessionViolation {
            expected: reader.to_string(),
            found: key.session_id().to_string(),
        })
    }
}

fn report_violation(err: &Error) {
    error!(%err, "query cache returned an entry owned by another session");
    if cfg!(debug_assertions) {
        panic!("{err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fusion::ComponentRanks,
        session::{SessionConfig, SessionKeyspace},
    };

    fn results(ids: &[u64]) -> Vec<RankedResult> {
        ids.iter()
            .enumerate()
            .map(|(i, &doc_id)| RankedResult {
                doc_id,
                fused_score: 1.0 / (i as f64 + 61.0),
                component_scores: ComponentRanks {
                    keyword_rank: Some(i + 1),
                    vector_rank: None,
                },
                final_rank: i + 1,
            })
            .collect()
    }

    fn params(k: usize) -> QueryParams {
        QueryParams {
            k,
            filters: MetadataFilter::new(),
            strategy: RetrievalStrategy::Hybrid,
        }
    }

    fn setup(config: QueryCacheConfig) -> (SessionKeyspace, QueryResultCache) {
        (
            SessionKeyspace::new(&SessionConfig::default()),
            QueryResultCache::new(&config),
        )
    }

    fn scope(ks: &SessionKeyspace, id: &str) -> SessionScope {
        ks.resolve(&SessionId::new(id).unwrap())
    }

    #[test]
    fn get_after_put_within_ttl() {
        let (ks, cache) = setup(QueryCacheConfig::default());
        let alice = scope(&ks, "alice");
        let now = Instant::now();

        cache.put_at(&alice, "cat dog", &params(2), results(&[3, 1]), now);
        let hit = cache
            .get_at(&alice, "cat dog", &params(2), now + Duration::from_secs(1))
            .unwrap();
        assert_eq!(hit, results(&[3, 1]));
    }

    #[test]
    fn expired_entry_is_a_miss_and_removed() {
        let (ks, cache) = setup(QueryCacheConfig {
            ttl: Duration::from_secs(10),
            ..QueryCacheConfig::default()
        });
        let alice = scope(&ks, "alice");
        let now = Instant::now();

        cache.put_at(&alice, "q", &params(2), results(&[1]), now);
        assert!(
            cache
                .get_at(&alice, "q", &params(2), now + Duration::from_secs(10))
                .is_none()
        );
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn sessions_do_not_share_entries() {
        let (ks, cache) = setup(QueryCacheConfig::default());
        let alice = scope(&ks, "alice");
        let bob = scope(&ks, "bob");

        cache.put(&alice, "secret plans", &params(5), results(&[42]));
        assert!(cache.get(&bob, "secret plans", &params(5)).is_none());
        assert!(cache.get(&alice, "secret plans", &params(5)).is_some());
    }

    #[test]
    fn query_normalization_shares_entries() {
        let (ks, cache) = setup(QueryCacheConfig::default());
        let alice = scope(&ks, "alice");

        cache.put(&alice, "Cat  DOG", &params(2), results(&[1]));
        assert!(cache.get(&alice, "cat dog", &params(2)).is_some());
    }

    #[test]
    fn params_are_part_of_the_key() {
        let (ks, cache) = setup(QueryCacheConfig::default());
        let alice = scope(&ks, "alice");

        cache.put(&alice, "q", &params(2), results(&[1, 2]));
        assert!(cache.get(&alice, "q", &params(3)).is_none());

        let filtered = QueryParams {
            filters: MetadataFilter::new().with("collection", "notes"),
            ..params(2)
        };
        assert!(cache.get(&alice, "q", &filtered).is_none());
    }

    #[test]
    fn filter_clause_boundaries_are_part_of_the_key() {
        let (ks, _) = setup(QueryCacheConfig::default());
        let alice = scope(&ks, "alice");
        let split = |key: &str, value: &str| QueryParams {
            filters: MetadataFilter::new().with(key, value),
            ..params(2)
        };

        let a = cache_key(&alice, "q", &split("ab", "c"));
        let b = cache_key(&alice, "q", &split("a", "bc"));
        assert_ne!(a, b);

        let keyword = QueryParams {
            strategy: RetrievalStrategy::KeywordOnly,
            ..params(2)
        };
        assert_ne!(cache_key(&alice, "q", &params(2)), cache_key(&alice, "q", &keyword));
        assert_eq!(cache_key(&alice, "Q", &params(2)), cache_key(&alice, "q", &params(2)));
    }

    #[test]
    fn invalidate_only_touches_one_session() {
        let (ks, cache) = setup(QueryCacheConfig::default());
        let alice = scope(&ks, "alice");
        let bob = scope(&ks, "bob");

        cache.put(&alice, "a", &params(1), results(&[1]));
        cache.put(&alice, "b", &params(1), results(&[2]));
        cache.put(&bob, "a", &params(1), results(&[3]));

        assert_eq!(cache.invalidate(alice.session_id()), 2);
        assert!(cache.get(&alice, "a", &params(1)).is_none());
        assert!(cache.get(&bob, "a", &params(1)).is_some());
    }

    #[test]
    fn lru_eviction_is_bounded() {
        let (ks, cache) = setup(QueryCacheConfig {
            max_entries: 2,
            shards: 1,
            ..QueryCacheConfig::default()
        });
        let alice = scope(&ks, "alice");

        cache.put(&alice, "one", &params(1), results(&[1]));
        cache.put(&alice, "two", &params(1), results(&[2]));
        // Touch "one" so "two" becomes least recently used.
        assert!(cache.get(&alice, "one", &params(1)).is_some());
        cache.put(&alice, "three", &params(1), results(&[3]));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&alice, "two", &params(1)).is_none());
        assert!(cache.get(&alice, "one", &params(1)).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn total_entries_never_exceed_max_entries() {
        for max_entries in [1, 2, 15, 17, 100] {
            let (ks, cache) = setup(QueryCacheConfig {
                max_entries,
                ..QueryCacheConfig::default()
            });
            let alice = scope(&ks, "alice");
            for i in 0..max_entries * 4 {
                cache.put(&alice, &format!("query {i}"), &params(1), results(&[1]));
                assert!(cache.len() <= max_entries, "{} > {max_entries}", cache.len());
            }
            assert!(cache.stats().evictions > 0);
        }
    }

    #[test]
    fn shard_capacities_sum_to_max_entries() {
        let cache = QueryResultCache::new(&QueryCacheConfig {
            max_entries: 100,
            shards: 16,
            ..QueryCacheConfig::default()
        });
        let total: usize =
            cache.shards.iter().map(|s| s.lock().cap().get()).sum();
        assert_eq!(total, 100);

        let tiny = QueryResultCache::new(&QueryCacheConfig {
            max_entries: 2,
            ..QueryCacheConfig::default()
        });
        assert_eq!(tiny.shards.len(), 2);
    }

    #[test]
    fn overwrite_is_not_an_eviction() {
        let (ks, cache) = setup(QueryCacheConfig::default());
        let alice = scope(&ks, "alice");

        cache.put(&alice, "q", &params(1), results(&[1]));
        cache.put(&alice, "q", &params(1), results(&[2]));
        assert_eq!(cache.get(&alice, "q", &params(1)), Some(results(&[2])));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn purge_expired_sweeps_all_shards() {
        let (ks, cache) = setup(QueryCacheConfig {
            ttl: Duration::from_secs(1),
            ..QueryCacheConfig::default()
        });
        let alice = scope(&ks, "alice");
        let now = Instant::now();
        for q in ["a", "b", "c", "d"] {
            cache.put_at(&alice, q, &params(1), results(&[1]), now);
        }

        assert_eq!(cache.purge_expired_at(now), 0);
        assert_eq!(cache.purge_expired_at(now + Duration::from_secs(2)), 4);
        assert!(cache.is_empty());
    }

    #[test]
    fn ownership_check_rejects_foreign_key() {
        let ks = SessionKeyspace::new(&SessionConfig::default());
        let key = scope(&ks, "alice").scoped_key(b"q");
        let err =
            ensure_owner(&key, &SessionId::new("bob").unwrap()).unwrap_err();
        assert!(matches!(err, Error::SessionViolation { .. }));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "session violation")]
    fn violation_fails_loudly_in_debug_builds() {
        let err = Error::SessionViolation {
            expected: "bob".into(),
            found: "alice".into(),
        };
        report_violation(&err);
    }

    #[test]
    fn hit_and_miss_counters() {
        let (ks, cache) = setup(QueryCacheConfig::default());
        let alice = scope(&ks, "alice");

        assert!(cache.get(&alice, "q", &params(1)).is_none());
        cache.put(&alice, "q", &params(1), results(&[1]));
        assert!(cache.get(&alice, "q", &params(1)).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }
}
