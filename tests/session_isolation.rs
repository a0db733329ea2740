use docrecall::{
    MetadataFilter, QueryResultCache, RankedResult, RetrievalStrategy,
    SessionId, SessionKeyspace,
    fusion::ComponentRanks,
    query_cache::{QueryCacheConfig, QueryParams},
    session::SessionConfig,
};
use proptest::prelude::*;

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

fn params() -> QueryParams {
    QueryParams {
        k: 5,
        filters: MetadataFilter::new(),
        strategy: RetrievalStrategy::Hybrid,
    }
}

fn session_pair() -> impl Strategy<Value = (String, String)> {
    ("[a-z0-9]{1,8}", "[a-z0-9]{1,8}").prop_filter("distinct", |(a, b)| a != b)
}

proptest! {
    #[test]
    fn a_session_never_reads_another_sessions_entries(
        (a, b) in session_pair(),
        queries in prop::collection::vec("[a-z ]{1,16}", 1..8),
    ) {
        let sessions = SessionKeyspace::new(&SessionConfig::default());
        let cache = QueryResultCache::new(&QueryCacheConfig::default());
        let scope_a = sessions.resolve(&SessionId::new(a).unwrap());
        let scope_b = sessions.resolve(&SessionId::new(b).unwrap());

        for (i, query) in queries.iter().enumerate() {
            cache.put(&scope_a, query, &params(), results(&[i as u64]));
        }
        for query in &queries {
            prop_assert!(cache.get(&scope_b, query, &params()).is_none());
        }
    }

    #[test]
    fn invalidating_one_session_spares_the_other(
        (a, b) in session_pair(),
        queries in prop::collection::vec("[a-z]{1,12}", 1..8),
    ) {
        let sessions = SessionKeyspace::new(&SessionConfig::default());
        let cache = QueryResultCache::new(&QueryCacheConfig::default());
        let id_a = SessionId::new(a).unwrap();
        let scope_a = sessions.resolve(&id_a);
        let scope_b = sessions.resolve(&SessionId::new(b).unwrap());

        for query in &queries {
            cache.put(&scope_a, query, &params(), results(&[1]));
            cache.put(&scope_b, query, &params(), results(&[2]));
        }
        cache.invalidate(&id_a);

        for query in &queries {
            prop_assert!(cache.get(&scope_a, query, &params()).is_none());
            prop_assert_eq!(
                cache.get(&scope_b, query, &params()),
                Some(results(&[2]))
            );
        }
    }
}

#[test]
fn same_query_in_two_sessions_gets_two_keys() {
    let sessions = SessionKeyspace::new(&SessionConfig::default());
    let a = sessions.resolve(&SessionId::new("alice").unwrap());
    let b = sessions.resolve(&SessionId::new("bob").unwrap());

    let key_a = a.scoped_key(b"cat dog");
    let key_b = b.scoped_key(b"cat dog");
    assert_ne!(key_a, key_b);
    assert!(key_a.belongs_to(a.session_id()));
    assert!(!key_a.belongs_to(b.session_id()));
}
