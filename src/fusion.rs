//! Reciprocal Rank Fusion of keyword and vector rankings.
//!
//! `fused(d) = Σ_i 1 / (rank_i(d) + C)` over every source in which `d`
//! appears, with 1-based ranks. Raw source scores (BM25 magnitudes, cosine
//! similarities) never enter the fused score; they are not comparable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Standard RRF constant from Cormack, Clarke & Buettcher (SIGIR 2009).
pub const RRF_K: usize = 60;

/// Where a document sat in each source ranking (1-based), if anywhere.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct ComponentRanks {
    pub keyword_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

/// A retrieval result after fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub doc_id: u64,
    pub fused_score: f64,
    pub component_scores: ComponentRanks,
    /// 1-based position in the final list.
    pub final_rank: usize,
}

/// RRF contribution of a single 1-based rank.
pub fn rrf_term(rank: usize, constant: usize) -> f64 {
    1.0 / (rank as f64 + constant as f64)
}

/// Fuse two best-first lists of document ids.
///
/// Either list may be empty (its source was unavailable or matched
/// nothing). Ties on the fused score are broken by the better keyword rank,
/// then by ascending doc id, so the output order is deterministic.
///
/// # Examples
///
/// ```
/// use docrecall::fusion::{reciprocal_rank_fusion, RRF_K};
///
/// let fused = reciprocal_rank_fusion(&[3, 1], &[1, 2], RRF_K);
/// assert_eq!(fused[0].doc_id, 1);
/// assert_eq!(fused[0].component_scores.keyword_rank, Some(2));
/// assert_eq!(fused[0].component_scores.vector_rank, Some(1));
/// assert_eq!(fused[0].final_rank, 1);
/// ```
pub fn reciprocal_rank_fusion(
    keyword_ranking: &[u64],
    vector_ranking: &[u64],
    constant: usize,
) -> Vec<RankedResult> {
    let mut ranks: HashMap<u64, ComponentRanks> = HashMap::new();

    for (i, &doc_id) in keyword_ranking.iter().enumerate() {
        let entry = ranks.entry(doc_id).or_default();
        // A source listing the same doc twice only counts its best rank.
        entry.keyword_rank.get_or_insert(i + 1);
    }
    for (i, &doc_id) in vector_ranking.iter().enumerate() {
        let entry = ranks.entry(doc_id).or_default();
        entry.vector_rank.get_or_insert(i + 1);
    }

    let mut fused: Vec<RankedResult> = ranks
        .into_iter()
        .map(|(doc_id, component_scores)| RankedResult {
            doc_id,
            fused_score: fused_score(&component_scores, constant),
            component_scores,
            final_rank: 0,
        })
        .collect();

    fused.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let ka = a.component_scores.keyword_rank.unwrap_or(usize::MAX);
                let kb = b.component_scores.keyword_rank.unwrap_or(usize::MAX);
                ka.cmp(&kb)
            })
            .then(a.doc_id.cmp(&b.doc_id))
    });

    for (i, result) in fused.iter_mut().enumerate() {
        result.final_rank = i + 1;
    }
    fused
}

/// Sum of the RRF terms for the sources that ranked the document.
pub fn fused_score(ranks: &ComponentRanks, constant: usize) -> f64 {
    ranks
        .keyword_rank
        .into_iter()
        .chain(ranks.vector_rank)
        .map(|r| rrf_term(r, constant))
        .sum()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn by_id(results: &[RankedResult], id: u64) -> &RankedResult {
        results.iter().find(|r| r.doc_id == id).unwrap()
    }

    #[test]
    fn both_sources_sum_their_terms() {
        let fused = reciprocal_rank_fusion(&[10, 20, 30], &[30, 10], RRF_K);
        let d10 = by_id(&fused, 10);
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((d10.fused_score - expected).abs() < 1e-12);
    }

    #[test]
    fn single_source_uses_one_term() {
        let fused = reciprocal_rank_fusion(&[10, 20], &[30], RRF_K);
        assert!((by_id(&fused, 20).fused_score - 1.0 / 62.0).abs() < 1e-12);
        assert!((by_id(&fused, 30).fused_score - 1.0 / 61.0).abs() < 1e-12);
        assert_eq!(by_id(&fused, 30).component_scores.keyword_rank, None);
    }

    #[test]
    fn overlap_outranks_single_source() {
        let fused = reciprocal_rank_fusion(&[1, 2, 3], &[3, 4, 5], RRF_K);
        assert_eq!(fused[0].doc_id, 3);
    }

    #[test]
    fn ties_prefer_keyword_rank_then_doc_id() {
        // 7 is keyword #1, 9 is vector #1: identical fused scores.
        let fused = reciprocal_rank_fusion(&[7], &[9], RRF_K);
        assert_eq!(fused[0].doc_id, 7);

        let fused = reciprocal_rank_fusion(&[], &[9, 4], RRF_K);
        assert_eq!(fused[0].doc_id, 9);
        assert_eq!(fused[1].doc_id, 4);
    }

    #[test]
    fn empty_inputs_give_empty_output() {
        assert!(reciprocal_rank_fusion(&[], &[], RRF_K).is_empty());
    }

    #[test]
    fn duplicate_ids_keep_best_rank() {
        let fused = reciprocal_rank_fusion(&[5, 5], &[], RRF_K);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].component_scores.keyword_rank, Some(1));
    }

    proptest! {
        #[test]
        fn fused_score_matches_formula(r1 in 1usize..500, r2 in 1usize..500) {
            let mut keyword: Vec<u64> = (1000..1000 + r1 as u64 - 1).collect();
            keyword.push(1);
            let mut vector: Vec<u64> = (5000..5000 + r2 as u64 - 1).collect();
            vector.push(1);

            let fused = reciprocal_rank_fusion(&keyword, &vector, RRF_K);
            let doc = by_id(&fused, 1);
            let expected = 1.0 / (r1 as f64 + 60.0) + 1.0 / (r2 as f64 + 60.0);
            prop_assert!((doc.fused_score - expected).abs() < 1e-12);
            prop_assert_eq!(doc.component_scores.keyword_rank, Some(r1));
            prop_assert_eq!(doc.component_scores.vector_rank, Some(r2));
        }

        #[test]
        fn final_ranks_are_dense_and_sorted(
            keyword in proptest::collection::vec(0u64..50, 0..30),
            vector in proptest::collection::vec(0u64..50, 0..30),
        ) {
            let fused = reciprocal_rank_fusion(&keyword, &vector, RRF_K);
            for (i, r) in fused.iter().enumerate() {
                prop_assert_eq!(r.final_rank, i + 1);
            }
            for pair in fused.windows(2) {
                prop_assert!(pair[0].fused_score >= pair[1].fused_score);
            }
        }
    }
}
