//! Relevance ranking of fix candidates against a query error.
//!
//! score = 0.5 * text similarity of normalized errors
//!       + 0.3 * candidate success rate
//!       + 0.2 * fraction of query context keys the candidate matches

use std::cmp::Ordering;
use std::sync::Arc;

use crate::errors::FixResult;
use crate::models::{FixContext, FixRecord, RankedFix};
use crate::query::guards::{
    clamp_unit, WEIGHT_CONTEXT_OVERLAP, WEIGHT_SUCCESS_RATE, WEIGHT_TEXT_SIMILARITY,
};
use crate::store::fix_store::FixStore;
use crate::text::normalizer::normalize;
use crate::text::similarity::TextSimilarity;

/// Fraction of `query` keys whose value equals the candidate's value.
pub fn context_overlap(query: &FixContext, candidate: &FixContext) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let matching = query
        .iter()
        .filter(|(key, value)| candidate.get(*key) == Some(*value))
        .count();
    matching as f64 / query.len() as f64
}

/// Descending score; ties go to local records, then more-used, then older.
pub fn compare_ranked(a: &RankedFix, b: &RankedFix) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.record.is_local().cmp(&a.record.is_local()))
        .then_with(|| b.record.usage_count.cmp(&a.record.usage_count))
        .then_with(|| a.record.created_at.cmp(&b.record.created_at))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

#[derive(Clone)]
pub struct RelevanceRanker {
    similarity: Arc<dyn TextSimilarity>,
}

impl RelevanceRanker {
    pub fn new(similarity: Arc<dyn TextSimilarity>) -> Self {
        Self { similarity }
    }

    pub fn similarity(&self) -> &dyn TextSimilarity {
        self.similarity.as_ref()
    }

    /// Score one candidate.  `query_error` may be raw; it is normalized here.
    pub fn score(&self, query_error: &str, query_context: &FixContext, candidate: &FixRecord) -> f64 {
        self.score_normalized(&normalize(query_error), query_context, candidate)
    }

    fn score_normalized(
        &self,
        normalized_query: &str,
        query_context: &FixContext,
        candidate: &FixRecord,
    ) -> f64 {
        let text = self
            .similarity
            .similarity(normalized_query, &candidate.error_signature);
        let score = WEIGHT_TEXT_SIMILARITY * clamp_unit(text)
            + WEIGHT_SUCCESS_RATE * clamp_unit(candidate.success_rate())
            + WEIGHT_CONTEXT_OVERLAP * context_overlap(query_context, &candidate.context);
        clamp_unit(score)
    }

    /// Score and order an explicit candidate list, dropping anything below
    /// `min_relevance`.
    pub fn rank_candidates(
        &self,
        query_error: &str,
        query_context: &FixContext,
        candidates: Vec<FixRecord>,
        min_relevance: f64,
    ) -> Vec<RankedFix> {
        let normalized = normalize(query_error);
        let mut ranked: Vec<RankedFix> = candidates
            .into_iter()
            .map(|record| RankedFix {
                score: self.score_normalized(&normalized, query_context, &record),
                record,
            })
            .filter(|r| r.score >= min_relevance)
            .collect();
        ranked.sort_by(compare_ranked);
        ranked
    }

    /// Rank every candidate the store considers related to the query.
    pub fn rank(
        &self,
        store: &FixStore,
        error_type: &str,
        query_error: &str,
        query_context: &FixContext,
        min_relevance: f64,
    ) -> FixResult<Vec<RankedFix>> {
        let normalized = normalize(query_error);
        let candidates = store.lookup_candidates(error_type, &normalized, self.similarity())?;
        Ok(self.rank_candidates(query_error, query_context, candidates, min_relevance))
    }
}
