//! Novelty filter: decides whether a freshly applied fix is worth sharing.
//!
//! Decision order:
//!   1. fingerprint already in the ledger     -> reject (duplicate)
//!   2. explicit parent fix                   -> accept (branch)
//!   3. novelty >= 0.7                        -> accept (novel)
//!   4. 0.4 <= novelty < 0.7 and the solution
//!      is a significant variation (> 0.7)    -> accept (variation)
//!   5. otherwise                             -> reject (low novelty)
//!
//! The ledger is written once per decision, at the terminal step, while the
//! ledger lock is held for the whole check-then-record sequence.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::errors::FixResult;
use crate::models::{content_fingerprint, FixContext, RemoteRef, CONTEXT_SCRIPT};
use crate::query::guards::{
    clamp_unit, CONTEXT_OVERLAP_SIMILARITY, NOVELTY_ACCEPT, NOVELTY_VARIANT_FLOOR,
    RECENT_REMOTE_SIMILARITY, VARIATION_ACCEPT, VARIATION_BASE, VARIATION_STEP,
};
use crate::store::fix_store::FixStore;
use crate::store::ledger::{UploadLedger, UploadedEntry};
use crate::text::normalizer::normalize_solution;
use crate::text::similarity::TextSimilarity;

pub const REASON_DUPLICATE: &str = "already uploaded (duplicate)";
pub const REASON_BRANCH: &str = "branch relationship";
pub const REASON_NOVEL: &str = "novel";
pub const REASON_VARIATION: &str = "significant variation";
pub const REASON_LOW_NOVELTY: &str = "duplicate/low novelty";

static VARIATION_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\btry\s*:",
        r"\basync\b",
        r"\bwith\b",
        r"\blambda\b",
        r"(?m)^\s*@[A-Za-z_][\w.]*",
        r"\bclass\b",
        r"\bdef\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UploadDecision {
    pub should_upload: bool,
    pub reason: &'static str,
    pub fingerprint: String,
    pub novelty: f64,
}

impl UploadDecision {
    pub fn is_duplicate(&self) -> bool {
        self.reason == REASON_DUPLICATE
    }
}

pub struct NoveltyFilter {
    store: Arc<FixStore>,
    ledger: Arc<UploadLedger>,
    similarity: Arc<dyn TextSimilarity>,
    recent_window: Duration,
}

impl NoveltyFilter {
    pub fn new(
        store: Arc<FixStore>,
        ledger: Arc<UploadLedger>,
        similarity: Arc<dyn TextSimilarity>,
        recent_window: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            similarity,
            recent_window,
        }
    }

    pub fn fingerprint(error_type: &str, normalized_error: &str, solution: &str) -> String {
        content_fingerprint(error_type, normalized_error, &normalize_solution(solution))
    }

    /// 0.5 plus 0.1 for each structural construct present, capped at 1.0.
    pub fn variation_significance(solution: &str) -> f64 {
        let hits = VARIATION_MARKERS
            .iter()
            .filter(|re| re.is_match(solution))
            .count();
        let raw = VARIATION_BASE + VARIATION_STEP * hits as f64;
        // Keep whole tenths exact so the 0.7 cut-off is not decided by rounding.
        clamp_unit((raw * 10.0).round() / 10.0)
    }

    /// `1 - max_similarity` against what is already known for this error
    /// type.  With no same-type remote references the fix is maximally novel.
    pub fn novelty_score(
        &self,
        same_type_refs: &[RemoteRef],
        context: &FixContext,
        normalized_solution: &str,
        previous_uploads: &[UploadedEntry],
        now: DateTime<Utc>,
    ) -> f64 {
        if same_type_refs.is_empty() {
            return 1.0;
        }
        let window = chrono::Duration::from_std(self.recent_window)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let script = context.get(CONTEXT_SCRIPT);

        let mut max_similarity = 0.0f64;
        for remote in same_type_refs {
            if now.signed_duration_since(remote.timestamp) <= window {
                max_similarity = max_similarity.max(RECENT_REMOTE_SIMILARITY);
            } else if script.is_some() && remote.script.as_ref() == script {
                max_similarity = max_similarity.max(CONTEXT_OVERLAP_SIMILARITY);
            }
        }
        for entry in previous_uploads {
            let sim = self
                .similarity
                .similarity(normalized_solution, &entry.normalized_solution);
            max_similarity = max_similarity.max(clamp_unit(sim));
        }
        clamp_unit(1.0 - max_similarity)
    }

    /// Decide and record the outcome in the ledger.
    pub fn decide(
        &self,
        error_type: &str,
        normalized_error: &str,
        solution: &str,
        inspired_by: Option<&str>,
        context: &FixContext,
    ) -> FixResult<UploadDecision> {
        let normalized_solution = normalize_solution(solution);
        let fingerprint = content_fingerprint(error_type, normalized_error, &normalized_solution);
        // Fetched before taking the ledger lock; the two locks never nest.
        let same_type_refs = self.store.remote_refs(Some(error_type))?;
        let now = Utc::now();

        let decision = self.ledger.exclusive(|txn| {
            let make = |should_upload, reason, novelty| UploadDecision {
                should_upload,
                reason,
                fingerprint: fingerprint.clone(),
                novelty,
            };

            if txn.contains(&fingerprint) {
                txn.reject()?;
                return Ok(make(false, REASON_DUPLICATE, 0.0));
            }

            let previous = txn.uploaded_for(error_type, normalized_error);
            let novelty = self.novelty_score(
                &same_type_refs,
                context,
                &normalized_solution,
                &previous,
                now,
            );
            let entry = UploadedEntry {
                error_type: error_type.to_string(),
                normalized_error: normalized_error.to_string(),
                normalized_solution: normalized_solution.clone(),
                recorded_at: now,
            };

            if inspired_by.is_some() {
                txn.accept(&fingerprint, entry)?;
                return Ok(make(true, REASON_BRANCH, novelty));
            }
            if novelty >= NOVELTY_ACCEPT {
                txn.accept(&fingerprint, entry)?;
                return Ok(make(true, REASON_NOVEL, novelty));
            }
            if novelty >= NOVELTY_VARIANT_FLOOR
                && Self::variation_significance(solution) > VARIATION_ACCEPT
            {
                txn.accept(&fingerprint, entry)?;
                return Ok(make(true, REASON_VARIATION, novelty));
            }
            txn.reject()?;
            Ok(make(false, REASON_LOW_NOVELTY, novelty))
        })?;

        debug!(
            error_type,
            should_upload = decision.should_upload,
            reason = decision.reason,
            novelty = decision.novelty,
            "upload decision"
        );
        Ok(decision)
    }
}
