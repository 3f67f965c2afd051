//! Shared thresholds, scoring weights and input bounds.

// Normalization / comparison bounds
pub const MAX_SIGNATURE_CHARS: usize = 200;
pub const MAX_COMPARE_CHARS: usize = 2000;

// Relevance ranking
pub const WEIGHT_TEXT_SIMILARITY: f64 = 0.5;
pub const WEIGHT_SUCCESS_RATE: f64 = 0.3;
pub const WEIGHT_CONTEXT_OVERLAP: f64 = 0.2;
pub const DEFAULT_MIN_RELEVANCE: f64 = 0.3;
/// Floor a stored signature must clear to be considered a candidate at all.
pub const CANDIDATE_SIMILARITY_FLOOR: f64 = 0.25;
/// Best local match at or above this becomes the `inspired_by` candidate.
pub const INSPIRATION_THRESHOLD: f64 = 0.3;
pub const MAX_SEARCH_RESULTS: usize = 50;

// Novelty filter
pub const NOVELTY_ACCEPT: f64 = 0.7;
pub const NOVELTY_VARIANT_FLOOR: f64 = 0.4;
pub const VARIATION_ACCEPT: f64 = 0.7;
pub const VARIATION_BASE: f64 = 0.5;
pub const VARIATION_STEP: f64 = 0.1;
pub const RECENT_REMOTE_SIMILARITY: f64 = 0.9;
pub const CONTEXT_OVERLAP_SIMILARITY: f64 = 0.7;
pub const RECENT_REMOTE_WINDOW_SECS: u64 = 3600;

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub fn clamp_limit(value: usize, maximum: usize) -> usize {
    value.max(1).min(maximum)
}

/// Keep at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one() {
        let total = WEIGHT_TEXT_SIMILARITY + WEIGHT_SUCCESS_RATE + WEIGHT_CONTEXT_OVERLAP;
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn clamp_unit_bounds() {
        assert_eq!(clamp_unit(-0.2), 0.0);
        assert_eq!(clamp_unit(1.7), 1.0);
        assert_eq!(clamp_unit(f64::NAN), 0.0);
        assert_eq!(clamp_unit(0.42), 0.42);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn clamp_limit_never_zero() {
        assert_eq!(clamp_limit(0, 10), 1);
        assert_eq!(clamp_limit(99, 10), 10);
    }
}
