//! Pluggable text similarity.
//!
//! The ranker, the fix store's candidate lookup and the novelty filter all go
//! through [`TextSimilarity`], so swapping the strategy changes all three at
//! once.

use std::collections::HashSet;

use crate::query::guards::{truncate_chars, MAX_COMPARE_CHARS};

/// A symmetric similarity measure in `[0, 1]`; 1 means identical.
pub trait TextSimilarity: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> f64;

    fn name(&self) -> &'static str;
}

/// Ratcliff/Obershelp "gestalt" ratio: `2 * matched / (len(a) + len(b))`,
/// where `matched` is found by repeatedly taking the longest common block and
/// recursing on both sides of it.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequenceRatio;

impl TextSimilarity for SequenceRatio {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let a: Vec<char> = truncate_chars(a, MAX_COMPARE_CHARS).chars().collect();
        let b: Vec<char> = truncate_chars(b, MAX_COMPARE_CHARS).chars().collect();
        let total = a.len() + b.len();
        if total == 0 {
            return 1.0;
        }
        (2 * matching_chars(&a, &b)) as f64 / total as f64
    }

    fn name(&self) -> &'static str {
        "sequence_ratio"
    }
}

/// Longest common block, as `(start_a, start_b, len)`.  Ties resolve to the
/// earliest block in `a`.
fn longest_common_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            if a[i - 1] == b[j - 1] {
                cur[j] = prev[j - 1] + 1;
                if cur[j] > best.2 {
                    best = (i - cur[j], j - cur[j], cur[j]);
                }
            } else {
                cur[j] = 0;
            }
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    best
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let mut matched = 0;
    let mut pending = vec![(0usize, a.len(), 0usize, b.len())];
    while let Some((a_lo, a_hi, b_lo, b_hi)) = pending.pop() {
        if a_lo >= a_hi || b_lo >= b_hi {
            continue;
        }
        let (i, j, len) = longest_common_block(&a[a_lo..a_hi], &b[b_lo..b_hi]);
        if len == 0 {
            continue;
        }
        matched += len;
        let (i, j) = (a_lo + i, b_lo + j);
        pending.push((a_lo, i, b_lo, j));
        pending.push((i + len, a_hi, j + len, b_hi));
    }
    matched
}

/// Jaccard index over character trigrams.  Cheaper than [`SequenceRatio`] on
/// long solution bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrigramJaccard;

fn trigrams(value: &str) -> HashSet<[char; 3]> {
    let padded: Vec<char> = format!("  {}  ", truncate_chars(value, MAX_COMPARE_CHARS).to_lowercase())
        .chars()
        .collect();
    padded.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

impl TextSimilarity for TrigramJaccard {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        let left = trigrams(a);
        let right = trigrams(b);
        let union = left.union(&right).count();
        if union == 0 {
            return 1.0;
        }
        left.intersection(&right).count() as f64 / union as f64
    }

    fn name(&self) -> &'static str {
        "trigram_jaccard"
    }
}
