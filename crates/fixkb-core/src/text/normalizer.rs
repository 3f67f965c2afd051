//! Error text canonicalization.
//!
//! Volatile parts of an error message (absolute paths, identifiers quoted in
//! well-known error phrases, digit runs) are replaced with fixed placeholders
//! so that the same failure seen in two scripts compares equal.

use regex::Regex;
use std::sync::LazyLock;

use crate::query::guards::{truncate_chars, MAX_SIGNATURE_CHARS};

pub const PATH_PLACEHOLDER: &str = "<PATH>";
pub const VAR_PLACEHOLDER: &str = "'<VAR>'";
pub const NUMBER_PLACEHOLDER: &str = "<N>";

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:[A-Za-z]:)?[/\\][^\s'",:;()\[\]<>]+"#).unwrap()
});

// 'X' is not defined / 'X' has no attribute / 'X' object has no attribute
static QUOTED_SUBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"['"][^'"\n]*['"](\s+(?:is not defined|has no attribute|object has no attribute))"#)
        .unwrap()
});

// ... has no attribute 'Y' / No module named 'Y'
static QUOTED_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"((?:has no attribute|No module named|cannot import name)\s+)['"][^'"\n]*['"]"#)
        .unwrap()
});

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Canonicalize raw error text into a comparable signature.
///
/// Pure and deterministic.  Blank or control-only input yields `""`.
pub fn normalize(raw_error: &str) -> String {
    let cleaned: String = raw_error
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let text = PATH_RE.replace_all(trimmed, PATH_PLACEHOLDER);
    let text = QUOTED_SUBJECT_RE.replace_all(&text, format!("{VAR_PLACEHOLDER}$1"));
    let text = QUOTED_OBJECT_RE.replace_all(&text, format!("${{1}}{VAR_PLACEHOLDER}"));
    let text = DIGITS_RE.replace_all(&text, NUMBER_PLACEHOLDER);
    let text = WHITESPACE_RE.replace_all(&text, " ");

    truncate_chars(text.trim(), MAX_SIGNATURE_CHARS)
        .trim_end()
        .to_string()
}

/// Whitespace-insensitive form of a solution, used for fingerprints.
pub fn normalize_solution(solution: &str) -> String {
    WHITESPACE_RE.replace_all(solution.trim(), " ").into_owned()
}
