//! Error type classification.

use regex::Regex;
use std::sync::LazyLock;

pub const UNKNOWN_ERROR_TYPE: &str = "UnknownError";

static ERROR_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b([A-Z][A-Za-z0-9_]*(?:Error|Exception|Warning)|KeyboardInterrupt|SystemExit|StopIteration)\b",
    )
    .unwrap()
});

/// Maps raw error text to a categorical tag such as `NameError`.
pub trait ErrorClassifier: Send + Sync {
    fn classify_error(&self, raw_text: &str) -> String;
}

/// Picks the first exception-shaped identifier in the text.
#[derive(Clone, Copy, Debug, Default)]
pub struct PatternClassifier;

impl ErrorClassifier for PatternClassifier {
    fn classify_error(&self, raw_text: &str) -> String {
        ERROR_TYPE_RE
            .captures(raw_text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| UNKNOWN_ERROR_TYPE.to_string())
    }
}
