//! Shared typed models used across the store, ranking and consensus layers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::text::normalizer::normalize;

/// Free-form advisory metadata attached to a fix (script path, line, function).
pub type FixContext = IndexMap<String, String>;

pub const CONTEXT_SCRIPT: &str = "script";
pub const CONTEXT_REMOTE_URL: &str = "remote_url";

const FIELD_SEPARATOR: &[u8] = b"\x1f";

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(FIELD_SEPARATOR);
        }
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Stable record id: first 16 hex chars of SHA-256 over the error type, the
/// normalized signature and the solution text.
pub fn compute_fix_id(error_type: &str, error_signature: &str, solution: &str) -> String {
    let digest = sha256_hex(&[error_type, &normalize(error_signature), solution]);
    digest[..16].to_string()
}

/// Full SHA-256 hex digest over already-normalized parts.  Used for the
/// upload ledger.
pub fn content_fingerprint(error_type: &str, normalized_error: &str, normalized_solution: &str) -> String {
    sha256_hex(&[error_type, normalized_error, normalized_solution])
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Origin::Local),
            "remote" => Ok(Origin::Remote),
            other => Err(format!("unknown origin {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// FixRecord
// ---------------------------------------------------------------------------

/// One stored error -> solution mapping with provenance and usage stats.
///
/// Only the usage counters ever change after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixRecord {
    pub id: String,
    pub error_type: String,
    pub error_signature: String,
    pub solution: String,
    pub context: FixContext,
    pub origin: Origin,
    pub usage_count: u64,
    pub success_count: u64,
    pub created_at: DateTime<Utc>,
}

impl FixRecord {
    pub fn success_rate(&self) -> f64 {
        self.success_count as f64 / self.usage_count.max(1) as f64
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }
}

/// Input for [`crate::store::fix_store::FixStore::add_fix`].
#[derive(Clone, Debug)]
pub struct NewFix {
    pub error_type: String,
    /// Raw or already-normalized error text; normalized on insert.
    pub error_signature: String,
    pub solution: String,
    pub context: FixContext,
    pub origin: Origin,
}

impl NewFix {
    pub fn local(
        error_type: impl Into<String>,
        error_signature: impl Into<String>,
        solution: impl Into<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            error_signature: error_signature.into(),
            solution: solution.into(),
            context: FixContext::new(),
            origin: Origin::Local,
        }
    }

    pub fn with_context(mut self, context: FixContext) -> Self {
        self.context = context;
        self
    }

    pub fn id(&self) -> String {
        compute_fix_id(&self.error_type, &self.error_signature, &self.solution)
    }
}

// ---------------------------------------------------------------------------
// Branches
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchRelationship {
    InspiredBy,
    VariantOf,
}

impl BranchRelationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchRelationship::InspiredBy => "inspired_by",
            BranchRelationship::VariantOf => "variant_of",
        }
    }
}

impl fmt::Display for BranchRelationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BranchRelationship {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inspired_by" | "inspired-by" => Ok(BranchRelationship::InspiredBy),
            "variant_of" | "variant-of" => Ok(BranchRelationship::VariantOf),
            other => Err(format!("unknown branch relationship {other:?}")),
        }
    }
}

/// Directed edge: `child_id` was derived from `parent_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BranchEdge {
    pub parent_id: String,
    pub child_id: String,
    pub relationship: BranchRelationship,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Remote references
// ---------------------------------------------------------------------------

/// Metadata about a fix known to exist in the shared store.
///
/// `solution` is normally absent: remote solution text is not held locally
/// until selected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRef {
    #[serde(default)]
    pub id: Option<String>,
    pub error_type: String,
    #[serde(default)]
    pub error_signature: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub solution: Option<String>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub success_count: u64,
}

impl RemoteRef {
    pub fn record_id(&self) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => compute_fix_id(
                &self.error_type,
                self.error_signature.as_deref().unwrap_or(""),
                self.url.as_deref().unwrap_or(""),
            ),
        }
    }

    /// Read-only view of this reference as a ranking candidate.
    pub fn to_record(&self) -> FixRecord {
        let mut context = FixContext::new();
        if let Some(script) = &self.script {
            context.insert(CONTEXT_SCRIPT.to_string(), script.clone());
        }
        if let Some(url) = &self.url {
            context.insert(CONTEXT_REMOTE_URL.to_string(), url.clone());
        }
        FixRecord {
            id: self.record_id(),
            error_type: self.error_type.clone(),
            error_signature: normalize(self.error_signature.as_deref().unwrap_or("")),
            solution: self.solution.clone().unwrap_or_default(),
            context,
            origin: Origin::Remote,
            usage_count: self.usage_count,
            success_count: self.success_count.min(self.usage_count),
            created_at: self.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Query / orchestration results
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RankedFix {
    pub record: FixRecord,
    pub score: f64,
}

/// Per-event states of [`crate::engine::FixEngine::apply_fix`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyState {
    Received,
    Ranked,
    Filtered,
    Uploaded,
    LocalOnly,
    Branched,
    Synced,
    Done,
}

#[derive(Clone, Debug)]
pub struct ApplyFixRequest {
    pub script_path: String,
    pub error: String,
    pub solution: String,
    pub context: FixContext,
    pub auto_upload: bool,
    /// Explicit parent fix.  Overrides the ranked candidate when it names a
    /// known record.
    pub inspired_by: Option<String>,
}

impl ApplyFixRequest {
    pub fn new(
        script_path: impl Into<String>,
        error: impl Into<String>,
        solution: impl Into<String>,
    ) -> Self {
        Self {
            script_path: script_path.into(),
            error: error.into(),
            solution: solution.into(),
            context: FixContext::new(),
            auto_upload: true,
            inspired_by: None,
        }
    }

    pub fn with_context(mut self, context: FixContext) -> Self {
        self.context = context;
        self
    }

    pub fn auto_upload(mut self, enabled: bool) -> Self {
        self.auto_upload = enabled;
        self
    }

    pub fn inspired_by(mut self, parent_id: impl Into<String>) -> Self {
        self.inspired_by = Some(parent_id.into());
        self
    }
}

/// Summary of one fix-application event.  Collaborator failures show up in
/// `warnings` rather than as an error.
#[derive(Clone, Debug, Serialize)]
pub struct FixApplicationResult {
    pub id: String,
    pub error_type: String,
    pub was_uploaded: bool,
    pub upload_reason: String,
    pub remote_url: Option<String>,
    pub inspired_by: Option<String>,
    pub branch_recorded: bool,
    pub similar_fixes_found: usize,
    pub synced: bool,
    pub states: Vec<ApplyState>,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EngineStatistics {
    pub local_fix_count: usize,
    pub error_type_count: usize,
    pub branch_count: usize,
    pub remote_fix_count: usize,
    pub novel_uploads: u64,
    pub rejected_duplicates: u64,
    pub rejection_rate: f64,
}
