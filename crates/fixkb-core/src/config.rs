//! Runtime configuration for the fix knowledge engine.
//!
//! Defaults can be overridden from the environment with [`EngineConfig::from_env`].
//! Scoring weights and novelty thresholds are not configurable; they live in
//! [`crate::query::guards`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{FixError, FixResult};
use crate::query::guards::{DEFAULT_MIN_RELEVANCE, RECENT_REMOTE_WINDOW_SECS};

pub const ENV_DATA_DIR: &str = "FIXKB_DATA_DIR";
pub const ENV_LOCK_TIMEOUT_MS: &str = "FIXKB_LOCK_TIMEOUT_MS";
pub const ENV_MIN_RELEVANCE: &str = "FIXKB_MIN_RELEVANCE";
pub const ENV_RECENT_WINDOW_SECS: &str = "FIXKB_RECENT_WINDOW_SECS";
pub const ENV_SHARING: &str = "FIXKB_SHARING";
pub const ENV_SYNC_ON_APPLY: &str = "FIXKB_SYNC_ON_APPLY";

const DEFAULT_DATA_DIR: &str = "~/.fixkb";
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 3000;

const STORE_FILE: &str = "fixes.db";
const LEDGER_FILE: &str = "upload_ledger.json";
const REMOTE_CACHE_FILE: &str = "remote_refs.jsonl";

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

/// Parse an on/off flag the way the rest of the environment overrides do.
/// Unset or unrecognised values fall back to `default`.
fn flag(value: Option<String>, default: bool) -> bool {
    match value {
        Some(val) => {
            let v = val.trim().to_lowercase();
            if matches!(v.as_str(), "0" | "false" | "no" | "off") {
                false
            } else if matches!(v.as_str(), "1" | "true" | "yes" | "on") {
                true
            } else {
                default
            }
        }
        None => default,
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> FixResult<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| FixError::Config(format!("{name}={raw:?} is not a valid number")))
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Upper bound on every lock wait before a `Busy` error.
    pub lock_timeout: Duration,
    /// Default cut-off used by `search`.
    pub min_relevance: f64,
    /// How recent a same-type remote fix must be to count as "someone else
    /// just hit this".
    pub recent_window: Duration,
    pub sharing_enabled: bool,
    pub sync_on_apply: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: expand_tilde(DEFAULT_DATA_DIR),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            min_relevance: DEFAULT_MIN_RELEVANCE,
            recent_window: Duration::from_secs(RECENT_REMOTE_WINDOW_SECS),
            sharing_enabled: true,
            sync_on_apply: true,
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let raw = data_dir.as_ref().to_string_lossy();
        Self {
            data_dir: expand_tilde(&raw),
            ..Self::default()
        }
    }

    /// Defaults overlaid with any `FIXKB_*` environment variables.
    pub fn from_env() -> FixResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> FixResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            if !dir.trim().is_empty() {
                config.data_dir = expand_tilde(dir.trim());
            }
        }
        if let Some(raw) = lookup(ENV_LOCK_TIMEOUT_MS) {
            let ms: u64 = parse_number(ENV_LOCK_TIMEOUT_MS, &raw)?;
            config.lock_timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(raw) = lookup(ENV_MIN_RELEVANCE) {
            let value: f64 = parse_number(ENV_MIN_RELEVANCE, &raw)?;
            if !(0.0..=1.0).contains(&value) {
                return Err(FixError::Config(format!(
                    "{ENV_MIN_RELEVANCE} must be within [0, 1], got {value}"
                )));
            }
            config.min_relevance = value;
        }
        if let Some(raw) = lookup(ENV_RECENT_WINDOW_SECS) {
            let secs: u64 = parse_number(ENV_RECENT_WINDOW_SECS, &raw)?;
            config.recent_window = Duration::from_secs(secs);
        }
        config.sharing_enabled = flag(lookup(ENV_SHARING), config.sharing_enabled);
        config.sync_on_apply = flag(lookup(ENV_SYNC_ON_APPLY), config.sync_on_apply);
        Ok(config)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE)
    }

    pub fn remote_cache_path(&self) -> PathBuf {
        self.data_dir.join(REMOTE_CACHE_FILE)
    }
}
