//! Consensus sync: refresh the cached remote reference set.
//!
//! One-shot and cancellable.  The cache is replaced only after the full
//! remote set has been fetched, so a cancelled or failed sync leaves the
//! previous cache untouched.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use crate::errors::FixResult;
use crate::models::RemoteRef;
use crate::store::fix_store::FixStore;

use super::transport::{CancelToken, RemoteRefSource};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub fetched: usize,
    pub previous: usize,
    /// Refs whose id was not in the previous cache.
    pub added: usize,
    pub elapsed_ms: u64,
}

pub struct ConsensusSync {
    store: Arc<FixStore>,
    source: Arc<dyn RemoteRefSource>,
}

impl ConsensusSync {
    pub fn new(store: Arc<FixStore>, source: Arc<dyn RemoteRefSource>) -> Self {
        Self { store, source }
    }

    pub fn sync(&self, cancel: &CancelToken) -> FixResult<SyncReport> {
        let started = Instant::now();
        cancel.check("sync")?;
        let fetched = self.source.fetch_remote_refs(cancel)?;
        cancel.check("sync")?;

        let refs = dedup_by_id(fetched);
        let previous = self.store.remote_refs(None)?;
        let added = refs
            .iter()
            .filter(|r| {
                let id = r.record_id();
                !previous.iter().any(|p| p.record_id() == id)
            })
            .count();

        let fetched = self.store.replace_remote(refs)?;
        let report = SyncReport {
            fetched,
            previous: previous.len(),
            added,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            fetched = report.fetched,
            added = report.added,
            previous = report.previous,
            elapsed_ms = report.elapsed_ms,
            "remote references synced"
        );
        Ok(report)
    }
}

/// Keep the first occurrence of each record id.  Metadata-only refs never
/// carry solution text into the cache.
fn dedup_by_id(refs: Vec<RemoteRef>) -> Vec<RemoteRef> {
    let mut seen = std::collections::HashSet::new();
    refs.into_iter()
        .filter(|r| seen.insert(r.record_id()))
        .map(|mut r| {
            r.solution = None;
            r
        })
        .collect()
}
