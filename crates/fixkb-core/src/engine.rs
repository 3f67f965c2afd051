//! The orchestrator: one entry point per fix-application event.
//!
//! `Received -> Ranked -> Filtered -> [Uploaded | LocalOnly] -> Branched? ->
//! Synced -> Done`.  The fix is captured locally before any network
//! collaborator runs; later failures become warnings on the result and never
//! undo earlier states.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::consensus::novelty::{NoveltyFilter, UploadDecision};
use crate::consensus::sync::{ConsensusSync, SyncReport};
use crate::consensus::transport::{
    CancelToken, EmptyRefSource, FixUploader, NoopUploader, RemoteRefSource, UploadRequest,
};
use crate::errors::FixResult;
use crate::models::{
    ApplyFixRequest, ApplyState, BranchRelationship, EngineStatistics, FixApplicationResult,
    FixRecord, NewFix, Origin, RankedFix, CONTEXT_SCRIPT,
};
use crate::query::guards::{clamp_limit, INSPIRATION_THRESHOLD, MAX_SEARCH_RESULTS};
use crate::query::ranker::RelevanceRanker;
use crate::store::fix_store::FixStore;
use crate::store::ledger::UploadLedger;
use crate::text::classifier::{ErrorClassifier, PatternClassifier};
use crate::text::normalizer::normalize;
use crate::text::similarity::{SequenceRatio, TextSimilarity};

pub const REASON_UPLOAD_DISABLED: &str = "upload disabled";
pub const REASON_SHARING_DISABLED: &str = "sharing disabled";

/// Pluggable pieces of the engine.  Defaults keep everything local.
#[derive(Clone)]
pub struct Collaborators {
    pub uploader: Arc<dyn FixUploader>,
    pub source: Arc<dyn RemoteRefSource>,
    pub classifier: Arc<dyn ErrorClassifier>,
    pub similarity: Arc<dyn TextSimilarity>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            uploader: Arc::new(NoopUploader),
            source: Arc::new(EmptyRefSource),
            classifier: Arc::new(PatternClassifier),
            similarity: Arc::new(SequenceRatio),
        }
    }
}

impl Collaborators {
    /// Use one object for both the upload and the fetch side.
    pub fn with_transport<T>(mut self, transport: Arc<T>) -> Self
    where
        T: FixUploader + RemoteRefSource + 'static,
    {
        self.uploader = transport.clone();
        self.source = transport;
        self
    }
}

/// Run `op`, retrying once if it reports a lock timeout.
fn retry_busy<T>(what: &'static str, mut op: impl FnMut() -> FixResult<T>) -> FixResult<T> {
    match op() {
        Err(e) if e.is_busy() => {
            debug!(operation = what, "lock busy; retrying once");
            op()
        }
        other => other,
    }
}

fn enter(states: &mut Vec<ApplyState>, state: ApplyState, id: &str) {
    debug!(fix_id = %id, ?state, "apply_fix state");
    states.push(state);
}

pub struct FixEngine {
    config: EngineConfig,
    store: Arc<FixStore>,
    ledger: Arc<UploadLedger>,
    ranker: RelevanceRanker,
    novelty: NoveltyFilter,
    sync: ConsensusSync,
    uploader: Arc<dyn FixUploader>,
    classifier: Arc<dyn ErrorClassifier>,
}

impl FixEngine {
    /// Open the installation at `config.data_dir` with local-only
    /// collaborators.
    pub fn open(config: EngineConfig) -> FixResult<Self> {
        Self::with_collaborators(config, Collaborators::default())
    }

    pub fn with_collaborators(config: EngineConfig, collaborators: Collaborators) -> FixResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Arc::new(FixStore::open(&config)?);
        let ledger = Arc::new(UploadLedger::open(config.ledger_path(), config.lock_timeout)?);
        Ok(Self::new(config, store, ledger, collaborators))
    }

    /// Assemble an engine around already-open store and ledger handles.
    pub fn new(
        config: EngineConfig,
        store: Arc<FixStore>,
        ledger: Arc<UploadLedger>,
        collaborators: Collaborators,
    ) -> Self {
        let ranker = RelevanceRanker::new(collaborators.similarity.clone());
        let novelty = NoveltyFilter::new(
            store.clone(),
            ledger.clone(),
            collaborators.similarity,
            config.recent_window,
        );
        let sync = ConsensusSync::new(store.clone(), collaborators.source);
        Self {
            config,
            store,
            ledger,
            ranker,
            novelty,
            sync,
            uploader: collaborators.uploader,
            classifier: collaborators.classifier,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<FixStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<UploadLedger> {
        &self.ledger
    }

    /// Record a fix that was just applied, and share it if it is worth it.
    ///
    /// Errors only when the fix could not be captured locally.
    pub fn apply_fix(&self, request: ApplyFixRequest) -> FixResult<FixApplicationResult> {
        let ApplyFixRequest {
            script_path,
            error,
            solution,
            mut context,
            auto_upload,
            inspired_by: requested_parent,
        } = request;

        let error_type = self.classifier.classify_error(&error);
        let normalized_error = normalize(&error);
        if !script_path.is_empty() {
            context
                .entry(CONTEXT_SCRIPT.to_string())
                .or_insert_with(|| script_path.clone());
        }
        let fix = NewFix {
            error_type: error_type.clone(),
            error_signature: error.clone(),
            solution: solution.clone(),
            context: context.clone(),
            origin: Origin::Local,
        };
        let id = fix.id();

        let mut states = Vec::with_capacity(8);
        let mut warnings = Vec::new();
        enter(&mut states, ApplyState::Received, &id);

        // Ranked
        let ranked = retry_busy("rank", || {
            self.ranker
                .rank(&self.store, &error_type, &error, &context, self.config.min_relevance)
        })
        .unwrap_or_else(|e| {
            warn!(fix_id = %id, error = %e, "ranking failed; continuing without candidates");
            warnings.push(format!("ranking skipped: {e}"));
            Vec::new()
        });
        let ranked: Vec<RankedFix> = ranked.into_iter().filter(|r| r.record.id != id).collect();
        let similar_fixes_found = ranked.len();
        let mut parent: Option<FixRecord> = ranked
            .iter()
            .find(|r| r.record.is_local() && r.score >= INSPIRATION_THRESHOLD)
            .map(|r| r.record.clone());
        if let Some(parent_id) = requested_parent {
            match self.store.get(&parent_id) {
                Ok(Some(record)) if record.id != id => parent = Some(record),
                Ok(Some(_)) => warnings.push("a fix cannot be inspired by itself".to_string()),
                Ok(None) => warnings.push(format!("unknown parent fix {parent_id}; ignored")),
                Err(e) => warnings.push(format!("parent lookup failed: {e}")),
            }
        }
        let inspired_by = parent.as_ref().map(|p| p.id.clone());
        enter(&mut states, ApplyState::Ranked, &id);

        // Filtered
        let decision: Option<UploadDecision> = if !self.config.sharing_enabled || !auto_upload {
            None
        } else {
            match retry_busy("novelty", || {
                self.novelty.decide(
                    &error_type,
                    &normalized_error,
                    &solution,
                    inspired_by.as_deref(),
                    &context,
                )
            }) {
                Ok(decision) => Some(decision),
                Err(e) => {
                    warn!(fix_id = %id, error = %e, "novelty filter failed; keeping fix local");
                    warnings.push(format!("novelty check failed: {e}"));
                    None
                }
            }
        };
        let mut upload_reason = match (&decision, self.config.sharing_enabled) {
            (Some(d), _) => d.reason.to_string(),
            (None, false) => REASON_SHARING_DISABLED.to_string(),
            (None, true) if !auto_upload => REASON_UPLOAD_DISABLED.to_string(),
            (None, true) => "kept local".to_string(),
        };
        enter(&mut states, ApplyState::Filtered, &id);

        // Local capture happens before the upload is attempted.  If it fails,
        // an accept recorded by the filter is undone so a retry can share.
        if let Err(e) = retry_busy("add_fix", || self.store.add_fix(fix.clone())) {
            if let Some(decision) = decision.as_ref().filter(|d| d.should_upload) {
                if let Err(revoke_err) = self.ledger.revoke(&decision.fingerprint) {
                    warn!(fix_id = %id, error = %revoke_err, "could not revoke upload fingerprint");
                }
            }
            return Err(e);
        }

        let mut was_uploaded = false;
        let mut remote_url = None;
        if let Some(decision) = decision.as_ref().filter(|d| d.should_upload) {
            let upload = UploadRequest {
                fix_id: id.clone(),
                error_type: error_type.clone(),
                error: error.clone(),
                solution: solution.clone(),
                context: context.clone(),
                inspired_by: inspired_by.clone(),
            };
            let failure = match self.uploader.upload(&upload) {
                Ok(receipt) if receipt.succeeded => {
                    was_uploaded = true;
                    remote_url = receipt.remote_url;
                    None
                }
                Ok(_) => Some("uploader reported failure".to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                warn!(fix_id = %id, %reason, "upload failed; fix kept local only");
                warnings.push(format!("upload failed: {reason}"));
                upload_reason = format!("upload failed: {reason}");
                if let Err(e) = self.ledger.revoke(&decision.fingerprint) {
                    warn!(fix_id = %id, error = %e, "could not revoke upload fingerprint");
                    warnings.push(format!("ledger revoke failed: {e}"));
                }
            }
        }
        enter(
            &mut states,
            if was_uploaded {
                ApplyState::Uploaded
            } else {
                ApplyState::LocalOnly
            },
            &id,
        );

        // Branched?
        let mut branch_recorded = false;
        if let (Some(parent), true) = (&parent, was_uploaded) {
            let relationship = if parent.error_type == error_type {
                BranchRelationship::VariantOf
            } else {
                BranchRelationship::InspiredBy
            };
            let reason = format!("applied in {script_path}");
            match retry_busy("add_branch", || {
                self.store.add_branch(&parent.id, &id, relationship, &reason)
            }) {
                Ok(_) => branch_recorded = true,
                Err(e) => {
                    warn!(fix_id = %id, parent = %parent.id, error = %e, "fix recorded without lineage");
                    warnings.push(format!("fix recorded without lineage: {e}"));
                }
            }
            enter(&mut states, ApplyState::Branched, &id);
        }

        // Synced
        let mut synced = false;
        if self.config.sync_on_apply {
            match retry_busy("sync", || self.sync.sync(&CancelToken::new())) {
                Ok(_) => {
                    synced = true;
                    enter(&mut states, ApplyState::Synced, &id);
                }
                Err(e) => {
                    warn!(fix_id = %id, error = %e, "sync skipped");
                    warnings.push(format!("sync skipped: {e}"));
                }
            }
        }

        enter(&mut states, ApplyState::Done, &id);
        Ok(FixApplicationResult {
            id,
            error_type,
            was_uploaded,
            upload_reason,
            remote_url,
            inspired_by,
            branch_recorded,
            similar_fixes_found,
            synced,
            states,
            warnings,
        })
    }

    /// Ranked suggestions for `error`.  Never fails: a broken lookup yields
    /// an empty list.
    pub fn search(&self, error: &str, error_type: Option<&str>) -> Vec<RankedFix> {
        self.search_limited(error, error_type, MAX_SEARCH_RESULTS)
    }

    pub fn search_limited(&self, error: &str, error_type: Option<&str>, limit: usize) -> Vec<RankedFix> {
        let error_type = error_type
            .map(str::to_string)
            .unwrap_or_else(|| self.classifier.classify_error(error));
        let result = retry_busy("search", || {
            self.ranker.rank(
                &self.store,
                &error_type,
                error,
                &Default::default(),
                self.config.min_relevance,
            )
        });
        match result {
            Ok(mut ranked) => {
                ranked.truncate(clamp_limit(limit, MAX_SEARCH_RESULTS));
                ranked
            }
            Err(e) => {
                warn!(error = %e, "search failed; returning no results");
                Vec::new()
            }
        }
    }

    /// Top suggestion, if any clears the relevance cut-off.
    pub fn best_fix(&self, error: &str, error_type: Option<&str>) -> Option<RankedFix> {
        self.search_limited(error, error_type, 1).into_iter().next()
    }

    pub fn statistics(&self) -> FixResult<EngineStatistics> {
        let counts = self.ledger.counts()?;
        Ok(EngineStatistics {
            local_fix_count: self.store.local_count()?,
            error_type_count: self.store.error_type_count()?,
            branch_count: self.store.branch_count()?,
            remote_fix_count: self.store.remote_count()?,
            novel_uploads: counts.novel_count,
            rejected_duplicates: counts.rejected_count,
            rejection_rate: counts.rejection_rate(),
        })
    }

    pub fn record_usage(&self, id: &str, success: bool) -> FixResult<FixRecord> {
        retry_busy("record_usage", || self.store.record_usage(id, success))
    }

    pub fn variations_of(&self, id: &str) -> FixResult<Vec<FixRecord>> {
        self.store.variations_of(id)
    }

    pub fn get_fix(&self, id: &str) -> FixResult<Option<FixRecord>> {
        self.store.get(id)
    }

    pub fn sync_now(&self, cancel: &CancelToken) -> FixResult<SyncReport> {
        retry_busy("sync", || self.sync.sync(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::shared_dir::SharedDirTransport;
    use crate::consensus::transport::UploadReceipt;
    use crate::errors::FixError;
    use crate::models::{FixContext, RemoteRef};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::time::Duration;

    /// Uploader double that records every request.
    #[derive(Default)]
    struct Recording {
        requests: Mutex<Vec<UploadRequest>>,
        fail: bool,
    }

    impl FixUploader for Recording {
        fn upload(&self, request: &UploadRequest) -> FixResult<UploadReceipt> {
            self.requests.lock().push(request.clone());
            if self.fail {
                return Err(FixError::Transport("remote unavailable".into()));
            }
            Ok(UploadReceipt::shared(format!("mem://{}", request.fix_id)))
        }
    }

    /// Uploader double that empties the remote cache as it uploads.
    #[derive(Default)]
    struct Evicting {
        store: Mutex<Option<Arc<FixStore>>>,
    }

    impl FixUploader for Evicting {
        fn upload(&self, request: &UploadRequest) -> FixResult<UploadReceipt> {
            if let Some(store) = self.store.lock().as_ref() {
                store.replace_remote(Vec::new())?;
            }
            Ok(UploadReceipt::shared(format!("mem://{}", request.fix_id)))
        }
    }

    struct Offline;

    impl RemoteRefSource for Offline {
        fn fetch_remote_refs(&self, _cancel: &CancelToken) -> FixResult<Vec<RemoteRef>> {
            Err(FixError::Transport("consensus unreachable".into()))
        }
    }

    fn config(dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::with_data_dir(dir);
        config.lock_timeout = Duration::from_millis(500);
        config
    }

    fn short_timeout_engine(dir: &Path, uploader: Arc<dyn FixUploader>) -> FixEngine {
        let mut config = config(dir);
        config.lock_timeout = Duration::from_millis(50);
        FixEngine::with_collaborators(
            config,
            Collaborators {
                uploader,
                ..Collaborators::default()
            },
        )
        .unwrap()
    }

    fn engine_with(dir: &Path, uploader: Arc<dyn FixUploader>) -> FixEngine {
        let collaborators = Collaborators {
            uploader,
            ..Collaborators::default()
        };
        FixEngine::with_collaborators(config(dir), collaborators).unwrap()
    }

    fn json_request(solution: &str) -> ApplyFixRequest {
        ApplyFixRequest::new(
            "scripts/report.py",
            "NameError: name 'json' is not defined",
            solution,
        )
    }

    #[test]
    fn captured_fix_is_found_by_search() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FixEngine::open(config(dir.path())).unwrap();
        let result = engine.apply_fix(json_request("import json")).unwrap();
        assert_eq!(result.error_type, "NameError");

        let hits = engine.search("NameError: name 'json' is not defined", Some("NameError"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, result.id);
        assert!(hits[0].score >= 0.3);
        assert_eq!(
            engine
                .best_fix("NameError: name 'json' is not defined", None)
                .map(|r| r.record.id),
            Some(result.id)
        );
    }

    #[test]
    fn second_identical_submission_is_a_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(Recording::default());
        let engine = engine_with(dir.path(), uploader.clone());

        let first = engine.apply_fix(json_request("import json")).unwrap();
        let second = engine.apply_fix(json_request("import json")).unwrap();
        assert!(first.was_uploaded);
        assert_eq!(first.remote_url.as_deref(), Some(format!("mem://{}", first.id).as_str()));
        assert!(!second.was_uploaded);
        assert!(second.upload_reason.contains("duplicate"));
        assert_eq!(first.id, second.id);
        assert_eq!(uploader.requests.lock().len(), 1);

        let stats = engine.statistics().unwrap();
        assert_eq!(stats.local_fix_count, 1);
        assert_eq!(stats.novel_uploads, 1);
        assert_eq!(stats.rejected_duplicates, 1);
        assert!((stats.rejection_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn explicit_parent_records_a_branch_across_error_types() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(dir.path(), Arc::new(Recording::default()));
        let parent = engine.apply_fix(json_request("import json")).unwrap();

        let child = engine
            .apply_fix(
                ApplyFixRequest::new(
                    "scripts/loader.py",
                    "TypeError: the JSON object must be str, bytes or bytearray, not dict",
                    "json.loads(json.dumps(payload))",
                )
                .inspired_by(parent.id.clone()),
            )
            .unwrap();
        assert_eq!(child.error_type, "TypeError");
        assert_eq!(child.inspired_by.as_deref(), Some(parent.id.as_str()));
        assert!(child.was_uploaded);
        assert_eq!(child.upload_reason, "branch relationship");
        assert!(child.branch_recorded);
        assert!(child.states.contains(&ApplyState::Branched));

        let variations = engine.variations_of(&parent.id).unwrap();
        assert_eq!(variations.len(), 1);
        assert_eq!(variations[0].id, child.id);
        let edges = engine.store().branches_from(&parent.id).unwrap();
        assert_eq!(edges[0].relationship, BranchRelationship::InspiredBy);
        assert_eq!(engine.statistics().unwrap().branch_count, 1);
    }

    #[test]
    fn similar_local_fix_becomes_the_parent() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(dir.path(), Arc::new(Recording::default()));
        let first = engine.apply_fix(json_request("import json")).unwrap();
        let second = engine
            .apply_fix(json_request("import simplejson as json"))
            .unwrap();
        assert_eq!(second.similar_fixes_found, 1);
        assert_eq!(second.inspired_by.as_deref(), Some(first.id.as_str()));
        assert!(second.branch_recorded);
        let edges = engine.store().branches_from(&first.id).unwrap();
        assert_eq!(edges[0].relationship, BranchRelationship::VariantOf);
    }

    #[test]
    fn failed_upload_keeps_fix_and_frees_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let engine = engine_with(dir.path(), uploader.clone());
        let result = engine.apply_fix(json_request("import json")).unwrap();

        assert!(!result.was_uploaded);
        assert!(result.upload_reason.starts_with("upload failed"));
        assert!(!result.warnings.is_empty());
        assert!(result.states.contains(&ApplyState::LocalOnly));
        assert!(engine.get_fix(&result.id).unwrap().is_some());
        assert_eq!(engine.ledger().counts().unwrap().uploaded, 0);

        // A retry is allowed to share it again.
        let retry = engine.apply_fix(json_request("import json")).unwrap();
        assert!(!retry.upload_reason.contains("duplicate"));
        assert_eq!(uploader.requests.lock().len(), 2);
    }

    #[test]
    fn failed_capture_releases_the_upload_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(Recording::default());
        let engine = short_timeout_engine(dir.path(), uploader.clone());
        {
            let _held = engine.store().write_gate().unwrap();
            let err = engine.apply_fix(json_request("import json")).unwrap_err();
            assert!(err.is_busy());
        }
        assert_eq!(engine.ledger().counts().unwrap(), Default::default());
        assert!(uploader.requests.lock().is_empty());

        let retry = engine.apply_fix(json_request("import json")).unwrap();
        assert!(retry.was_uploaded);
        assert_eq!(retry.upload_reason, "novel");
        assert_eq!(engine.ledger().counts().unwrap().novel_count, 1);
    }

    #[test]
    fn unreachable_consensus_only_skips_sync() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FixEngine::with_collaborators(
            config(dir.path()),
            Collaborators {
                source: Arc::new(Offline),
                ..Collaborators::default()
            },
        )
        .unwrap();
        let result = engine.apply_fix(json_request("import json")).unwrap();
        assert!(!result.synced);
        assert!(!result.states.contains(&ApplyState::Synced));
        assert_eq!(result.states.last(), Some(&ApplyState::Done));
        assert!(result.warnings.iter().any(|w| w.starts_with("sync skipped")));
        assert!(engine.get_fix(&result.id).unwrap().is_some());
        assert!(engine.sync_now(&CancelToken::new()).is_err());
    }

    #[test]
    fn vanished_parent_leaves_fix_without_lineage() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(Evicting::default());
        let engine = engine_with(dir.path(), uploader.clone());
        *uploader.store.lock() = Some(engine.store().clone());
        engine
            .store()
            .replace_remote(vec![RemoteRef {
                id: Some("remote-parent".into()),
                error_type: "NameError".into(),
                error_signature: Some("NameError: name 'yaml' is not defined".into()),
                script: None,
                timestamp: Utc::now() - chrono::Duration::days(2),
                url: None,
                solution: None,
                usage_count: 0,
                success_count: 0,
            }])
            .unwrap();

        let result = engine
            .apply_fix(json_request("import json").inspired_by("remote-parent"))
            .unwrap();
        assert_eq!(result.inspired_by.as_deref(), Some("remote-parent"));
        assert!(result.was_uploaded);
        assert!(!result.branch_recorded);
        assert!(result.states.contains(&ApplyState::Branched));
        assert!(result
            .warnings
            .iter()
            .any(|w| w.starts_with("fix recorded without lineage")));
        assert_eq!(engine.statistics().unwrap().branch_count, 0);
    }

    #[test]
    fn busy_ledger_keeps_fix_local() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(Recording::default());
        let engine = short_timeout_engine(dir.path(), uploader.clone());
        engine
            .ledger()
            .exclusive(|_| {
                let result = std::thread::scope(|scope| {
                    scope
                        .spawn(|| engine.apply_fix(json_request("import json")))
                        .join()
                        .unwrap()
                })
                .unwrap();
                assert!(!result.was_uploaded);
                assert!(result
                    .warnings
                    .iter()
                    .any(|w| w.starts_with("novelty check failed")));
                assert!(engine.get_fix(&result.id).unwrap().is_some());
                Ok(())
            })
            .unwrap();
        assert!(uploader.requests.lock().is_empty());
        assert_eq!(engine.ledger().counts().unwrap(), Default::default());
    }

    #[test]
    fn sharing_disabled_keeps_everything_local() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(Recording::default());
        let mut config = config(dir.path());
        config.sharing_enabled = false;
        let engine = FixEngine::with_collaborators(
            config,
            Collaborators {
                uploader: uploader.clone(),
                ..Collaborators::default()
            },
        )
        .unwrap();

        let result = engine.apply_fix(json_request("import json")).unwrap();
        assert!(!result.was_uploaded);
        assert_eq!(result.upload_reason, REASON_SHARING_DISABLED);
        assert!(uploader.requests.lock().is_empty());
        assert_eq!(engine.ledger().counts().unwrap(), Default::default());
        assert_eq!(engine.statistics().unwrap().local_fix_count, 1);
    }

    #[test]
    fn auto_upload_off_skips_the_filter() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = Arc::new(Recording::default());
        let engine = engine_with(dir.path(), uploader.clone());
        let result = engine
            .apply_fix(json_request("import json").auto_upload(false))
            .unwrap();
        assert_eq!(result.upload_reason, REASON_UPLOAD_DISABLED);
        assert!(uploader.requests.lock().is_empty());
        assert_eq!(
            result.states,
            vec![
                ApplyState::Received,
                ApplyState::Ranked,
                ApplyState::Filtered,
                ApplyState::LocalOnly,
                ApplyState::Synced,
                ApplyState::Done,
            ]
        );
    }

    #[test]
    fn shared_directory_round_trip_between_installations() {
        let shared = tempfile::tempdir().unwrap();
        let alice_dir = tempfile::tempdir().unwrap();
        let bob_dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(SharedDirTransport::new(shared.path()));
        let open = |dir: &Path| {
            FixEngine::with_collaborators(
                config(dir),
                Collaborators::default().with_transport(transport.clone()),
            )
            .unwrap()
        };
        let alice = open(alice_dir.path());
        let bob = open(bob_dir.path());

        let shared_fix = alice.apply_fix(json_request("import json")).unwrap();
        assert!(shared_fix.was_uploaded);

        let report = bob.sync_now(&CancelToken::new()).unwrap();
        assert_eq!(report.fetched, 1);
        let hits = bob.search("NameError: name 'json' is not defined", None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, shared_fix.id);
        assert!(!hits[0].record.is_local());
        assert!(matches!(
            bob.record_usage(&shared_fix.id, true).unwrap_err(),
            FixError::ReadOnly(_)
        ));

        // Bob just saw Alice's fix, so his own plain take on it is not shared.
        let mut context = FixContext::new();
        context.insert("function".into(), "main".into());
        let bobs = bob
            .apply_fix(json_request("import json as j").with_context(context))
            .unwrap();
        assert!(!bobs.was_uploaded);
        assert_eq!(bobs.upload_reason, "duplicate/low novelty");
    }

    #[test]
    fn search_on_empty_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FixEngine::open(config(dir.path())).unwrap();
        assert!(engine.search("anything at all", None).is_empty());
        assert!(engine.best_fix("anything at all", None).is_none());
        assert_eq!(engine.statistics().unwrap(), EngineStatistics::default());
    }

    #[test]
    fn usage_feedback_updates_success_rate() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FixEngine::open(config(dir.path())).unwrap();
        let result = engine.apply_fix(json_request("import json")).unwrap();
        engine.record_usage(&result.id, true).unwrap();
        let record = engine.record_usage(&result.id, false).unwrap();
        assert_eq!((record.usage_count, record.success_count), (2, 1));
        assert!(matches!(
            engine.record_usage("missing", true).unwrap_err(),
            FixError::NotFound(_)
        ));
    }

    #[test]
    fn busy_is_retried_exactly_once() {
        let mut calls = 0;
        let result = retry_busy("test", || {
            calls += 1;
            if calls == 1 {
                Err(FixError::Busy("test"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);

        let mut calls = 0;
        let result: FixResult<()> = retry_busy("test", || {
            calls += 1;
            Err(FixError::Busy("test"))
        });
        assert!(result.unwrap_err().is_busy());
        assert_eq!(calls, 2);
    }
}
