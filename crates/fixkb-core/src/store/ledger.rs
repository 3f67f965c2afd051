//! Upload ledger: which fix fingerprints have already been shared.
//!
//! Constructed once per installation and passed by handle to whoever needs
//! it.  Several handles (in one process or many) may point at the same file:
//! every operation reads the file afresh, and every mutation runs under an
//! advisory lock on `<ledger>.lock` and is persisted (atomic replace) before
//! it returns.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use indexmap::IndexMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::errors::{FixError, FixResult};
use crate::store::atomic::{quarantine, write_atomic};

const LOCK_POLL: Duration = Duration::from_millis(5);

/// What was shared for one fingerprint.  Kept so later fixes for the same
/// error can be compared against previously uploaded solutions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadedEntry {
    pub error_type: String,
    pub normalized_error: String,
    pub normalized_solution: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct LedgerState {
    #[serde(default)]
    uploaded: IndexMap<String, UploadedEntry>,
    #[serde(default)]
    novel_count: u64,
    #[serde(default)]
    rejected_count: u64,
}

impl LedgerState {
    fn uploaded_for(&self, error_type: &str, normalized_error: &str) -> Vec<UploadedEntry> {
        self.uploaded
            .values()
            .filter(|e| e.error_type == error_type && e.normalized_error == normalized_error)
            .cloned()
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub uploaded: usize,
    pub novel_count: u64,
    pub rejected_count: u64,
}

impl LedgerCounts {
    pub fn rejection_rate(&self) -> f64 {
        let total = self.novel_count + self.rejected_count;
        if total == 0 {
            0.0
        } else {
            self.rejected_count as f64 / total as f64
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

pub struct UploadLedger {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    gate: RwLock<()>,
    recovered: AtomicBool,
}

impl UploadLedger {
    /// Open the ledger at `path`, starting empty if it does not exist.  An
    /// unparseable file is moved aside and replaced with an empty ledger.
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> FixResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let ledger = Self {
            lock_path: lock_path_for(&path),
            path,
            lock_timeout,
            gate: RwLock::new(()),
            recovered: AtomicBool::new(false),
        };
        // Validates the file (quarantining it if needed) under the lock.
        ledger.exclusive(|_| Ok(()))?;
        Ok(ledger)
    }

    pub fn recovered_from_corruption(&self) -> bool {
        self.recovered.load(Ordering::Relaxed)
    }

    fn read_gate(&self) -> FixResult<RwLockReadGuard<'_, ()>> {
        self.gate
            .try_read_for(self.lock_timeout)
            .ok_or(FixError::Busy("upload ledger"))
    }

    fn write_gate(&self) -> FixResult<RwLockWriteGuard<'_, ()>> {
        self.gate
            .try_write_for(self.lock_timeout)
            .ok_or(FixError::Busy("upload ledger"))
    }

    /// Take the cross-process lock, polling until `lock_timeout` runs out.
    /// Released when the returned file is dropped.
    fn lock_file(&self) -> FixResult<File> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(file),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(FixError::Busy("upload ledger"));
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn parse(&self, content: &str) -> Result<LedgerState, FixError> {
        serde_json::from_str(content).map_err(|e| FixError::CorruptStore {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Current on-disk state.  Writers replace the file atomically, so this
    /// needs no file lock.
    fn snapshot(&self) -> FixResult<LedgerState> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => self.parse(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LedgerState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Like [`Self::snapshot`], but an unparseable file is quarantined and
    /// treated as empty.  Only called with the file lock held.
    fn load_locked(&self) -> FixResult<LedgerState> {
        match self.snapshot() {
            Err(err @ FixError::CorruptStore { .. }) => {
                quarantine(&self.path, &err.to_string())?;
                self.recovered.store(true, Ordering::Relaxed);
                Ok(LedgerState::default())
            }
            other => other,
        }
    }

    fn read<T>(&self, f: impl FnOnce(&LedgerState) -> T) -> FixResult<T> {
        let _guard = self.read_gate()?;
        Ok(f(&self.snapshot()?))
    }

    fn persist(&self, next: &LedgerState) -> FixResult<()> {
        let bytes = serde_json::to_vec_pretty(next)?;
        write_atomic(&self.path, &bytes)
    }

    pub fn contains(&self, fingerprint: &str) -> FixResult<bool> {
        self.read(|s| s.uploaded.contains_key(fingerprint))
    }

    pub fn counts(&self) -> FixResult<LedgerCounts> {
        self.read(|s| LedgerCounts {
            uploaded: s.uploaded.len(),
            novel_count: s.novel_count,
            rejected_count: s.rejected_count,
        })
    }

    /// Previously uploaded entries for `error_type` whose normalized error
    /// equals `normalized_error`.
    pub fn uploaded_for(&self, error_type: &str, normalized_error: &str) -> FixResult<Vec<UploadedEntry>> {
        self.read(|s| s.uploaded_for(error_type, normalized_error))
    }

    /// Record an accepted upload.  Returns `false` (and changes nothing) if
    /// the fingerprint was already present.
    pub fn record_accept(&self, fingerprint: &str, entry: UploadedEntry) -> FixResult<bool> {
        self.exclusive(|txn| {
            if txn.contains(fingerprint) {
                return Ok(false);
            }
            txn.accept(fingerprint, entry)?;
            Ok(true)
        })
    }

    pub fn record_reject(&self) -> FixResult<()> {
        self.exclusive(|txn| txn.reject())
    }

    /// Undo an accept whose fix never reached the shared store.
    pub fn revoke(&self, fingerprint: &str) -> FixResult<bool> {
        self.exclusive(|txn| txn.revoke(fingerprint))
    }

    /// Run `f` against the freshly loaded ledger with both the in-process
    /// gate and the file lock held, so one check-then-record sequence cannot
    /// interleave with another from any handle.
    pub(crate) fn exclusive<T>(
        &self,
        f: impl FnOnce(&mut LedgerTxn<'_>) -> FixResult<T>,
    ) -> FixResult<T> {
        let _guard = self.write_gate()?;
        let _lock = self.lock_file()?;
        let state = self.load_locked()?;
        let mut txn = LedgerTxn {
            ledger: self,
            state,
        };
        f(&mut txn)
    }
}

/// Locked view of the ledger handed out by [`UploadLedger::exclusive`].
pub(crate) struct LedgerTxn<'a> {
    ledger: &'a UploadLedger,
    state: LedgerState,
}

impl LedgerTxn<'_> {
    fn commit(&mut self, next: LedgerState) -> FixResult<()> {
        self.ledger.persist(&next)?;
        self.state = next;
        Ok(())
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.state.uploaded.contains_key(fingerprint)
    }

    pub fn uploaded_for(&self, error_type: &str, normalized_error: &str) -> Vec<UploadedEntry> {
        self.state.uploaded_for(error_type, normalized_error)
    }

    pub fn accept(&mut self, fingerprint: &str, entry: UploadedEntry) -> FixResult<()> {
        let mut next = self.state.clone();
        next.uploaded.insert(fingerprint.to_string(), entry);
        next.novel_count += 1;
        self.commit(next)
    }

    pub fn reject(&mut self) -> FixResult<()> {
        let mut next = self.state.clone();
        next.rejected_count += 1;
        self.commit(next)
    }

    pub fn revoke(&mut self, fingerprint: &str) -> FixResult<bool> {
        if !self.contains(fingerprint) {
            return Ok(false);
        }
        let mut next = self.state.clone();
        next.uploaded.shift_remove(fingerprint);
        next.novel_count = next.novel_count.saturating_sub(1);
        self.commit(next)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(solution: &str) -> UploadedEntry {
        UploadedEntry {
            error_type: "NameError".into(),
            normalized_error: "NameError: name '<VAR>' is not defined".into(),
            normalized_solution: solution.into(),
            recorded_at: Utc::now(),
        }
    }

    fn open(dir: &Path) -> UploadLedger {
        UploadLedger::open(dir.join("upload_ledger.json"), Duration::from_millis(200)).unwrap()
    }

    #[test]
    fn fingerprint_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(dir.path());
        assert!(ledger.record_accept("fp1", entry("import json")).unwrap());
        assert!(!ledger.record_accept("fp1", entry("import json")).unwrap());
        let counts = ledger.counts().unwrap();
        assert_eq!(counts.uploaded, 1);
        assert_eq!(counts.novel_count, 1);
    }

    #[test]
    fn state_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = open(dir.path());
            ledger.record_accept("fp1", entry("import json")).unwrap();
            ledger.record_reject().unwrap();
            ledger.record_reject().unwrap();
        }
        let ledger = open(dir.path());
        assert!(ledger.contains("fp1").unwrap());
        let counts = ledger.counts().unwrap();
        assert_eq!(counts.rejected_count, 2);
        assert!((counts.rejection_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(
            ledger
                .uploaded_for("NameError", "NameError: name '<VAR>' is not defined")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn revoke_forgets_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(dir.path());
        ledger.record_accept("fp1", entry("import json")).unwrap();
        assert!(ledger.revoke("fp1").unwrap());
        assert!(!ledger.revoke("fp1").unwrap());
        assert!(!ledger.contains("fp1").unwrap());
        assert_eq!(ledger.counts().unwrap().novel_count, 0);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("upload_ledger.json"), "[[[").unwrap();
        let ledger = open(dir.path());
        assert!(ledger.recovered_from_corruption());
        assert_eq!(ledger.counts().unwrap(), LedgerCounts::default());
    }

    #[test]
    fn handles_on_one_file_see_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let interactive = open(dir.path());
        let watcher = open(dir.path());

        assert!(interactive.record_accept("fp1", entry("import json")).unwrap());
        assert!(watcher.contains("fp1").unwrap());
        assert!(!watcher.record_accept("fp1", entry("import json")).unwrap());
        watcher.record_reject().unwrap();
        interactive.record_reject().unwrap();

        let reopened = open(dir.path());
        let counts = reopened.counts().unwrap();
        assert_eq!(counts.uploaded, 1);
        assert_eq!(counts.novel_count, 1);
        assert_eq!(counts.rejected_count, 2);
        assert_eq!(interactive.counts().unwrap(), counts);
    }

    #[test]
    fn concurrent_handles_accept_a_fingerprint_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload_ledger.json");
        let accepted: usize = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..6)
                .map(|_| {
                    let path = &path;
                    scope.spawn(move || {
                        let ledger = UploadLedger::open(path, Duration::from_secs(5)).unwrap();
                        ledger.record_accept("fp1", entry("import json")).unwrap()
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| usize::from(w.join().unwrap()))
                .sum()
        });
        assert_eq!(accepted, 1);
        assert_eq!(open(dir.path()).counts().unwrap().novel_count, 1);
    }

    #[test]
    fn held_lock_yields_busy_for_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let holder = open(dir.path());
        let other =
            UploadLedger::open(dir.path().join("upload_ledger.json"), Duration::from_millis(50)).unwrap();
        holder
            .exclusive(|_| {
                let err = std::thread::scope(|scope| {
                    scope.spawn(|| other.record_reject()).join().unwrap()
                })
                .unwrap_err();
                assert!(err.is_busy());
                Ok(())
            })
            .unwrap();
        assert!(other.record_accept("fp1", entry("import json")).unwrap());
    }

    #[test]
    fn empty_counts_have_zero_rejection_rate() {
        assert_eq!(LedgerCounts::default().rejection_rate(), 0.0);
    }
}
