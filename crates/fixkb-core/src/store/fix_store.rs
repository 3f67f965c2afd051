//! Durable local store of fix records.
//!
//! Local records and branch edges live in one SQLite file.  Remote records
//! are a read-only cache replaced wholesale by consensus sync.
//!
//! Every public method opens its own connection.  Within the process, a
//! readers-writer gate serializes mutations; across processes SQLite's own
//! locking does, bounded by the same timeout.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::config::EngineConfig;
use crate::errors::{FixError, FixResult};
use crate::models::{FixContext, FixRecord, NewFix, Origin, RemoteRef};
use crate::query::guards::CANDIDATE_SIMILARITY_FLOOR;
use crate::store::atomic::quarantine;
use crate::store::{remote_cache, schema};
use crate::text::normalizer::normalize;
use crate::text::similarity::TextSimilarity;

pub(crate) const FIX_COLUMNS: &str = "id, error_type, error_signature, solution, context_json, \
     origin, usage_count, success_count, created_at";

pub(crate) fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<FixRecord> {
    let context_json: String = row.get(4)?;
    let origin: String = row.get(5)?;
    let usage_count: i64 = row.get(6)?;
    let success_count: i64 = row.get(7)?;
    Ok(FixRecord {
        id: row.get(0)?,
        error_type: row.get(1)?,
        error_signature: row.get(2)?,
        solution: row.get(3)?,
        context: serde_json::from_str::<FixContext>(&context_json).unwrap_or_default(),
        origin: origin.parse().unwrap_or(Origin::Local),
        usage_count: usage_count.max(0) as u64,
        success_count: success_count.max(0) as u64,
        created_at: row.get::<_, DateTime<Utc>>(8)?,
    })
}

fn is_corruption(err: &FixError) -> bool {
    match err {
        FixError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::NotADatabase | rusqlite::ErrorCode::DatabaseCorrupt
        ),
        _ => false,
    }
}

pub struct FixStore {
    db_path: PathBuf,
    remote_cache_path: PathBuf,
    lock_timeout: Duration,
    gate: RwLock<()>,
    remote: RwLock<Vec<RemoteRef>>,
    recovered: AtomicBool,
}

impl FixStore {
    /// Open (creating if needed) the store files named by `config`.
    pub fn open(config: &EngineConfig) -> FixResult<Self> {
        Self::open_at(
            config.store_path(),
            config.remote_cache_path(),
            config.lock_timeout,
        )
    }

    /// Open with explicit paths.  An unreadable database or cache file is
    /// moved aside and replaced with an empty one.
    pub fn open_at(
        db_path: impl AsRef<Path>,
        remote_cache_path: impl AsRef<Path>,
        lock_timeout: Duration,
    ) -> FixResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cache = remote_cache::load(remote_cache_path.as_ref())?;
        let store = Self {
            db_path,
            remote_cache_path: remote_cache_path.as_ref().to_path_buf(),
            lock_timeout,
            gate: RwLock::new(()),
            remote: RwLock::new(cache.refs),
            recovered: AtomicBool::new(cache.recovered_from_corruption),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> FixResult<()> {
        let first = self.connect().and_then(|conn| Self::prepare(&conn));
        match first {
            Ok(()) => Ok(()),
            Err(e) if is_corruption(&e) => {
                let err = FixError::CorruptStore {
                    path: self.db_path.display().to_string(),
                    reason: e.to_string(),
                };
                quarantine(&self.db_path, &err.to_string())?;
                for suffix in ["-wal", "-shm"] {
                    let mut side = self.db_path.clone().into_os_string();
                    side.push(suffix);
                    let _ = std::fs::remove_file(PathBuf::from(side));
                }
                self.recovered.store(true, Ordering::SeqCst);
                let conn = self.connect()?;
                Self::prepare(&conn)
            }
            Err(e) => Err(e),
        }
    }

    fn prepare(conn: &Connection) -> FixResult<()> {
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        schema::init_schema(conn)
    }

    fn connect(&self) -> FixResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.lock_timeout)?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Ok(conn)
    }

    pub(crate) fn read_gate(&self) -> FixResult<RwLockReadGuard<'_, ()>> {
        self.gate
            .try_read_for(self.lock_timeout)
            .ok_or(FixError::Busy("fix store"))
    }

    pub(crate) fn write_gate(&self) -> FixResult<RwLockWriteGuard<'_, ()>> {
        self.gate
            .try_write_for(self.lock_timeout)
            .ok_or(FixError::Busy("fix store"))
    }

    pub(crate) fn remote_read(&self) -> FixResult<RwLockReadGuard<'_, Vec<RemoteRef>>> {
        self.remote
            .try_read_for(self.lock_timeout)
            .ok_or(FixError::Busy("remote cache"))
    }

    fn remote_write(&self) -> FixResult<RwLockWriteGuard<'_, Vec<RemoteRef>>> {
        self.remote
            .try_write_for(self.lock_timeout)
            .ok_or(FixError::Busy("remote cache"))
    }

    pub(crate) fn open_connection(&self) -> FixResult<Connection> {
        self.connect()
    }

    /// True when opening the store had to discard an unreadable file.
    pub fn recovered_from_corruption(&self) -> bool {
        self.recovered.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Add a fix and return its id.  Re-adding identical content returns the
    /// existing id and touches no counters.
    pub fn add_fix(&self, fix: NewFix) -> FixResult<String> {
        let id = fix.id();
        if fix.origin == Origin::Remote {
            return self.add_remote(fix, id);
        }

        let signature = normalize(&fix.error_signature);
        let context_json = serde_json::to_string(&fix.context)?;
        let _guard = self.write_gate()?;
        let conn = self.connect()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO fixes(id, error_type, error_signature, solution, \
             context_json, origin, usage_count, success_count, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'local', 0, 0, ?6);",
            params![
                id,
                fix.error_type,
                signature,
                fix.solution,
                context_json,
                Utc::now()
            ],
        )?;
        if inserted == 0 {
            debug!(id = %id, "fix already known; add is a no-op");
        } else {
            debug!(id = %id, error_type = %fix.error_type, "fix recorded");
        }
        Ok(id)
    }

    fn add_remote(&self, fix: NewFix, id: String) -> FixResult<String> {
        let mut remote = self.remote_write()?;
        if remote.iter().any(|r| r.record_id() == id) {
            return Ok(id);
        }
        let mut next = remote.clone();
        next.push(RemoteRef {
            id: Some(id.clone()),
            error_type: fix.error_type,
            error_signature: Some(normalize(&fix.error_signature)),
            script: fix.context.get(crate::models::CONTEXT_SCRIPT).cloned(),
            timestamp: Utc::now(),
            url: fix.context.get(crate::models::CONTEXT_REMOTE_URL).cloned(),
            solution: Some(fix.solution),
            usage_count: 0,
            success_count: 0,
        });
        remote_cache::save(&self.remote_cache_path, &next)?;
        *remote = next;
        Ok(id)
    }

    /// Record one use of a local fix.  Returns the updated record.
    pub fn record_usage(&self, id: &str, success: bool) -> FixResult<FixRecord> {
        let _guard = self.write_gate()?;
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE fixes SET usage_count = usage_count + 1, \
             success_count = success_count + ?2 WHERE id = ?1;",
            params![id, if success { 1i64 } else { 0i64 }],
        )?;
        if changed == 0 {
            drop(tx);
            if self.remote_read()?.iter().any(|r| r.record_id() == id) {
                return Err(FixError::ReadOnly(id.to_string()));
            }
            return Err(FixError::NotFound(id.to_string()));
        }
        let record = tx.query_row(
            &format!("SELECT {FIX_COLUMNS} FROM fixes WHERE id = ?1;"),
            params![id],
            row_to_record,
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// Replace the cached remote set in one step.  The file is written before
    /// the in-memory view changes, so a failed write leaves both untouched.
    pub fn replace_remote(&self, refs: Vec<RemoteRef>) -> FixResult<usize> {
        let mut remote = self.remote_write()?;
        remote_cache::save(&self.remote_cache_path, &refs)?;
        let count = refs.len();
        *remote = refs;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub(crate) fn get_local(conn: &Connection, id: &str) -> FixResult<Option<FixRecord>> {
        Ok(conn
            .query_row(
                &format!("SELECT {FIX_COLUMNS} FROM fixes WHERE id = ?1;"),
                params![id],
                row_to_record,
            )
            .optional()?)
    }

    /// Look a record up by id, local first, then the remote cache.
    pub fn get(&self, id: &str) -> FixResult<Option<FixRecord>> {
        let _guard = self.read_gate()?;
        let conn = self.connect()?;
        if let Some(record) = Self::get_local(&conn, id)? {
            return Ok(Some(record));
        }
        Ok(self
            .remote_read()?
            .iter()
            .find(|r| r.record_id() == id)
            .map(RemoteRef::to_record))
    }

    pub fn contains(&self, id: &str) -> FixResult<bool> {
        Ok(self.get(id)?.is_some())
    }

    fn query_local(conn: &Connection) -> FixResult<Vec<FixRecord>> {
        let mut stmt = conn.prepare(&format!("SELECT {FIX_COLUMNS} FROM fixes ORDER BY seq;"))?;
        let rows = stmt
            .query_map([], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Local and cached-remote records whose type matches, or whose signature
    /// is similar enough to `normalized_error` to be worth scoring.
    pub fn lookup_candidates(
        &self,
        error_type: &str,
        normalized_error: &str,
        similarity: &dyn TextSimilarity,
    ) -> FixResult<Vec<FixRecord>> {
        let worth_scoring = |record: &FixRecord| {
            record.error_type == error_type
                || similarity.similarity(normalized_error, &record.error_signature)
                    > CANDIDATE_SIMILARITY_FLOOR
        };

        let _guard = self.read_gate()?;
        let conn = self.connect()?;
        let mut candidates: Vec<FixRecord> = Self::query_local(&conn)?
            .into_iter()
            .filter(|r| worth_scoring(r))
            .collect();

        let remote = self.remote_read()?;
        for record in remote.iter().map(RemoteRef::to_record) {
            if candidates.iter().any(|c| c.id == record.id) {
                continue;
            }
            if worth_scoring(&record) {
                candidates.push(record);
            }
        }
        Ok(candidates)
    }

    /// Cached remote references, optionally restricted to one error type.
    pub fn remote_refs(&self, error_type: Option<&str>) -> FixResult<Vec<RemoteRef>> {
        Ok(self
            .remote_read()?
            .iter()
            .filter(|r| error_type.map_or(true, |t| r.error_type == t))
            .cloned()
            .collect())
    }

    pub fn remote_count(&self) -> FixResult<usize> {
        Ok(self.remote_read()?.len())
    }

    pub fn local_count(&self) -> FixResult<usize> {
        let _guard = self.read_gate()?;
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM fixes;", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn error_type_count(&self) -> FixResult<usize> {
        let _guard = self.read_gate()?;
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT error_type) FROM fixes;",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
