//! SQLite schema for the fix store, expressed as an ordered list of
//! versioned migrations.

use rusqlite::{params, Connection};
use tracing::debug;

use crate::errors::FixResult;

/// Bookkeeping tables that exist before any migration runs.
const BOOTSTRAP_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS store_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
];

struct Migration {
    version: i32,
    description: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "fix records and lineage edges",
        statements: &[
            "CREATE TABLE IF NOT EXISTS fixes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                error_type TEXT NOT NULL,
                error_signature TEXT NOT NULL,
                solution TEXT NOT NULL,
                context_json TEXT NOT NULL DEFAULT '{}',
                origin TEXT NOT NULL DEFAULT 'local',
                usage_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                CHECK (success_count <= usage_count)
            );",
            "CREATE TABLE IF NOT EXISTS branches (
                parent_id TEXT NOT NULL,
                child_id TEXT NOT NULL,
                relationship TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                PRIMARY KEY(parent_id, child_id),
                CHECK (parent_id <> child_id)
            );",
            "CREATE INDEX IF NOT EXISTS idx_fixes_error_type ON fixes(error_type);",
        ],
    },
    Migration {
        version: 2,
        description: "child-side lineage lookups and oldest-first candidate scans",
        statements: &[
            "CREATE INDEX IF NOT EXISTS idx_branches_child ON branches(child_id);",
            "CREATE INDEX IF NOT EXISTS idx_fixes_type_created ON fixes(error_type, created_at);",
        ],
    },
];

/// Version a fully migrated store reports.
pub const SCHEMA_VERSION: i32 = 2;

/// Schema version recorded in `store_meta`; 0 for a new database.
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'schema_version';",
        [],
        |row| row.get::<_, String>(0),
    )
    .ok()
    .and_then(|v| v.parse().ok())
    .unwrap_or(0)
}

fn record_step(
    conn: &Connection,
    step: &Migration,
    status: &str,
    error_msg: Option<&str>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, description, status, error_message) \
         VALUES (?1, ?2, ?3, ?4, ?5);",
        params![step.version - 1, step.version, step.description, status, error_msg],
    )
}

/// Apply one migration inside its own SAVEPOINT; on failure only this step
/// is rolled back and the failure is written to `migration_history`.
fn apply_step(conn: &Connection, step: &Migration) -> FixResult<()> {
    conn.execute_batch("SAVEPOINT fixkb_migrate_step;")?;
    let applied = step
        .statements
        .iter()
        .try_for_each(|sql| conn.execute_batch(sql))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO store_meta(key, value) VALUES('schema_version', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
                params![step.version.to_string()],
            )
        })
        .and_then(|_| record_step(conn, step, "success", None));

    match applied {
        Ok(_) => {
            conn.execute_batch("RELEASE SAVEPOINT fixkb_migrate_step;")?;
            debug!(version = step.version, description = step.description, "fix store migrated");
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch(
                "ROLLBACK TO SAVEPOINT fixkb_migrate_step; RELEASE SAVEPOINT fixkb_migrate_step;",
            );
            let _ = record_step(conn, step, "failed", Some(&e.to_string()));
            Err(e.into())
        }
    }
}

/// Bring `conn` from its recorded version up to [`SCHEMA_VERSION`].
pub fn migrate_schema(conn: &Connection) -> FixResult<()> {
    let current = get_schema_version(conn);
    for step in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply_step(conn, step)?;
    }
    Ok(())
}

/// Create the bookkeeping tables and run every pending migration.
pub fn init_schema(conn: &Connection) -> FixResult<()> {
    for stmt in BOOTSTRAP_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    migrate_schema(conn)
}
