//! Branch graph: "inspired by" / "variant of" edges between fix records.
//!
//! Edges are stored next to the local records and keyed by record id.  Only
//! one-hop queries are offered, so traversal terminates even if an
//! accidental cycle was recorded.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use crate::errors::{FixError, FixResult};
use crate::models::{BranchEdge, BranchRelationship, FixRecord, RemoteRef};
use crate::store::fix_store::FixStore;

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<BranchEdge> {
    let relationship: String = row.get(2)?;
    Ok(BranchEdge {
        parent_id: row.get(0)?,
        child_id: row.get(1)?,
        relationship: relationship
            .parse()
            .unwrap_or(BranchRelationship::InspiredBy),
        reason: row.get(3)?,
        created_at: row.get::<_, DateTime<Utc>>(4)?,
    })
}

impl FixStore {
    /// Record that `child_id` was derived from `parent_id`.
    ///
    /// Returns `false` when the exact `(parent, child)` edge already exists.
    pub fn add_branch(
        &self,
        parent_id: &str,
        child_id: &str,
        relationship: BranchRelationship,
        reason: &str,
    ) -> FixResult<bool> {
        if parent_id == child_id {
            return Err(FixError::InvalidEdge(format!(
                "a fix cannot branch from itself ({parent_id})"
            )));
        }

        let _guard = self.write_gate()?;
        let conn = self.open_connection()?;
        {
            let remote = self.remote_read()?;
            for id in [parent_id, child_id] {
                let known_remote = remote.iter().any(|r| r.record_id() == id);
                if !known_remote && FixStore::get_local(&conn, id)?.is_none() {
                    return Err(FixError::NotFound(id.to_string()));
                }
            }
        }

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO branches(parent_id, child_id, relationship, reason, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![parent_id, child_id, relationship.as_str(), reason, Utc::now()],
        )?;
        if inserted > 0 {
            debug!(parent = %parent_id, child = %child_id, %relationship, "branch recorded");
        }
        Ok(inserted > 0)
    }

    /// Outgoing edges of `id`, oldest first.
    pub fn branches_from(&self, id: &str) -> FixResult<Vec<BranchEdge>> {
        let _guard = self.read_gate()?;
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT parent_id, child_id, relationship, reason, created_at \
             FROM branches WHERE parent_id = ?1 ORDER BY created_at, child_id;",
        )?;
        let edges = stmt
            .query_map(params![id], row_to_edge)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    /// One-hop children of `id`.  Children whose records have since left the
    /// remote cache are skipped.
    pub fn variations_of(&self, id: &str) -> FixResult<Vec<FixRecord>> {
        if !self.contains(id)? {
            return Err(FixError::NotFound(id.to_string()));
        }
        let edges = self.branches_from(id)?;

        let _guard = self.read_gate()?;
        let conn = self.open_connection()?;
        let remote = self.remote_read()?;
        let mut children = Vec::with_capacity(edges.len());
        for edge in edges {
            if let Some(record) = FixStore::get_local(&conn, &edge.child_id)? {
                children.push(record);
            } else if let Some(r) = remote.iter().find(|r| r.record_id() == edge.child_id) {
                children.push(RemoteRef::to_record(r));
            }
        }
        Ok(children)
    }

    pub fn branch_count(&self) -> FixResult<usize> {
        let _guard = self.read_gate()?;
        let conn = self.open_connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM branches;", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
