//! On-disk cache of the last-synced remote reference set.
//!
//! One JSON document per line.  The file is always replaced as a whole, so a
//! reader sees either the previous or the new set.

use std::path::Path;

use crate::errors::{FixError, FixResult};
use crate::models::RemoteRef;
use crate::store::atomic::{quarantine, write_atomic};

/// Result of loading the cache: the refs plus whether the file had to be
/// quarantined.
pub struct LoadedRemoteCache {
    pub refs: Vec<RemoteRef>,
    pub recovered_from_corruption: bool,
}

fn parse(content: &str) -> Result<Vec<RemoteRef>, String> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<RemoteRef>(line).map_err(|e| format!("line {}: {e}", n + 1))
        })
        .collect()
}

pub fn load(path: &Path) -> FixResult<LoadedRemoteCache> {
    if !path.exists() {
        return Ok(LoadedRemoteCache {
            refs: Vec::new(),
            recovered_from_corruption: false,
        });
    }
    let content = std::fs::read_to_string(path)?;
    match parse(&content) {
        Ok(refs) => Ok(LoadedRemoteCache {
            refs,
            recovered_from_corruption: false,
        }),
        Err(reason) => {
            let err = FixError::CorruptStore {
                path: path.display().to_string(),
                reason,
            };
            quarantine(path, &err.to_string())?;
            Ok(LoadedRemoteCache {
                refs: Vec::new(),
                recovered_from_corruption: true,
            })
        }
    }
}

pub fn save(path: &Path, refs: &[RemoteRef]) -> FixResult<()> {
    let mut out = String::new();
    for remote in refs {
        out.push_str(&serde_json::to_string(remote)?);
        out.push('\n');
    }
    write_atomic(path, out.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn remote(id: &str) -> RemoteRef {
        RemoteRef {
            id: Some(id.to_string()),
            error_type: "NameError".into(),
            error_signature: Some("NameError: name 'x' is not defined".into()),
            script: Some("main.py".into()),
            timestamp: Utc::now(),
            url: None,
            solution: None,
            usage_count: 2,
            success_count: 1,
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load(&dir.path().join("remote_refs.jsonl")).unwrap();
        assert!(loaded.refs.is_empty());
        assert!(!loaded.recovered_from_corruption);
    }

    #[test]
    fn saved_refs_load_back_line_per_ref() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote_refs.jsonl");
        save(&path, &[remote("a"), remote("b")]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.refs.len(), 2);
        assert_eq!(loaded.refs[1].id.as_deref(), Some("b"));
    }

    #[test]
    fn garbage_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote_refs.jsonl");
        std::fs::write(&path, "{\"error_type\": \n").unwrap();
        let loaded = load(&path).unwrap();
        assert!(loaded.refs.is_empty());
        assert!(loaded.recovered_from_corruption);
        assert!(!path.exists());
    }
}
