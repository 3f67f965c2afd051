//! Atomic file replacement and quarantine of unreadable state files.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::warn;

use crate::errors::FixResult;

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Write `bytes` to `dest` so that readers see either the old or the new
/// contents, never a partial file.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> FixResult<()> {
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    // Fresh temp name per call; writers to one destination never collide.
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    fsync_dir(dir).ok();
    Ok(())
}

/// Move an unreadable file out of the way as `<name>.corrupt-<unix-ts>` and
/// return the new location.
pub fn quarantine(path: &Path, reason: &str) -> FixResult<PathBuf> {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt-{}", chrono::Utc::now().timestamp()));
    let target = path.with_file_name(name);
    fs::rename(path, &target)?;
    warn!(
        path = %path.display(),
        moved_to = %target.display(),
        "state file unreadable ({reason}); starting from an empty store"
    );
    Ok(target)
}
