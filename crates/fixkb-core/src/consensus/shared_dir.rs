//! Transport over a shared directory (network mount, synced folder).
//!
//! Each shared fix is one JSON document named `<fix_id>.json`.  Fetching
//! returns metadata only; solution text is read on explicit selection.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{FixError, FixResult};
use crate::models::{RemoteRef, CONTEXT_SCRIPT};
use crate::store::atomic::write_atomic;
use crate::text::normalizer::normalize;

use super::transport::{CancelToken, FixUploader, RemoteRefSource, UploadReceipt, UploadRequest};

const DOCUMENT_EXT: &str = "json";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SharedFixDocument {
    id: String,
    error_type: String,
    error_signature: String,
    #[serde(default)]
    script: Option<String>,
    timestamp: DateTime<Utc>,
    solution: String,
    #[serde(default)]
    inspired_by: Option<String>,
    #[serde(default)]
    usage_count: u64,
    #[serde(default)]
    success_count: u64,
}

fn transport_err(err: impl std::fmt::Display) -> FixError {
    FixError::Transport(err.to_string())
}

pub struct SharedDirTransport {
    root: PathBuf,
}

impl SharedDirTransport {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn document_path(&self, fix_id: &str) -> PathBuf {
        self.root.join(format!("{fix_id}.{DOCUMENT_EXT}"))
    }

    fn read_document(path: &Path) -> FixResult<SharedFixDocument> {
        let content = std::fs::read_to_string(path).map_err(transport_err)?;
        serde_json::from_str(&content).map_err(transport_err)
    }

    /// Solution text of one shared fix, read only when a caller selects it.
    pub fn fetch_solution(&self, fix_id: &str) -> FixResult<Option<String>> {
        let path = self.document_path(fix_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_document(&path)?.solution))
    }
}

impl FixUploader for SharedDirTransport {
    fn upload(&self, request: &UploadRequest) -> FixResult<UploadReceipt> {
        let path = self.document_path(&request.fix_id);
        let document = SharedFixDocument {
            id: request.fix_id.clone(),
            error_type: request.error_type.clone(),
            error_signature: normalize(&request.error),
            script: request.context.get(CONTEXT_SCRIPT).cloned(),
            timestamp: Utc::now(),
            solution: request.solution.clone(),
            inspired_by: request.inspired_by.clone(),
            usage_count: 0,
            success_count: 0,
        };
        let bytes = serde_json::to_vec_pretty(&document)?;
        write_atomic(&path, &bytes).map_err(transport_err)?;
        Ok(UploadReceipt::shared(format!("file://{}", path.display())))
    }
}

impl RemoteRefSource for SharedDirTransport {
    fn fetch_remote_refs(&self, cancel: &CancelToken) -> FixResult<Vec<RemoteRef>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.root)
            .map_err(transport_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == DOCUMENT_EXT))
            .collect();
        paths.sort();

        let mut refs = Vec::with_capacity(paths.len());
        for path in paths {
            cancel.check("fetch")?;
            let document = match Self::read_document(&path) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable shared fix");
                    continue;
                }
            };
            refs.push(RemoteRef {
                id: Some(document.id),
                error_type: document.error_type,
                error_signature: Some(document.error_signature),
                script: document.script,
                timestamp: document.timestamp,
                url: Some(format!("file://{}", path.display())),
                solution: None,
                usage_count: document.usage_count,
                success_count: document.success_count,
            });
        }
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FixContext;

    fn request(id: &str, solution: &str) -> UploadRequest {
        let mut context = FixContext::new();
        context.insert(CONTEXT_SCRIPT.into(), "report.py".into());
        UploadRequest {
            fix_id: id.into(),
            error_type: "NameError".into(),
            error: "NameError: name 'pd' is not defined at /home/u/report.py line 4".into(),
            solution: solution.into(),
            context,
            inspired_by: None,
        }
    }

    #[test]
    fn uploaded_fix_is_fetched_without_solution() {
        let dir = tempfile::tempdir().unwrap();
        let transport = SharedDirTransport::new(dir.path().join("shared"));
        let receipt = transport.upload(&request("f1", "import pandas as pd")).unwrap();
        assert!(receipt.succeeded);
        assert!(receipt.remote_url.unwrap().starts_with("file://"));

        let refs = transport.fetch_remote_refs(&CancelToken::new()).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].id.as_deref(), Some("f1"));
        assert_eq!(refs[0].script.as_deref(), Some("report.py"));
        assert_eq!(
            refs[0].error_signature.as_deref(),
            Some("NameError: name '<VAR>' is not defined at <PATH> line <N>")
        );
        assert!(refs[0].solution.is_none());

        assert_eq!(
            transport.fetch_solution("f1").unwrap().as_deref(),
            Some("import pandas as pd")
        );
        assert!(transport.fetch_solution("missing").unwrap().is_none());
    }

    #[test]
    fn missing_directory_fetches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let transport = SharedDirTransport::new(dir.path().join("absent"));
        assert!(transport.fetch_remote_refs(&CancelToken::new()).unwrap().is_empty());
    }

    #[test]
    fn unreadable_documents_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let transport = SharedDirTransport::new(dir.path());
        transport.upload(&request("good", "import pandas as pd")).unwrap();
        std::fs::write(dir.path().join("bad.json"), "not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let refs = transport.fetch_remote_refs(&CancelToken::new()).unwrap();
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn cancelled_fetch_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let transport = SharedDirTransport::new(dir.path());
        transport.upload(&request("a", "x")).unwrap();
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            transport.fetch_remote_refs(&token),
            Err(FixError::Cancelled(_))
        ));
    }
}
