//! Contracts for the network-facing collaborators.
//!
//! Implementations handle encryption, signing and the remote write.  The
//! engine treats every failure here as transient.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{FixError, FixResult};
use crate::models::{FixContext, RemoteRef};

/// Everything the uploader receives for one accepted fix.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub fix_id: String,
    pub error_type: String,
    pub error: String,
    pub solution: String,
    pub context: FixContext,
    pub inspired_by: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadReceipt {
    pub remote_url: Option<String>,
    pub succeeded: bool,
}

impl UploadReceipt {
    pub fn shared(remote_url: impl Into<String>) -> Self {
        Self {
            remote_url: Some(remote_url.into()),
            succeeded: true,
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }
}

pub trait FixUploader: Send + Sync {
    fn upload(&self, request: &UploadRequest) -> FixResult<UploadReceipt>;
}

/// Source of the shared store's reference metadata.  Never returns remote
/// solution text.
pub trait RemoteRefSource: Send + Sync {
    fn fetch_remote_refs(&self, cancel: &CancelToken) -> FixResult<Vec<RemoteRef>>;
}

/// Cloneable cancellation flag shared between a sync and whoever may abort it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once [`cancel`](Self::cancel) has been called.
    pub fn check(&self, during: &'static str) -> FixResult<()> {
        if self.is_cancelled() {
            Err(FixError::Cancelled(during))
        } else {
            Ok(())
        }
    }
}

/// Uploader for installations with sharing turned off.  Every upload
/// reports failure, so accepted fixes stay local.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopUploader;

impl FixUploader for NoopUploader {
    fn upload(&self, _request: &UploadRequest) -> FixResult<UploadReceipt> {
        Ok(UploadReceipt::failed())
    }
}

/// Source with nothing to report.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyRefSource;

impl RemoteRefSource for EmptyRefSource {
    fn fetch_remote_refs(&self, cancel: &CancelToken) -> FixResult<Vec<RemoteRef>> {
        cancel.check("fetch")?;
        Ok(Vec::new())
    }
}
