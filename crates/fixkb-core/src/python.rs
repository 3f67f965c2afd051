//! Python bindings (`--features python`).
//!
//! Results cross the boundary as plain dicts and lists built from the serde
//! form of the Rust types.

use std::collections::HashMap;
use std::sync::Arc;

use pyo3::prelude::*;
use pyo3::wrap_pyfunction;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::consensus::shared_dir::SharedDirTransport;
use crate::consensus::transport::{CancelToken, FixUploader, UploadReceipt, UploadRequest};
use crate::engine::{Collaborators, FixEngine};
use crate::errors::{FixError, FixResult};
use crate::models::{ApplyFixRequest, FixContext};
use crate::text::classifier::{ErrorClassifier, PatternClassifier};
use crate::text::normalizer::normalize;

fn to_py<T: Serialize>(py: Python<'_>, value: &T) -> PyResult<PyObject> {
    let text = serde_json::to_string(value).map_err(FixError::from)?;
    let json_module = py.import("json")?;
    Ok(json_module.call_method1("loads", (text,))?.unbind())
}

/// Any Python object with
/// `upload(fix_id, error_type, error, solution, context, inspired_by)`
/// returning `(remote_url | None, succeeded)`.
struct PyUploader {
    target: PyObject,
}

impl FixUploader for PyUploader {
    fn upload(&self, request: &UploadRequest) -> FixResult<UploadReceipt> {
        Python::with_gil(|py| {
            let context: HashMap<String, String> = request
                .context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let result = self.target.call_method1(
                py,
                "upload",
                (
                    request.fix_id.as_str(),
                    request.error_type.as_str(),
                    request.error.as_str(),
                    request.solution.as_str(),
                    context,
                    request.inspired_by.as_deref(),
                ),
            )?;
            let (remote_url, succeeded): (Option<String>, bool) = result.extract(py)?;
            Ok(UploadReceipt {
                remote_url,
                succeeded,
            })
        })
        .map_err(|e: PyErr| FixError::Transport(e.to_string()))
    }
}

#[pyclass(name = "FixEngine")]
pub struct PyFixEngine {
    inner: FixEngine,
}

#[pymethods]
impl PyFixEngine {
    /// `data_dir` defaults to the `FIXKB_*` environment configuration.
    /// `shared_dir` enables the directory transport; `uploader` overrides
    /// its upload side.
    #[new]
    #[pyo3(signature = (data_dir=None, uploader=None, shared_dir=None))]
    fn new(
        data_dir: Option<std::path::PathBuf>,
        uploader: Option<PyObject>,
        shared_dir: Option<std::path::PathBuf>,
    ) -> PyResult<Self> {
        let mut config = EngineConfig::from_env()?;
        if let Some(dir) = data_dir {
            config.data_dir = crate::config::expand_tilde(&dir.to_string_lossy());
        }
        let mut collaborators = Collaborators::default();
        if let Some(dir) = shared_dir {
            collaborators = collaborators.with_transport(Arc::new(SharedDirTransport::new(dir)));
        }
        if let Some(target) = uploader {
            collaborators.uploader = Arc::new(PyUploader { target });
        }
        Ok(Self {
            inner: FixEngine::with_collaborators(config, collaborators)?,
        })
    }

    #[pyo3(signature = (script_path, error, solution, context=None, auto_upload=true, inspired_by=None))]
    fn apply_fix(
        &self,
        py: Python<'_>,
        script_path: String,
        error: String,
        solution: String,
        context: Option<HashMap<String, String>>,
        auto_upload: bool,
        inspired_by: Option<String>,
    ) -> PyResult<PyObject> {
        let mut request = ApplyFixRequest::new(script_path, error, solution).auto_upload(auto_upload);
        if let Some(context) = context {
            request = request.with_context(context.into_iter().collect::<FixContext>());
        }
        if let Some(parent) = inspired_by {
            request = request.inspired_by(parent);
        }
        let result = py.allow_threads(|| self.inner.apply_fix(request))?;
        to_py(py, &result)
    }

    #[pyo3(signature = (error, error_type=None))]
    fn search(&self, py: Python<'_>, error: &str, error_type: Option<&str>) -> PyResult<PyObject> {
        let ranked = py.allow_threads(|| self.inner.search(error, error_type));
        to_py(py, &ranked)
    }

    fn statistics(&self, py: Python<'_>) -> PyResult<PyObject> {
        let stats = self.inner.statistics()?;
        to_py(py, &stats)
    }

    fn record_usage(&self, py: Python<'_>, id: &str, success: bool) -> PyResult<PyObject> {
        let record = self.inner.record_usage(id, success)?;
        to_py(py, &record)
    }

    fn variations_of(&self, py: Python<'_>, id: &str) -> PyResult<PyObject> {
        let children = self.inner.variations_of(id)?;
        to_py(py, &children)
    }

    fn get_fix(&self, py: Python<'_>, id: &str) -> PyResult<PyObject> {
        let record = self.inner.get_fix(id)?;
        to_py(py, &record)
    }

    fn sync(&self, py: Python<'_>) -> PyResult<PyObject> {
        let report = py.allow_threads(|| self.inner.sync_now(&CancelToken::new()))?;
        to_py(py, &report)
    }

    #[getter]
    fn data_dir(&self) -> String {
        self.inner.config().data_dir.to_string_lossy().into_owned()
    }
}

#[pyfunction]
fn normalize_error(raw_error: &str) -> String {
    normalize(raw_error)
}

#[pyfunction]
fn classify_error(raw_text: &str) -> String {
    PatternClassifier.classify_error(raw_text)
}

#[pymodule]
fn fixkb_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyFixEngine>()?;
    m.add_function(wrap_pyfunction!(normalize_error, m)?)?;
    m.add_function(wrap_pyfunction!(classify_error, m)?)?;
    m.add("DEFAULT_MIN_RELEVANCE", crate::query::guards::DEFAULT_MIN_RELEVANCE)?;
    m.add("NOVELTY_ACCEPT", crate::query::guards::NOVELTY_ACCEPT)?;
    Ok(())
}
