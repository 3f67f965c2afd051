//! Error types for the fix knowledge engine.

/// Top-level error enum for the fix knowledge engine.
///
/// Local structural failures (`NotFound`, `InvalidEdge`, `Busy`,
/// `CorruptStore`) surface to callers as typed errors.  `Transport` failures
/// come from network-facing collaborators and are downgraded by the engine.
#[derive(Debug, thiserror::Error)]
pub enum FixError {
    #[error("fix not found: {0}")]
    NotFound(String),

    #[error("invalid branch edge: {0}")]
    InvalidEdge(String),

    #[error("{0} is busy: lock wait timed out")]
    Busy(&'static str),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("corrupt store {path}: {reason}")]
    CorruptStore { path: String, reason: String },

    #[error("record {0} is a remote reference and is read-only")]
    ReadOnly(String),

    #[error("operation cancelled: {0}")]
    Cancelled(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FixError {
    /// True for lock timeouts, whether from our own gates or from SQLite.
    pub fn is_busy(&self) -> bool {
        matches!(self, FixError::Busy(_))
    }

    /// True for failures that come from outside the local installation.
    pub fn is_transient(&self) -> bool {
        matches!(self, FixError::Transport(_) | FixError::Cancelled(_))
    }
}

impl From<rusqlite::Error> for FixError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                FixError::Busy("fix store database")
            }
            _ => FixError::Sqlite(err),
        }
    }
}

#[cfg(feature = "python")]
impl From<FixError> for pyo3::PyErr {
    fn from(err: FixError) -> pyo3::PyErr {
        use pyo3::exceptions::{
            PyConnectionError, PyIOError, PyLookupError, PyRuntimeError, PyTimeoutError,
            PyValueError,
        };
        match &err {
            FixError::NotFound(_) => PyLookupError::new_err(err.to_string()),
            FixError::InvalidEdge(_) | FixError::ReadOnly(_) | FixError::Config(_) => {
                PyValueError::new_err(err.to_string())
            }
            FixError::Busy(_) => PyTimeoutError::new_err(err.to_string()),
            FixError::Transport(_) | FixError::Cancelled(_) => {
                PyConnectionError::new_err(err.to_string())
            }
            FixError::Io(_) => PyIOError::new_err(err.to_string()),
            FixError::CorruptStore { .. } | FixError::Sqlite(_) | FixError::Json(_) => {
                PyRuntimeError::new_err(err.to_string())
            }
        }
    }
}

pub type FixResult<T> = Result<T, FixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_busy_maps_to_busy() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(FixError::from(err).is_busy());
    }

    #[test]
    fn other_sqlite_errors_stay_sqlite() {
        let err = FixError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, FixError::Sqlite(_)));
        assert!(!err.is_busy());
    }

    #[test]
    fn transport_is_transient() {
        assert!(FixError::Transport("offline".into()).is_transient());
        assert!(!FixError::NotFound("abc".into()).is_transient());
    }
}
