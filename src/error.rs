//! Error types for the go-sandbox executor.
//!
//! Toolchain failures, timeouts and resource-limit violations are not errors:
//! they come back as unsuccessful [`crate::ExecutionResult`]s. The variants here
//! cover the cases where the sandbox itself could not run the request.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level error type for sandboxed executions.
#[derive(Error, Debug)]
pub enum Error {
    /// The request cannot be executed as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Creating, copying or overlaying workspace files failed.
    #[error("failed to materialize workspace at {path}: {reason}")]
    Materialization { path: PathBuf, reason: String },

    /// Failed to release a system-owned workspace.
    #[error("failed to clean up workspace at {path}: {reason}")]
    WorkspaceCleanup { path: PathBuf, reason: String },

    /// Unexpected host-level failure, such as being unable to spawn a process.
    #[error("internal failure: {0}")]
    Internal(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error outside workspace materialization.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Builds a materialization error for `path`.
    pub(crate) fn materialization(path: &Path, reason: impl ToString) -> Self {
        Error::Materialization {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if the sandbox rejected or could not prepare the request,
    /// as opposed to a host failure.
    pub fn is_request_side(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_) | Error::Materialization { .. }
        )
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialization_error_names_path() {
        let err = Error::materialization(Path::new("/tmp/ws/main.go"), "disk full");
        assert_eq!(
            err.to_string(),
            "failed to materialize workspace at /tmp/ws/main.go: disk full"
        );
        assert!(err.is_request_side());
    }

    #[test]
    fn internal_errors_are_not_request_side() {
        assert!(!Error::Internal("spawn failed".to_string()).is_request_side());
        assert!(Error::InvalidRequest("empty".to_string()).is_request_side());
    }
}
