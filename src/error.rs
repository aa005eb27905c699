//! Import error taxonomy
//!
//! Row-level issues never surface here (see `RowIssue`); batch-level failures
//! are `BackendError`s that the batch processor retries or records; only
//! session-level outcomes become an `ImportError` returned to the caller.

use std::time::Duration;

use crate::types::{codes, ImportStatus};

/// Failure of a single call to the session endpoint
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Endpoint reported its worker pool as saturated
    #[error("session endpoint worker limit reached: {0}")]
    WorkerLimit(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },
}

impl BackendError {
    /// Map an error envelope code to its variant
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            codes::WORKER_LIMIT => BackendError::WorkerLimit(message),
            codes::NOT_FOUND => BackendError::NotFound(message),
            codes::INVALID_REQUEST => BackendError::InvalidRequest(message),
            _ => BackendError::Remote { code: code.to_string(), message },
        }
    }

    /// Worker-pool saturation gets the longer backoff
    pub fn is_saturation(&self) -> bool {
        match self {
            BackendError::WorkerLimit(_) => true,
            BackendError::Remote { message, .. } | BackendError::Transport(message) => {
                message.contains(codes::WORKER_LIMIT)
            }
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackendError::NotFound(_) | BackendError::InvalidRequest(_))
    }
}

/// Session-level failure of an import run
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("unsupported file format '{0}' (expected .csv, .xlsx, .xls, .xlsm or .ods)")]
    UnsupportedFormat(String),
    #[error("failed to parse file: {0}")]
    Parse(String),
    #[error("no valid batches: all {failed} batch(es) failed")]
    NoSuccessfulBatches { failed: u64 },
    #[error("import timed out after {0:?} waiting for batches to settle")]
    Timeout(Duration),
    #[error("could not start import session: {0}")]
    SessionStart(#[source] BackendError),
    #[error("aggregation failed: {0}")]
    Aggregation(#[source] BackendError),
    #[error("import cancelled")]
    Cancelled,
    #[error("an import is already running")]
    AlreadyRunning,
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: ImportStatus, to: ImportStatus },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_maps_known_codes() {
        assert_eq!(
            BackendError::from_code("WORKER_LIMIT", "busy"),
            BackendError::WorkerLimit("busy".to_string())
        );
        assert_eq!(
            BackendError::from_code("NOT_FOUND", "gone"),
            BackendError::NotFound("gone".to_string())
        );
        assert!(matches!(
            BackendError::from_code("BATCH_FAILED", "db down"),
            BackendError::Remote { .. }
        ));
    }

    #[test]
    fn test_saturation_detected_inside_message() {
        let err = BackendError::Transport("status 546: WORKER_LIMIT".to_string());
        assert!(err.is_saturation());
        assert!(!BackendError::Timeout(Duration::from_secs(1)).is_saturation());
    }

    #[test]
    fn test_not_found_is_not_retryable() {
        assert!(!BackendError::NotFound("x".to_string()).is_retryable());
        assert!(!BackendError::InvalidRequest("x".to_string()).is_retryable());
        assert!(BackendError::WorkerLimit("x".to_string()).is_retryable());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_import_error_messages_distinguish_causes() {
        let timeout = ImportError::Timeout(Duration::from_secs(600)).to_string();
        let none = ImportError::NoSuccessfulBatches { failed: 3 }.to_string();
        let remote = ImportError::Aggregation(BackendError::Remote {
            code: "INTERNAL_ERROR".to_string(),
            message: "boom".to_string(),
        })
        .to_string();
        assert!(timeout.contains("timed out"));
        assert!(none.contains("no valid batches"));
        assert!(remote.contains("aggregation failed"));
    }
}
