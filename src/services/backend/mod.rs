//! Session endpoint abstraction
//!
//! The import pipeline talks to the session endpoint only through
//! `ImportBackend`:
//! - `NatsImportBackend` → request/reply against the endpoint served by `serve`
//! - `MockImportBackend` → in-memory endpoint for dry runs and tests
//!
//! Selected via the IMPORT_BACKEND env variable ("nats" or "mock").

mod mock;
mod nats;

pub use mock::MockImportBackend;
pub use nats::NatsImportBackend;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BackendError;
use crate::types::{
    BatchResult, FinishSessionRequest, FinishSummary, ImportSession, ProcessBatchRequest,
    StartSessionRequest, UpdateSessionRequest,
};

/// Client side of the session endpoint contract
#[async_trait]
pub trait ImportBackend: Send + Sync {
    /// `START_SESSION`: create the session record, returns its id
    async fn start_session(&self, request: StartSessionRequest) -> Result<Uuid, BackendError>;

    /// `PROCESS_BATCH`: upsert one batch of validated rows
    async fn process_batch(&self, request: ProcessBatchRequest) -> Result<BatchResult, BackendError>;

    /// `FINISH_SESSION`: aggregate and mark the session completed
    async fn finish_session(&self, request: FinishSessionRequest) -> Result<FinishSummary, BackendError>;

    /// `CHECK_SESSION`: `None` when the endpoint does not know the id
    async fn check_session(&self, session_id: Uuid) -> Result<Option<ImportSession>, BackendError>;

    /// `UPDATE_SESSION`: record status/progress (used for error marking)
    async fn update_session(&self, request: UpdateSessionRequest) -> Result<(), BackendError>;

    /// Get the name of this backend implementation
    fn name(&self) -> &'static str;
}

/// Which backend the import client uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Nats,
    Mock,
}

impl BackendKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "nats" => Some(BackendKind::Nats),
            "mock" => Some(BackendKind::Mock),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!(BackendKind::from_str("NATS"), Some(BackendKind::Nats));
        assert_eq!(BackendKind::from_str(" mock "), Some(BackendKind::Mock));
        assert_eq!(BackendKind::from_str("supabase"), None);
    }
}
