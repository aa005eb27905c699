//! NATS request/reply client for the session endpoint

use std::time::Duration;

use async_nats::Client;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use super::ImportBackend;
use crate::error::BackendError;
use crate::types::{
    BatchResult, CheckSessionRequest, FinishSessionRequest, FinishSessionResponse, FinishSummary,
    ImportSession, ProcessBatchRequest, Reply, Request, SessionAction, StartSessionRequest,
    StartSessionResponse, UpdateSessionRequest, UpdateSessionResponse,
};

/// Session endpoint reached over NATS request/reply
pub struct NatsImportBackend {
    client: Client,
    subject: String,
    timeout: Duration,
}

impl NatsImportBackend {
    pub fn new(client: Client, subject: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            subject: subject.into(),
            timeout,
        }
    }

    async fn call<T: DeserializeOwned>(&self, action: SessionAction) -> Result<T, BackendError> {
        let name = action.name();
        let request = Request::new(action);
        let payload = serde_json::to_vec(&request)
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;

        debug!("{} -> {} ({} bytes)", name, self.subject, payload.len());

        let response = tokio::time::timeout(
            self.timeout,
            self.client.request(self.subject.clone(), payload.into()),
        )
        .await
        .map_err(|_| BackendError::Timeout(self.timeout))?
        .map_err(|e| BackendError::Transport(e.to_string()))?;

        match serde_json::from_slice::<Reply<T>>(&response.payload) {
            Ok(Reply::Success(ok)) => Ok(ok.payload),
            Ok(Reply::Error(err)) => Err(BackendError::from_code(&err.error.code, err.error.message)),
            Err(e) => Err(BackendError::Transport(format!("malformed {} reply: {}", name, e))),
        }
    }
}

#[async_trait]
impl ImportBackend for NatsImportBackend {
    async fn start_session(&self, request: StartSessionRequest) -> Result<Uuid, BackendError> {
        let response: StartSessionResponse = self.call(SessionAction::StartSession(request)).await?;
        Ok(response.session_id)
    }

    async fn process_batch(&self, request: ProcessBatchRequest) -> Result<BatchResult, BackendError> {
        self.call(SessionAction::ProcessBatch(request)).await
    }

    async fn finish_session(&self, request: FinishSessionRequest) -> Result<FinishSummary, BackendError> {
        let response: FinishSessionResponse = self.call(SessionAction::FinishSession(request)).await?;
        Ok(response.summary)
    }

    async fn check_session(&self, session_id: Uuid) -> Result<Option<ImportSession>, BackendError> {
        let action = SessionAction::CheckSession(CheckSessionRequest { session_id });
        match self.call::<ImportSession>(action).await {
            Ok(session) => Ok(Some(session)),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_session(&self, request: UpdateSessionRequest) -> Result<(), BackendError> {
        let _: UpdateSessionResponse = self.call(SessionAction::UpdateSession(request)).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}
