//! NATS message types

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Error codes shared by the session endpoint and its clients
pub mod codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// Endpoint has no free batch slot; clients back off longer
    pub const WORKER_LIMIT: &str = "WORKER_LIMIT";
    pub const BATCH_FAILED: &str = "BATCH_FAILED";
    pub const INTERNAL: &str = "INTERNAL_ERROR";
}

/// Generic request wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<T> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub token: Option<String>,
    pub payload: T,
}

impl<T> Request<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            token: None,
            payload,
        }
    }
}

/// Generic success response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse<T> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: T,
}

impl<T> SuccessResponse<T> {
    pub fn new(request_id: Uuid, payload: T) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(request_id: Uuid, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }
}

/// Either side of a reply, for clients that do not know the outcome up front
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Success(SuccessResponse<T>),
    Error(ErrorResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_parses_error_envelope() {
        let error = ErrorResponse::new(Uuid::nil(), codes::NOT_FOUND, "Session not found");
        let bytes = serde_json::to_vec(&error).unwrap();
        let reply: Reply<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        match reply {
            Reply::Error(e) => assert_eq!(e.error.code, "NOT_FOUND"),
            Reply::Success(_) => panic!("error envelope parsed as success"),
        }
    }

    #[test]
    fn test_reply_parses_success_envelope() {
        let ok = SuccessResponse::new(Uuid::nil(), serde_json::json!({"updated": true}));
        let bytes = serde_json::to_vec(&ok).unwrap();
        let reply: Reply<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        assert!(matches!(reply, Reply::Success(_)));
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let request = Request::new(serde_json::json!({}));
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"timestamp\""));
        assert!(json.contains("\"payload\""));
    }
}
