//! Import session types
//!
//! Covers the server-tracked `ImportSession` record, the session endpoint
//! action payloads (`START_SESSION`, `PROCESS_BATCH`, ...) and the in-memory
//! progress record the controller publishes while an import runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::import::{BatchResult, ShareholderRecord};

// ==========================================================================
// Tests First (TDD)
// ==========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_forward_path_is_allowed() {
        use ImportStatus::*;
        assert!(Idle.can_transition_to(Parsing));
        assert!(Parsing.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Aggregating));
        assert!(Aggregating.can_transition_to(Completed));
    }

    #[test]
    fn test_status_skipping_states_is_rejected() {
        use ImportStatus::*;
        assert!(!Idle.can_transition_to(Uploading));
        assert!(!Parsing.can_transition_to(Completed));
        assert!(!Uploading.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Parsing));
    }

    #[test]
    fn test_status_pause_only_from_uploading() {
        use ImportStatus::*;
        assert!(Uploading.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Uploading));
        assert!(!Parsing.can_transition_to(Paused));
        assert!(!Aggregating.can_transition_to(Paused));
    }

    #[test]
    fn test_status_error_reachable_from_active_states() {
        use ImportStatus::*;
        for s in [Idle, Parsing, Uploading, Paused, Aggregating] {
            assert!(s.can_transition_to(Error), "{:?} -> error", s);
        }
        assert!(!Completed.can_transition_to(Error));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ImportStatus::Aggregating).unwrap();
        assert_eq!(json, "\"aggregating\"");
    }

    #[test]
    fn test_session_action_tagged_by_action_field() {
        let action = SessionAction::CheckSession(CheckSessionRequest { session_id: Uuid::nil() });
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"action\":\"CHECK_SESSION\""));
        assert!(json.contains("session_id"));
    }

    #[test]
    fn test_start_session_deserializes_without_is_global() {
        let json = r#"{
            "action": "START_SESSION",
            "user_id": "00000000-0000-0000-0000-000000000000",
            "year": 2024,
            "file_data": {"name": "aksjonaerer.csv", "size": 1024}
        }"#;
        let action: SessionAction = serde_json::from_str(json).unwrap();
        match action {
            SessionAction::StartSession(req) => {
                assert_eq!(req.year, 2024);
                assert_eq!(req.file_data.name, "aksjonaerer.csv");
                assert!(!req.is_global);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_progress_scale_bounds() {
        assert_eq!(ProgressScale::parsing(0.0), 0.0);
        assert_eq!(ProgressScale::parsing(1.0), 50.0);
        assert_eq!(ProgressScale::uploading(0.0), 50.0);
        assert_eq!(ProgressScale::uploading(1.0), 90.0);
        assert_eq!(ProgressScale::uploading(7.0), 90.0);
        assert_eq!(ProgressScale::AGGREGATING, 90.0);
        assert_eq!(ProgressScale::COMPLETED, 100.0);
    }

    #[test]
    fn test_session_resumable_only_when_active() {
        let mut session = ImportSession {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            year: 2024,
            status: ImportStatus::Uploading,
            total_rows: 10,
            processed_rows: 4,
            progress: 62.0,
            file_name: "a.csv".to_string(),
            file_size: 100,
            is_global: false,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(session.is_resumable());
        session.status = ImportStatus::Completed;
        assert!(!session.is_resumable());
        session.status = ImportStatus::Error;
        assert!(!session.is_resumable());
    }
}

// ==========================================================================
// Session status
// ==========================================================================

/// Import session status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "import_status", rename_all = "lowercase")]
pub enum ImportStatus {
    #[default]
    Idle,
    Parsing,
    Uploading,
    Aggregating,
    Completed,
    Error,
    Paused,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Idle => "idle",
            ImportStatus::Parsing => "parsing",
            ImportStatus::Uploading => "uploading",
            ImportStatus::Aggregating => "aggregating",
            ImportStatus::Completed => "completed",
            ImportStatus::Error => "error",
            ImportStatus::Paused => "paused",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Error)
    }

    /// Allowed state machine edges. Resetting to `Idle` (cancel) is always allowed.
    pub fn can_transition_to(&self, next: ImportStatus) -> bool {
        use ImportStatus::*;
        match (*self, next) {
            (_, Idle) => true,
            (Completed, _) => false,
            (_, Error) => true,
            (Idle, Parsing) => true,
            (Parsing, Uploading) => true,
            (Uploading, Aggregating) => true,
            (Uploading, Paused) => true,
            (Paused, Uploading) => true,
            (Aggregating, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side record of one import run
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ImportSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub year: i32,
    pub status: ImportStatus,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub progress: f64,
    pub file_name: String,
    pub file_size: i64,
    pub is_global: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportSession {
    /// Owner of rows written by this session: the nil UUID for global data,
    /// otherwise the session's user
    pub fn scope(&self, is_global: bool) -> Uuid {
        if is_global {
            Uuid::nil()
        } else {
            self.user_id
        }
    }

    /// Whether the session's counters still describe an unfinished run.
    /// Parse state itself is never resumable after the worker is gone.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.status,
            ImportStatus::Parsing
                | ImportStatus::Uploading
                | ImportStatus::Paused
                | ImportStatus::Aggregating
        )
    }
}

// ==========================================================================
// Session endpoint actions
// ==========================================================================

/// Request payload for the session endpoint, selected by the `action` field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionAction {
    StartSession(StartSessionRequest),
    ProcessBatch(ProcessBatchRequest),
    FinishSession(FinishSessionRequest),
    CheckSession(CheckSessionRequest),
    UpdateSession(UpdateSessionRequest),
}

impl SessionAction {
    pub fn name(&self) -> &'static str {
        match self {
            SessionAction::StartSession(_) => "START_SESSION",
            SessionAction::ProcessBatch(_) => "PROCESS_BATCH",
            SessionAction::FinishSession(_) => "FINISH_SESSION",
            SessionAction::CheckSession(_) => "CHECK_SESSION",
            SessionAction::UpdateSession(_) => "UPDATE_SESSION",
        }
    }
}

/// Uploaded file metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub user_id: Uuid,
    pub year: i32,
    pub file_data: FileData,
    #[serde(default)]
    pub is_global: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessBatchRequest {
    pub session_id: Uuid,
    /// Position of the batch in the file; every retry of a batch reuses it
    pub batch_index: u64,
    pub year: i32,
    pub batch_data: Vec<ShareholderRecord>,
    #[serde(default)]
    pub is_global: bool,
}

pub type ProcessBatchResponse = BatchResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishSessionRequest {
    pub session_id: Uuid,
    pub year: i32,
    #[serde(default)]
    pub is_global: bool,
}

/// Aggregated counts after all batches are ingested
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishSummary {
    pub companies: i64,
    pub holdings: i64,
    pub entities: i64,
    pub year: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishSessionResponse {
    pub summary: FinishSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSessionRequest {
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    pub session_id: Uuid,
    pub status: ImportStatus,
    pub progress: f64,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSessionResponse {
    pub updated: bool,
}

// ==========================================================================
// In-memory progress
// ==========================================================================

/// Fixed progress scale: parsing 0–50, uploading 50–90, aggregating 90–100
pub struct ProgressScale;

impl ProgressScale {
    pub const AGGREGATING: f64 = 90.0;
    pub const COMPLETED: f64 = 100.0;

    pub fn parsing(fraction: f64) -> f64 {
        50.0 * fraction.clamp(0.0, 1.0)
    }

    pub fn uploading(fraction: f64) -> f64 {
        50.0 + 40.0 * fraction.clamp(0.0, 1.0)
    }
}

/// Progress of the running import, as published by the controller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub status: ImportStatus,
    pub progress: f64,
    /// Share of the file read so far, 1.0 once parsing completes
    #[serde(default)]
    pub parsed_fraction: f64,
    pub session_id: Option<Uuid>,
    pub file_name: Option<String>,
    pub total_rows: u64,
    pub processed_rows: u64,
    pub valid_rows: u64,
    pub invalid_rows: u64,
    pub total_batches: u64,
    pub completed_batches: u64,
    pub failed_batches: u64,
    pub message: Option<String>,
    pub error: Option<String>,
}
