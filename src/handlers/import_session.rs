//! Session endpoint handler
//!
//! One subject carries every import action; the payload's `action` field
//! selects it. `PROCESS_BATCH` admission is bounded: when all batch permits
//! are taken the request is answered with `WORKER_LIMIT` right away and the
//! client backs off.

use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::queries;
use crate::types::{
    codes, BatchResult, CheckSessionRequest, ErrorResponse, FinishSessionRequest,
    FinishSessionResponse, ImportSession, ProcessBatchRequest, Request, SessionAction,
    ShareholderRecord, StartSessionRequest, StartSessionResponse, SuccessResponse,
    UpdateSessionRequest, UpdateSessionResponse,
};

/// Failure of one action, sent back as an error envelope
#[derive(Debug)]
struct ActionError {
    code: &'static str,
    message: String,
}

impl ActionError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    fn not_found(session_id: Uuid) -> Self {
        Self::new(codes::NOT_FOUND, format!("Session {} not found", session_id))
    }

    fn internal(e: anyhow::Error) -> Self {
        Self::new(codes::INTERNAL, e.to_string())
    }
}

type ActionResult = std::result::Result<serde_json::Value, ActionError>;

fn to_value<T: Serialize>(value: T) -> ActionResult {
    serde_json::to_value(value).map_err(|e| ActionError::new(codes::INTERNAL, e.to_string()))
}

/// Handle import session requests
pub async fn handle_import_session(
    client: Client,
    mut subscriber: Subscriber,
    pool: PgPool,
    max_concurrent_batches: usize,
) -> Result<()> {
    let batch_permits = Arc::new(Semaphore::new(max_concurrent_batches.max(1)));

    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Import session message without reply subject");
                continue;
            }
        };

        let request: Request<SessionAction> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse import session request: {}", e);
                let error = ErrorResponse::new(Uuid::nil(), codes::INVALID_REQUEST, e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let permit = if matches!(request.payload, SessionAction::ProcessBatch(_)) {
            match Arc::clone(&batch_permits).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!("No free batch slot, rejecting request {}", request.id);
                    let error = ErrorResponse::new(
                        request.id,
                        codes::WORKER_LIMIT,
                        "All batch workers are busy",
                    );
                    let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                    continue;
                }
            }
        } else {
            None
        };

        let client = client.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let action = request.payload.name();
            let payload = match dispatch(&pool, request.payload).await {
                Ok(value) => serde_json::to_vec(&SuccessResponse::new(request.id, value)),
                Err(e) => {
                    warn!("{} failed ({}): {}", action, e.code, e.message);
                    serde_json::to_vec(&ErrorResponse::new(request.id, e.code, e.message))
                }
            };
            match payload {
                Ok(bytes) => {
                    if let Err(e) = client.publish(reply, bytes.into()).await {
                        error!("Failed to publish {} reply: {}", action, e);
                    }
                }
                Err(e) => error!("Failed to serialize {} reply: {}", action, e),
            }
        });
    }

    Ok(())
}

async fn dispatch(pool: &PgPool, action: SessionAction) -> ActionResult {
    match action {
        SessionAction::StartSession(req) => start_session(pool, req).await,
        SessionAction::ProcessBatch(req) => process_batch(pool, req).await,
        SessionAction::FinishSession(req) => finish_session(pool, req).await,
        SessionAction::CheckSession(req) => check_session(pool, req).await,
        SessionAction::UpdateSession(req) => update_session(pool, req).await,
    }
}

async fn load_session(pool: &PgPool, session_id: Uuid) -> Result<ImportSession, ActionError> {
    queries::import_session::get_session(pool, session_id)
        .await
        .map_err(ActionError::internal)?
        .ok_or_else(|| ActionError::not_found(session_id))
}

async fn start_session(pool: &PgPool, req: StartSessionRequest) -> ActionResult {
    if req.file_data.name.trim().is_empty() {
        return Err(ActionError::new(codes::INVALID_REQUEST, "file_data.name is required"));
    }
    if !(1900..=2100).contains(&req.year) {
        return Err(ActionError::new(
            codes::INVALID_REQUEST,
            format!("year {} out of range", req.year),
        ));
    }

    let session = queries::import_session::create_session(pool, &req)
        .await
        .map_err(ActionError::internal)?;
    info!(
        "Import session {} created by {} for {} ({} bytes, year {}, global: {})",
        session.id, req.user_id, req.file_data.name, req.file_data.size, req.year, req.is_global
    );

    to_value(StartSessionResponse { session_id: session.id })
}

/// Split off rows whose organization number is not 9 digits
fn validate_rows(records: Vec<ShareholderRecord>) -> (Vec<ShareholderRecord>, Vec<String>) {
    let mut valid = Vec::with_capacity(records.len());
    let mut errors = Vec::new();
    for record in records {
        if record.orgnr.len() == 9 && record.orgnr.chars().all(|c| c.is_ascii_digit()) {
            valid.push(record);
        } else {
            errors.push(format!(
                "row {}: invalid organization number '{}'",
                record.row_number, record.orgnr
            ));
        }
    }
    (valid, errors)
}

async fn process_batch(pool: &PgPool, req: ProcessBatchRequest) -> ActionResult {
    let session = load_session(pool, req.session_id).await?;
    let scope = session.scope(req.is_global);
    let total_rows = req.batch_data.len() as u64;
    let (valid, errors) = validate_rows(req.batch_data);

    let apply = async {
        let mut tx = pool.begin().await?;
        if !valid.is_empty() {
            queries::shareholder::upsert_batch(&mut tx, session.id, scope, req.year, &valid).await?;
        }
        queries::import_session::record_batch(
            &mut tx,
            session.id,
            req.batch_index,
            valid.len() as i64,
            total_rows as i64,
        )
        .await?;
        tx.commit().await?;
        anyhow::Ok(())
    };
    apply
        .await
        .map_err(|e| ActionError::new(codes::BATCH_FAILED, e.to_string()))?;

    debug!(
        "Session {}: batch {} applied {}/{} rows",
        session.id,
        req.batch_index,
        valid.len(),
        total_rows
    );
    to_value(BatchResult {
        processed_rows: valid.len() as u64,
        total_rows,
        errors,
    })
}

async fn finish_session(pool: &PgPool, req: FinishSessionRequest) -> ActionResult {
    let session = load_session(pool, req.session_id).await?;
    let scope = session.scope(req.is_global);

    let summary = queries::shareholder::aggregate(pool, scope, req.year)
        .await
        .map_err(ActionError::internal)?;
    queries::import_session::complete_session(pool, session.id)
        .await
        .map_err(ActionError::internal)?;

    info!(
        "Import session {} finished: {} companies, {} holdings, {} entities for {}",
        session.id, summary.companies, summary.holdings, summary.entities, summary.year
    );
    to_value(FinishSessionResponse { summary })
}

async fn check_session(pool: &PgPool, req: CheckSessionRequest) -> ActionResult {
    let session = load_session(pool, req.session_id).await?;
    to_value(session)
}

async fn update_session(pool: &PgPool, req: UpdateSessionRequest) -> ActionResult {
    let updated = queries::import_session::update_session(
        pool,
        req.session_id,
        req.status,
        req.progress,
        req.error_message.as_deref(),
    )
    .await
    .map_err(ActionError::internal)?;

    if !updated {
        return Err(ActionError::not_found(req.session_id));
    }
    to_value(UpdateSessionResponse { updated })
}
