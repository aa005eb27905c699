//! Import session queries

use anyhow::Result;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::types::{ImportSession, ImportStatus, StartSessionRequest};

const SESSION_COLUMNS: &str = r#"
    id, user_id, year, status, total_rows, processed_rows, progress,
    file_name, file_size, is_global, error_message, created_at, updated_at
"#;

/// Create a session in `parsing` state
pub async fn create_session(pool: &PgPool, request: &StartSessionRequest) -> Result<ImportSession> {
    let session = sqlx::query_as::<_, ImportSession>(&format!(
        r#"
        INSERT INTO import_sessions (id, user_id, year, status, file_name, file_size, is_global)
        VALUES ($1, $2, $3, 'parsing', $4, $5, $6)
        RETURNING {}
        "#,
        SESSION_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(request.user_id)
    .bind(request.year)
    .bind(&request.file_data.name)
    .bind(request.file_data.size as i64)
    .bind(request.is_global)
    .fetch_one(pool)
    .await?;

    Ok(session)
}

/// Get a session by ID
pub async fn get_session(pool: &PgPool, id: Uuid) -> Result<Option<ImportSession>> {
    let session = sqlx::query_as::<_, ImportSession>(&format!(
        "SELECT {} FROM import_sessions WHERE id = $1",
        SESSION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(session)
}

/// Record status and progress. Returns false when the session does not exist.
pub async fn update_session(
    pool: &PgPool,
    id: Uuid,
    status: ImportStatus,
    progress: f64,
    error_message: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE import_sessions
        SET status = $2, progress = $3, error_message = $4, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status)
    .bind(progress)
    .bind(error_message)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Record one batch's counters inside the batch transaction and recompute the
/// session totals from them. A retried batch overwrites its own row, so the
/// totals count it once.
pub async fn record_batch(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    batch_index: u64,
    processed_rows: i64,
    total_rows: i64,
) -> Result<()> {
    // Serializes concurrent batches of one session; later statements see
    // every batch committed before the lock was granted
    sqlx::query("SELECT id FROM import_sessions WHERE id = $1 FOR UPDATE")
        .bind(id)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO import_session_batches (session_id, batch_index, processed_rows, total_rows)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (session_id, batch_index) DO UPDATE SET
            processed_rows = EXCLUDED.processed_rows,
            total_rows = EXCLUDED.total_rows,
            updated_at = NOW()
        "#,
    )
    .bind(id)
    .bind(batch_index as i64)
    .bind(processed_rows)
    .bind(total_rows)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE import_sessions s
        SET status = CASE WHEN s.status = 'parsing' THEN 'uploading'::import_status ELSE s.status END,
            processed_rows = b.processed_rows,
            total_rows = b.total_rows,
            updated_at = NOW()
        FROM (
            SELECT COALESCE(SUM(processed_rows), 0)::BIGINT AS processed_rows,
                   COALESCE(SUM(total_rows), 0)::BIGINT AS total_rows
            FROM import_session_batches
            WHERE session_id = $1
        ) b
        WHERE s.id = $1
        "#,
    )
    .bind(id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Mark a session completed at 100%
pub async fn complete_session(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_sessions
        SET status = 'completed', progress = 100, error_message = NULL, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}
