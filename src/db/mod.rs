//! Database module

pub mod queries;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

/// Create a database connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    Ok(pool)
}

/// Run database migrations.
///
/// Applied versions that no longer exist in the binary are reported and
/// skipped instead of failing the run.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);

    let compiled: Vec<i64> = migrator
        .iter()
        .filter(|m| !m.migration_type.is_down_migration())
        .map(|m| m.version)
        .collect();
    info!("Compiled migration versions: {:?}", compiled);

    for version in get_applied_versions(pool).await? {
        if !compiled.contains(&version) {
            warn!("Applied migration {} is unknown to this binary", version);
        }
    }

    migrator.run(pool).await.context("migration failed")?;

    info!("Database migrations complete");
    Ok(())
}

async fn get_applied_versions(pool: &PgPool) -> Result<Vec<i64>> {
    let table_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = '_sqlx_migrations')",
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(vec![]);
    }

    let rows: Vec<(i64,)> = sqlx::query_as("SELECT version FROM _sqlx_migrations ORDER BY version")
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|(v,)| v).collect())
}
