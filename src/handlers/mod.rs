//! NATS message handlers

pub mod import_session;
pub mod ping;

use anyhow::Result;
use async_nats::Client;
use sqlx::PgPool;
use tokio::select;
use tracing::{error, info};

use crate::config::Config;
use crate::defaults;

/// Subscribe to all subjects and run the handlers until one of them stops
pub async fn start_handlers(client: Client, pool: PgPool, config: &Config) -> Result<()> {
    let ping_sub = client.subscribe(defaults::PING_SUBJECT).await?;
    let session_sub = client.subscribe(config.import_subject.clone()).await?;

    info!(
        "Subscribed to {} and {} (batch slots: {})",
        defaults::PING_SUBJECT, config.import_subject, config.endpoint_max_concurrent_batches
    );

    let ping_handle = tokio::spawn(ping::handle_ping(client.clone(), ping_sub, pool.clone()));
    let session_handle = tokio::spawn(import_session::handle_import_session(
        client.clone(),
        session_sub,
        pool,
        config.endpoint_max_concurrent_batches,
    ));

    select! {
        result = ping_handle => {
            error!("Ping handler finished: {:?}", result);
        }
        result = session_handle => {
            error!("Import session handler finished: {:?}", result);
        }
    }

    Ok(())
}
