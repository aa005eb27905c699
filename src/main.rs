//! Revisjon Import - shareholder-register bulk import
//!
//! `serve` runs the session endpoint on NATS backed by PostgreSQL; `import`
//! streams a register file through the batch pipeline against that endpoint.

mod cli;
mod config;
mod db;
mod defaults;
mod error;
mod handlers;
mod services;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::services::backend::{BackendKind, ImportBackend, MockImportBackend, NatsImportBackend};
use crate::services::session_controller::ImportController;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs directory - use LOGS_DIR env var or default to ./logs
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "./logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "import.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,revisjon_import=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!("Configuration loaded");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config).await,
        Command::Migrate => {
            let pool = db::create_pool(config.require_database_url()?, 2).await?;
            db::run_migrations(&pool).await
        }
        Command::Import { file, year, user, global } => {
            let backend = create_backend(&config).await?;
            let controller = ImportController::new(backend, config.controller_config());
            let user_id = user.unwrap_or_else(Uuid::nil);

            // Ctrl-C cancels the run; the import call then returns `Cancelled`
            let controller = Arc::new(controller);
            let on_signal = Arc::clone(&controller);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling import");
                    on_signal.cancel();
                }
            });

            let outcome = controller
                .start_import(&file, user_id, year, global)
                .await
                .with_context(|| format!("import of {} failed", file.display()))?;
            println!("{}", outcome.report());
            Ok(())
        }
        Command::CheckSession { session_id } => {
            let backend = create_backend(&config).await?;
            let controller = ImportController::new(backend, config.controller_config());
            match controller.check_session(session_id).await? {
                Some(session) => println!("{}", serde_json::to_string_pretty(&session)?),
                None => println!("Session {} not found", session_id),
            }
            Ok(())
        }
    }
}

async fn serve(config: &Config) -> Result<()> {
    info!("Starting Revisjon import endpoint...");

    let pool = db::create_pool(config.require_database_url()?, 10).await?;
    info!("Connected to PostgreSQL");

    db::run_migrations(&pool).await?;

    let client = connect_nats(config).await?;

    let handler_result = handlers::start_handlers(client, pool, config).await;
    if let Err(e) = handler_result {
        error!("Handler error: {}", e);
        return Err(e);
    }

    Ok(())
}

/// Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth)
async fn connect_nats(config: &Config) -> Result<async_nats::Client> {
    let client = match (&config.nats_user, &config.nats_password) {
        (Some(user), Some(password)) => {
            async_nats::ConnectOptions::new()
                .user_and_password(user.clone(), password.clone())
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);
    Ok(client)
}

async fn create_backend(config: &Config) -> Result<Arc<dyn ImportBackend>> {
    let backend: Arc<dyn ImportBackend> = match config.backend {
        BackendKind::Nats => {
            let client = connect_nats(config).await?;
            Arc::new(NatsImportBackend::new(
                client,
                config.import_subject.clone(),
                config.request_timeout,
            ))
        }
        BackendKind::Mock => {
            warn!("Using in-memory session endpoint; nothing will be persisted");
            Arc::new(MockImportBackend::new())
        }
    };
    info!("Session endpoint backend: {}", backend.name());
    Ok(backend)
}
