//! Import session controller
//!
//! Drives one import run through the session state machine:
//!
//! ```text
//! idle -> parsing -> uploading -> aggregating -> completed
//!            \           |  ^          |
//!             \          v  |          |
//!              \       paused          |
//!               `-------> error <------'
//! ```
//!
//! The controller owns the progress record. Every change goes through one
//! reducer that validates the status edge and never lowers the percentage
//! within a run; observers subscribe to a `watch` channel.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::defaults;
use crate::error::ImportError;
use crate::services::backend::ImportBackend;
use crate::services::batch_processor::{
    BatchOutcome, BatchProcessor, BatchSnapshot, BatchTarget, RetryPolicy,
};
use crate::services::parser::{self, FileFormat, LogLevel, WorkerCommand, WorkerEvent};
use crate::types::{
    FileData, FinishSessionRequest, FinishSummary, ImportProgress, ImportSession, ImportStatus,
    ProgressScale, StartSessionRequest, UpdateSessionRequest,
};

/// Upper bound on error lines kept for the final report
const MAX_ERROR_SAMPLES: usize = 100;

// =============================================================================
// Configuration & outcome
// =============================================================================

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub retry: RetryPolicy,
    /// Interval of the batch-settle poll
    pub poll_interval: Duration,
    /// Absolute limit for all batches to settle after parsing ends
    pub settle_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            max_concurrent_batches: defaults::MAX_CONCURRENT_BATCHES,
            retry: RetryPolicy::default(),
            poll_interval: defaults::SETTLE_POLL_INTERVAL,
            settle_timeout: defaults::SETTLE_TIMEOUT,
        }
    }
}

/// Result of a completed import run
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub session_id: Uuid,
    pub file_name: String,
    pub summary: FinishSummary,
    pub total_rows: u64,
    pub valid_rows: u64,
    pub invalid_rows: u64,
    pub processed_rows: u64,
    pub total_batches: u64,
    pub failed_batches: u64,
    /// Sampled row and batch errors
    pub errors: Vec<String>,
}

impl ImportOutcome {
    /// Human-readable summary for logs and the CLI
    pub fn report(&self) -> String {
        let mut report = format!("Import av aksjonærregister fra fil '{}'\n", self.file_name);
        report.push_str(&format!("Økt: {}\n", self.session_id));
        report.push_str(&format!("År: {}\n", self.summary.year));
        report.push_str(&format!("Rader totalt: {}\n", self.total_rows));
        report.push_str(&format!("Rader importert: {}\n", self.processed_rows));
        report.push_str(&format!("Ugyldige rader: {}\n", self.invalid_rows));
        report.push_str(&format!(
            "Batcher: {} ({} feilet)\n",
            self.total_batches, self.failed_batches
        ));
        report.push_str(&format!(
            "Selskaper: {}, aksjonærer: {}, eierposter: {}\n",
            self.summary.companies, self.summary.entities, self.summary.holdings
        ));

        if !self.errors.is_empty() {
            report.push_str("\nFeil:\n");
            for (i, err) in self.errors.iter().take(20).enumerate() {
                report.push_str(&format!("{}. {}\n", i + 1, err));
            }
            if self.errors.len() > 20 {
                report.push_str(&format!("... og {} flere feil\n", self.errors.len() - 20));
            }
        }

        report
    }
}

// =============================================================================
// Progress reducer
// =============================================================================

/// Apply `change` to the progress record.
///
/// Rejects status edges the state machine does not allow and keeps the
/// percentage from going down, except on a reset to `Idle`.
fn reduce(
    progress: &watch::Sender<ImportProgress>,
    change: impl FnOnce(&mut ImportProgress),
) -> Result<(), ImportError> {
    let mut rejected = None;
    progress.send_modify(|current| {
        let mut next = current.clone();
        change(&mut next);

        if next.status != current.status && !current.status.can_transition_to(next.status) {
            rejected = Some(ImportError::InvalidTransition {
                from: current.status,
                to: next.status,
            });
            return;
        }
        if next.status != ImportStatus::Idle {
            next.progress = next.progress.max(current.progress).min(ProgressScale::COMPLETED);
        }
        *current = next;
    });
    match rejected {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn transition(progress: &watch::Sender<ImportProgress>, status: ImportStatus) -> Result<(), ImportError> {
    reduce(progress, |p| p.status = status)
}

// =============================================================================
// Controller
// =============================================================================

struct ActiveImport {
    cancel: CancellationToken,
    commands: Option<std::sync::mpsc::Sender<WorkerCommand>>,
}

/// Orchestrates parser, batch processor and session endpoint for one import
/// at a time
pub struct ImportController {
    backend: Arc<dyn ImportBackend>,
    config: ControllerConfig,
    progress: Arc<watch::Sender<ImportProgress>>,
    active: Mutex<Option<ActiveImport>>,
}

impl ImportController {
    pub fn new(backend: Arc<dyn ImportBackend>, config: ControllerConfig) -> Self {
        let (progress, _) = watch::channel(ImportProgress::default());
        Self {
            backend,
            config,
            progress: Arc::new(progress),
            active: Mutex::new(None),
        }
    }

    /// Live progress of the current (or last) run
    pub fn subscribe(&self) -> watch::Receiver<ImportProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> ImportProgress {
        self.progress.borrow().clone()
    }

    pub fn status(&self) -> ImportStatus {
        self.progress.borrow().status
    }

    /// Import `path` for `year`. Resolves when the run completes, fails or is
    /// cancelled.
    pub async fn start_import(
        &self,
        path: &Path,
        user_id: Uuid,
        year: i32,
        is_global: bool,
    ) -> Result<ImportOutcome, ImportError> {
        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock();
            if active.is_some() {
                return Err(ImportError::AlreadyRunning);
            }
            *active = Some(ActiveImport {
                cancel: cancel.clone(),
                commands: None,
            });
        }

        let result = match self.run(path, user_id, year, is_global, cancel.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Errors raised while a cancel was in progress are the cancel
                let err = if cancel.is_cancelled() { ImportError::Cancelled } else { err };
                cancel.cancel();
                Err(self.fail(err).await)
            }
        };
        *self.active.lock() = None;
        result
    }

    /// Ask the CSV worker to pause. Status follows once the worker confirms.
    pub fn pause(&self) -> Result<(), ImportError> {
        self.forward(WorkerCommand::Pause, ImportStatus::Paused)
    }

    pub fn resume(&self) -> Result<(), ImportError> {
        self.forward(WorkerCommand::Resume, ImportStatus::Uploading)
    }

    /// Stop the worker and all pending batches, reset progress to idle
    pub fn cancel(&self) {
        let active = self.active.lock();
        if let Some(active) = active.as_ref() {
            info!("Cancelling import");
            active.cancel.cancel();
            if let Some(commands) = &active.commands {
                let _ = commands.send(WorkerCommand::Cancel);
            }
        }
        drop(active);
        self.progress.send_replace(ImportProgress::default());
    }

    /// Server-side record of a session, `None` when unknown
    pub async fn check_session(&self, session_id: Uuid) -> Result<Option<ImportSession>, ImportError> {
        let session = self.backend.check_session(session_id).await?;
        match &session {
            Some(s) => debug!(
                "Session {} is {} ({}/{} rows, resumable: {})",
                s.id,
                s.status,
                s.processed_rows,
                s.total_rows,
                s.is_resumable()
            ),
            None => debug!("Session {} not found", session_id),
        }
        Ok(session)
    }

    fn forward(&self, command: WorkerCommand, target: ImportStatus) -> Result<(), ImportError> {
        let status = self.status();
        let invalid = || ImportError::InvalidTransition { from: status, to: target };
        if !status.can_transition_to(target) {
            return Err(invalid());
        }
        let active = self.active.lock();
        let commands = active
            .as_ref()
            .and_then(|a| a.commands.as_ref())
            .ok_or_else(invalid)?;
        commands.send(command).map_err(|_| invalid())
    }

    async fn run(
        &self,
        path: &Path,
        user_id: Uuid,
        year: i32,
        is_global: bool,
        cancel: CancellationToken,
    ) -> Result<ImportOutcome, ImportError> {
        let file_name = parser::file_name_of(path);
        self.progress.send_replace(ImportProgress {
            file_name: Some(file_name.clone()),
            message: Some("Starter import".to_string()),
            ..Default::default()
        });
        transition(&self.progress, ImportStatus::Parsing)?;

        let format = FileFormat::detect(path)?;
        let file_size = tokio::fs::metadata(path)
            .await
            .map(|m| m.len())
            .map_err(|e| ImportError::Parse(format!("cannot read {}: {}", path.display(), e)))?;

        let session_id = self
            .backend
            .start_session(StartSessionRequest {
                user_id,
                year,
                file_data: FileData { name: file_name.clone(), size: file_size },
                is_global,
            })
            .await
            .map_err(ImportError::SessionStart)?;
        reduce(&self.progress, |p| p.session_id = Some(session_id))?;
        info!(
            "Import session {} started for {} ({} bytes, {:?}, year {}, global: {})",
            session_id, file_name, file_size, format, year, is_global
        );

        let mut worker = parser::spawn_parser(path, self.config.batch_size)?;
        if let Some(active) = self.active.lock().as_mut() {
            active.commands = worker.commands();
        }

        let progress = Arc::clone(&self.progress);
        let processor = BatchProcessor::new(
            Arc::clone(&self.backend),
            BatchTarget { session_id, year, is_global },
            self.config.max_concurrent_batches,
            self.config.retry.clone(),
            cancel.clone(),
        )
        .with_settled_hook({
            let cancel = cancel.clone();
            Arc::new(move |outcome: &BatchOutcome, snapshot: BatchSnapshot| {
                on_batch_settled(&progress, &cancel, outcome, snapshot);
            })
        });

        // Parse, handing batches to the processor as they arrive
        let mut expected_batches = None;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ImportError::Cancelled),
                event = worker.events.recv() => event,
            };
            let Some(event) = event else { break };

            match event {
                WorkerEvent::Log { level, message } => match level {
                    LogLevel::Info => info!("{}", message),
                    LogLevel::Warn => warn!("{}", message),
                    LogLevel::Error => warn!("Row rejected: {}", message),
                },
                WorkerEvent::ParseStart { file_name, file_size } => {
                    debug!("Parser started on {} ({} bytes)", file_name, file_size);
                }
                WorkerEvent::Progress {
                    rows_read,
                    valid_rows,
                    invalid_rows,
                    bytes_read,
                    file_size,
                    memory_estimate_bytes,
                } => {
                    debug!(
                        "Parsed {} rows ({} bytes of {}, ~{} bytes buffered)",
                        rows_read, bytes_read, file_size, memory_estimate_bytes
                    );
                    let fraction = if file_size == 0 { 1.0 } else { bytes_read as f64 / file_size as f64 };
                    reduce(&self.progress, |p| {
                        p.total_rows = rows_read;
                        p.valid_rows = valid_rows;
                        p.invalid_rows = invalid_rows;
                        p.parsed_fraction = p.parsed_fraction.max(fraction.clamp(0.0, 1.0));
                        p.progress = ProgressScale::parsing(fraction);
                    })?;
                }
                WorkerEvent::BatchReady { batch_index, rows } => {
                    if self.status() == ImportStatus::Parsing {
                        transition(&self.progress, ImportStatus::Uploading)?;
                    }
                    reduce(&self.progress, |p| {
                        p.total_batches = p.total_batches.max(batch_index + 1);
                        p.message = Some(format!("Laster opp batch {}", batch_index + 1));
                    })?;
                    processor.submit(batch_index, rows);
                }
                WorkerEvent::ParseComplete {
                    total_rows,
                    valid_rows,
                    invalid_rows,
                    total_batches,
                } => {
                    info!(
                        "Parsed {}: {} rows ({} valid, {} invalid) in {} batches",
                        file_name, total_rows, valid_rows, invalid_rows, total_batches
                    );
                    reduce(&self.progress, |p| {
                        p.total_rows = total_rows;
                        p.valid_rows = valid_rows;
                        p.invalid_rows = invalid_rows;
                        p.total_batches = total_batches;
                        p.parsed_fraction = 1.0;
                    })?;
                    expected_batches = Some(total_batches);
                    break;
                }
                WorkerEvent::Error { message } => return Err(ImportError::Parse(message)),
                WorkerEvent::Paused => {
                    transition(&self.progress, ImportStatus::Paused)?;
                    info!("Import paused");
                }
                WorkerEvent::Resumed => {
                    transition(&self.progress, ImportStatus::Uploading)?;
                    info!("Import resumed");
                }
            }
        }

        let Some(expected_batches) = expected_batches else {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }
            return Err(ImportError::Parse("parser stopped before completing".to_string()));
        };

        let snapshot = processor
            .wait_until_settled(expected_batches, self.config.poll_interval, self.config.settle_timeout)
            .await?;

        let errors = collect_errors(&processor.outcomes());
        if snapshot.succeeded == 0 {
            return Err(ImportError::NoSuccessfulBatches { failed: snapshot.failed });
        }
        if snapshot.failed > 0 {
            warn!(
                "{} of {} batches failed permanently; continuing with partial data",
                snapshot.failed, snapshot.settled
            );
        }

        reduce(&self.progress, |p| {
            p.status = ImportStatus::Aggregating;
            p.progress = ProgressScale::AGGREGATING;
            p.message = Some("Aggregerer".to_string());
        })?;

        let summary = self
            .backend
            .finish_session(FinishSessionRequest { session_id, year, is_global })
            .await
            .map_err(ImportError::Aggregation)?;

        reduce(&self.progress, |p| {
            p.status = ImportStatus::Completed;
            p.progress = ProgressScale::COMPLETED;
            p.message = Some("Import fullført".to_string());
        })?;
        info!(
            "Import session {} completed: {} companies, {} holdings, {} entities",
            session_id, summary.companies, summary.holdings, summary.entities
        );

        let progress = self.progress();
        Ok(ImportOutcome {
            session_id,
            file_name,
            summary,
            total_rows: progress.total_rows,
            valid_rows: progress.valid_rows,
            invalid_rows: progress.invalid_rows,
            processed_rows: snapshot.processed_rows,
            total_batches: expected_batches,
            failed_batches: snapshot.failed,
            errors,
        })
    }

    /// Record a fatal error. Cancellation resets to idle instead.
    async fn fail(&self, err: ImportError) -> ImportError {
        let current = self.progress();

        if let Some(active) = self.active.lock().as_ref() {
            if let Some(commands) = &active.commands {
                let _ = commands.send(WorkerCommand::Cancel);
            }
        }

        // A cancelled session record is left as it was
        if matches!(err, ImportError::Cancelled) {
            info!("Import cancelled");
            self.progress.send_replace(ImportProgress::default());
            return err;
        }

        error!("Import failed: {}", err);
        let message = err.to_string();
        if let Err(e) = reduce(&self.progress, |p| {
            p.status = ImportStatus::Error;
            p.error = Some(message.clone());
            p.message = None;
        }) {
            warn!("Could not record error status: {}", e);
        }

        if let Some(session_id) = current.session_id {
            let request = UpdateSessionRequest {
                session_id,
                status: ImportStatus::Error,
                progress: current.progress,
                error_message: Some(err.to_string()),
            };
            if let Err(e) = self.backend.update_session(request).await {
                warn!("Could not mark session {} as failed: {}", session_id, e);
            }
        }
        err
    }
}

/// Fold a settled batch into the progress record. Settles that arrive after
/// the run was cancelled are dropped; the check runs under the channel lock
/// so it cannot interleave with the reset in `cancel`.
fn on_batch_settled(
    progress: &watch::Sender<ImportProgress>,
    cancel: &CancellationToken,
    outcome: &BatchOutcome,
    snapshot: BatchSnapshot,
) {
    if let Some(err) = &outcome.error {
        warn!("Batch {} failed: {}", outcome.index, err);
    }
    let result = reduce(progress, |p| {
        if cancel.is_cancelled() {
            return;
        }
        p.processed_rows = snapshot.processed_rows;
        p.completed_batches = snapshot.succeeded;
        p.failed_batches = snapshot.failed;
        if matches!(p.status, ImportStatus::Uploading | ImportStatus::Paused) {
            let fraction = upload_fraction(snapshot.settled, p.total_batches, p.parsed_fraction);
            p.progress = ProgressScale::uploading(fraction);
        }
    });
    if let Err(e) = result {
        warn!("Progress update rejected: {}", e);
    }
}

/// Share of the upload phase done. While parsing is still running the batch
/// total is not known, so the settled share of the batches seen so far is
/// scaled by the share of the file read.
fn upload_fraction(settled: u64, batches_seen: u64, parsed_fraction: f64) -> f64 {
    let seen = batches_seen.max(settled).max(1);
    settled as f64 / seen as f64 * parsed_fraction.clamp(0.0, 1.0)
}

fn collect_errors(outcomes: &[BatchOutcome]) -> Vec<String> {
    let mut sorted: Vec<&BatchOutcome> = outcomes.iter().collect();
    sorted.sort_by_key(|o| o.index);

    let mut errors = Vec::new();
    for outcome in sorted {
        if let Some(err) = &outcome.error {
            errors.push(format!("batch {}: {}", outcome.index + 1, err));
        }
        errors.extend(outcome.result.errors.iter().cloned());
        if errors.len() >= MAX_ERROR_SAMPLES {
            errors.truncate(MAX_ERROR_SAMPLES);
            break;
        }
    }
    errors
}
