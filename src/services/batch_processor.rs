//! Batch processor
//!
//! Submits row batches to the session endpoint with:
//! - a hard cap on simultaneous submissions (semaphore, default 2)
//! - per-batch retry with linear backoff, longer when the endpoint is saturated
//! - pre-submission filtering of rows that can never be applied
//!
//! A batch that exhausts its retries is recorded as failed; sibling batches
//! keep going. Completion is observed by polling `wait_until_settled`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::defaults;
use crate::error::{BackendError, ImportError};
use crate::services::backend::ImportBackend;
use crate::types::{BatchResult, NormalizedRow, ProcessBatchRequest, ShareholderRecord};

// =============================================================================
// Retry policy
// =============================================================================

/// Retry policy for one batch
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Backoff unit for generic transient errors
    pub base_delay: Duration,
    /// Backoff unit when the endpoint reports worker-pool saturation
    pub saturated_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_BATCH_ATTEMPTS,
            base_delay: defaults::RETRY_BASE_DELAY,
            saturated_delay: defaults::RETRY_SATURATED_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempt` (1-based) failed with `error`
    pub fn delay_for(&self, attempt: u32, error: &BackendError) -> Duration {
        let unit = if error.is_saturation() {
            self.saturated_delay
        } else {
            self.base_delay
        };
        unit * attempt
    }
}

// =============================================================================
// Bookkeeping
// =============================================================================

/// Identity of the session the batches belong to
#[derive(Debug, Clone)]
pub struct BatchTarget {
    pub session_id: Uuid,
    pub year: i32,
    pub is_global: bool,
}

/// Final state of one batch
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub index: u64,
    pub result: BatchResult,
    pub attempts: u32,
    /// Set when the batch failed permanently
    pub error: Option<String>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Counter snapshot taken after a batch settles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSnapshot {
    pub active: u64,
    pub settled: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Rows applied by the endpoint
    pub processed_rows: u64,
    /// Rows contained in settled batches, before filtering
    pub settled_rows: u64,
}

/// Called after every settled batch
pub type SettledHook = Arc<dyn Fn(&BatchOutcome, BatchSnapshot) + Send + Sync>;

#[derive(Default)]
struct Counters {
    active: AtomicU64,
    settled: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    processed_rows: AtomicU64,
    settled_rows: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            active: self.active.load(Ordering::SeqCst),
            settled: self.settled.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            processed_rows: self.processed_rows.load(Ordering::SeqCst),
            settled_rows: self.settled_rows.load(Ordering::SeqCst),
        }
    }
}

struct Inner {
    backend: Arc<dyn ImportBackend>,
    target: BatchTarget,
    semaphore: Semaphore,
    retry: RetryPolicy,
    cancel: CancellationToken,
    counters: Counters,
    outcomes: Mutex<Vec<BatchOutcome>>,
    on_settled: Option<SettledHook>,
}

// =============================================================================
// Processor
// =============================================================================

/// Concurrency-capped batch submitter for one import session
#[derive(Clone)]
pub struct BatchProcessor {
    inner: Arc<Inner>,
}

impl BatchProcessor {
    pub fn new(
        backend: Arc<dyn ImportBackend>,
        target: BatchTarget,
        max_concurrent: usize,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                target,
                semaphore: Semaphore::new(max_concurrent.max(1)),
                retry,
                cancel,
                counters: Counters::default(),
                outcomes: Mutex::new(Vec::new()),
                on_settled: None,
            }),
        }
    }

    /// Install the settle hook. Must be called before the first `submit`.
    pub fn with_settled_hook(mut self, hook: SettledHook) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.on_settled = Some(hook);
        } else {
            warn!("Settled hook installed after batches were submitted; ignoring");
        }
        self
    }

    /// Queue a batch. Returns immediately; the batch waits for a free slot.
    pub fn submit(&self, index: u64, rows: Vec<NormalizedRow>) {
        self.inner.counters.active.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = inner.run_batch(index, rows).await;
            inner.settle(outcome);
        });
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        self.inner.counters.snapshot()
    }

    /// Outcomes of all settled batches, in settle order
    pub fn outcomes(&self) -> Vec<BatchOutcome> {
        self.inner.outcomes.lock().clone()
    }

    /// Poll until no batch is active and at least `expected` batches settled.
    ///
    /// This is a best-effort join: it relies on the counters rather than on
    /// task handles, so batches submitted after the check are not awaited.
    pub async fn wait_until_settled(
        &self,
        expected: u64,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<BatchSnapshot, ImportError> {
        let started = Instant::now();
        loop {
            let snapshot = self.snapshot();
            if snapshot.active == 0 && snapshot.settled >= expected {
                return Ok(snapshot);
            }
            if started.elapsed() >= timeout {
                warn!(
                    "Batches did not settle within {:?}: {} active, {}/{} settled",
                    timeout, snapshot.active, snapshot.settled, expected
                );
                return Err(ImportError::Timeout(timeout));
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(ImportError::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

/// Split rows into submittable records and the reasons for the rest
pub fn filter_rows(rows: Vec<NormalizedRow>) -> (Vec<ShareholderRecord>, Vec<String>) {
    let mut records = Vec::with_capacity(rows.len());
    let mut issues = Vec::new();
    for row in rows {
        match row.into_record() {
            Ok(record) => records.push(record),
            Err(issue) => issues.push(issue.to_string()),
        }
    }
    (records, issues)
}

impl Inner {
    async fn run_batch(&self, index: u64, rows: Vec<NormalizedRow>) -> BatchOutcome {
        let total_rows = rows.len() as u64;
        let mut result = BatchResult {
            processed_rows: 0,
            total_rows,
            errors: Vec::new(),
        };

        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => {
                return BatchOutcome { index, result, attempts: 0, error: Some("cancelled".to_string()) };
            }
            permit = self.semaphore.acquire() => match permit {
                Ok(p) => p,
                Err(e) => {
                    return BatchOutcome { index, result, attempts: 0, error: Some(e.to_string()) };
                }
            }
        };

        let (records, issues) = filter_rows(rows);
        for issue in &issues {
            warn!("Batch {}: dropping {}", index, issue);
        }
        result.errors = issues;

        if records.is_empty() {
            warn!("Batch {}: no valid rows, skipping submission", index);
            return BatchOutcome {
                index,
                result,
                attempts: 0,
                error: Some("batch contains no valid rows".to_string()),
            };
        }

        let request = ProcessBatchRequest {
            session_id: self.target.session_id,
            batch_index: index,
            year: self.target.year,
            batch_data: records,
            is_global: self.target.is_global,
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return BatchOutcome { index, result, attempts: attempt - 1, error: Some("cancelled".to_string()) };
            }

            match self.backend.process_batch(request.clone()).await {
                Ok(remote) => {
                    result.processed_rows = remote.processed_rows;
                    result.errors.extend(remote.errors);
                    debug!(
                        "Batch {} applied {}/{} rows on attempt {}",
                        index, result.processed_rows, total_rows, attempt
                    );
                    return BatchOutcome { index, result, attempts: attempt, error: None };
                }
                Err(e) if !e.is_retryable() || attempt >= self.retry.max_attempts => {
                    warn!("Batch {} failed permanently after {} attempt(s): {}", index, attempt, e);
                    return BatchOutcome { index, result, attempts: attempt, error: Some(e.to_string()) };
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt, &e);
                    warn!(
                        "Batch {} attempt {}/{} failed: {} (retrying in {:?})",
                        index, attempt, self.retry.max_attempts, e, delay
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return BatchOutcome { index, result, attempts: attempt, error: Some("cancelled".to_string()) };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn settle(&self, outcome: BatchOutcome) {
        let c = &self.counters;
        if outcome.succeeded() {
            c.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            c.failed.fetch_add(1, Ordering::SeqCst);
        }
        c.processed_rows.fetch_add(outcome.result.processed_rows, Ordering::SeqCst);
        c.settled_rows.fetch_add(outcome.result.total_rows, Ordering::SeqCst);

        let snapshot = BatchSnapshot {
            active: c.active.load(Ordering::SeqCst).saturating_sub(1),
            settled: c.settled.load(Ordering::SeqCst) + 1,
            ..c.snapshot()
        };
        info!(
            "Batch {} settled ({}): {}/{} rows, {}/{} batches ok",
            outcome.index,
            if outcome.succeeded() { "ok" } else { "failed" },
            outcome.result.processed_rows,
            outcome.result.total_rows,
            snapshot.succeeded,
            snapshot.settled
        );
        if let Some(hook) = &self.on_settled {
            hook(&outcome, snapshot);
        }
        self.outcomes.lock().push(outcome);

        // Publish last so a waiter never sees a settled batch without its outcome
        c.settled.fetch_add(1, Ordering::SeqCst);
        c.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::MockImportBackend;
    use crate::services::normalizer::normalize_row_at;
    use crate::types::{FileData, RawRow, StartSessionRequest};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            saturated_delay: Duration::from_millis(5),
        }
    }

    fn rows(orgnrs: &[&str]) -> Vec<NormalizedRow> {
        orgnrs
            .iter()
            .enumerate()
            .map(|(i, orgnr)| {
                let mut raw = RawRow::new();
                raw.insert("orgnr", (*orgnr).into());
                raw.insert("selskap", "Fjord AS".into());
                raw.insert("navn aksjonær", format!("Holder {}", i).as_str().into());
                raw.insert("antall aksjer", "10".into());
                normalize_row_at(&raw, i as u64 + 1, 2025)
            })
            .collect()
    }

    async fn setup(backend: Arc<MockImportBackend>, max_concurrent: usize) -> BatchProcessor {
        let session_id = backend
            .start_session(StartSessionRequest {
                user_id: Uuid::new_v4(),
                year: 2024,
                file_data: FileData { name: "a.csv".to_string(), size: 1 },
                is_global: false,
            })
            .await
            .unwrap();
        BatchProcessor::new(
            backend,
            BatchTarget { session_id, year: 2024, is_global: false },
            max_concurrent,
            fast_retry(),
            CancellationToken::new(),
        )
    }

    async fn settle(processor: &BatchProcessor, expected: u64) -> BatchSnapshot {
        processor
            .wait_until_settled(expected, Duration::from_millis(5), Duration::from_secs(10))
            .await
            .unwrap()
    }

    #[test]
    fn test_saturation_backoff_grows_and_exceeds_generic() {
        let policy = RetryPolicy::default();
        let saturated = BackendError::WorkerLimit("busy".to_string());
        let generic = BackendError::Transport("reset".to_string());

        let mut previous = Duration::ZERO;
        for attempt in 1..policy.max_attempts {
            let delay = policy.delay_for(attempt, &saturated);
            assert!(delay > previous);
            assert!(delay > policy.delay_for(attempt, &generic));
            previous = delay;
        }
        assert_eq!(policy.delay_for(2, &saturated), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2, &generic), Duration::from_secs(2));
    }

    #[test]
    fn test_filter_rows_drops_invalid_orgnr() {
        let (records, issues) = filter_rows(rows(&["912345678", "1234567", "12345678"]));
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].orgnr, "012345678");
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("row 2"));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_two() {
        let backend = Arc::new(MockImportBackend::new().with_batch_delay(Duration::from_millis(20)));
        let processor = setup(backend.clone(), 2).await;

        for i in 0..10 {
            processor.submit(i, rows(&["912345678"]));
        }
        let snapshot = settle(&processor, 10).await;

        assert_eq!(snapshot.succeeded, 10);
        assert!(backend.max_in_flight() <= 2, "max in flight {}", backend.max_in_flight());
        assert_eq!(backend.batch_calls(), 10);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let backend = Arc::new(MockImportBackend::new());
        backend.fail_next_batches(2, BackendError::Transport("connection reset".to_string()));
        let processor = setup(backend.clone(), 2).await;

        processor.submit(0, rows(&["912345678", "987654321"]));
        let snapshot = settle(&processor, 1).await;

        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.processed_rows, 2);
        assert_eq!(backend.batch_calls(), 3);
        assert_eq!(processor.outcomes()[0].attempts, 3);
    }

    #[tokio::test]
    async fn exhausted_batch_does_not_abort_siblings() {
        let backend = Arc::new(MockImportBackend::new());
        backend.fail_next_batches(5, BackendError::WorkerLimit("WORKER_LIMIT".to_string()));
        let processor = setup(backend.clone(), 1).await;

        processor.submit(0, rows(&["912345678"]));
        processor.submit(1, rows(&["987654321"]));
        let snapshot = settle(&processor, 2).await;

        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(backend.batch_calls(), 6);
        let failed: Vec<_> = processor.outcomes().into_iter().filter(|o| !o.succeeded()).collect();
        assert_eq!(failed[0].attempts, 5);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let backend = Arc::new(MockImportBackend::new());
        backend.fail_all_batches(BackendError::NotFound("session".to_string()));
        let processor = setup(backend.clone(), 2).await;

        processor.submit(0, rows(&["912345678"]));
        let snapshot = settle(&processor, 1).await;

        assert_eq!(snapshot.failed, 1);
        assert_eq!(backend.batch_calls(), 1);
    }

    #[tokio::test]
    async fn batch_result_counts_filtered_rows() {
        let backend = Arc::new(MockImportBackend::new());
        let processor = setup(backend.clone(), 2).await;

        processor.submit(0, rows(&["912345678", "912345679", "1234567", "912345680", "912345681"]));
        settle(&processor, 1).await;

        let outcome = &processor.outcomes()[0];
        assert!(outcome.succeeded());
        assert_eq!(outcome.result.total_rows, 5);
        assert_eq!(outcome.result.processed_rows, 4);
        assert_eq!(outcome.result.errors.len(), 1);
    }

    #[tokio::test]
    async fn all_invalid_batch_fails_without_remote_call() {
        let backend = Arc::new(MockImportBackend::new());
        let processor = setup(backend.clone(), 2).await;

        processor.submit(0, rows(&["1", "22"]));
        let snapshot = settle(&processor, 1).await;

        assert_eq!(snapshot.failed, 1);
        assert_eq!(backend.batch_calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_processor_starts_no_submissions() {
        let backend = Arc::new(MockImportBackend::new());
        let processor = setup(backend.clone(), 2).await;
        processor.inner.cancel.cancel();

        processor.submit(0, rows(&["912345678"]));
        // wait_until_settled reports the cancellation itself
        let result = processor
            .wait_until_settled(1, Duration::from_millis(5), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ImportError::Cancelled)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.batch_calls(), 0);
    }

    #[tokio::test]
    async fn wait_until_settled_times_out() {
        let backend = Arc::new(MockImportBackend::new().with_batch_delay(Duration::from_millis(200)));
        let processor = setup(backend, 2).await;

        processor.submit(0, rows(&["912345678"]));
        let result = processor
            .wait_until_settled(1, Duration::from_millis(5), Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(ImportError::Timeout(_))));
    }
}
