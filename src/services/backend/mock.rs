//! In-memory session endpoint
//!
//! Applies the same keyed-upsert rules as the Postgres endpoint so dry runs
//! report realistic summary counts. Failure injection and call accounting
//! make it the test double for the batch processor and controller.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::ImportBackend;
use crate::error::BackendError;
use crate::types::{
    BatchResult, FinishSessionRequest, FinishSummary, ImportSession, ImportStatus,
    ProcessBatchRequest, ProgressScale, StartSessionRequest, UpdateSessionRequest,
};

/// (scope, year, orgnr)
type CompanyKey = (Uuid, i32, String);
/// (scope, year, company orgnr, entity key, share class)
type HoldingKey = (Uuid, i32, String, String, String);

#[derive(Default)]
struct Store {
    sessions: HashMap<Uuid, ImportSession>,
    companies: HashMap<CompanyKey, Option<i64>>,
    entities: HashSet<(Uuid, String)>,
    holdings: HashMap<HoldingKey, i64>,
    /// (session, batch index) -> (processed rows, total rows)
    batches: HashMap<(Uuid, u64), (i64, i64)>,
}

/// In-memory backend
#[derive(Default)]
pub struct MockImportBackend {
    store: Mutex<Store>,
    batch_delay: Mutex<Duration>,
    injected_failures: Mutex<VecDeque<BackendError>>,
    permanent_failure: Mutex<Option<BackendError>>,
    finish_failure: Mutex<Option<BackendError>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl MockImportBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every `PROCESS_BATCH` call for `delay` before answering
    pub fn with_batch_delay(self, delay: Duration) -> Self {
        *self.batch_delay.lock() = delay;
        self
    }

    /// Fail the next `count` batch calls with `error`, then recover
    pub fn fail_next_batches(&self, count: usize, error: BackendError) {
        let mut queue = self.injected_failures.lock();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Fail every batch call with `error`
    pub fn fail_all_batches(&self, error: BackendError) {
        *self.permanent_failure.lock() = Some(error);
    }

    pub fn fail_finish(&self, error: BackendError) {
        *self.finish_failure.lock() = Some(error);
    }

    /// Highest number of simultaneous `PROCESS_BATCH` calls observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn session(&self, session_id: Uuid) -> Option<ImportSession> {
        self.store.lock().sessions.get(&session_id).cloned()
    }

    fn next_failure(&self) -> Option<BackendError> {
        if let Some(error) = self.injected_failures.lock().pop_front() {
            return Some(error);
        }
        self.permanent_failure.lock().clone()
    }
}

#[async_trait]
impl ImportBackend for MockImportBackend {
    async fn start_session(&self, request: StartSessionRequest) -> Result<Uuid, BackendError> {
        let now = Utc::now();
        let session = ImportSession {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            year: request.year,
            status: ImportStatus::Parsing,
            total_rows: 0,
            processed_rows: 0,
            progress: 0.0,
            file_name: request.file_data.name,
            file_size: request.file_data.size as i64,
            is_global: request.is_global,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        let id = session.id;
        self.store.lock().sessions.insert(id, session);
        Ok(id)
    }

    async fn process_batch(&self, request: ProcessBatchRequest) -> Result<BatchResult, BackendError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let delay = *self.batch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.next_failure() {
            return Err(error);
        }

        let mut store = self.store.lock();
        let Some(session) = store.sessions.get(&request.session_id).cloned() else {
            return Err(BackendError::NotFound(request.session_id.to_string()));
        };
        let scope = session.scope(request.is_global);

        for record in &request.batch_data {
            let entity_key = record.entity_key();
            store
                .companies
                .entry((scope, request.year, record.orgnr.clone()))
                .and_modify(|total| *total = record.total_shares.or(*total))
                .or_insert(record.total_shares);
            store.entities.insert((scope, entity_key.clone()));
            store.holdings.insert(
                (
                    scope,
                    request.year,
                    record.orgnr.clone(),
                    entity_key,
                    record.share_class.clone(),
                ),
                record.shares,
            );
        }

        let processed = request.batch_data.len() as u64;
        store.batches.insert(
            (request.session_id, request.batch_index),
            (processed as i64, processed as i64),
        );
        let (processed_rows, total_rows) = store
            .batches
            .iter()
            .filter(|((id, _), _)| *id == request.session_id)
            .fold((0i64, 0i64), |(p, t), (_, (bp, bt))| (p + *bp, t + *bt));
        if let Some(s) = store.sessions.get_mut(&request.session_id) {
            s.status = ImportStatus::Uploading;
            s.processed_rows = processed_rows;
            s.total_rows = total_rows;
            s.updated_at = Utc::now();
        }

        Ok(BatchResult {
            processed_rows: processed,
            total_rows: processed,
            errors: Vec::new(),
        })
    }

    async fn finish_session(&self, request: FinishSessionRequest) -> Result<FinishSummary, BackendError> {
        if let Some(error) = self.finish_failure.lock().clone() {
            return Err(error);
        }

        let mut guard = self.store.lock();
        let store = &mut *guard;
        let Some(session) = store.sessions.get(&request.session_id).cloned() else {
            return Err(BackendError::NotFound(request.session_id.to_string()));
        };
        let scope = session.scope(request.is_global);

        let mut sums: HashMap<String, i64> = HashMap::new();
        let mut entities: HashSet<&str> = HashSet::new();
        let mut holdings = 0i64;
        for ((s, year, orgnr, entity, _), shares) in &store.holdings {
            if *s == scope && *year == request.year {
                *sums.entry(orgnr.clone()).or_default() += shares;
                entities.insert(entity.as_str());
                holdings += 1;
            }
        }
        let entity_count = entities.len() as i64;

        let mut companies = 0i64;
        for ((s, year, orgnr), total) in store.companies.iter_mut() {
            if *s == scope && *year == request.year {
                companies += 1;
                if total.unwrap_or(0) == 0 {
                    *total = sums.get(orgnr).copied();
                }
            }
        }

        if let Some(s) = store.sessions.get_mut(&request.session_id) {
            s.status = ImportStatus::Completed;
            s.progress = ProgressScale::COMPLETED;
            s.updated_at = Utc::now();
        }

        Ok(FinishSummary {
            companies,
            holdings,
            entities: entity_count,
            year: request.year,
        })
    }

    async fn check_session(&self, session_id: Uuid) -> Result<Option<ImportSession>, BackendError> {
        Ok(self.store.lock().sessions.get(&session_id).cloned())
    }

    async fn update_session(&self, request: UpdateSessionRequest) -> Result<(), BackendError> {
        let mut store = self.store.lock();
        let session = store
            .sessions
            .get_mut(&request.session_id)
            .ok_or_else(|| BackendError::NotFound(request.session_id.to_string()))?;
        session.status = request.status;
        session.progress = request.progress;
        session.error_message = request.error_message;
        session.updated_at = Utc::now();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileData, Holder, ShareholderRecord};

    fn record(orgnr: &str, holder: &str, shares: i64) -> ShareholderRecord {
        ShareholderRecord {
            row_number: 1,
            orgnr: orgnr.to_string(),
            company_name: "Fjord AS".to_string(),
            share_class: "Ordinære".to_string(),
            holder_name: holder.to_string(),
            holder: Holder::Person { birth_year: Some(1970), country_code: "NO".to_string() },
            postal_place: None,
            shares,
            total_shares: None,
        }
    }

    async fn start(backend: &MockImportBackend) -> Uuid {
        backend
            .start_session(StartSessionRequest {
                user_id: Uuid::new_v4(),
                year: 2024,
                file_data: FileData { name: "a.csv".to_string(), size: 10 },
                is_global: false,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn mock_check_unknown_session_returns_none() {
        let backend = MockImportBackend::new();
        let result = backend.check_session(Uuid::new_v4()).await;
        assert_eq!(result.unwrap().map(|s| s.id), None);
    }

    #[tokio::test]
    async fn mock_upserts_are_idempotent_across_retries() {
        let backend = MockImportBackend::new();
        let session_id = start(&backend).await;
        let batch = vec![record("912345678", "Ola", 10), record("912345678", "Kari", 30)];

        for _ in 0..2 {
            backend
                .process_batch(ProcessBatchRequest {
                    session_id,
                    batch_index: 0,
                    year: 2024,
                    batch_data: batch.clone(),
                    is_global: false,
                })
                .await
                .unwrap();
        }

        let summary = backend
            .finish_session(FinishSessionRequest { session_id, year: 2024, is_global: false })
            .await
            .unwrap();
        assert_eq!(summary.companies, 1);
        assert_eq!(summary.holdings, 2);
        assert_eq!(summary.entities, 2);
        let session = backend.session(session_id).unwrap();
        assert_eq!(session.status, ImportStatus::Completed);
        assert_eq!(session.processed_rows, 2);
        assert_eq!(session.total_rows, 2);
    }

    #[tokio::test]
    async fn mock_session_totals_sum_distinct_batches() {
        let backend = MockImportBackend::new();
        let session_id = start(&backend).await;

        for (batch_index, rows) in [(0, 2), (1, 1), (0, 2)] {
            let batch_data = (0..rows).map(|i| record("912345678", &format!("Holder {}", i), 1)).collect();
            backend
                .process_batch(ProcessBatchRequest {
                    session_id,
                    batch_index,
                    year: 2024,
                    batch_data,
                    is_global: false,
                })
                .await
                .unwrap();
        }

        let session = backend.session(session_id).unwrap();
        assert_eq!(session.processed_rows, 3);
        assert_eq!(session.total_rows, 3);
    }

    #[tokio::test]
    async fn mock_injected_failures_are_consumed_in_order() {
        let backend = MockImportBackend::new();
        let session_id = start(&backend).await;
        backend.fail_next_batches(1, BackendError::WorkerLimit("busy".to_string()));

        let request = ProcessBatchRequest {
            session_id,
            batch_index: 0,
            year: 2024,
            batch_data: vec![record("912345678", "Ola", 1)],
            is_global: false,
        };
        assert!(backend.process_batch(request.clone()).await.is_err());
        assert!(backend.process_batch(request).await.is_ok());
        assert_eq!(backend.batch_calls(), 2);
    }
}
