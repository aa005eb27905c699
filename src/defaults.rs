use std::time::Duration;

/// Default NATS subject of the session endpoint
pub const IMPORT_SUBJECT: &str = "revisjon.import.session";

pub const PING_SUBJECT: &str = "revisjon.ping";

/// Rows per `PROCESS_BATCH` request
pub const BATCH_SIZE: usize = 2_500;

/// Batch submissions in flight per import
pub const MAX_CONCURRENT_BATCHES: usize = 2;

/// Attempts per batch, including the first
pub const MAX_BATCH_ATTEMPTS: u32 = 5;

/// Backoff unit for transient failures (delay = unit x attempt)
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Backoff unit when the endpoint reports `WORKER_LIMIT`
pub const RETRY_SATURATED_DELAY: Duration = Duration::from_secs(5);

pub const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Parser emits a `Progress` event every this many rows
pub const PROGRESS_EVERY_ROWS: u64 = 1_000;

/// Timeout of a single request to the session endpoint
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// `PROCESS_BATCH` requests the endpoint applies at once
pub const ENDPOINT_MAX_CONCURRENT_BATCHES: usize = 4;
