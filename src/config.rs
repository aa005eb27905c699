//! Configuration management

use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};

use crate::defaults;
use crate::services::backend::BackendKind;
use crate::services::batch_processor::RetryPolicy;
use crate::services::session_controller::ControllerConfig;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// Optional NATS credentials
    pub nats_user: Option<String>,
    pub nats_password: Option<String>,

    /// PostgreSQL connection string (only needed by `serve` and `migrate`)
    pub database_url: Option<String>,

    /// Subject of the session endpoint
    pub import_subject: String,

    /// Session endpoint implementation used by `import` and `check-session`
    pub backend: BackendKind,

    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub max_attempts: u32,

    /// Timeout of one request to the session endpoint
    pub request_timeout: Duration,

    /// `PROCESS_BATCH` requests `serve` applies at once
    pub endpoint_max_concurrent_batches: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` (environment in production)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match var("IMPORT_BACKEND") {
            Some(value) => BackendKind::from_str(&value)
                .with_context(|| format!("IMPORT_BACKEND must be 'nats' or 'mock', got '{}'", value))?,
            None => BackendKind::Nats,
        };

        let request_timeout_secs: u64 = parse_positive(
            &var,
            "IMPORT_REQUEST_TIMEOUT_SECS",
            defaults::REQUEST_TIMEOUT.as_secs(),
        )?;

        Ok(Self {
            nats_url: var("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string()),
            nats_user: var("NATS_USER"),
            nats_password: var("NATS_PASSWORD"),
            database_url: var("DATABASE_URL"),
            import_subject: var("IMPORT_SUBJECT").unwrap_or_else(|| defaults::IMPORT_SUBJECT.to_string()),
            backend,
            batch_size: parse_positive(&var, "IMPORT_BATCH_SIZE", defaults::BATCH_SIZE)?,
            max_concurrent_batches: parse_positive(
                &var,
                "IMPORT_MAX_CONCURRENT_BATCHES",
                defaults::MAX_CONCURRENT_BATCHES,
            )?,
            max_attempts: parse_positive(&var, "IMPORT_MAX_ATTEMPTS", defaults::MAX_BATCH_ATTEMPTS)?,
            request_timeout: Duration::from_secs(request_timeout_secs),
            endpoint_max_concurrent_batches: parse_positive(
                &var,
                "ENDPOINT_MAX_CONCURRENT_BATCHES",
                defaults::ENDPOINT_MAX_CONCURRENT_BATCHES,
            )?,
        })
    }

    /// Database URL, required by the server commands
    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }

    /// Import pipeline settings
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            batch_size: self.batch_size,
            max_concurrent_batches: self.max_concurrent_batches,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            ..ControllerConfig::default()
        }
    }
}

fn parse_positive<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = var(key) else {
        return Ok(default);
    };
    let value: T = raw
        .trim()
        .parse()
        .ok()
        .with_context(|| format!("{} must be a positive integer, got '{}'", key, raw))?;
    if value <= T::default() {
        anyhow::bail!("{} must be greater than zero", key);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = assert_ok!(load(&[]));
        assert_eq!(config.nats_url, "nats://localhost:4222");
        assert_eq!(config.import_subject, "revisjon.import.session");
        assert_eq!(config.backend, BackendKind::Nats);
        assert_eq!(config.batch_size, 2_500);
        assert_eq!(config.max_concurrent_batches, 2);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.endpoint_max_concurrent_batches, 4);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_config_database_url_required_only_on_demand() {
        let config = assert_ok!(load(&[]));
        assert_err!(config.require_database_url());

        let config = assert_ok!(load(&[("DATABASE_URL", "postgres://test")]));
        assert_eq!(config.require_database_url().unwrap(), "postgres://test");
    }

    #[test]
    fn test_config_overrides() {
        let config = assert_ok!(load(&[
            ("IMPORT_BACKEND", "mock"),
            ("IMPORT_BATCH_SIZE", "500"),
            ("IMPORT_MAX_ATTEMPTS", "3"),
            ("IMPORT_REQUEST_TIMEOUT_SECS", "5"),
        ]));
        assert_eq!(config.backend, BackendKind::Mock);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.request_timeout, Duration::from_secs(5));

        let controller = config.controller_config();
        assert_eq!(controller.batch_size, 500);
        assert_eq!(controller.retry.max_attempts, 3);
        assert_eq!(controller.retry.saturated_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_config_rejects_invalid_numbers() {
        assert_err!(load(&[("IMPORT_BATCH_SIZE", "lots")]));
        assert_err!(load(&[("IMPORT_MAX_CONCURRENT_BATCHES", "0")]));
        assert_err!(load(&[("IMPORT_MAX_ATTEMPTS", "-1")]));
    }

    #[test]
    fn test_config_rejects_unknown_backend() {
        let err = load(&[("IMPORT_BACKEND", "supabase")]).unwrap_err();
        assert!(err.to_string().contains("IMPORT_BACKEND"));
    }

    #[test]
    fn test_config_blank_values_fall_back_to_defaults() {
        let config = assert_ok!(load(&[("NATS_URL", "  "), ("IMPORT_SUBJECT", "")]));
        assert_eq!(config.nats_url, "nats://localhost:4222");
        assert_eq!(config.import_subject, "revisjon.import.session");
    }
}
