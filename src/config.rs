//! Runtime configuration for the relay.
//!
//! This module collects everything the relay reads at startup: the ordered
//! worker endpoint list, per-route timeouts, the queue attempt policy and
//! the retention window for finished jobs.

use std::time::Duration;

use thiserror::Error;

/// Concurrency used when the worker count is not known yet.
const DEFAULT_CONCURRENCY: usize = 3;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Per-route timeouts for worker calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTimeouts {
    /// `GET /health`.
    pub health: Duration,
    /// `POST /search`.
    pub search: Duration,
    /// `POST /session/refresh`.
    pub refresh: Duration,
    /// `POST /browser/restart`.
    pub restart: Duration,
    /// `POST /tabs/search`.
    pub warmup: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self {
            health: Duration::from_secs(5),
            search: Duration::from_secs(180),
            refresh: Duration::from_secs(60),
            restart: Duration::from_secs(90),
            warmup: Duration::from_secs(60),
        }
    }
}

/// Configuration for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    // Worker settings
    /// Ordered worker endpoints; position `i` is worker `i + 1`.
    pub worker_urls: Vec<String>,
    /// Timeouts applied to each worker route.
    pub timeouts: WorkerTimeouts,

    // Queue settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Queue name, used as the Redis key prefix.
    pub queue_name: String,
    /// Attempts per job before it is marked failed.
    pub job_attempts: u32,
    /// Base delay of the exponential backoff between attempts.
    pub job_backoff: Duration,
    /// Hard limit for a single attempt.
    pub job_timeout: Duration,
    /// How long completed and failed jobs are kept.
    pub job_retention: Duration,

    // Scheduler settings
    /// Number of jobs executed concurrently. `None` derives it from the
    /// worker count.
    pub concurrency: Option<usize>,
    /// How long an idle runner waits before polling again.
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_urls: Vec::new(),
            timeouts: WorkerTimeouts::default(),

            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "prompt-relay".to_string(),
            job_attempts: 3,
            job_backoff: Duration::from_secs(5),
            job_timeout: Duration::from_secs(600),
            job_retention: Duration::from_secs(24 * 60 * 60),

            concurrency: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl RelayConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RELAY_WORKER_URLS`: Comma-separated worker endpoints (required)
    /// - `RELAY_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `RELAY_QUEUE_NAME`: Queue name (default: prompt-relay)
    /// - `RELAY_HEALTH_TIMEOUT_MS`: Health check timeout (default: 5000)
    /// - `RELAY_SEARCH_TIMEOUT_MS`: Search call timeout (default: 180000)
    /// - `RELAY_REFRESH_TIMEOUT_MS`: Session refresh timeout (default: 60000)
    /// - `RELAY_RESTART_TIMEOUT_MS`: Browser restart timeout (default: 90000)
    /// - `RELAY_WARMUP_TIMEOUT_MS`: Search tab warmup timeout (default: 60000)
    /// - `RELAY_JOB_ATTEMPTS`: Attempts per job (default: 3)
    /// - `RELAY_JOB_BACKOFF_MS`: Backoff base between attempts (default: 5000)
    /// - `RELAY_JOB_TIMEOUT_MS`: Per-attempt timeout (default: 600000)
    /// - `RELAY_JOB_RETENTION_SECS`: Finished job retention (default: 86400)
    /// - `RELAY_CONCURRENCY`: Concurrent jobs (default: worker count)
    /// - `RELAY_POLL_INTERVAL_MS`: Idle poll interval (default: 1000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let urls = std::env::var("RELAY_WORKER_URLS")
            .map_err(|_| ConfigError::MissingEnvVar("RELAY_WORKER_URLS".to_string()))?;
        config.worker_urls = parse_url_list(&urls);

        if let Ok(val) = std::env::var("RELAY_REDIS_URL") {
            config.redis_url = val;
        }
        if let Ok(val) = std::env::var("RELAY_QUEUE_NAME") {
            config.queue_name = val;
        }

        if let Ok(val) = std::env::var("RELAY_HEALTH_TIMEOUT_MS") {
            config.timeouts.health = parse_env_millis(&val, "RELAY_HEALTH_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("RELAY_SEARCH_TIMEOUT_MS") {
            config.timeouts.search = parse_env_millis(&val, "RELAY_SEARCH_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("RELAY_REFRESH_TIMEOUT_MS") {
            config.timeouts.refresh = parse_env_millis(&val, "RELAY_REFRESH_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("RELAY_RESTART_TIMEOUT_MS") {
            config.timeouts.restart = parse_env_millis(&val, "RELAY_RESTART_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("RELAY_WARMUP_TIMEOUT_MS") {
            config.timeouts.warmup = parse_env_millis(&val, "RELAY_WARMUP_TIMEOUT_MS")?;
        }

        if let Ok(val) = std::env::var("RELAY_JOB_ATTEMPTS") {
            config.job_attempts = parse_env_value(&val, "RELAY_JOB_ATTEMPTS")?;
        }
        if let Ok(val) = std::env::var("RELAY_JOB_BACKOFF_MS") {
            config.job_backoff = parse_env_millis(&val, "RELAY_JOB_BACKOFF_MS")?;
        }
        if let Ok(val) = std::env::var("RELAY_JOB_TIMEOUT_MS") {
            config.job_timeout = parse_env_millis(&val, "RELAY_JOB_TIMEOUT_MS")?;
        }
        if let Ok(val) = std::env::var("RELAY_JOB_RETENTION_SECS") {
            let secs: u64 = parse_env_value(&val, "RELAY_JOB_RETENTION_SECS")?;
            config.job_retention = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("RELAY_CONCURRENCY") {
            config.concurrency = Some(parse_env_value(&val, "RELAY_CONCURRENCY")?);
        }
        if let Ok(val) = std::env::var("RELAY_POLL_INTERVAL_MS") {
            config.poll_interval = parse_env_millis(&val, "RELAY_POLL_INTERVAL_MS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_urls.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one worker URL is required".to_string(),
            ));
        }

        if let Some(url) = self
            .worker_urls
            .iter()
            .find(|url| !(url.starts_with("http://") || url.starts_with("https://")))
        {
            return Err(ConfigError::ValidationFailed(format!(
                "worker URL '{}' must start with http:// or https://",
                url
            )));
        }

        let timeouts = [
            ("health timeout", self.timeouts.health),
            ("search timeout", self.timeouts.search),
            ("refresh timeout", self.timeouts.refresh),
            ("restart timeout", self.timeouts.restart),
            ("warmup timeout", self.timeouts.warmup),
            ("job_timeout", self.job_timeout),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.job_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "job_attempts must be greater than 0".to_string(),
            ));
        }

        if self.concurrency == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }

        if self.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Number of jobs the scheduler runs at once.
    pub fn effective_concurrency(&self) -> usize {
        match self.concurrency {
            Some(n) => n,
            None if self.worker_urls.is_empty() => DEFAULT_CONCURRENCY,
            None => self.worker_urls.len(),
        }
    }

    /// Builder method to set the worker endpoints.
    pub fn with_worker_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to set the worker timeouts.
    pub fn with_timeouts(mut self, timeouts: WorkerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Builder method to set the attempt budget.
    pub fn with_job_attempts(mut self, attempts: u32) -> Self {
        self.job_attempts = attempts;
        self
    }

    /// Builder method to set the backoff base.
    pub fn with_job_backoff(mut self, backoff: Duration) -> Self {
        self.job_backoff = backoff;
        self
    }

    /// Builder method to set the per-attempt timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Builder method to set the retention window.
    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    /// Builder method to set the scheduler concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Builder method to set the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Split a comma-separated URL list, dropping blanks.
fn parse_url_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding milliseconds.
fn parse_env_millis(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_millis)
}
