//! Pool-level health aggregation.
//!
//! Every worker is checked concurrently with its own deadline. A dead or slow
//! worker shows up as an unhealthy entry in [`PoolHealth::details`]; it never
//! delays the other checks and never turns into an error.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::client::WorkerClient;
use super::transport::Outcome;

/// Reduced status of the whole pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    /// Every worker is healthy.
    Ok,
    /// Some, but not all, workers are healthy.
    Degraded,
    /// No worker is healthy.
    Fail,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolStatus::Ok => write!(f, "ok"),
            PoolStatus::Degraded => write!(f, "degraded"),
            PoolStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Health of one worker, derived fresh from a single check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// 1-based worker index.
    pub worker: usize,
    /// Whether the worker reported itself healthy.
    pub ok: bool,
    /// Whether the worker is handling a request right now.
    #[serde(default)]
    pub busy: bool,
    /// Whether the worker's browser session is ready for searches.
    #[serde(default)]
    pub ready: bool,
    /// Browser identity reported by the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    /// Browser liveness flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alive: Option<bool>,
    /// Check error, when the worker could not be reached or answered badly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerHealth {
    /// Entry for a check that failed.
    pub fn unreachable(worker: usize, error: impl Into<String>) -> Self {
        Self {
            worker,
            ok: false,
            busy: false,
            ready: false,
            browser: None,
            alive: None,
            error: Some(error.into()),
        }
    }

    /// Builds an entry from a `/health` body.
    ///
    /// A 2xx body without an `ok` field counts as healthy.
    pub fn from_body(worker: usize, body: &Value) -> Self {
        let flag = |key: &str| body.get(key).and_then(Value::as_bool);
        let browser = body.get("browser").and_then(|b| match b {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        });

        Self {
            worker,
            ok: flag("ok").unwrap_or(true),
            busy: flag("busy").unwrap_or(false),
            ready: flag("ready").unwrap_or(false),
            browser,
            alive: flag("alive").or_else(|| flag("browser_alive")),
            error: None,
        }
    }

    /// Whether this worker counts towards `healthy`.
    pub fn is_healthy(&self) -> bool {
        self.ok && self.error.is_none()
    }
}

/// Aggregated pool health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub status: PoolStatus,
    pub healthy: usize,
    pub total: usize,
    pub details: Vec<WorkerHealth>,
}

impl PoolHealth {
    /// Reduces per-worker results into pool status.
    pub fn from_details(details: Vec<WorkerHealth>) -> Self {
        let total = details.len();
        let healthy = details.iter().filter(|h| h.is_healthy()).count();

        let status = if total > 0 && healthy == total {
            PoolStatus::Ok
        } else if healthy > 0 {
            PoolStatus::Degraded
        } else {
            PoolStatus::Fail
        };

        Self {
            status,
            healthy,
            total,
            details,
        }
    }
}

/// Checks all workers and reduces the results.
#[derive(Clone)]
pub struct HealthAggregator {
    client: WorkerClient,
}

impl HealthAggregator {
    pub fn new(client: WorkerClient) -> Self {
        Self { client }
    }

    /// Checks a single worker. Never fails.
    pub async fn check_worker(&self, worker: usize) -> WorkerHealth {
        match self.client.health(worker).await {
            Ok(Outcome::Ok(body)) => WorkerHealth::from_body(worker, &body),
            Ok(Outcome::Fail(failure)) => WorkerHealth::unreachable(worker, failure.message),
            Err(e) => WorkerHealth::unreachable(worker, e.to_string()),
        }
    }

    /// Checks every worker concurrently and waits for all checks to settle.
    pub async fn check(&self) -> PoolHealth {
        let checks = (1..=self.client.worker_count()).map(|worker| self.check_worker(worker));
        let health = PoolHealth::from_details(join_all(checks).await);

        if health.status == PoolStatus::Ok {
            debug!(healthy = health.healthy, total = health.total, "Worker pool healthy");
        } else {
            warn!(
                status = %health.status,
                healthy = health.healthy,
                total = health.total,
                "Worker pool not fully healthy"
            );
        }

        health
    }
}
