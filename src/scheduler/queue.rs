//! Job queue facade.
//!
//! [`JobQueue`] owns the job policy (input validation, attempt budget,
//! backoff, listing order) and delegates persistence to a [`JobStore`]:
//!
//! - Callers use `enqueue`, `get_status` and `list_jobs`
//! - The scheduler uses `claim_next`, `complete`, `record_failure`,
//!   `update_progress` and the maintenance operations
//!
//! # Reliability
//!
//! Every state change is a compare-and-set against the state the caller
//! last observed. A runner whose job was moved by someone else gets
//! `QueueError::InvalidTransition` instead of silently overwriting it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{JobPayload, JobProgress, JobRecord, JobState, JobStatus, JobView, RetryPolicy};
use super::pagination::{clamp_limit, PageToken, Pagination};
use super::redis_store::RedisJobStore;
use super::store::{JobStore, MemoryJobStore};
use crate::dispatch::DispatchOutput;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Job not found in the queue.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    /// Rejected before anything was queued.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The job was no longer in the state the caller expected.
    #[error("Job {id} is no longer {expected}")]
    InvalidTransition { id: Uuid, expected: JobState },
}

impl QueueError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::ConnectionFailed(_) | QueueError::RedisError(_))
    }
}

/// Policy applied to newly enqueued jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// Attempt budget and backoff base.
    pub retry: RetryPolicy,
    /// Limit on a single attempt.
    pub job_timeout: Duration,
    /// Size of the worker pool, used to validate preferred workers.
    pub worker_count: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            job_timeout: Duration::from_secs(600),
            worker_count: 0,
        }
    }
}

impl QueueSettings {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub items: Vec<JobView>,
    pub pagination: Pagination,
}

/// Number of jobs per public status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    /// Returns the total number of jobs.
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Durable, at-least-once job queue.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    settings: QueueSettings,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, settings: QueueSettings) -> Self {
        Self { store, settings }
    }

    /// Creates a queue over a fresh in-process store.
    pub fn in_memory(settings: QueueSettings) -> Self {
        Self::new(Arc::new(MemoryJobStore::new()), settings)
    }

    /// Creates an in-process queue that keeps finished jobs for `retention`.
    pub fn in_memory_with_retention(retention: Duration, settings: QueueSettings) -> Self {
        let store = MemoryJobStore::new().with_retention(retention);
        Self::new(Arc::new(store), settings)
    }

    /// Connects to Redis and creates a queue over it.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        queue_name: &str,
        retention: Duration,
        settings: QueueSettings,
    ) -> Result<Self, QueueError> {
        let store = RedisJobStore::connect(redis_url, queue_name)
            .await?
            .with_retention(retention);
        Ok(Self::new(Arc::new(store), settings))
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Enqueues a prompt and returns its id without waiting for execution.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidInput` for a blank prompt or a preferred
    /// worker outside `1..=worker_count`.
    pub async fn enqueue(
        &self,
        prompt: &str,
        preferred_worker: Option<usize>,
    ) -> Result<Uuid, QueueError> {
        if prompt.trim().is_empty() {
            return Err(QueueError::InvalidInput("prompt must not be empty".to_string()));
        }

        let mut payload = JobPayload::new(prompt);
        if let Some(worker) = preferred_worker {
            if worker == 0 || worker > self.settings.worker_count {
                return Err(QueueError::InvalidInput(format!(
                    "preferred worker {} is outside 1..={}",
                    worker, self.settings.worker_count
                )));
            }
            payload = payload.with_preferred_worker(worker);
        }

        let record = JobRecord::new(payload, &self.settings.retry, self.settings.job_timeout);
        self.store.insert(&record).await?;

        info!(job_id = %record.id, preferred_worker = ?preferred_worker, "Job enqueued");
        Ok(record.id)
    }

    /// Fetches the full stored record.
    pub async fn get(&self, id: Uuid) -> Result<JobRecord, QueueError> {
        self.store
            .get(id)
            .await?
            .ok_or(QueueError::JobNotFound(id))
    }

    /// Returns the external projection of a job.
    pub async fn get_status(&self, id: Uuid) -> Result<JobView, QueueError> {
        Ok(self.get(id).await?.view())
    }

    /// Lists jobs newest first.
    ///
    /// The same ordering is applied for every filter so that cursors stay
    /// stable while new jobs arrive. A malformed or stale `page_token`
    /// starts from the first page.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<usize>,
        page_token: Option<&str>,
    ) -> Result<JobPage, QueueError> {
        let states: &[JobState] = match status {
            Some(status) => status.states(),
            None => &JobState::ALL,
        };

        let mut records = self.store.list(states).await?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let limit = clamp_limit(limit);
        let total = records.len();
        // A cursor past the end belongs to an older, larger snapshot
        let offset = match PageToken::resolve_offset(page_token) {
            offset if offset >= total => 0,
            offset => offset,
        };

        let items = records
            .iter()
            .skip(offset)
            .take(limit)
            .map(JobRecord::view)
            .collect();

        Ok(JobPage {
            items,
            pagination: Pagination::new(offset, limit, total),
        })
    }

    /// Polls until the job is completed or failed.
    ///
    /// Never gives up on its own; wrap it in `tokio::time::timeout` to bound
    /// the wait.
    pub async fn wait_until_finished(
        &self,
        id: Uuid,
        poll_interval: Duration,
    ) -> Result<JobView, QueueError> {
        loop {
            let view = self.get_status(id).await?;
            if matches!(view.status, JobStatus::Completed | JobStatus::Failed) {
                return Ok(view);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Claims the oldest waiting job for execution.
    pub async fn claim_next(&self) -> Result<Option<JobRecord>, QueueError> {
        let claimed = self.store.claim_next().await?;
        if let Some(job) = &claimed {
            debug!(job_id = %job.id, attempt = job.attempts_made, "Job claimed");
        }
        Ok(claimed)
    }

    /// Marks an active job completed. The output is stored unchanged.
    pub async fn complete(
        &self,
        job: &JobRecord,
        output: DispatchOutput,
    ) -> Result<JobRecord, QueueError> {
        let mut updated = job.clone();
        updated.mark_completed(output, Utc::now());
        self.apply(JobState::Active, &updated).await?;
        Ok(updated)
    }

    /// Records a failed attempt of an active job.
    ///
    /// The job is delayed for `base * 2^(attempts_made - 1)` while attempts
    /// remain and failed with `reason` once the budget is spent. Returns the
    /// updated record.
    pub async fn record_failure(
        &self,
        job: &JobRecord,
        reason: &str,
    ) -> Result<JobRecord, QueueError> {
        let mut updated = job.clone();
        match updated.mark_attempt_failed(reason, Utc::now()) {
            JobState::Delayed => warn!(
                job_id = %job.id,
                attempt = job.attempts_made,
                remaining_attempts = updated.remaining_attempts(),
                backoff_ms = updated.next_backoff().as_millis() as u64,
                error = %reason,
                "Job attempt failed, delaying retry"
            ),
            _ => warn!(
                job_id = %job.id,
                attempts = job.attempts_made,
                error = %reason,
                "Job failed after exhausting attempts"
            ),
        }
        self.apply(JobState::Active, &updated).await?;
        Ok(updated)
    }

    /// Overwrites a job's advisory progress.
    pub async fn update_progress(&self, id: Uuid, progress: JobProgress) -> Result<(), QueueError> {
        self.store.set_progress(id, &progress).await
    }

    /// Moves delayed jobs whose backoff has elapsed back to waiting.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut promoted = 0;

        for mut job in self.store.due_delayed(now).await? {
            job.mark_waiting();
            // Losing the race means another process promoted it first
            if self.store.transition(JobState::Delayed, &job).await? {
                promoted += 1;
            }
        }

        if promoted > 0 {
            debug!(promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Returns jobs left active by a crashed process to the queue.
    ///
    /// The interrupted attempt counts against the budget; jobs without
    /// attempts left are failed. Must only run while no runner of this
    /// queue is executing jobs.
    pub async fn recover_stalled(&self) -> Result<usize, QueueError> {
        let mut recovered = self.store.release_orphaned_claims().await?;

        for job in self.store.active_jobs().await? {
            let mut updated = job.clone();
            if updated.should_retry() {
                updated.mark_waiting();
            } else {
                updated.mark_attempt_failed("Job stalled after exhausting attempts", Utc::now());
            }

            if self.store.transition(JobState::Active, &updated).await? {
                recovered += 1;
                warn!(job_id = %job.id, state = %updated.state, "Recovered stalled job");
            }
        }

        Ok(recovered)
    }

    /// Fails attempts that outlived their timeout by more than `grace`.
    ///
    /// Catches attempts whose runner died or could not write the outcome.
    /// Each one goes through [`record_failure`](Self::record_failure), so the
    /// job is retried while attempts remain. Safe to run next to live
    /// runners: a runner that finishes first wins the compare-and-set.
    pub async fn fail_overdue(&self, grace: Duration) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut failed = 0;

        for job in self.store.active_jobs().await? {
            if !job.is_overdue(now, grace) {
                continue;
            }
            let reason = format!("Job stalled: no outcome within {}ms", job.timeout_ms);
            match self.record_failure(&job, &reason).await {
                Ok(_) => failed += 1,
                Err(QueueError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(failed)
    }

    /// Drops finished jobs older than the retention window.
    pub async fn purge_expired(&self) -> Result<usize, QueueError> {
        let purged = self.store.purge_expired(Utc::now()).await?;
        if purged > 0 {
            debug!(purged, "Purged expired jobs");
        }
        Ok(purged)
    }

    /// Counts jobs per public status.
    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut by_state: HashMap<JobState, usize> = HashMap::new();
        for job in self.store.list(&JobState::ALL).await? {
            *by_state.entry(job.state).or_default() += 1;
        }

        let mut counts = QueueCounts::default();
        for (state, n) in by_state {
            match state.status() {
                JobStatus::Pending => counts.pending += n,
                JobStatus::Processing => counts.processing += n,
                JobStatus::Completed => counts.completed += n,
                JobStatus::Failed => counts.failed += n,
            }
        }
        Ok(counts)
    }

    async fn apply(&self, from: JobState, record: &JobRecord) -> Result<(), QueueError> {
        if self.store.transition(from, record).await? {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                id: record.id,
                expected: from,
            })
        }
    }
}
