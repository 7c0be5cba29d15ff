//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `JobRecord`: A stored unit of work with its scheduling metadata
//! - `JobPayload`: The prompt to dispatch
//! - `JobState`: Internal lifecycle state
//! - `JobStatus`: Public status vocabulary
//! - `JobView`: External projection returned by status and listing calls

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::DispatchOutput;

/// Default maximum number of attempts for a job.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay of the exponential backoff.
const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// What a job asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Natural-language prompt sent to the workers.
    pub prompt: String,
    /// Worker the caller would like to use.
    ///
    /// Validated and stored, but dispatch always starts from worker 1: the
    /// failover loop does not honor this value.
    #[serde(
        rename = "preferredWorker",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub preferred_worker: Option<usize>,
}

impl JobPayload {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            preferred_worker: None,
        }
    }

    /// Sets the preferred worker.
    pub fn with_preferred_worker(mut self, worker: usize) -> Self {
        self.preferred_worker = Some(worker);
        self
    }
}

/// Internal lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be claimed.
    Waiting,
    /// Claimed by a runner.
    Active,
    /// Finished with a result.
    Completed,
    /// Attempt budget exhausted.
    Failed,
    /// Waiting for its backoff to elapse before the next attempt.
    Delayed,
}

impl JobState {
    /// Every internal state.
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Delayed,
    ];

    /// Maps to the public vocabulary.
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Waiting | JobState::Delayed => JobStatus::Pending,
            JobState::Active => JobStatus::Processing,
            JobState::Completed => JobStatus::Completed,
            JobState::Failed => JobStatus::Failed,
        }
    }

    /// Completed and failed jobs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Internal states reported under this status.
    pub fn states(&self) -> &'static [JobState] {
        match self {
            JobStatus::Pending => &[JobState::Waiting, JobState::Delayed],
            JobStatus::Processing => &[JobState::Active],
            JobStatus::Completed => &[JobState::Completed],
            JobStatus::Failed => &[JobState::Failed],
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!(
                "unknown status '{}': expected pending, processing, completed or failed",
                other
            )),
        }
    }
}

/// Stage reported on the progress side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    Processing,
    Completed,
    Failed,
}

/// Advisory progress of the current attempt. Last write wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub stage: ProgressStage,
    #[serde(rename = "workerId", default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
}

impl JobProgress {
    pub fn new(stage: ProgressStage, worker_id: Option<usize>) -> Self {
        Self { stage, worker_id }
    }
}

/// Attempt budget applied across whole dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before the job is marked failed.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later one.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
        }
    }
}

/// A job as stored by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique identifier, never reused.
    pub id: Uuid,
    /// Immutable payload.
    pub payload: JobPayload,
    /// Authoritative lifecycle state.
    pub state: JobState,
    /// Advisory progress, stored on its own side channel.
    #[serde(skip)]
    pub progress: Option<JobProgress>,
    /// Set once when the job completes.
    #[serde(default)]
    pub result: Option<DispatchOutput>,
    /// Last error, set when the job fails.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Number of attempts started so far.
    pub attempts_made: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Backoff base in milliseconds.
    pub backoff_ms: u64,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the current or last attempt started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When a delayed job becomes claimable again.
    #[serde(default)]
    pub ready_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Creates a waiting job.
    pub fn new(payload: JobPayload, policy: &RetryPolicy, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            state: JobState::Waiting,
            progress: None,
            result: None,
            failure_reason: None,
            attempts_made: 0,
            max_attempts: policy.max_attempts,
            backoff_ms: policy.backoff_base.as_millis() as u64,
            timeout_ms: timeout.as_millis() as u64,
            created_at: Utc::now(),
            started_at: None,
            ready_at: None,
            completed_at: None,
        }
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns whether another attempt is allowed.
    pub fn should_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_made)
    }

    /// Backoff before the next attempt: `base * 2^(attempts_made - 1)`.
    pub fn next_backoff(&self) -> Duration {
        let exponent = self.attempts_made.saturating_sub(1).min(20);
        Duration::from_millis(self.backoff_ms.saturating_mul(1u64 << exponent))
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// `waiting → active`; starts a new attempt.
    pub fn mark_active(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.started_at = Some(now);
        self.ready_at = None;
    }

    /// `active → completed` with the dispatch output fixed permanently.
    pub fn mark_completed(&mut self, output: DispatchOutput, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.result = Some(output);
        self.failure_reason = None;
        self.completed_at = Some(now);
    }

    /// `active → delayed` while attempts remain, otherwise `active → failed`.
    ///
    /// Returns the new state.
    pub fn mark_attempt_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> JobState {
        let reason = reason.into();
        if self.should_retry() {
            let backoff = chrono::Duration::from_std(self.next_backoff())
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
            self.state = JobState::Delayed;
            self.ready_at = Some(now + backoff);
            self.failure_reason = Some(reason);
        } else {
            self.state = JobState::Failed;
            self.failure_reason = Some(reason);
            self.completed_at = Some(now);
        }
        self.state
    }

    /// `delayed → waiting` once the backoff has elapsed.
    pub fn mark_waiting(&mut self) {
        self.state = JobState::Waiting;
        self.ready_at = None;
    }

    /// Whether a delayed job may be promoted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Delayed && self.ready_at.map_or(true, |at| at <= now)
    }

    /// Whether an active attempt has outlived its timeout by more than
    /// `grace` at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let Some(started) = self.started_at.filter(|_| self.state == JobState::Active) else {
            return false;
        };
        let budget = self.timeout().saturating_add(grace);
        match chrono::Duration::from_std(budget) {
            Ok(budget) => started + budget <= now,
            Err(_) => false,
        }
    }

    /// Whether a finished job is past its retention window at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::MAX);
        match self.completed_at {
            Some(done) if self.state.is_terminal() => done + retention <= now,
            _ => false,
        }
    }

    /// External projection.
    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.id,
            status: self.state.status(),
            progress: self.progress.clone(),
            result: self.result.clone(),
            error: match self.state {
                JobState::Failed => self.failure_reason.clone(),
                _ => None,
            },
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Public projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<DispatchOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}
