//! Storage capability behind the job queue.
//!
//! A store persists [`JobRecord`]s and guards every lifecycle change with a
//! compare-and-set on the stored state, so two runners can never both move
//! the same job. Progress lives on a separate side channel and never touches
//! the authoritative state.
//!
//! Two implementations exist:
//!
//! - [`MemoryJobStore`]: a single mutex over maps, for tests and one-shot runs
//! - [`RedisJobStore`](super::redis_store::RedisJobStore): durable, shared
//!   between processes

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::job::{JobProgress, JobRecord, JobState};
use super::queue::QueueError;

/// Default time completed and failed jobs are kept.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Durable job storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new `waiting` job and makes it claimable.
    async fn insert(&self, record: &JobRecord) -> Result<(), QueueError>;

    /// Fetches a job with its latest progress attached.
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, QueueError>;

    /// Returns every job in one of `states`, progress attached, in no
    /// particular order.
    async fn list(&self, states: &[JobState]) -> Result<Vec<JobRecord>, QueueError>;

    /// Returns delayed jobs whose backoff has elapsed at `now`.
    async fn due_delayed(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, QueueError>;

    /// Returns every job currently claimed for execution.
    async fn active_jobs(&self) -> Result<Vec<JobRecord>, QueueError>;

    /// Atomically takes the oldest waiting job and marks it active.
    async fn claim_next(&self) -> Result<Option<JobRecord>, QueueError>;

    /// Makes claims that were taken but never marked active claimable again.
    ///
    /// A claimer that dies between taking an id and writing the `active`
    /// state leaves the job unreachable. Returns how many jobs were put back.
    /// Must only run while no claim is in flight.
    async fn release_orphaned_claims(&self) -> Result<usize, QueueError>;

    /// Replaces the stored job with `record` if its stored state is `from`.
    ///
    /// Returns `false` without writing anything when the state has moved on
    /// or the job no longer exists.
    async fn transition(&self, from: JobState, record: &JobRecord) -> Result<bool, QueueError>;

    /// Overwrites the job's progress. Last write wins.
    async fn set_progress(&self, id: Uuid, progress: &JobProgress) -> Result<(), QueueError>;

    /// Drops finished jobs older than the retention window. Returns how many
    /// were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<Uuid, JobRecord>,
    waiting: VecDeque<Uuid>,
    progress: HashMap<Uuid, JobProgress>,
}

impl MemoryState {
    fn attach_progress(&self, record: &JobRecord) -> JobRecord {
        let mut record = record.clone();
        record.progress = self.progress.get(&record.id).cloned();
        record
    }
}

/// In-process store.
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    retention: Duration,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            retention: DEFAULT_RETENTION,
        }
    }

    /// Sets how long finished jobs stay visible.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn is_live(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        !record.is_expired(now, self.retention)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: &JobRecord) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let mut record = record.clone();
        record.progress = None;
        if record.state == JobState::Waiting {
            state.waiting.push_back(record.id);
        }
        state.records.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .records
            .get(&id)
            .filter(|r| self.is_live(r, now))
            .map(|r| state.attach_progress(r)))
    }

    async fn list(&self, states: &[JobState]) -> Result<Vec<JobRecord>, QueueError> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .records
            .values()
            .filter(|r| states.contains(&r.state) && self.is_live(r, now))
            .map(|r| state.attach_progress(r))
            .collect())
    }

    async fn due_delayed(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.is_due(now))
            .map(|r| state.attach_progress(r))
            .collect())
    }

    async fn active_jobs(&self) -> Result<Vec<JobRecord>, QueueError> {
        self.list(&[JobState::Active]).await
    }

    async fn claim_next(&self) -> Result<Option<JobRecord>, QueueError> {
        let mut state = self.state.lock().await;

        while let Some(id) = state.waiting.pop_front() {
            let claimed = match state.records.get_mut(&id) {
                Some(record) if record.state == JobState::Waiting => {
                    record.mark_active(Utc::now());
                    record.clone()
                }
                _ => continue,
            };
            return Ok(Some(state.attach_progress(&claimed)));
        }

        Ok(None)
    }

    async fn release_orphaned_claims(&self) -> Result<usize, QueueError> {
        // Claims happen under the lock, so none can be left half done
        Ok(0)
    }

    async fn transition(&self, from: JobState, record: &JobRecord) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;

        match state.records.get(&record.id) {
            Some(current) if current.state == from => {}
            _ => return Ok(false),
        }

        if from == JobState::Waiting && record.state != JobState::Waiting {
            state.waiting.retain(|id| *id != record.id);
        }
        if record.state == JobState::Waiting && from != JobState::Waiting {
            state.waiting.push_back(record.id);
        }

        let mut stored = record.clone();
        stored.progress = None;
        state.records.insert(stored.id, stored);
        Ok(true)
    }

    async fn set_progress(&self, id: Uuid, progress: &JobProgress) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(&id) {
            return Err(QueueError::JobNotFound(id));
        }
        state.progress.insert(id, progress.clone());
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let expired: Vec<Uuid> = state
            .records
            .values()
            .filter(|r| r.is_expired(now, self.retention))
            .map(|r| r.id)
            .collect();

        for id in &expired {
            state.records.remove(id);
            state.progress.remove(id);
        }

        Ok(expired.len())
    }
}
