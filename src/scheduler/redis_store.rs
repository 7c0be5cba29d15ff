//! Redis-backed job store with reliable claim.
//!
//! # Key Structure
//!
//! All keys are prefixed with the queue name:
//!
//! - `{queue}:job:{id}`: JSON job record; finished jobs carry the retention TTL
//! - `{queue}:progress:{id}`: JSON progress, written independently of the record
//! - `{queue}:waiting`: list of claimable ids (LPUSH in, RPOPLPUSH out)
//! - `{queue}:active`: list of claimed ids (for crash recovery)
//! - `{queue}:delayed`: sorted set of ids scored by their ready time
//! - `{queue}:index`: sorted set of every id scored by creation time
//!
//! # Reliability
//!
//! Ids move from `waiting` to `active` with a single RPOPLPUSH, so one id is
//! handed to exactly one claimer. Every record change then goes through a Lua
//! script that compares the stored state before writing and moves the id
//! between the lists in the same step. Index entries of expired jobs are
//! removed lazily.
//!
//! A claimer that fails after RPOPLPUSH but before its compare-and-set
//! leaves an id on `active` whose record still reads `waiting`. Recovery
//! walks the `active` list and pushes such ids back onto `waiting`.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::{JobProgress, JobRecord, JobState};
use super::queue::QueueError;
use super::store::{JobStore, DEFAULT_RETENTION};

/// Number of keys fetched per MGET.
const FETCH_CHUNK: usize = 500;

/// Compare-and-set of a job record.
///
/// KEYS: job, waiting, active, delayed, progress.
/// ARGV: expected state, new record, new state, id, ready score, ttl secs.
const TRANSITION_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
if cjson.decode(current)['state'] ~= ARGV[1] then
  return 0
end

local from = ARGV[1]
local to = ARGV[3]
local id = ARGV[4]

if ARGV[6] ~= '0' then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[6])
  redis.call('EXPIRE', KEYS[5], ARGV[6])
else
  redis.call('SET', KEYS[1], ARGV[2])
end

if from == 'active' and to ~= 'active' then
  redis.call('LREM', KEYS[3], 0, id)
elseif from == 'delayed' and to ~= 'delayed' then
  redis.call('ZREM', KEYS[4], id)
elseif from == 'waiting' and to ~= 'waiting' and to ~= 'active' then
  redis.call('LREM', KEYS[2], 0, id)
end

if to == 'waiting' and from ~= 'waiting' then
  redis.call('LPUSH', KEYS[2], id)
elseif to == 'delayed' then
  redis.call('ZADD', KEYS[4], ARGV[5], id)
end

return 1
"#;

/// Repairs one entry of the active list.
///
/// KEYS: job, waiting, active.
/// ARGV: id, expected state ('' when the record is gone), requeue flag.
const REPAIR_CLAIM_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
local state = ''
if current then
  state = cjson.decode(current)['state']
end
if state ~= ARGV[2] then
  return 0
end
if redis.call('LREM', KEYS[3], 0, ARGV[1]) == 0 then
  return 0
end
if ARGV[3] == '1' then
  redis.call('RPUSH', KEYS[2], ARGV[1])
end
return 1
"#;

/// What recovery does with an id found on the active list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimRepair {
    /// A live claim; stalled attempts are handled through the record state.
    Keep,
    /// Taken off `waiting` but never marked active.
    Requeue,
    /// The record moved on or expired; only the list entry is stale.
    Drop,
}

impl ClaimRepair {
    fn for_record(record: Option<&JobRecord>) -> Self {
        match record.map(|r| r.state) {
            Some(JobState::Active) => ClaimRepair::Keep,
            Some(JobState::Waiting) => ClaimRepair::Requeue,
            _ => ClaimRepair::Drop,
        }
    }
}

/// Key names for one queue.
#[derive(Debug, Clone)]
struct QueueKeys {
    prefix: String,
    waiting: String,
    active: String,
    delayed: String,
    index: String,
}

impl QueueKeys {
    fn new(queue_name: &str) -> Self {
        Self {
            prefix: queue_name.to_string(),
            waiting: format!("{}:waiting", queue_name),
            active: format!("{}:active", queue_name),
            delayed: format!("{}:delayed", queue_name),
            index: format!("{}:index", queue_name),
        }
    }

    fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn progress(&self, id: &str) -> String {
        format!("{}:progress:{}", self.prefix, id)
    }
}

/// Job store shared between processes through Redis.
pub struct RedisJobStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    keys: QueueKeys,
    retention: Duration,
    transition_script: Script,
    repair_script: Script,
}

impl RedisJobStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Name of the queue (used as prefix for Redis keys)
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            keys: QueueKeys::new(queue_name),
            retention: DEFAULT_RETENTION,
            transition_script: Script::new(TRANSITION_SCRIPT),
            repair_script: Script::new(REPAIR_CLAIM_SCRIPT),
        }
    }

    /// Sets how long finished jobs are kept before Redis expires them.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.keys.prefix
    }

    /// Deletes every job and list of this queue.
    ///
    /// **Warning**: This permanently deletes all jobs. Use with caution.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.zrange(&self.keys.index, 0, -1).await?;

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.del(self.keys.job(id)).ignore();
            pipe.del(self.keys.progress(id)).ignore();
        }
        pipe.del(&self.keys.waiting)
            .del(&self.keys.active)
            .del(&self.keys.delayed)
            .del(&self.keys.index);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    /// Loads records for `ids`, returning the live ones and the ids whose
    /// record no longer exists.
    async fn load_many(&self, ids: &[String]) -> Result<(Vec<JobRecord>, Vec<String>), QueueError> {
        let mut conn = self.redis.clone();
        let mut records = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();

        for chunk in ids.chunks(FETCH_CHUNK) {
            let keys: Vec<String> = chunk.iter().map(|id| self.keys.job(id)).collect();
            let values: Vec<Option<String>> =
                redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

            for (id, value) in chunk.iter().zip(values) {
                match value {
                    Some(data) => match serde_json::from_str::<JobRecord>(&data) {
                        Ok(record) => records.push(record),
                        Err(e) => warn!(job_id = %id, error = %e, "Skipping unreadable job record"),
                    },
                    None => missing.push(id.clone()),
                }
            }
        }

        Ok((records, missing))
    }

    /// Attaches stored progress to each record.
    async fn attach_progress(&self, records: &mut [JobRecord]) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        for chunk in records.chunks_mut(FETCH_CHUNK) {
            let keys: Vec<String> = chunk
                .iter()
                .map(|r| self.keys.progress(&r.id.to_string()))
                .collect();
            let values: Vec<Option<String>> =
                redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

            for (record, value) in chunk.iter_mut().zip(values) {
                record.progress = value.and_then(|data| serde_json::from_str(&data).ok());
            }
        }

        Ok(())
    }

    async fn drop_from_index(&self, ids: &[String]) -> Result<(), QueueError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        conn.zrem::<_, _, ()>(&self.keys.index, ids).await?;
        debug!(removed = ids.len(), "Dropped expired jobs from index");
        Ok(())
    }

    /// Distinct ids currently on the active list, oldest claim first.
    async fn claimed_ids(&self) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let listed: Vec<String> = conn.lrange(&self.keys.active, 0, -1).await?;

        let mut seen = HashSet::new();
        Ok(listed
            .into_iter()
            .rev()
            .filter(|id| seen.insert(id.clone()))
            .collect())
    }

    /// Applies `repair` to `id` if its record is still in `expected` state.
    async fn repair_claim(
        &self,
        id: &str,
        expected: Option<JobState>,
        repair: ClaimRepair,
    ) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let mut invocation = self.repair_script.prepare_invoke();
        invocation
            .key(self.keys.job(id))
            .key(&self.keys.waiting)
            .key(&self.keys.active)
            .arg(id)
            .arg(expected.map_or("", |state| state.as_str()))
            .arg(if repair == ClaimRepair::Requeue { "1" } else { "0" });
        let applied: i32 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    /// Removes one occurrence of `id` from the active list.
    async fn release_claim(&self, id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lrem::<_, _, ()>(&self.keys.active, 1, id).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, record: &JobRecord) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(record)?;
        let id = record.id.to_string();
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.keys.job(&id), serialized)
            .zadd(&self.keys.index, &id, record.created_at.timestamp_millis())
            .lpush(&self.keys.waiting, &id);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>, QueueError> {
        let id = id.to_string();
        let mut conn = self.redis.clone();

        let (data, progress): (Option<String>, Option<String>) = redis::pipe()
            .get(self.keys.job(&id))
            .get(self.keys.progress(&id))
            .query_async(&mut conn)
            .await?;

        match data {
            Some(data) => {
                let mut record: JobRecord = serde_json::from_str(&data)?;
                record.progress = progress.and_then(|p| serde_json::from_str(&p).ok());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, states: &[JobState]) -> Result<Vec<JobRecord>, QueueError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.zrevrange(&self.keys.index, 0, -1).await?;

        let (records, missing) = self.load_many(&ids).await?;
        self.drop_from_index(&missing).await?;

        let mut records: Vec<JobRecord> = records
            .into_iter()
            .filter(|r| states.contains(&r.state))
            .collect();
        self.attach_progress(&mut records).await?;

        Ok(records)
    }

    async fn due_delayed(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, QueueError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(&self.keys.delayed, "-inf", now.timestamp_millis())
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let (records, missing) = self.load_many(&ids).await?;
        if !missing.is_empty() {
            conn.zrem::<_, _, ()>(&self.keys.delayed, &missing).await?;
        }

        let mut due: Vec<JobRecord> = records.into_iter().filter(|r| r.is_due(now)).collect();
        self.attach_progress(&mut due).await?;
        Ok(due)
    }

    async fn active_jobs(&self) -> Result<Vec<JobRecord>, QueueError> {
        let ids = self.claimed_ids().await?;
        let (records, _) = self.load_many(&ids).await?;

        let mut active: Vec<JobRecord> = records
            .into_iter()
            .filter(|r| r.state == JobState::Active)
            .collect();
        self.attach_progress(&mut active).await?;
        Ok(active)
    }

    async fn release_orphaned_claims(&self) -> Result<usize, QueueError> {
        let ids = self.claimed_ids().await?;
        let (records, missing) = self.load_many(&ids).await?;

        let mut released = 0;
        for record in &records {
            let repair = ClaimRepair::for_record(Some(record));
            if repair == ClaimRepair::Keep {
                continue;
            }
            let id = record.id.to_string();
            if self.repair_claim(&id, Some(record.state), repair).await?
                && repair == ClaimRepair::Requeue
            {
                warn!(job_id = %id, "Requeued orphaned claim");
                released += 1;
            }
        }
        for id in &missing {
            self.repair_claim(id, None, ClaimRepair::Drop).await?;
        }

        Ok(released)
    }

    async fn claim_next(&self) -> Result<Option<JobRecord>, QueueError> {
        let mut conn = self.redis.clone();

        loop {
            // RPOPLPUSH atomically pops from waiting and pushes to active
            let popped: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&self.keys.waiting)
                .arg(&self.keys.active)
                .query_async(&mut conn)
                .await?;

            let Some(id) = popped else {
                return Ok(None);
            };

            let record = match Uuid::parse_str(&id) {
                Ok(uuid) => self.get(uuid).await?,
                Err(_) => None,
            };

            let Some(mut record) = record.filter(|r| r.state == JobState::Waiting) else {
                warn!(job_id = %id, "Discarding stale waiting entry");
                self.release_claim(&id).await?;
                continue;
            };

            record.mark_active(Utc::now());
            if self.transition(JobState::Waiting, &record).await? {
                return Ok(Some(record));
            }
            self.release_claim(&id).await?;
        }
    }

    async fn transition(&self, from: JobState, record: &JobRecord) -> Result<bool, QueueError> {
        let serialized = serde_json::to_string(record)?;
        let id = record.id.to_string();
        let ttl = if record.state.is_terminal() {
            self.retention.as_secs().max(1)
        } else {
            0
        };
        let ready_score = record.ready_at.map_or(0, |at| at.timestamp_millis());

        let mut conn = self.redis.clone();
        let mut invocation = self.transition_script.prepare_invoke();
        invocation
            .key(self.keys.job(&id))
            .key(&self.keys.waiting)
            .key(&self.keys.active)
            .key(&self.keys.delayed)
            .key(self.keys.progress(&id))
            .arg(from.as_str())
            .arg(serialized)
            .arg(record.state.as_str())
            .arg(&id)
            .arg(ready_score)
            .arg(ttl);
        let applied: i32 = invocation.invoke_async(&mut conn).await?;

        Ok(applied == 1)
    }

    async fn set_progress(&self, id: Uuid, progress: &JobProgress) -> Result<(), QueueError> {
        let key = id.to_string();
        let mut conn = self.redis.clone();

        let exists: bool = conn.exists(self.keys.job(&key)).await?;
        if !exists {
            return Err(QueueError::JobNotFound(id));
        }

        let serialized = serde_json::to_string(progress)?;
        redis::cmd("SET")
            .arg(self.keys.progress(&key))
            .arg(serialized)
            .arg("EX")
            .arg(self.retention.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, QueueError> {
        // Records expire on their own; only their index entries need cleanup
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.zrange(&self.keys.index, 0, -1).await?;

        let (_, missing) = self.load_many(&ids).await?;
        self.drop_from_index(&missing).await?;

        Ok(missing.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobPayload, RetryPolicy};

    #[test]
    fn test_queue_keys() {
        let keys = QueueKeys::new("relay");
        assert_eq!(keys.waiting, "relay:waiting");
        assert_eq!(keys.active, "relay:active");
        assert_eq!(keys.delayed, "relay:delayed");
        assert_eq!(keys.index, "relay:index");
        assert_eq!(keys.job("abc"), "relay:job:abc");
        assert_eq!(keys.progress("abc"), "relay:progress:abc");
    }

    #[test]
    fn test_claim_repair_follows_record_state() {
        let mut record = JobRecord::new(
            JobPayload::new("p"),
            &RetryPolicy::default(),
            Duration::from_secs(30),
        );
        assert_eq!(ClaimRepair::for_record(Some(&record)), ClaimRepair::Requeue);

        record.mark_active(Utc::now());
        assert_eq!(ClaimRepair::for_record(Some(&record)), ClaimRepair::Keep);

        record.mark_attempt_failed("exhausted", Utc::now());
        assert_eq!(ClaimRepair::for_record(Some(&record)), ClaimRepair::Drop);
        assert_eq!(ClaimRepair::for_record(None), ClaimRepair::Drop);
    }

    #[test]
    fn test_repair_script_requeues_at_claim_end() {
        // Claims pop from the right, so a requeued id goes first
        let compare = REPAIR_CLAIM_SCRIPT.find("~= ARGV[2]").unwrap();
        let remove = REPAIR_CLAIM_SCRIPT.find("'LREM', KEYS[3]").unwrap();
        let push = REPAIR_CLAIM_SCRIPT.find("'RPUSH', KEYS[2]").unwrap();
        assert!(compare < remove && remove < push);
    }

    #[test]
    fn test_transition_script_compares_state_first() {
        let compare = TRANSITION_SCRIPT.find("~= ARGV[1]").unwrap();
        let write = TRANSITION_SCRIPT.find("'SET'").unwrap();
        assert!(compare < write);
    }
}
