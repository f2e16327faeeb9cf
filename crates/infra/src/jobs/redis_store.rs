//! Redis-backed job store.
//!
//! ## Layout (per queue, prefix `dailycast:queue:<name>`)
//!
//! - `:job:<id>`: job JSON
//! - `:state`: hash id -> state; authoritative for deduplication
//! - `:rank`: hash id -> claim rank (`priority * 1e13 + run_at_ms`)
//! - `:delayed`: zset of waiting ids scored by `run_at_ms`
//! - `:ready`: zset of due ids scored by rank
//! - `:leases`: zset of active ids scored by lease expiry (ms); authoritative
//!   over the `lease_expires_at` copy inside the job JSON
//! - `:completed` / `:failed`: zsets scored by finish time, trimmed to retention
//!
//! State transitions run as Lua scripts so concurrent processes never see a
//! half-applied enqueue or claim.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, Script};
use tracing::{debug, instrument, warn};

use super::store::{
    DEFAULT_LEASE, EnqueueOutcome, JobStore, JobStoreError, QueueStats, RetentionPolicy,
};
use super::types::{Job, JobId, JobState, QueueName};

const KEY_PREFIX: &str = "dailycast:queue";

const RANK_PRIORITY_FACTOR: f64 = 1e13;

const ENQUEUE_SCRIPT: &str = r#"
local state = redis.call("HGET", KEYS[2], ARGV[1])
if state == "waiting" then
    return state
end
if state == "active" then
    local lease = redis.call("ZSCORE", KEYS[7], ARGV[1])
    if not lease or tonumber(lease) > tonumber(ARGV[5]) then
        return state
    end
    redis.call("ZREM", KEYS[7], ARGV[1])
end
redis.call("SET", KEYS[1], ARGV[2])
redis.call("HSET", KEYS[2], ARGV[1], "waiting")
redis.call("HSET", KEYS[3], ARGV[1], ARGV[4])
redis.call("ZREM", KEYS[5], ARGV[1])
redis.call("ZREM", KEYS[6], ARGV[1])
redis.call("ZADD", KEYS[4], ARGV[3], ARGV[1])
return "enqueued"
"#;

const CLAIM_SCRIPT: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
for _, id in ipairs(due) do
    redis.call("ZREM", KEYS[1], id)
    local rank = redis.call("HGET", KEYS[4], id) or "0"
    redis.call("ZADD", KEYS[2], rank, id)
end
local popped = redis.call("ZPOPMIN", KEYS[2])
if #popped == 0 then
    return false
end
local id = popped[1]
redis.call("HSET", KEYS[3], id, "active")
redis.call("ZADD", KEYS[5], ARGV[3], id)
return redis.call("GET", ARGV[2] .. id)
"#;

const RECOVER_SCRIPT: &str = r#"
local lapsed = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
local recovered = {}
for _, id in ipairs(lapsed) do
    redis.call("ZREM", KEYS[1], id)
    if redis.call("HGET", KEYS[2], id) == "active" then
        table.insert(recovered, id)
    end
end
return recovered
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("HGET", KEYS[1], ARGV[1]) ~= "active" then
    return 0
end
redis.call("ZADD", KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

const UPDATE_SCRIPT: &str = r#"
if redis.call("HEXISTS", KEYS[2], ARGV[1]) == 0 then
    return 0
end
local id = ARGV[1]
local state = ARGV[3]
redis.call("SET", KEYS[1], ARGV[2])
redis.call("HSET", KEYS[2], id, state)
if state ~= "active" then
    redis.call("ZREM", KEYS[7], id)
end
if state == "waiting" then
    redis.call("HSET", KEYS[3], id, ARGV[5])
    redis.call("ZADD", KEYS[4], ARGV[4], id)
elseif state == "completed" or state == "failed" then
    local bucket = KEYS[5]
    local keep = tonumber(ARGV[6])
    if state == "failed" then
        bucket = KEYS[6]
        keep = tonumber(ARGV[7])
    end
    redis.call("HDEL", KEYS[3], id)
    redis.call("ZADD", bucket, ARGV[4], id)
    local excess = redis.call("ZCARD", bucket) - keep
    if excess > 0 then
        local evicted = redis.call("ZPOPMIN", bucket, excess)
        for i = 1, #evicted, 2 do
            redis.call("DEL", ARGV[8] .. evicted[i])
            redis.call("HDEL", KEYS[2], evicted[i])
        end
    end
end
return 1
"#;

/// Job store shared by every worker process through one Redis instance.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: MultiplexedConnection,
    retention: RetentionPolicy,
    lease: Duration,
    enqueue: Script,
    claim: Script,
    recover: Script,
    renew: Script,
    update: Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("retention", &self.retention)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

struct QueueKeys {
    base: String,
}

impl QueueKeys {
    fn new(queue: QueueName) -> Self {
        Self {
            base: format!("{KEY_PREFIX}:{}", queue.as_str()),
        }
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn job(&self, id: &JobId) -> String {
        format!("{}{}", self.job_prefix(), id.as_str())
    }

    fn suffixed(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.base)
    }
}

impl RedisJobStore {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            retention: RetentionPolicy::default(),
            lease: DEFAULT_LEASE,
            enqueue: Script::new(ENQUEUE_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            recover: Script::new(RECOVER_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            update: Script::new(UPDATE_SCRIPT),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn lease_end(&self, now: DateTime<Utc>) -> i64 {
        millis(now) + i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX / 2)
    }

    /// Hand every active job of `queue` whose lease lapsed by `now` back to
    /// the queue as a failed attempt.
    async fn recover_lapsed(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();

        let lapsed: Vec<String> = self
            .recover
            .key(keys.suffixed("leases"))
            .key(keys.suffixed("state"))
            .arg(millis(now))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        for id in &lapsed {
            let id = JobId::new(id.as_str());
            let raw: Option<String> = conn.get(keys.job(&id)).await.map_err(map_redis_error)?;
            let Some(raw) = raw else {
                continue;
            };
            let mut job = decode(&raw)?;
            let requeued = job.expire_lease(now);
            warn!(queue = %queue, job_id = %id, requeued, "recovered job with lapsed lease");
            self.update(&job).await?;
        }
        Ok(lapsed.len())
    }
}

fn map_redis_error(e: RedisError) -> JobStoreError {
    JobStoreError::Storage(e.to_string())
}

fn encode(job: &Job) -> Result<String, JobStoreError> {
    serde_json::to_string(job).map_err(|e| JobStoreError::Serialization(e.to_string()))
}

fn decode(raw: &str) -> Result<Job, JobStoreError> {
    serde_json::from_str(raw).map_err(|e| JobStoreError::Serialization(e.to_string()))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn rank(job: &Job) -> f64 {
    f64::from(job.priority) * RANK_PRIORITY_FACTOR + millis(job.run_at) as f64
}

fn parse_state(raw: &str) -> Option<JobState> {
    match raw {
        "waiting" => Some(JobState::Waiting),
        "active" => Some(JobState::Active),
        "completed" => Some(JobState::Completed),
        "failed" => Some(JobState::Failed),
        _ => None,
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(queue = %job.queue, job_id = %job.id), err)]
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let keys = QueueKeys::new(job.queue);
        let mut conn = self.conn.clone();

        let reply: String = self
            .enqueue
            .key(keys.job(&job.id))
            .key(keys.suffixed("state"))
            .key(keys.suffixed("rank"))
            .key(keys.suffixed("delayed"))
            .key(keys.suffixed("completed"))
            .key(keys.suffixed("failed"))
            .key(keys.suffixed("leases"))
            .arg(job.id.as_str())
            .arg(encode(&job)?)
            .arg(millis(job.run_at))
            .arg(rank(&job))
            .arg(millis(job.created_at))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        match parse_state(&reply) {
            Some(state) => {
                debug!(state = state.as_str(), "duplicate enqueue ignored");
                Ok(EnqueueOutcome::Duplicate { id: job.id, state })
            }
            None => Ok(EnqueueOutcome::Enqueued(job.id)),
        }
    }

    #[instrument(skip_all, fields(queue = %queue), err)]
    async fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.recover_lapsed(queue, now).await?;

        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();

        let raw: Option<String> = self
            .claim
            .key(keys.suffixed("delayed"))
            .key(keys.suffixed("ready"))
            .key(keys.suffixed("state"))
            .key(keys.suffixed("rank"))
            .key(keys.suffixed("leases"))
            .arg(millis(now))
            .arg(keys.job_prefix())
            .arg(self.lease_end(now))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let mut job = decode(&raw)?;
        job.mark_leased(now, self.lease);
        let _: () = conn
            .set(keys.job(&job.id), encode(&job)?)
            .await
            .map_err(map_redis_error)?;
        Ok(Some(job))
    }

    #[instrument(skip_all, fields(queue = %queue, job_id = %id), err)]
    async fn renew_lease(
        &self,
        queue: QueueName,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();

        let renewed: i64 = self
            .renew
            .key(keys.suffixed("state"))
            .key(keys.suffixed("leases"))
            .arg(id.as_str())
            .arg(self.lease_end(now))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(renewed == 1)
    }

    #[instrument(skip(self, job), fields(queue = %job.queue, job_id = %job.id, state = job.state.as_str()), err)]
    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let keys = QueueKeys::new(job.queue);
        let mut conn = self.conn.clone();

        let score = match job.state {
            JobState::Waiting | JobState::Active => millis(job.run_at),
            JobState::Completed | JobState::Failed => {
                millis(job.finished_at.unwrap_or(job.updated_at))
            }
        };

        let updated: i64 = self
            .update
            .key(keys.job(&job.id))
            .key(keys.suffixed("state"))
            .key(keys.suffixed("rank"))
            .key(keys.suffixed("delayed"))
            .key(keys.suffixed("completed"))
            .key(keys.suffixed("failed"))
            .key(keys.suffixed("leases"))
            .arg(job.id.as_str())
            .arg(encode(job)?)
            .arg(job.state.as_str())
            .arg(score)
            .arg(rank(job))
            .arg(self.retention.keep_completed)
            .arg(self.retention.keep_failed)
            .arg(keys.job_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if updated == 1 {
            Ok(())
        } else {
            Err(JobStoreError::NotFound(job.id.clone()))
        }
    }

    async fn get(&self, queue: QueueName, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys.job(id)).await.map_err(map_redis_error)?;
        raw.as_deref().map(decode).transpose()
    }

    async fn list(
        &self,
        queue: QueueName,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let states: Vec<(String, String)> = conn
            .hgetall(keys.suffixed("state"))
            .await
            .map_err(map_redis_error)?;

        let ids: Vec<String> = states
            .into_iter()
            .filter(|(_, s)| state.is_none_or(|want| parse_state(s) == Some(want)))
            .map(|(id, _)| format!("{}{id}", keys.job_prefix()))
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raws: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let mut jobs = raws
            .into_iter()
            .flatten()
            .map(|raw| decode(&raw))
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, JobStoreError> {
        let keys = QueueKeys::new(queue);
        let mut conn = self.conn.clone();
        let states: Vec<String> = conn
            .hvals(keys.suffixed("state"))
            .await
            .map_err(map_redis_error)?;

        let mut stats = QueueStats::default();
        for s in states.iter().filter_map(|s| parse_state(s)) {
            match s {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
