//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use super::types::{Job, JobId, JobState, QueueName};

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job (or a fresh attempt replacing a terminal one) was stored.
    Enqueued(JobId),
    /// A waiting/active job with the same identity exists; nothing changed.
    Duplicate { id: JobId, state: JobState },
}

impl EnqueueOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate { .. })
    }

    pub fn id(&self) -> &JobId {
        match self {
            EnqueueOutcome::Enqueued(id) => id,
            EnqueueOutcome::Duplicate { id, .. } => id,
        }
    }
}

/// How long a claim stays valid without a heartbeat.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(120);

/// How many finished jobs each queue keeps for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 10,
            keep_failed: 20,
        }
    }
}

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a job unless a waiting/active job with the same id exists.
    ///
    /// A completed or failed job with the same id is replaced by the new one,
    /// and so is an active job whose lease lapsed before `job.created_at`.
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError>;

    /// Claim the next ready job of `queue` and mark it active under a lease.
    ///
    /// Active jobs whose lease lapsed by `now` are first handed back to the
    /// queue as failed attempts. Order: lowest priority value, then earliest
    /// `run_at`, then FIFO.
    async fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Extend the lease of an active job to one lease past `now`.
    ///
    /// Returns `false` if the job is no longer active.
    async fn renew_lease(
        &self,
        queue: QueueName,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Persist a job after a state transition.
    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Get a job by identity.
    async fn get(&self, queue: QueueName, id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// List jobs of a queue, optionally filtered by state.
    async fn list(
        &self,
        queue: QueueName,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Per-state counts of a queue.
    async fn stats(&self, queue: QueueName) -> Result<QueueStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<(QueueName, JobId), StoredJob>,
    next_seq: u64,
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    retention: RetentionPolicy,
    lease: Duration,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_retention(RetentionPolicy::default())
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            retention,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn trim(&self, inner: &mut Inner, queue: QueueName, state: JobState) {
        let keep = match state {
            JobState::Completed => self.retention.keep_completed,
            JobState::Failed => self.retention.keep_failed,
            _ => return,
        };

        let mut finished: Vec<(DateTime<Utc>, u64, JobId)> = inner
            .jobs
            .iter()
            .filter(|((q, _), s)| *q == queue && s.job.state == state)
            .map(|((_, id), s)| {
                (
                    s.job.finished_at.unwrap_or(s.job.updated_at),
                    s.seq,
                    id.clone(),
                )
            })
            .collect();

        if finished.len() <= keep {
            return;
        }

        // Newest first; everything past `keep` is discarded.
        finished.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        for (_, _, id) in finished.into_iter().skip(keep) {
            inner.jobs.remove(&(queue, id));
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        let mut inner = self.inner.write().unwrap();
        let key = (job.queue, job.id.clone());

        if let Some(existing) = inner.jobs.get(&key) {
            if existing.job.lease_expired(job.created_at) {
                warn!(queue = %job.queue, job_id = %job.id, "replacing job with lapsed lease");
            } else if existing.job.state.is_live() {
                return Ok(EnqueueOutcome::Duplicate {
                    id: job.id,
                    state: existing.job.state,
                });
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let id = job.id.clone();
        inner.jobs.insert(key, StoredJob { job, seq });
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.inner.write().unwrap();

        for ((q, id), stored) in inner.jobs.iter_mut() {
            if *q == queue && stored.job.lease_expired(now) {
                let requeued = stored.job.expire_lease(now);
                warn!(queue = %queue, job_id = %id, requeued, "recovered job with lapsed lease");
            }
        }

        let next = inner
            .jobs
            .iter()
            .filter(|((q, _), s)| *q == queue && s.job.is_ready(now))
            .min_by_key(|(_, s)| (s.job.priority, s.job.run_at, s.seq))
            .map(|(key, _)| key.clone());

        let Some(key) = next else {
            return Ok(None);
        };

        match inner.jobs.get_mut(&key) {
            Some(stored) => {
                stored.job.mark_leased(now, self.lease);
                Ok(Some(stored.job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn renew_lease(
        &self,
        queue: QueueName,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.jobs.get_mut(&(queue, id.clone())) {
            Some(stored) if stored.job.state == JobState::Active => {
                stored.job.lease_expires_at =
                    Some(now + chrono::Duration::from_std(self.lease).unwrap_or_default());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut inner = self.inner.write().unwrap();
        let key = (job.queue, job.id.clone());

        match inner.jobs.get_mut(&key) {
            Some(stored) => stored.job = job.clone(),
            None => return Err(JobStoreError::NotFound(job.id.clone())),
        }

        if job.state.is_terminal() {
            self.trim(&mut inner, job.queue, job.state);
        }
        Ok(())
    }

    async fn get(&self, queue: QueueName, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .jobs
            .get(&(queue, id.clone()))
            .map(|s| s.job.clone()))
    }

    async fn list(
        &self,
        queue: QueueName,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.inner.read().unwrap();
        let mut result: Vec<&StoredJob> = inner
            .jobs
            .iter()
            .filter(|((q, _), s)| *q == queue && state.is_none_or(|st| s.job.state == st))
            .map(|(_, s)| s)
            .collect();

        result.sort_by_key(|s| s.seq);
        Ok(result
            .into_iter()
            .take(limit)
            .map(|s| s.job.clone())
            .collect())
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, JobStoreError> {
        let inner = self.inner.read().unwrap();
        let mut stats = QueueStats::default();

        for ((q, _), stored) in inner.jobs.iter() {
            if *q != queue {
                continue;
            }
            match stored.job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(queue, now).await
    }

    async fn renew_lease(
        &self,
        queue: QueueName,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        (**self).renew_lease(queue, id, now).await
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job).await
    }

    async fn get(&self, queue: QueueName, id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(queue, id).await
    }

    async fn list(
        &self,
        queue: QueueName,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(queue, state, limit).await
    }

    async fn stats(&self, queue: QueueName) -> Result<QueueStats, JobStoreError> {
        (**self).stats(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobOutcome, ELEVATED_PRIORITY};
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn job(id: &str) -> Job {
        Job::new(
            QueueName::SummaryGenerate,
            JobId::new(id),
            serde_json::json!({}),
            now(),
        )
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        store.enqueue(job("a")).await.unwrap();

        let claimed = store
            .claim_next(QueueName::SummaryGenerate, now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, JobId::new("a"));
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts, 1);

        // No more jobs, and other queues are untouched.
        assert!(store.claim_next(QueueName::SummaryGenerate, now()).await.unwrap().is_none());
        assert!(store.claim_next(QueueName::ScriptGenerate, now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_duplicates_are_suppressed() {
        let store = InMemoryJobStore::new();

        assert!(!store.enqueue(job("a")).await.unwrap().is_duplicate());
        let second = store.enqueue(job("a")).await.unwrap();
        assert_eq!(
            second,
            EnqueueOutcome::Duplicate {
                id: JobId::new("a"),
                state: JobState::Waiting
            }
        );

        let claimed = store.claim_next(QueueName::SummaryGenerate, now()).await.unwrap().unwrap();
        assert!(store.enqueue(job("a")).await.unwrap().is_duplicate());

        let stats = store.stats(QueueName::SummaryGenerate).await.unwrap();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.waiting, 0);

        // Once finished, the same identity may run again.
        let mut finished = claimed;
        finished.mark_completed(JobOutcome::Done, now(), now());
        store.update(&finished).await.unwrap();
        assert!(!store.enqueue(job("a")).await.unwrap().is_duplicate());
        let fresh = store.get(QueueName::SummaryGenerate, &JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(fresh.state, JobState::Waiting);
        assert_eq!(fresh.attempts, 0);
    }

    #[tokio::test]
    async fn claims_by_priority_then_readiness() {
        let store = InMemoryJobStore::new();
        store.enqueue(job("plain")).await.unwrap();
        store
            .enqueue(job("delayed").with_priority(ELEVATED_PRIORITY).delayed(Duration::from_secs(2)))
            .await
            .unwrap();
        store.enqueue(job("urgent").with_priority(ELEVATED_PRIORITY)).await.unwrap();

        let q = QueueName::SummaryGenerate;
        assert_eq!(store.claim_next(q, now()).await.unwrap().unwrap().id, JobId::new("urgent"));
        assert_eq!(store.claim_next(q, now()).await.unwrap().unwrap().id, JobId::new("plain"));
        assert!(store.claim_next(q, now()).await.unwrap().is_none());

        let later = now() + chrono::Duration::seconds(2);
        assert_eq!(store.claim_next(q, later).await.unwrap().unwrap().id, JobId::new("delayed"));
    }

    #[tokio::test]
    async fn retention_discards_old_terminal_jobs() {
        let store = InMemoryJobStore::with_retention(RetentionPolicy {
            keep_completed: 2,
            keep_failed: 1,
        });
        let q = QueueName::SummaryGenerate;

        for i in 0..4 {
            store.enqueue(job(&format!("done-{i}"))).await.unwrap();
            let mut claimed = store.claim_next(q, now()).await.unwrap().unwrap();
            let at = now() + chrono::Duration::seconds(i);
            claimed.mark_completed(JobOutcome::Done, at, at);
            store.update(&claimed).await.unwrap();
        }

        let kept = store.list(q, Some(JobState::Completed), 10).await.unwrap();
        let ids: Vec<_> = kept.iter().map(|j| j.id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["done-2", "done-3"]);
    }

    #[tokio::test]
    async fn lapsed_claim_is_recovered() {
        let store = InMemoryJobStore::new().with_lease(Duration::from_secs(60));
        let q = QueueName::SummaryGenerate;
        store.enqueue(job("a")).await.unwrap();
        let claimed = store.claim_next(q, now()).await.unwrap().unwrap();
        assert_eq!(claimed.lease_expires_at, Some(now() + chrono::Duration::seconds(60)));

        // Heartbeats keep the claim alive.
        let beat = now() + chrono::Duration::seconds(50);
        assert!(store.renew_lease(q, &claimed.id, beat).await.unwrap());
        assert!(store.claim_next(q, now() + chrono::Duration::seconds(100)).await.unwrap().is_none());
        let stored = store.get(q, &claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Active);

        // Without them the job goes back to the queue as a failed attempt.
        let lapsed = now() + chrono::Duration::seconds(110);
        assert!(store.claim_next(q, lapsed).await.unwrap().is_none());
        let stored = store.get(q, &claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
        assert_eq!(stored.last_error.as_deref(), Some("claim lease expired"));

        let retried = store.claim_next(q, stored.run_at).await.unwrap().unwrap();
        assert_eq!(retried.id, claimed.id);
        assert_eq!(retried.attempts, 2);
    }

    #[tokio::test]
    async fn lapsed_claim_does_not_block_new_enqueue() {
        let store = InMemoryJobStore::new().with_lease(Duration::from_secs(60));
        let q = QueueName::SummaryGenerate;
        store.enqueue(job("a")).await.unwrap();
        let claimed = store.claim_next(q, now()).await.unwrap().unwrap();

        assert!(store.enqueue(job("a")).await.unwrap().is_duplicate());

        let mut later = job("a");
        later.created_at = now() + chrono::Duration::minutes(5);
        later.run_at = later.created_at;
        assert!(!store.enqueue(later).await.unwrap().is_duplicate());
        let fresh = store.get(q, &claimed.id).await.unwrap().unwrap();
        assert_eq!(fresh.state, JobState::Waiting);
        assert_eq!(fresh.attempts, 0);

        assert!(!store.renew_lease(q, &claimed.id, now()).await.unwrap());
    }

    #[tokio::test]
    async fn update_unknown_job_fails() {
        let store = InMemoryJobStore::new();
        let err = store.update(&job("ghost")).await.unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(_)));
    }
}
