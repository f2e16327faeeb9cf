//! Queue worker: claims jobs, runs handlers, applies retry and backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dailycast_core::Clock;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobError, JobOutcome, JobState, QueueName};

/// Attempts at persisting a job's state after its handler ran.
const PERSIST_ATTEMPTS: u32 = 3;

const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Lease renewal period while a handler runs; well under the store lease.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Handler for the jobs of one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError>;

    /// Called once a job reached a terminal state and was persisted.
    async fn on_finished(&self, _job: &Job) {}
}

/// Queue worker configuration.
#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    /// How often an idle loop polls for new jobs
    pub poll_interval: Duration,
    /// Concurrent loops per queue
    pub concurrency: usize,
    /// Upper bound on one handler execution; exceeding it counts as a
    /// retryable failure
    pub job_timeout: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            concurrency: 2,
            job_timeout: Duration::from_secs(10 * 60),
            name: "queue-worker".to_string(),
        }
    }
}

impl QueueWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_skipped: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    /// Executions whose resulting state could not be stored
    pub persist_failures: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control running worker loops.
#[derive(Debug)]
pub struct QueueWorkerHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl QueueWorkerHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            let _ = join.await;
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().unwrap().clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Background queue worker.
///
/// Holds one handler per queue, registered in a table keyed by queue name.
pub struct QueueWorker<S: JobStore> {
    store: S,
    handlers: HashMap<QueueName, Arc<dyn JobHandler>>,
    clock: Arc<dyn Clock>,
    stats: Arc<Mutex<WorkerStats>>,
    job_timeout: Duration,
    heartbeat_interval: Duration,
}

impl<S: JobStore + 'static> QueueWorker<S> {
    /// Create a new worker over `store`.
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            clock,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            job_timeout: QueueWorkerConfig::default().job_timeout,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Register the handler of `queue` (replaces any previous one).
    pub fn register_handler(&mut self, queue: QueueName, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(queue, handler);
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<_> = self.handlers.keys().copied().collect();
        queues.sort();
        queues
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one claimed job to its next state and persist it.
    ///
    /// Returns the handler result; the persisted job reflects retry scheduling.
    pub async fn execute_one(&self, job: &mut Job) -> Result<JobOutcome, JobError> {
        let started = self.clock.now();
        let handler = self.handlers.get(&job.queue).cloned();

        let result = match &handler {
            Some(handler) => self.run_with_heartbeat(handler.as_ref(), job).await,
            None => Err(JobError::Permanent(format!(
                "no handler for queue {}",
                job.queue
            ))),
        };

        let now = self.clock.now();
        match &result {
            Ok(outcome) => {
                job.mark_completed(*outcome, started, now);
                debug!(queue = %job.queue, job_id = %job.id, outcome = ?outcome, "job completed");
            }
            Err(e) => {
                let retrying = job.mark_failed(e.to_string(), e.is_retryable(), started, now);
                if retrying {
                    warn!(
                        queue = %job.queue,
                        job_id = %job.id,
                        attempt = job.attempts,
                        retry_at = %job.run_at,
                        error = %e,
                        "job failed; retry scheduled"
                    );
                } else {
                    error!(
                        queue = %job.queue,
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %e,
                        "job failed permanently"
                    );
                }
            }
        }

        let persisted = self.persist(job).await;
        if persisted && job.state.is_terminal() {
            if let Some(handler) = &handler {
                handler.on_finished(job).await;
            }
        }

        self.record(job, &result);
        result
    }

    /// Run the handler under the job timeout, renewing the claim lease
    /// until it returns.
    async fn run_with_heartbeat(
        &self,
        handler: &dyn JobHandler,
        job: &Job,
    ) -> Result<JobOutcome, JobError> {
        let run = tokio::time::timeout(self.job_timeout, handler.execute(job));
        tokio::pin!(run);

        let period = self.heartbeat_interval.max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                outcome = &mut run => {
                    return match outcome {
                        Ok(result) => result,
                        Err(_) => Err(JobError::Retryable(format!(
                            "timed out after {:?}",
                            self.job_timeout
                        ))),
                    };
                }
                _ = heartbeat.tick() => {
                    match self.store.renew_lease(job.queue, &job.id, self.clock.now()).await {
                        Ok(true) => {}
                        Ok(false) => warn!(queue = %job.queue, job_id = %job.id, "job no longer active while running"),
                        Err(e) => warn!(queue = %job.queue, job_id = %job.id, error = %e, "failed to renew job lease"),
                    }
                }
            }
        }
    }

    /// Store the job's new state, retrying briefly. Returns `false` if the
    /// state could not be stored; the claim lease then lapses and the store
    /// hands the job back to the queue.
    async fn persist(&self, job: &Job) -> bool {
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.store.update(job).await {
                Ok(()) => return true,
                Err(e @ JobStoreError::NotFound(_)) => {
                    error!(queue = %job.queue, job_id = %job.id, error = %e, "job vanished before its state was stored");
                    break;
                }
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(queue = %job.queue, job_id = %job.id, attempt, error = %e, "failed to persist job state; retrying");
                    tokio::time::sleep(PERSIST_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    error!(
                        queue = %job.queue,
                        job_id = %job.id,
                        error = %e,
                        "failed to persist job state; it returns to the queue when its lease lapses"
                    );
                }
            }
        }
        self.stats.lock().unwrap().persist_failures += 1;
        false
    }

    /// Claim and run every job of `queue` that is ready at the clock's now,
    /// including jobs that handlers enqueue along the way.
    ///
    /// Returns the number of executions.
    pub async fn drain(&self, queue: QueueName) -> Result<usize, JobStoreError> {
        let mut executed = 0;
        while let Some(mut job) = self.store.claim_next(queue, self.clock.now()).await? {
            let _ = self.execute_one(&mut job).await;
            executed += 1;
        }
        Ok(executed)
    }

    fn record(&self, job: &Job, result: &Result<JobOutcome, JobError>) {
        let mut s = self.stats.lock().unwrap();
        s.jobs_processed += 1;
        match result {
            Ok(JobOutcome::Done) => s.jobs_succeeded += 1,
            Ok(JobOutcome::Skipped(_)) => s.jobs_skipped += 1,
            Err(_) if job.state == JobState::Waiting => s.jobs_retried += 1,
            Err(_) => s.jobs_failed += 1,
        }
    }

    /// Spawn polling loops for every registered queue.
    pub fn spawn(self: Arc<Self>, config: QueueWorkerConfig) -> QueueWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut joins = Vec::new();

        for queue in self.queues() {
            for slot in 0..config.concurrency.max(1) {
                let worker = self.clone();
                let config = config.clone();
                let shutdown = shutdown_rx.clone();
                joins.push(tokio::spawn(async move {
                    worker_loop(worker, queue, slot, config, shutdown).await;
                }));
            }
        }

        QueueWorkerHandle {
            shutdown: shutdown_tx,
            joins,
            stats: self.stats.clone(),
            started: Instant::now(),
        }
    }
}

async fn worker_loop<S: JobStore + 'static>(
    worker: Arc<QueueWorker<S>>,
    queue: QueueName,
    slot: usize,
    config: QueueWorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker = %config.name, queue = %queue, slot, "queue worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match worker.store.claim_next(queue, worker.clock.now()).await {
            Ok(Some(mut job)) => {
                debug!(worker = %config.name, queue = %queue, job_id = %job.id, "claimed job");
                worker.stats.lock().unwrap().current_running += 1;

                let _ = worker.execute_one(&mut job).await;

                let mut s = worker.stats.lock().unwrap();
                s.current_running = s.current_running.saturating_sub(1);
            }
            Ok(None) => {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) => {
                error!(worker = %config.name, queue = %queue, error = %e, "failed to claim job");
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }

    info!(worker = %config.name, queue = %queue, slot, "queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{EnqueueOutcome, InMemoryJobStore, QueueStats};
    use crate::jobs::types::{JobId, RetryPolicy, SkipReason};
    use chrono::{DateTime, Utc};
    use dailycast_core::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct FixedResult(Result<JobOutcome, JobError>);

    #[async_trait]
    impl JobHandler for FixedResult {
        async fn execute(&self, _job: &Job) -> Result<JobOutcome, JobError> {
            self.0.clone()
        }
    }

    struct Slow;

    #[async_trait]
    impl JobHandler for Slow {
        async fn execute(&self, _job: &Job) -> Result<JobOutcome, JobError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(JobOutcome::Done)
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl JobHandler for Counting {
        async fn execute(&self, _job: &Job) -> Result<JobOutcome, JobError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(JobOutcome::Done)
        }
    }

    fn setup(
        handler: Arc<dyn JobHandler>,
    ) -> (Arc<InMemoryJobStore>, Arc<ManualClock>, QueueWorker<Arc<InMemoryJobStore>>) {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::new(t0()));
        let mut worker = QueueWorker::new(store.clone(), clock.clone());
        worker.register_handler(QueueName::SummaryGenerate, handler);
        (store, clock, worker)
    }

    fn job(id: &str) -> Job {
        Job::new(QueueName::SummaryGenerate, JobId::new(id), serde_json::json!({}), t0())
    }

    #[tokio::test]
    async fn execute_successful_job() {
        let (store, _, worker) = setup(Arc::new(FixedResult(Ok(JobOutcome::Done))));
        store.enqueue(job("a")).await.unwrap();

        let mut claimed = store.claim_next(QueueName::SummaryGenerate, t0()).await.unwrap().unwrap();
        assert!(worker.execute_one(&mut claimed).await.is_ok());

        let stored = store.get(QueueName::SummaryGenerate, &JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
    }

    #[tokio::test]
    async fn skipped_outcome_completes_without_failure() {
        let (store, _, worker) = setup(Arc::new(FixedResult(Ok(JobOutcome::Skipped(
            SkipReason::LockHeld,
        )))));
        store.enqueue(job("a")).await.unwrap();

        assert_eq!(worker.drain(QueueName::SummaryGenerate).await.unwrap(), 1);
        let stored = store.get(QueueName::SummaryGenerate, &JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.outcome, Some(JobOutcome::Skipped(SkipReason::LockHeld)));
    }

    #[tokio::test]
    async fn transient_failure_retries_until_exhausted() {
        let (store, clock, worker) = setup(Arc::new(FixedResult(Err(JobError::Retryable(
            "503 from provider".into(),
        )))));
        store
            .enqueue(job("a").with_retry_policy(RetryPolicy::content_stage()))
            .await
            .unwrap();
        let q = QueueName::SummaryGenerate;

        assert_eq!(worker.drain(q).await.unwrap(), 1);
        let stored = store.get(q, &JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);

        // Backoff holds the retry back until its time comes.
        assert_eq!(worker.drain(q).await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(worker.drain(q).await.unwrap(), 1);
        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(worker.drain(q).await.unwrap(), 1);

        let stored = store.get(q, &JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts, 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let (store, _, worker) = setup(Arc::new(FixedResult(Err(JobError::Permanent(
            "400 bad request".into(),
        )))));
        store.enqueue(job("a")).await.unwrap();

        assert_eq!(worker.drain(QueueName::SummaryGenerate).await.unwrap(), 1);
        let stored = store.get(QueueName::SummaryGenerate, &JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn timeout_counts_as_retryable_failure() {
        let (store, _, worker) = setup(Arc::new(Slow));
        let worker = worker.with_job_timeout(Duration::from_millis(20));
        store.enqueue(job("a")).await.unwrap();

        let mut claimed = store.claim_next(QueueName::SummaryGenerate, t0()).await.unwrap().unwrap();
        let err = worker.execute_one(&mut claimed).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(claimed.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn missing_handler_fails_job() {
        let (store, _, worker) = setup(Arc::new(FixedResult(Ok(JobOutcome::Done))));
        let orphan = Job::new(QueueName::EmbeddingBatch, JobId::new("x"), serde_json::json!({}), t0());
        store.enqueue(orphan).await.unwrap();

        let mut claimed = store.claim_next(QueueName::EmbeddingBatch, t0()).await.unwrap().unwrap();
        assert!(worker.execute_one(&mut claimed).await.is_err());
        assert_eq!(claimed.state, JobState::Failed);
    }

    /// Store whose next `failing` updates fail.
    struct FlakyUpdates {
        inner: Arc<InMemoryJobStore>,
        failing: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for FlakyUpdates {
        async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome, JobStoreError> {
            self.inner.enqueue(job).await
        }

        async fn claim_next(
            &self,
            queue: QueueName,
            now: DateTime<Utc>,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.claim_next(queue, now).await
        }

        async fn renew_lease(
            &self,
            queue: QueueName,
            id: &JobId,
            now: DateTime<Utc>,
        ) -> Result<bool, JobStoreError> {
            self.inner.renew_lease(queue, id, now).await
        }

        async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
            let remaining = self.failing.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing.store(remaining - 1, Ordering::SeqCst);
                return Err(JobStoreError::Storage("connection reset".into()));
            }
            self.inner.update(job).await
        }

        async fn get(&self, queue: QueueName, id: &JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(queue, id).await
        }

        async fn list(
            &self,
            queue: QueueName,
            state: Option<JobState>,
            limit: usize,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list(queue, state, limit).await
        }

        async fn stats(&self, queue: QueueName) -> Result<QueueStats, JobStoreError> {
            self.inner.stats(queue).await
        }
    }

    fn flaky(failing: usize) -> (Arc<InMemoryJobStore>, Arc<ManualClock>, QueueWorker<FlakyUpdates>) {
        let inner = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = FlakyUpdates {
            inner: inner.clone(),
            failing: AtomicUsize::new(failing),
        };
        let mut worker = QueueWorker::new(store, clock.clone());
        worker.register_handler(QueueName::SummaryGenerate, Arc::new(FixedResult(Ok(JobOutcome::Done))));
        (inner, clock, worker)
    }

    #[tokio::test]
    async fn transient_persist_failure_is_retried() {
        let (store, _, worker) = flaky(1);
        store.enqueue(job("a")).await.unwrap();

        assert_eq!(worker.drain(QueueName::SummaryGenerate).await.unwrap(), 1);
        let stored = store.get(QueueName::SummaryGenerate, &JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(worker.stats.lock().unwrap().persist_failures, 0);
    }

    #[tokio::test]
    async fn unpersisted_job_runs_again_after_lease_lapses() {
        let (store, clock, worker) = flaky(PERSIST_ATTEMPTS as usize);
        let q = QueueName::SummaryGenerate;
        store.enqueue(job("a")).await.unwrap();

        assert_eq!(worker.drain(q).await.unwrap(), 1);
        assert_eq!(worker.stats.lock().unwrap().persist_failures, 1);
        let stuck = store.get(q, &JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(stuck.state, JobState::Active);

        // Still leased: nothing to claim, duplicates suppressed.
        assert_eq!(worker.drain(q).await.unwrap(), 0);
        assert!(store.enqueue(job("a")).await.unwrap().is_duplicate());

        clock.advance(chrono::Duration::minutes(3));
        assert_eq!(worker.drain(q).await.unwrap(), 0);
        let recovered = store.get(q, &JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(recovered.state, JobState::Waiting);

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(worker.drain(q).await.unwrap(), 1);
        let done = store.get(q, &JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts, 2);
    }

    /// Sleeps past the store lease, then checks whether the job was taken away.
    struct Lingering {
        store: Arc<InMemoryJobStore>,
        seen: Mutex<Option<JobState>>,
    }

    #[async_trait]
    impl JobHandler for Lingering {
        async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = self.store.claim_next(job.queue, Utc::now()).await;
            let state = self.store.get(job.queue, &job.id).await.ok().flatten().map(|j| j.state);
            *self.seen.lock().unwrap() = state;
            Ok(JobOutcome::Done)
        }
    }

    #[tokio::test]
    async fn heartbeat_keeps_long_job_claimed() {
        let store = Arc::new(InMemoryJobStore::new().with_lease(Duration::from_millis(40)));
        let handler = Arc::new(Lingering {
            store: store.clone(),
            seen: Mutex::new(None),
        });
        let mut worker = QueueWorker::new(store.clone(), Arc::new(dailycast_core::SystemClock))
            .with_heartbeat_interval(Duration::from_millis(10));
        worker.register_handler(QueueName::SummaryGenerate, handler.clone());
        store
            .enqueue(Job::new(QueueName::SummaryGenerate, JobId::new("a"), serde_json::json!({}), Utc::now()))
            .await
            .unwrap();

        assert_eq!(worker.drain(QueueName::SummaryGenerate).await.unwrap(), 1);
        assert_eq!(*handler.seen.lock().unwrap(), Some(JobState::Active));
        let stored = store.get(QueueName::SummaryGenerate, &JobId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempts, 1);
    }

    #[derive(Default)]
    struct FinishRecorder {
        finished: Mutex<Vec<(JobId, JobState)>>,
    }

    #[async_trait]
    impl JobHandler for FinishRecorder {
        async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError> {
            match job.id.as_str() {
                "ok" => Ok(JobOutcome::Done),
                _ => Err(JobError::Retryable("busy".into())),
            }
        }

        async fn on_finished(&self, job: &Job) {
            self.finished.lock().unwrap().push((job.id.clone(), job.state));
        }
    }

    #[tokio::test]
    async fn finish_hook_sees_terminal_jobs_only() {
        let recorder = Arc::new(FinishRecorder::default());
        let (store, _, worker) = setup(recorder.clone());
        store.enqueue(job("ok")).await.unwrap();
        store.enqueue(job("retry")).await.unwrap();

        assert_eq!(worker.drain(QueueName::SummaryGenerate).await.unwrap(), 2);
        assert_eq!(
            *recorder.finished.lock().unwrap(),
            vec![(JobId::new("ok"), JobState::Completed)]
        );
    }

    #[tokio::test]
    async fn spawned_loops_process_and_shut_down() {
        let count = Arc::new(AtomicUsize::new(0));
        let store = InMemoryJobStore::arc();
        let mut worker = QueueWorker::new(store.clone(), Arc::new(dailycast_core::SystemClock));
        worker.register_handler(QueueName::ScriptGenerate, Arc::new(Counting(count.clone())));

        for i in 0..5 {
            let j = Job::new(
                QueueName::ScriptGenerate,
                JobId::new(format!("s{i}")),
                serde_json::json!({}),
                Utc::now(),
            );
            store.enqueue(j).await.unwrap();
        }

        let handle = Arc::new(worker).spawn(
            QueueWorkerConfig::default()
                .with_concurrency(2)
                .with_poll_interval(Duration::from_millis(5)),
        );

        for _ in 0..200 {
            if count.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(handle.stats().jobs_succeeded, 5);
        handle.shutdown().await;
    }
}
