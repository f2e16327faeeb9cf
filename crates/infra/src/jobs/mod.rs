//! Named job queues with retry, backoff, and deduplication.
//!
//! ## Design
//!
//! - One queue per pipeline stage, addressed by [`QueueName`]
//! - Jobs carry a deterministic [`JobId`]; enqueueing an id that is still
//!   waiting or active is a no-op
//! - Claims are leased; the worker heartbeats while a handler runs, and a
//!   lapsed lease hands the job back to the queue
//! - Terminal jobs are retained up to a per-state bound
//! - A [`QueueWorker`] claims jobs in priority order and runs handlers
//!
//! ## Components
//!
//! - `Job`: queued unit of work with payload and attempt history
//! - `JobStore`: persistence (in-memory, or Redis behind the `redis` feature)
//! - `QueueWorker`: runs handlers with retry logic

pub mod executor;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod types;

pub use executor::{JobHandler, QueueWorker, QueueWorkerConfig, QueueWorkerHandle, WorkerStats};
#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
pub use store::{
    DEFAULT_LEASE, EnqueueOutcome, InMemoryJobStore, JobStore, JobStoreError, QueueStats,
    RetentionPolicy,
};
pub use types::{
    BackoffStrategy, DEFAULT_PRIORITY, ELEVATED_PRIORITY, Job, JobAttemptRecord, JobError, JobId,
    JobOutcome, JobState, QueueName, RetryPolicy, SkipReason,
};
