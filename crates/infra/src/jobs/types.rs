//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dailycast_core::{EmbeddingRecordType, SummaryId, UserId};

/// Durable work queues, one per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    SummaryGenerate,
    ScriptGenerate,
    PodcastGenerate,
    EmbeddingBatch,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::SummaryGenerate,
        QueueName::ScriptGenerate,
        QueueName::PodcastGenerate,
        QueueName::EmbeddingBatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::SummaryGenerate => "summary-generate",
            QueueName::ScriptGenerate => "script-generate",
            QueueName::PodcastGenerate => "podcast-generate",
            QueueName::EmbeddingBatch => "embedding-batch",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic job identity.
///
/// Two enqueues describing the same unit of work produce the same id, which
/// is what lets the store suppress duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// `summary:<userId>:<YYYY-MM-DD>`
    pub fn summary(user_id: UserId, date: NaiveDate) -> Self {
        Self(format!("summary:{user_id}:{date}"))
    }

    /// `script:<userId>:<summaryId>`
    pub fn script(user_id: UserId, summary_id: SummaryId) -> Self {
        Self(format!("script:{user_id}:{summary_id}"))
    }

    /// `podcast:<userId>:<summaryId>`
    pub fn podcast(user_id: UserId, summary_id: SummaryId) -> Self {
        Self(format!("podcast:{user_id}:{summary_id}"))
    }

    /// `embedding:<userId>:<recordType>:<cursor|start>`
    pub fn embedding(
        user_id: UserId,
        record_type: EmbeddingRecordType,
        after: Option<Uuid>,
    ) -> Self {
        match after {
            Some(cursor) => Self(format!("embedding:{user_id}:{record_type}:{cursor}")),
            None => Self(format!("embedding:{user_id}:{record_type}:start")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued (possibly delayed or waiting for a retry)
    Waiting,
    /// Claimed by a worker
    Active,
    /// Finished; see `Job::outcome`
    Completed,
    /// Attempts exhausted or permanent error
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Waiting or active jobs suppress duplicates.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Why a handler did nothing. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoSourceRecords,
    MissingSummary,
    MissingScript,
    LockHeld,
    AlreadyComplete,
    Disabled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoSourceRecords => "no_source_records",
            SkipReason::MissingSummary => "missing_summary",
            SkipReason::MissingScript => "missing_script",
            SkipReason::LockHeld => "lock_held",
            SkipReason::AlreadyComplete => "already_complete",
            SkipReason::Disabled => "disabled",
        }
    }
}

/// How a completed job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum JobOutcome {
    Done,
    Skipped(SkipReason),
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
///
/// `max_attempts` counts every execution, the first one included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::content_stage()
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::content_stage()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Summary and script generation: 3 attempts, 30s doubling, capped at 2 min.
    pub fn content_stage() -> Self {
        Self::exponential(3, Duration::from_secs(30), Duration::from_secs(120))
    }

    /// Audio synthesis: 3 attempts, 1 min apart.
    pub fn synthesis_stage() -> Self {
        Self::fixed(3, Duration::from_secs(60))
    }

    /// Embedding pages: 3 attempts, 2s doubling.
    pub fn embedding_batch() -> Self {
        Self::exponential(3, Duration::from_secs(2), Duration::from_secs(30))
    }

    /// Delay before the retry that follows attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempt` executions.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Default priority; lower values are claimed first.
pub const DEFAULT_PRIORITY: u8 = 10;

/// Priority for continuation jobs that should jump the line.
pub const ELEVATED_PRIORITY: u8 = 1;

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueName,
    /// JSON payload
    pub payload: serde_json::Value,
    pub state: JobState,
    pub priority: u8,
    pub retry_policy: RetryPolicy,
    /// Executions started so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest instant the job may be claimed
    pub run_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Claim lease of an active job; a lapsed lease returns the job to the queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub outcome: Option<JobOutcome>,
    pub last_error: Option<String>,
    /// Execution history (one record per attempt)
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    /// Create a waiting job, ready immediately.
    pub fn new(
        queue: QueueName,
        id: JobId,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            queue,
            payload,
            state: JobState::Waiting,
            priority: DEFAULT_PRIORITY,
            retry_policy: RetryPolicy::default(),
            attempts: 0,
            created_at: now,
            updated_at: now,
            run_at: now,
            finished_at: None,
            lease_expires_at: None,
            outcome: None,
            last_error: None,
            history: Vec::new(),
        }
    }

    /// Serialize `payload` and create the job.
    pub fn with_payload<P: Serialize>(
        queue: QueueName,
        id: JobId,
        payload: &P,
        now: DateTime<Utc>,
    ) -> Result<Self, JobError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| JobError::InvalidPayload(e.to_string()))?;
        Ok(Self::new(queue, id, value, now))
    }

    /// Set a custom retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Hold the job back for `delay` after creation.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.run_at =
            self.created_at + chrono::Duration::from_std(delay).unwrap_or_default();
        self
    }

    /// Schedule the job for a specific instant.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = at;
        self
    }

    /// Decode the payload.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, JobError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::InvalidPayload(format!("{}: {e}", self.id)))
    }

    /// Check if the job may be claimed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Waiting && self.run_at <= now
    }

    /// Mark job as claimed.
    pub fn mark_active(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempts += 1;
        self.updated_at = now;
    }

    /// Mark job as claimed under a lease ending `lease` after `now`.
    pub fn mark_leased(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.mark_active(now);
        self.lease_expires_at = Some(now + chrono::Duration::from_std(lease).unwrap_or_default());
    }

    /// Check if the job is active but its claim lease ran out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// Give up an abandoned claim, counting it as a failed attempt.
    ///
    /// Returns `true` if the job went back to waiting.
    pub fn expire_lease(&mut self, now: DateTime<Utc>) -> bool {
        let started = self.updated_at;
        self.mark_failed("claim lease expired".to_string(), true, started, now)
    }

    /// Mark job as completed.
    pub fn mark_completed(
        &mut self,
        outcome: JobOutcome,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.state = JobState::Completed;
        self.lease_expires_at = None;
        self.outcome = Some(outcome);
        self.updated_at = now;
        self.finished_at = Some(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            success: true,
            error: None,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }

    /// Mark job as failed. Returns `true` if a retry was scheduled.
    pub fn mark_failed(
        &mut self,
        error: String,
        retryable: bool,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        self.updated_at = now;
        self.lease_expires_at = None;
        self.last_error = Some(error.clone());
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            success: false,
            error: Some(error),
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });

        if retryable && self.retry_policy.should_retry(self.attempts) {
            let delay = self.retry_policy.delay_for_attempt(self.attempts);
            self.run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            self.state = JobState::Waiting;
            true
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
            false
        }
    }
}

/// Error returned by job handlers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// Transient failure; retried with backoff while attempts remain
    #[error("transient failure: {0}")]
    Retryable(String),
    /// Permanent failure; never retried
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// Payload could not be decoded; never retried
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}
