//! Stage workers for the content chain.
//!
//! Every stage follows the same contract:
//!
//! 1. take the per-user lock of its own stage; if held (or the lock store
//!    errors) return `Skipped(LockHeld)` without failing the job
//! 2. re-check the completion precondition under the lock
//! 3. gather inputs from the repository
//! 4. call the external capability under a timeout
//! 5. persist the result
//! 6. enqueue the next stage
//! 7. release the lock, on success and failure alike
//!
//! Once a job is final, a skip that ends the chain or an exhausted failure
//! is written to the repository as a [`StageOutcomeRecord`] for status reads.

mod podcast;
mod script;
mod summary;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, warn};

use dailycast_core::{
    ChainStage, Clock, DomainError, StageOutcomeRecord, StageResolution, SummaryId, UserId,
};
use dailycast_infra::PipelineConfig;
use dailycast_infra::jobs::{
    Job, JobError, JobOutcome, JobState, JobStoreError, QueueName, SkipReason,
};
use dailycast_infra::lock::{DistributedLock, LockGuard, LockKey};
use dailycast_infra::repository::{ContentRepository, RepositoryError};

use crate::capabilities::CapabilityError;
use crate::embeddings::EmbeddingBackfill;
use crate::orchestrator::{Orchestrator, OrchestratorError};

pub use podcast::PodcastStage;
pub use script::ScriptStage;
pub use summary::SummaryStage;

/// Content stages, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Summary,
    Script,
    Podcast,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Summary => "summary",
            Stage::Script => "script",
            Stage::Podcast => "podcast",
        }
    }

    pub fn queue(&self) -> QueueName {
        match self {
            Stage::Summary => QueueName::SummaryGenerate,
            Stage::Script => QueueName::ScriptGenerate,
            Stage::Podcast => QueueName::PodcastGenerate,
        }
    }

    pub fn lock_key(&self, user_id: UserId) -> LockKey {
        LockKey::for_stage(self.as_str(), user_id)
    }

    pub fn chain_stage(&self) -> ChainStage {
        match self {
            Stage::Summary => ChainStage::Summary,
            Stage::Script => ChainStage::Script,
            Stage::Podcast => ChainStage::Podcast,
        }
    }
}

/// Resolution worth keeping for a finished job; `None` for jobs that
/// produced output or will be re-driven (lock contention, already done).
fn final_resolution(job: &Job) -> Option<(StageResolution, String)> {
    match (job.state, job.outcome) {
        (JobState::Failed, _) => Some((
            StageResolution::Failed,
            job.last_error.clone().unwrap_or_default(),
        )),
        (JobState::Completed, Some(JobOutcome::Skipped(reason))) => match reason {
            SkipReason::LockHeld | SkipReason::AlreadyComplete => None,
            SkipReason::NoSourceRecords
            | SkipReason::MissingSummary
            | SkipReason::MissingScript
            | SkipReason::Disabled => Some((StageResolution::Skipped, reason.as_str().to_string())),
        },
        _ => None,
    }
}

/// Stage failure, classified into retryable and permanent job errors.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("{stage} capability call timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Orchestration(#[from] OrchestratorError),
    #[error(transparent)]
    Queue(#[from] JobStoreError),
    /// Stored state does not match what was just written
    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl From<StageError> for JobError {
    fn from(e: StageError) -> Self {
        let msg = e.to_string();
        let retryable = match &e {
            StageError::Repository(RepositoryError::Backend(_)) => true,
            StageError::Repository(_) => false,
            StageError::Capability(c) => c.is_retryable(),
            StageError::Timeout { .. } => true,
            StageError::Orchestration(OrchestratorError::Repository(RepositoryError::Backend(_)))
            | StageError::Orchestration(OrchestratorError::Queue(_)) => true,
            StageError::Orchestration(_) => false,
            StageError::Queue(_) => true,
            StageError::Domain(_) | StageError::Integrity(_) => false,
        };
        if retryable {
            JobError::Retryable(msg)
        } else {
            JobError::Permanent(msg)
        }
    }
}

/// Shared dependencies of the stage workers.
#[derive(Clone)]
pub struct StageContext {
    pub repository: Arc<dyn ContentRepository>,
    pub lock: DistributedLock,
    pub orchestrator: Arc<Orchestrator>,
    pub backfill: Arc<EmbeddingBackfill>,
    pub clock: Arc<dyn Clock>,
    pub config: PipelineConfig,
}

impl StageContext {
    /// Take the stage lock for `user_id`. `None` means "held"; lock store
    /// errors are logged and reported the same way.
    pub(crate) async fn acquire(&self, stage: Stage, user_id: UserId) -> Option<LockGuard> {
        match self
            .lock
            .try_lock(stage.lock_key(user_id), self.config.lock_ttl)
            .await
        {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => {
                debug!(stage = stage.as_str(), user_id = %user_id, "stage lock held elsewhere");
                None
            }
            Err(e) => {
                warn!(stage = stage.as_str(), user_id = %user_id, error = %e, "lock store error; treating as held");
                None
            }
        }
    }

    /// Release a stage lock, logging instead of failing.
    pub(crate) async fn release(&self, guard: LockGuard) {
        let key = guard.key().clone();
        if guard.is_lost() {
            warn!(lock_key = %key, "stage lock was lost while held");
        }
        if let Err(e) = guard.release().await {
            warn!(lock_key = %key, error = %e, "failed to release stage lock");
        }
    }

    /// Persist the final outcome of `job` for `user_id` on `date`.
    pub(crate) async fn record_outcome(
        &self,
        stage: Stage,
        user_id: UserId,
        date: NaiveDate,
        job: &Job,
    ) {
        let Some((resolution, detail)) = final_resolution(job) else {
            return;
        };
        let record = StageOutcomeRecord {
            user_id,
            date,
            stage: stage.chain_stage(),
            resolution,
            detail,
            recorded_at: self.clock.now(),
        };
        if let Err(e) = self.repository.record_stage_outcome(&record).await {
            warn!(stage = stage.as_str(), user_id = %user_id, error = %e, "failed to record stage outcome");
        }
    }

    /// Like [`Self::record_outcome`] for stages addressed by summary id.
    pub(crate) async fn record_summary_ref_outcome(
        &self,
        stage: Stage,
        user_id: UserId,
        summary_id: SummaryId,
        job: &Job,
    ) {
        if final_resolution(job).is_none() {
            return;
        }
        match self.repository.summary_by_id(user_id, summary_id).await {
            Ok(Some(summary)) => self.record_outcome(stage, user_id, summary.date, job).await,
            Ok(None) => debug!(stage = stage.as_str(), summary_id = %summary_id, "summary gone; outcome not recorded"),
            Err(e) => warn!(stage = stage.as_str(), summary_id = %summary_id, error = %e, "failed to load summary for outcome"),
        }
    }

    /// Run a capability call under the configured timeout.
    pub(crate) async fn call<T, F>(&self, stage: Stage, fut: F) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, CapabilityError>>,
    {
        let after = self.config.capability_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StageError::Timeout {
                stage: stage.as_str(),
                after,
            }),
        }
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_follow_namespace() {
        let user: UserId = "0190f4c2-8c3e-7b1a-9d4e-2f6a1b3c5d7e".parse().unwrap();
        assert_eq!(
            Stage::Podcast.lock_key(user).as_str(),
            "lock:podcast:0190f4c2-8c3e-7b1a-9d4e-2f6a1b3c5d7e"
        );
        assert_eq!(Stage::Script.queue(), QueueName::ScriptGenerate);
    }

    #[test]
    fn only_chain_ending_outcomes_are_kept() {
        let now = chrono::Utc::now();
        let mut job = Job::new(
            QueueName::SummaryGenerate,
            dailycast_infra::jobs::JobId::new("summary:u:2026-03-02"),
            serde_json::Value::Null,
            now,
        );
        job.mark_active(now);

        let mut skipped = job.clone();
        skipped.mark_completed(JobOutcome::Skipped(SkipReason::NoSourceRecords), now, now);
        assert_eq!(
            final_resolution(&skipped),
            Some((StageResolution::Skipped, "no_source_records".to_string()))
        );

        let mut contended = job.clone();
        contended.mark_completed(JobOutcome::Skipped(SkipReason::LockHeld), now, now);
        assert_eq!(final_resolution(&contended), None);

        let mut failed = job.clone();
        failed.mark_failed("401 unauthorized".into(), false, now, now);
        assert_eq!(
            final_resolution(&failed),
            Some((StageResolution::Failed, "401 unauthorized".to_string()))
        );

        let mut retrying = job;
        retrying.mark_failed("503".into(), true, now, now);
        assert_eq!(final_resolution(&retrying), None);
    }

    #[test]
    fn error_classification() {
        let transient: JobError = StageError::Capability(CapabilityError::RateLimited("429".into())).into();
        assert!(transient.is_retryable());

        let permanent: JobError = StageError::Capability(CapabilityError::Permanent("401".into())).into();
        assert!(!permanent.is_retryable());

        let timeout: JobError = StageError::Timeout {
            stage: "summary",
            after: Duration::from_secs(1),
        }
        .into();
        assert!(timeout.is_retryable());

        let integrity: JobError = StageError::Integrity("mismatch".into()).into();
        assert!(!integrity.is_retryable());

        let conflict: JobError = StageError::Repository(RepositoryError::Conflict("dup".into())).into();
        assert!(!conflict.is_retryable());
    }
}
