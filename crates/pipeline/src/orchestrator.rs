//! Flow orchestration for the summary → script → podcast chain.
//!
//! Per user and calendar date the chain moves through
//! `idle → summary → script → podcast`, one queued job per stage. Every
//! enqueue uses a deterministic [`JobId`], so any entry point can be called
//! repeatedly: a stage that is already waiting or active is not queued twice,
//! and a stage whose output exists is not queued at all.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use dailycast_core::{
    ChainStage, Clock, DailySummary, StageOutcomeRecord, StageResolution, SummaryId, UserId,
};
use dailycast_infra::jobs::{
    EnqueueOutcome, Job, JobError, JobId, JobOutcome, JobState, JobStore, JobStoreError,
    QueueName, RetryPolicy, SkipReason,
};
use dailycast_infra::repository::{ContentRepository, RepositoryError};

/// Payload of `summary-generate` jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryJobPayload {
    pub user_id: UserId,
    pub calendar_date: NaiveDate,
}

/// Payload of `script-generate` and `podcast-generate` jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRefPayload {
    pub user_id: UserId,
    pub summary_id: SummaryId,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("unknown user: {0}")]
    UnknownUser(UserId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Queue(#[from] JobStoreError),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// What an orchestration call did for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "state", rename_all = "snake_case")]
pub enum StageAction {
    /// A fresh job was queued
    Enqueued,
    /// A job with the same identity is already waiting or active
    AlreadyQueued(JobState),
    /// The stage output already exists
    AlreadyComplete,
    /// An earlier stage has not produced its output yet
    NotReady,
    /// The stage is turned off in the user's settings
    Disabled,
}

impl From<EnqueueOutcome> for StageAction {
    fn from(outcome: EnqueueOutcome) -> Self {
        match outcome {
            EnqueueOutcome::Enqueued(_) => StageAction::Enqueued,
            EnqueueOutcome::Duplicate { state, .. } => StageAction::AlreadyQueued(state),
        }
    }
}

/// Result of a "run now" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunNowReport {
    pub date: NaiveDate,
    pub summary: StageAction,
    pub script: StageAction,
    pub podcast: StageAction,
}

/// User-visible state of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Idle,
    Waiting,
    Active,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Idle => "idle",
            StageStatus::Waiting => "waiting",
            StageStatus::Active => "active",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    fn from_live(state: JobState) -> Option<Self> {
        match state {
            JobState::Waiting => Some(StageStatus::Waiting),
            JobState::Active => Some(StageStatus::Active),
            JobState::Completed | JobState::Failed => None,
        }
    }
}

/// Per-stage state of one user's chain for one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowStatus {
    pub summary: StageStatus,
    pub script: StageStatus,
    pub podcast: StageStatus,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "summary:{}, script:{}, podcast:{}",
            self.summary.as_str(),
            self.script.as_str(),
            self.podcast.as_str()
        )
    }
}

/// Enqueues and advances the stage chain.
pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    repository: Arc<dyn ContentRepository>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        repository: Arc<dyn ContentRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            repository,
            clock,
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Re-enter the chain at the first stage whose output is missing.
    #[instrument(skip_all, fields(user_id = %user_id, date = %date), err)]
    pub async fn run_now(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<RunNowReport, OrchestratorError> {
        let config = self
            .repository
            .schedule_config(user_id)
            .await?
            .ok_or(OrchestratorError::UnknownUser(user_id))?;
        let podcast_blocked = if config.podcast_active() {
            StageAction::NotReady
        } else {
            StageAction::Disabled
        };

        let mut report = RunNowReport {
            date,
            summary: StageAction::AlreadyComplete,
            script: StageAction::NotReady,
            podcast: podcast_blocked,
        };

        let summary = match self.completed_summary(user_id, date).await? {
            Some(summary) => summary,
            None => {
                report.summary = self.enqueue_summary(user_id, date).await?;
                info!(summary = ?report.summary, "run now: summary");
                return Ok(report);
            }
        };

        if !summary.has_script() {
            report.script = self.enqueue_script(user_id, summary.id).await?;
            info!(script = ?report.script, "run now: script");
            return Ok(report);
        }
        report.script = StageAction::AlreadyComplete;

        if config.podcast_active() {
            report.podcast = self.podcast_action(user_id, summary.id).await?;
        }
        info!(podcast = ?report.podcast, "run now: podcast");
        Ok(report)
    }

    /// Scheduler entry point for the summary stage.
    #[instrument(skip_all, fields(user_id = %user_id, date = %date), err)]
    pub async fn trigger_summary(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<StageAction, OrchestratorError> {
        if self.completed_summary(user_id, date).await?.is_some() {
            debug!("summary already complete");
            return Ok(StageAction::AlreadyComplete);
        }
        self.enqueue_summary(user_id, date).await
    }

    /// Scheduler entry point at podcast time: continue the chain if the
    /// summary exists but a later stage is still missing.
    #[instrument(skip_all, fields(user_id = %user_id, date = %date), err)]
    pub async fn trigger_podcast_catch_up(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<StageAction, OrchestratorError> {
        let Some(summary) = self.completed_summary(user_id, date).await? else {
            return Ok(StageAction::NotReady);
        };
        if !summary.has_script() {
            return self.enqueue_script(user_id, summary.id).await;
        }
        let active = self
            .repository
            .schedule_config(user_id)
            .await?
            .is_some_and(|c| c.podcast_active());
        if !active {
            return Ok(StageAction::Disabled);
        }
        self.podcast_action(user_id, summary.id).await
    }

    /// Called by the summary stage once the digest is persisted.
    pub async fn advance_after_summary(
        &self,
        user_id: UserId,
        summary_id: SummaryId,
    ) -> Result<StageAction, OrchestratorError> {
        self.enqueue_script(user_id, summary_id).await
    }

    /// Called by the script stage once the script is persisted.
    pub async fn advance_after_script(
        &self,
        user_id: UserId,
        summary_id: SummaryId,
    ) -> Result<StageAction, OrchestratorError> {
        let active = self
            .repository
            .schedule_config(user_id)
            .await?
            .is_some_and(|c| c.podcast_active());
        if !active {
            debug!(user_id = %user_id, "podcast disabled; chain ends at script");
            return Ok(StageAction::Disabled);
        }
        self.enqueue_podcast(user_id, summary_id).await
    }

    /// Derive each stage's state from queue state, stored output, and
    /// recorded stage outcomes.
    pub async fn flow_status(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<FlowStatus, OrchestratorError> {
        let config = self.repository.schedule_config(user_id).await?;
        let podcast_active = config.is_some_and(|c| c.podcast_active());
        let summary = self.repository.summary_for_date(user_id, date).await?;
        let outcomes = self.repository.stage_outcomes(user_id, date).await?;

        let summary_job = self
            .jobs
            .get(QueueName::SummaryGenerate, &JobId::summary(user_id, date))
            .await?;
        let summary_status = derive_status(
            summary_job.as_ref(),
            summary.as_ref().is_some_and(|s| s.is_complete_summary()),
            recorded(&outcomes, ChainStage::Summary),
            &[SkipReason::NoSourceRecords, SkipReason::Disabled],
        );

        if summary_status == StageStatus::Skipped {
            return Ok(FlowStatus {
                summary: StageStatus::Skipped,
                script: StageStatus::Skipped,
                podcast: StageStatus::Skipped,
            });
        }

        let Some(summary) = summary else {
            return Ok(FlowStatus {
                summary: summary_status,
                script: StageStatus::Idle,
                podcast: if podcast_active {
                    StageStatus::Idle
                } else {
                    StageStatus::Skipped
                },
            });
        };

        let script_job = self
            .jobs
            .get(QueueName::ScriptGenerate, &JobId::script(user_id, summary.id))
            .await?;
        let script_status = derive_status(
            script_job.as_ref(),
            summary.has_script(),
            recorded(&outcomes, ChainStage::Script),
            &[SkipReason::MissingSummary],
        );

        let podcast_status = if !podcast_active {
            StageStatus::Skipped
        } else {
            let episode_done = self
                .repository
                .episode_for_summary(user_id, summary.id)
                .await?
                .is_some_and(|e| e.is_complete());
            let podcast_job = self
                .jobs
                .get(QueueName::PodcastGenerate, &JobId::podcast(user_id, summary.id))
                .await?;
            derive_status(
                podcast_job.as_ref(),
                episode_done,
                recorded(&outcomes, ChainStage::Podcast),
                &[SkipReason::MissingScript, SkipReason::MissingSummary, SkipReason::Disabled],
            )
        };

        Ok(FlowStatus {
            summary: summary_status,
            script: script_status,
            podcast: podcast_status,
        })
    }

    async fn completed_summary(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<Option<DailySummary>, OrchestratorError> {
        Ok(self
            .repository
            .summary_for_date(user_id, date)
            .await?
            .filter(|s| s.is_complete_summary()))
    }

    async fn podcast_action(
        &self,
        user_id: UserId,
        summary_id: SummaryId,
    ) -> Result<StageAction, OrchestratorError> {
        let done = self
            .repository
            .episode_for_summary(user_id, summary_id)
            .await?
            .is_some_and(|e| e.is_complete());
        if done {
            return Ok(StageAction::AlreadyComplete);
        }
        self.enqueue_podcast(user_id, summary_id).await
    }

    async fn enqueue_summary(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<StageAction, OrchestratorError> {
        let payload = SummaryJobPayload {
            user_id,
            calendar_date: date,
        };
        let job = Job::with_payload(
            QueueName::SummaryGenerate,
            JobId::summary(user_id, date),
            &payload,
            self.clock.now(),
        )?
        .with_retry_policy(RetryPolicy::content_stage());
        self.submit(job).await
    }

    async fn enqueue_script(
        &self,
        user_id: UserId,
        summary_id: SummaryId,
    ) -> Result<StageAction, OrchestratorError> {
        let payload = SummaryRefPayload {
            user_id,
            summary_id,
        };
        let job = Job::with_payload(
            QueueName::ScriptGenerate,
            JobId::script(user_id, summary_id),
            &payload,
            self.clock.now(),
        )?
        .with_retry_policy(RetryPolicy::content_stage());
        self.submit(job).await
    }

    async fn enqueue_podcast(
        &self,
        user_id: UserId,
        summary_id: SummaryId,
    ) -> Result<StageAction, OrchestratorError> {
        let payload = SummaryRefPayload {
            user_id,
            summary_id,
        };
        let job = Job::with_payload(
            QueueName::PodcastGenerate,
            JobId::podcast(user_id, summary_id),
            &payload,
            self.clock.now(),
        )?
        .with_retry_policy(RetryPolicy::synthesis_stage());
        self.submit(job).await
    }

    async fn submit(&self, job: Job) -> Result<StageAction, OrchestratorError> {
        let queue = job.queue;
        let outcome = self.jobs.enqueue(job).await?;
        match &outcome {
            EnqueueOutcome::Enqueued(id) => {
                info!(queue = %queue, job_id = %id, "job enqueued");
            }
            EnqueueOutcome::Duplicate { id, state } => {
                debug!(queue = %queue, job_id = %id, state = state.as_str(), "duplicate enqueue suppressed");
            }
        }
        Ok(outcome.into())
    }
}

fn recorded(outcomes: &[StageOutcomeRecord], stage: ChainStage) -> Option<StageResolution> {
    outcomes.iter().find(|r| r.stage == stage).map(|r| r.resolution)
}

/// Stage state from its job (if any), whether its output exists, and its
/// recorded outcome.
///
/// A live job wins so a re-run shows as in progress. The recorded outcome
/// outranks the terminal job, which retention may already have dropped.
fn derive_status(
    job: Option<&Job>,
    output_exists: bool,
    recorded: Option<StageResolution>,
    skip_reasons: &[SkipReason],
) -> StageStatus {
    if let Some(live) = job.and_then(|j| StageStatus::from_live(j.state)) {
        return live;
    }
    if output_exists {
        return StageStatus::Completed;
    }
    match recorded {
        Some(StageResolution::Skipped) => return StageStatus::Skipped,
        Some(StageResolution::Failed) => return StageStatus::Failed,
        None => {}
    }
    match job {
        Some(j) if j.state == JobState::Failed => StageStatus::Failed,
        Some(j) => match j.outcome {
            Some(JobOutcome::Skipped(reason)) if skip_reasons.contains(&reason) => {
                StageStatus::Skipped
            }
            _ => StageStatus::Idle,
        },
        None => StageStatus::Idle,
    }
}
