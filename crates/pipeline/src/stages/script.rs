use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use dailycast_infra::jobs::{Job, JobError, JobHandler, JobOutcome, SkipReason};

use super::{Stage, StageContext, StageError};
use crate::capabilities::NarrateCapability;
use crate::orchestrator::SummaryRefPayload;

/// Writes the narration script for a stored digest.
pub struct ScriptStage {
    ctx: StageContext,
    narrate: Arc<dyn NarrateCapability>,
}

impl ScriptStage {
    pub fn new(ctx: StageContext, narrate: Arc<dyn NarrateCapability>) -> Self {
        Self { ctx, narrate }
    }

    async fn run_locked(&self, payload: &SummaryRefPayload) -> Result<JobOutcome, StageError> {
        let ctx = &self.ctx;
        let user_id = payload.user_id;

        let Some(summary) = ctx
            .repository
            .summary_by_id(user_id, payload.summary_id)
            .await?
        else {
            return Ok(JobOutcome::Skipped(SkipReason::MissingSummary));
        };
        if summary.has_script() {
            ctx.orchestrator.advance_after_script(user_id, summary.id).await?;
            return Ok(JobOutcome::Skipped(SkipReason::AlreadyComplete));
        }
        if !summary.is_complete_summary() {
            return Ok(JobOutcome::Skipped(SkipReason::MissingSummary));
        }

        let language = ctx
            .repository
            .schedule_config(user_id)
            .await?
            .map(|c| c.podcast_language)
            .unwrap_or_default();

        // Exactly the articles the digest was built from.
        let context = ctx
            .repository
            .articles_by_ids(user_id, &summary.source_article_ids)
            .await?;

        let script = ctx
            .call(
                Stage::Script,
                self.narrate.generate(&summary.summary_text, &context, language),
            )
            .await?;
        if script.trim().is_empty() {
            return Err(StageError::Integrity("narrator returned an empty script".into()));
        }

        let summary_id = summary.id;
        let updated = summary.with_script(script, ctx.clock.now());
        ctx.repository.upsert_summary(&updated).await?;
        info!(user_id = %user_id, summary_id = %summary_id, language = language.as_str(), "script stored");

        ctx.orchestrator.advance_after_script(user_id, summary_id).await?;
        Ok(JobOutcome::Done)
    }
}

#[async_trait]
impl JobHandler for ScriptStage {
    #[instrument(skip(self, job), fields(job_id = %job.id, stage = "script"))]
    async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError> {
        let payload: SummaryRefPayload = job.payload_as()?;

        let Some(guard) = self.ctx.acquire(Stage::Script, payload.user_id).await else {
            return Ok(JobOutcome::Skipped(SkipReason::LockHeld));
        };
        let result = self.run_locked(&payload).await;
        self.ctx.release(guard).await;

        Ok(result?)
    }

    async fn on_finished(&self, job: &Job) {
        if let Ok(payload) = job.payload_as::<SummaryRefPayload>() {
            self.ctx
                .record_summary_ref_outcome(Stage::Script, payload.user_id, payload.summary_id, job)
                .await;
        }
    }
}
