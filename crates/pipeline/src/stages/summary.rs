use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::{info, instrument, warn};

use dailycast_core::{DailySummary, EmbeddingRecordType};
use dailycast_infra::jobs::{Job, JobError, JobHandler, JobOutcome, SkipReason};

use super::{Stage, StageContext, StageError};
use crate::capabilities::SummarizeCapability;
use crate::orchestrator::SummaryJobPayload;

/// Builds the daily digest from recently ingested articles.
pub struct SummaryStage {
    ctx: StageContext,
    summarize: Arc<dyn SummarizeCapability>,
}

impl SummaryStage {
    pub fn new(ctx: StageContext, summarize: Arc<dyn SummarizeCapability>) -> Self {
        Self { ctx, summarize }
    }

    async fn run_locked(&self, payload: &SummaryJobPayload) -> Result<JobOutcome, StageError> {
        let ctx = &self.ctx;
        let user_id = payload.user_id;

        let existing = ctx
            .repository
            .summary_for_date(user_id, payload.calendar_date)
            .await?;
        if let Some(summary) = existing.as_ref().filter(|s| s.is_complete_summary()) {
            ctx.orchestrator.advance_after_summary(user_id, summary.id).await?;
            return Ok(JobOutcome::Skipped(SkipReason::AlreadyComplete));
        }

        if ctx.repository.schedule_config(user_id).await?.is_none() {
            return Ok(JobOutcome::Skipped(SkipReason::Disabled));
        }

        let now = ctx.clock.now();
        let lookback =
            Duration::from_std(ctx.config.summary_lookback).unwrap_or_else(|_| Duration::hours(24));
        let articles = ctx
            .repository
            .recent_articles(user_id, now - lookback, ctx.config.summary_max_articles)
            .await?;
        if articles.is_empty() {
            info!(user_id = %user_id, "no source articles; summary skipped");
            return Ok(JobOutcome::Skipped(SkipReason::NoSourceRecords));
        }

        let text = ctx
            .call(Stage::Summary, self.summarize.generate(&articles))
            .await?;
        if text.trim().is_empty() {
            return Err(StageError::Integrity("summarizer returned an empty digest".into()));
        }

        let source_ids = articles.iter().map(|a| a.id).collect();
        let summary = match existing {
            Some(mut summary) => {
                summary.summary_text = text;
                summary.source_article_ids = source_ids;
                summary.updated_at = now;
                summary
            }
            None => DailySummary::new(user_id, payload.calendar_date, text, source_ids, now),
        };
        ctx.repository.upsert_summary(&summary).await?;

        let stored = ctx
            .repository
            .summary_for_date(user_id, payload.calendar_date)
            .await?;
        if !stored.is_some_and(|s| s.id == summary.id && s.is_complete_summary()) {
            return Err(StageError::Integrity(format!(
                "summary {} not readable after upsert",
                summary.id
            )));
        }

        info!(
            user_id = %user_id,
            summary_id = %summary.id,
            articles = summary.source_article_ids.len(),
            "summary stored"
        );

        if let Err(e) = ctx.backfill.request(user_id, EmbeddingRecordType::Summary).await {
            warn!(user_id = %user_id, error = %e, "failed to request summary embeddings");
        }

        ctx.orchestrator.advance_after_summary(user_id, summary.id).await?;
        Ok(JobOutcome::Done)
    }
}

#[async_trait]
impl JobHandler for SummaryStage {
    #[instrument(skip(self, job), fields(job_id = %job.id, stage = "summary"))]
    async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError> {
        let payload: SummaryJobPayload = job.payload_as()?;

        let Some(guard) = self.ctx.acquire(Stage::Summary, payload.user_id).await else {
            return Ok(JobOutcome::Skipped(SkipReason::LockHeld));
        };
        let result = self.run_locked(&payload).await;
        self.ctx.release(guard).await;

        Ok(result?)
    }

    async fn on_finished(&self, job: &Job) {
        if let Ok(payload) = job.payload_as::<SummaryJobPayload>() {
            self.ctx
                .record_outcome(Stage::Summary, payload.user_id, payload.calendar_date, job)
                .await;
        }
    }
}
