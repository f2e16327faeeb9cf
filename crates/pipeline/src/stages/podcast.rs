use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use dailycast_core::{DailySummary, PodcastEpisode, PodcastLanguage};
use dailycast_infra::jobs::{Job, JobError, JobHandler, JobOutcome, SkipReason};

use super::{Stage, StageContext, StageError};
use crate::capabilities::{ObjectMetadata, ObjectStore, SynthesizeCapability};
use crate::orchestrator::SummaryRefPayload;

const AUDIO_CONTENT_TYPE: &str = "audio/mpeg";

/// Object key of an episode's audio: `podcasts/<user>/<date>-<lang>.mp3`.
pub fn audio_object_key(summary: &DailySummary, language: PodcastLanguage) -> String {
    format!(
        "podcasts/{}/{}-{}.mp3",
        summary.user_id,
        summary.date,
        language.as_str()
    )
}

/// Synthesizes and uploads the episode audio for a scripted digest.
pub struct PodcastStage {
    ctx: StageContext,
    synthesize: Arc<dyn SynthesizeCapability>,
    storage: Arc<dyn ObjectStore>,
}

impl PodcastStage {
    pub fn new(
        ctx: StageContext,
        synthesize: Arc<dyn SynthesizeCapability>,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            ctx,
            synthesize,
            storage,
        }
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
        let Some(script) = summary.script_text.clone().filter(|_| summary.has_script()) else {
            return Ok(JobOutcome::Skipped(SkipReason::MissingScript));
        };

        let Some(config) = ctx
            .repository
            .schedule_config(user_id)
            .await?
            .filter(|c| c.podcast_active())
        else {
            return Ok(JobOutcome::Skipped(SkipReason::Disabled));
        };
        let language = config.podcast_language;

        let mut episode = match ctx.repository.episode_for_summary(user_id, summary.id).await? {
            Some(episode) if episode.is_complete() => {
                return Ok(JobOutcome::Skipped(SkipReason::AlreadyComplete));
            }
            Some(episode) => episode,
            None => {
                let episode = PodcastEpisode::pending(user_id, summary.id, language, ctx.clock.now());
                ctx.repository.upsert_episode(&episode).await?;
                episode
            }
        };

        let audio = ctx
            .call(Stage::Podcast, self.synthesize.speak(&script, episode.language))
            .await?;
        let size = audio.len() as u64;
        let metadata = ObjectMetadata {
            key: audio_object_key(&summary, episode.language),
            content_type: AUDIO_CONTENT_TYPE.to_string(),
        };
        let url = ctx
            .call(Stage::Podcast, self.storage.put(audio, metadata))
            .await?;

        episode.complete(url, size, ctx.clock.now())?;
        ctx.repository.upsert_episode(&episode).await?;
        info!(
            user_id = %user_id,
            summary_id = %summary.id,
            episode_id = %episode.id,
            bytes = size,
            "podcast episode stored"
        );
        Ok(JobOutcome::Done)
    }
}

#[async_trait]
impl JobHandler for PodcastStage {
    #[instrument(skip(self, job), fields(job_id = %job.id, stage = "podcast"))]
    async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError> {
        let payload: SummaryRefPayload = job.payload_as()?;

        let Some(guard) = self.ctx.acquire(Stage::Podcast, payload.user_id).await else {
            return Ok(JobOutcome::Skipped(SkipReason::LockHeld));
        };
        let result = self.run_locked(&payload).await;
        self.ctx.release(guard).await;

        Ok(result?)
    }

    async fn on_finished(&self, job: &Job) {
        if let Ok(payload) = job.payload_as::<SummaryRefPayload>() {
            self.ctx
                .record_summary_ref_outcome(Stage::Podcast, payload.user_id, payload.summary_id, job)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use dailycast_core::UserId;

    #[test]
    fn object_key_layout() {
        let user: UserId = "0190f4c2-8c3e-7b1a-9d4e-2f6a1b3c5d7e".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let summary = DailySummary::new(user, date, "digest", vec![], Utc::now());
        assert_eq!(
            audio_object_key(&summary, PodcastLanguage::En),
            "podcasts/0190f4c2-8c3e-7b1a-9d4e-2f6a1b3c5d7e/2026-03-02-en.mp3"
        );
    }
}
