//! Content repository boundary.
//!
//! The pipeline reads schedule settings and source articles and writes
//! summaries, episodes, and embeddings through [`ContentRepository`]. The
//! relational store behind it is owned elsewhere; [`InMemoryContentRepository`]
//! serves tests and single-process runs.

pub mod in_memory;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use uuid::Uuid;

use dailycast_core::{
    Article, ArticleId, DailySummary, EmbeddingCandidate, EmbeddingRecordType, PodcastEpisode,
    StageOutcomeRecord, SummaryId, UserId, UserScheduleConfig,
};

pub use in_memory::InMemoryContentRepository;

/// Page request for records that still lack an embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingEmbeddingQuery {
    pub user_id: UserId,
    pub record_type: EmbeddingRecordType,
    /// Exclusive lower bound on record id
    pub after: Option<Uuid>,
    pub limit: usize,
}

/// Repository error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Schedule settings of a user, if the user exists.
    async fn schedule_config(&self, user_id: UserId) -> RepositoryResult<Option<UserScheduleConfig>>;

    /// Users with at least one stage enabled.
    async fn scheduled_users(&self) -> RepositoryResult<Vec<UserId>>;

    /// Articles ingested at or after `since`, newest first.
    async fn recent_articles(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<Article>>;

    /// The user's articles among `ids`, in the order of `ids`; unknown ids
    /// are left out.
    async fn articles_by_ids(
        &self,
        user_id: UserId,
        ids: &[ArticleId],
    ) -> RepositoryResult<Vec<Article>>;

    async fn summary_for_date(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> RepositoryResult<Option<DailySummary>>;

    async fn summary_by_id(
        &self,
        user_id: UserId,
        summary_id: SummaryId,
    ) -> RepositoryResult<Option<DailySummary>>;

    /// Insert or replace a summary. One summary per user and date.
    async fn upsert_summary(&self, summary: &DailySummary) -> RepositoryResult<()>;

    async fn episode_for_summary(
        &self,
        user_id: UserId,
        summary_id: SummaryId,
    ) -> RepositoryResult<Option<PodcastEpisode>>;

    /// Insert or replace an episode. One episode per summary.
    async fn upsert_episode(&self, episode: &PodcastEpisode) -> RepositoryResult<()>;

    /// Records lacking an embedding, ordered by id ascending.
    async fn find_missing_embeddings(
        &self,
        query: MissingEmbeddingQuery,
    ) -> RepositoryResult<Vec<EmbeddingCandidate>>;

    async fn save_embedding(
        &self,
        record_type: EmbeddingRecordType,
        record_id: Uuid,
        vector: Vec<f32>,
    ) -> RepositoryResult<()>;

    async fn count_missing_embeddings(
        &self,
        user_id: UserId,
        record_type: EmbeddingRecordType,
    ) -> RepositoryResult<u64>;

    /// Insert or replace the outcome of one stage for a user and date.
    async fn record_stage_outcome(&self, record: &StageOutcomeRecord) -> RepositoryResult<()>;

    async fn stage_outcomes(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> RepositoryResult<Vec<StageOutcomeRecord>>;
}

#[async_trait]
impl<T: ContentRepository + ?Sized> ContentRepository for Arc<T> {
    async fn schedule_config(&self, user_id: UserId) -> RepositoryResult<Option<UserScheduleConfig>> {
        (**self).schedule_config(user_id).await
    }

    async fn scheduled_users(&self) -> RepositoryResult<Vec<UserId>> {
        (**self).scheduled_users().await
    }

    async fn recent_articles(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<Article>> {
        (**self).recent_articles(user_id, since, limit).await
    }

    async fn articles_by_ids(
        &self,
        user_id: UserId,
        ids: &[ArticleId],
    ) -> RepositoryResult<Vec<Article>> {
        (**self).articles_by_ids(user_id, ids).await
    }

    async fn summary_for_date(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> RepositoryResult<Option<DailySummary>> {
        (**self).summary_for_date(user_id, date).await
    }

    async fn summary_by_id(
        &self,
        user_id: UserId,
        summary_id: SummaryId,
    ) -> RepositoryResult<Option<DailySummary>> {
        (**self).summary_by_id(user_id, summary_id).await
    }

    async fn upsert_summary(&self, summary: &DailySummary) -> RepositoryResult<()> {
        (**self).upsert_summary(summary).await
    }

    async fn episode_for_summary(
        &self,
        user_id: UserId,
        summary_id: SummaryId,
    ) -> RepositoryResult<Option<PodcastEpisode>> {
        (**self).episode_for_summary(user_id, summary_id).await
    }

    async fn upsert_episode(&self, episode: &PodcastEpisode) -> RepositoryResult<()> {
        (**self).upsert_episode(episode).await
    }

    async fn find_missing_embeddings(
        &self,
        query: MissingEmbeddingQuery,
    ) -> RepositoryResult<Vec<EmbeddingCandidate>> {
        (**self).find_missing_embeddings(query).await
    }

    async fn save_embedding(
        &self,
        record_type: EmbeddingRecordType,
        record_id: Uuid,
        vector: Vec<f32>,
    ) -> RepositoryResult<()> {
        (**self).save_embedding(record_type, record_id, vector).await
    }

    async fn count_missing_embeddings(
        &self,
        user_id: UserId,
        record_type: EmbeddingRecordType,
    ) -> RepositoryResult<u64> {
        (**self).count_missing_embeddings(user_id, record_type).await
    }

    async fn record_stage_outcome(&self, record: &StageOutcomeRecord) -> RepositoryResult<()> {
        (**self).record_stage_outcome(record).await
    }

    async fn stage_outcomes(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> RepositoryResult<Vec<StageOutcomeRecord>> {
        (**self).stage_outcomes(user_id, date).await
    }
}
