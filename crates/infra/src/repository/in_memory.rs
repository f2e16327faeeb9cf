use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use dailycast_core::{
    Article, ArticleId, ChainStage, DailySummary, EmbeddingCandidate, EmbeddingRecordType,
    PodcastEpisode, StageOutcomeRecord, SummaryId, UserId, UserScheduleConfig,
};

use super::{ContentRepository, MissingEmbeddingQuery, RepositoryError, RepositoryResult};

#[derive(Debug, Default)]
struct Tables {
    configs: HashMap<UserId, UserScheduleConfig>,
    articles: Vec<Article>,
    summaries: HashMap<SummaryId, DailySummary>,
    episodes: Vec<PodcastEpisode>,
    embeddings: HashMap<(EmbeddingRecordType, Uuid), Vec<f32>>,
    outcomes: HashMap<(UserId, NaiveDate, ChainStage), StageOutcomeRecord>,
}

impl Tables {
    fn candidates(
        &self,
        user_id: UserId,
        record_type: EmbeddingRecordType,
    ) -> Vec<EmbeddingCandidate> {
        let mut out: Vec<EmbeddingCandidate> = match record_type {
            EmbeddingRecordType::Article => self
                .articles
                .iter()
                .filter(|a| a.user_id == user_id)
                .map(|a| EmbeddingCandidate {
                    id: *a.id.as_uuid(),
                    text: format!("{}\n{}", a.title, a.body),
                })
                .collect(),
            EmbeddingRecordType::Summary => self
                .summaries
                .values()
                .filter(|s| s.user_id == user_id)
                .map(|s| EmbeddingCandidate {
                    id: *s.id.as_uuid(),
                    text: s.summary_text.clone(),
                })
                .collect(),
        };
        out.retain(|c| !self.embeddings.contains_key(&(record_type, c.id)));
        out.sort_by_key(|c| c.id);
        out
    }
}

/// In-memory content repository for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryContentRepository {
    tables: RwLock<Tables>,
}

impl InMemoryContentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed or replace a user's schedule settings.
    pub fn put_schedule_config(&self, user_id: UserId, config: UserScheduleConfig) {
        self.tables.write().unwrap().configs.insert(user_id, config);
    }

    /// Seed an ingested article.
    pub fn insert_article(&self, article: Article) {
        self.tables.write().unwrap().articles.push(article);
    }

    /// Stored embedding of a record, if any.
    pub fn embedding(&self, record_type: EmbeddingRecordType, record_id: Uuid) -> Option<Vec<f32>> {
        self.tables
            .read()
            .unwrap()
            .embeddings
            .get(&(record_type, record_id))
            .cloned()
    }

    pub fn summaries(&self, user_id: UserId) -> Vec<DailySummary> {
        let tables = self.tables.read().unwrap();
        let mut out: Vec<_> = tables
            .summaries
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.date);
        out
    }
}

#[async_trait]
impl ContentRepository for InMemoryContentRepository {
    async fn schedule_config(&self, user_id: UserId) -> RepositoryResult<Option<UserScheduleConfig>> {
        Ok(self.tables.read().unwrap().configs.get(&user_id).cloned())
    }

    async fn scheduled_users(&self) -> RepositoryResult<Vec<UserId>> {
        let tables = self.tables.read().unwrap();
        let mut users: Vec<UserId> = tables
            .configs
            .iter()
            .filter(|(_, c)| c.summary_enabled || c.podcast_enabled)
            .map(|(u, _)| *u)
            .collect();
        users.sort();
        Ok(users)
    }

    async fn recent_articles(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<Article>> {
        let tables = self.tables.read().unwrap();
        let mut out: Vec<Article> = tables
            .articles
            .iter()
            .filter(|a| a.user_id == user_id && a.ingested_at >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.ingested_at.cmp(&a.ingested_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn articles_by_ids(
        &self,
        user_id: UserId,
        ids: &[ArticleId],
    ) -> RepositoryResult<Vec<Article>> {
        let tables = self.tables.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                tables
                    .articles
                    .iter()
                    .find(|a| a.id == *id && a.user_id == user_id)
                    .cloned()
            })
            .collect())
    }

    async fn summary_for_date(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> RepositoryResult<Option<DailySummary>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .summaries
            .values()
            .find(|s| s.user_id == user_id && s.date == date)
            .cloned())
    }

    async fn summary_by_id(
        &self,
        user_id: UserId,
        summary_id: SummaryId,
    ) -> RepositoryResult<Option<DailySummary>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .summaries
            .get(&summary_id)
            .filter(|s| s.user_id == user_id)
            .cloned())
    }

    async fn upsert_summary(&self, summary: &DailySummary) -> RepositoryResult<()> {
        let mut tables = self.tables.write().unwrap();
        let clash = tables.summaries.values().any(|s| {
            s.user_id == summary.user_id && s.date == summary.date && s.id != summary.id
        });
        if clash {
            return Err(RepositoryError::Conflict(format!(
                "summary for {} on {} already exists",
                summary.user_id, summary.date
            )));
        }
        tables.summaries.insert(summary.id, summary.clone());
        Ok(())
    }

    async fn episode_for_summary(
        &self,
        user_id: UserId,
        summary_id: SummaryId,
    ) -> RepositoryResult<Option<PodcastEpisode>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .episodes
            .iter()
            .find(|e| e.user_id == user_id && e.summary_id == summary_id)
            .cloned())
    }

    async fn upsert_episode(&self, episode: &PodcastEpisode) -> RepositoryResult<()> {
        let mut tables = self.tables.write().unwrap();
        if !tables.summaries.contains_key(&episode.summary_id) {
            return Err(RepositoryError::NotFound(format!(
                "summary {}",
                episode.summary_id
            )));
        }
        match tables.episodes.iter_mut().find(|e| e.id == episode.id) {
            Some(existing) => *existing = episode.clone(),
            None => {
                let clash = tables
                    .episodes
                    .iter()
                    .any(|e| e.summary_id == episode.summary_id);
                if clash {
                    return Err(RepositoryError::Conflict(format!(
                        "episode for summary {} already exists",
                        episode.summary_id
                    )));
                }
                tables.episodes.push(episode.clone());
            }
        }
        Ok(())
    }

    async fn find_missing_embeddings(
        &self,
        query: MissingEmbeddingQuery,
    ) -> RepositoryResult<Vec<EmbeddingCandidate>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .candidates(query.user_id, query.record_type)
            .into_iter()
            .filter(|c| query.after.is_none_or(|after| c.id > after))
            .take(query.limit)
            .collect())
    }

    async fn save_embedding(
        &self,
        record_type: EmbeddingRecordType,
        record_id: Uuid,
        vector: Vec<f32>,
    ) -> RepositoryResult<()> {
        if vector.is_empty() {
            return Err(RepositoryError::Backend(format!(
                "empty embedding for {record_type} {record_id}"
            )));
        }
        self.tables
            .write()
            .unwrap()
            .embeddings
            .insert((record_type, record_id), vector);
        Ok(())
    }

    async fn count_missing_embeddings(
        &self,
        user_id: UserId,
        record_type: EmbeddingRecordType,
    ) -> RepositoryResult<u64> {
        let tables = self.tables.read().unwrap();
        Ok(tables.candidates(user_id, record_type).len() as u64)
    }

    async fn record_stage_outcome(&self, record: &StageOutcomeRecord) -> RepositoryResult<()> {
        self.tables
            .write()
            .unwrap()
            .outcomes
            .insert((record.user_id, record.date, record.stage), record.clone());
        Ok(())
    }

    async fn stage_outcomes(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> RepositoryResult<Vec<StageOutcomeRecord>> {
        let tables = self.tables.read().unwrap();
        let mut out: Vec<StageOutcomeRecord> = tables
            .outcomes
            .values()
            .filter(|r| r.user_id == user_id && r.date == date)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.stage);
        Ok(out)
    }
}
