//! Content records produced and consumed by the pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::id::{ArticleId, EpisodeId, SummaryId, UserId};
use crate::schedule::PodcastLanguage;

/// An ingested source item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: ArticleId,
    pub user_id: UserId,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

/// Digest for one user and one calendar date.
///
/// Created by the summary stage and later enriched with the narration script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub id: SummaryId,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub summary_text: String,
    pub script_text: Option<String>,
    pub source_article_ids: Vec<ArticleId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DailySummary {
    pub fn new(
        user_id: UserId,
        date: NaiveDate,
        summary_text: impl Into<String>,
        source_article_ids: Vec<ArticleId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SummaryId::new(),
            user_id,
            date,
            summary_text: summary_text.into(),
            script_text: None,
            source_article_ids,
            created_at: now,
            updated_at: now,
        }
    }

    /// The digest text is present.
    pub fn is_complete_summary(&self) -> bool {
        !self.summary_text.trim().is_empty()
    }

    /// The narration script is present.
    pub fn has_script(&self) -> bool {
        self.script_text
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }

    pub fn with_script(mut self, script: impl Into<String>, now: DateTime<Utc>) -> Self {
        self.script_text = Some(script.into());
        self.updated_at = now;
        self
    }
}

/// Audio state of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Pending,
    Completed,
}

/// Synthesized audio episode tied to a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodcastEpisode {
    pub id: EpisodeId,
    pub user_id: UserId,
    pub summary_id: SummaryId,
    pub language: PodcastLanguage,
    pub status: EpisodeStatus,
    pub audio_url: Option<String>,
    pub audio_size_bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PodcastEpisode {
    pub fn pending(
        user_id: UserId,
        summary_id: SummaryId,
        language: PodcastLanguage,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EpisodeId::new(),
            user_id,
            summary_id,
            language,
            status: EpisodeStatus::Pending,
            audio_url: None,
            audio_size_bytes: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == EpisodeStatus::Completed && self.audio_url.is_some()
    }

    /// Attach the uploaded audio. An episode completes once.
    pub fn complete(
        &mut self,
        audio_url: impl Into<String>,
        size_bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if self.is_complete() {
            return Err(DomainError::invariant(format!(
                "episode {} already has audio",
                self.id
            )));
        }
        self.audio_url = Some(audio_url.into());
        self.audio_size_bytes = Some(size_bytes);
        self.status = EpisodeStatus::Completed;
        self.updated_at = now;
        Ok(())
    }
}

/// Record families that carry a vector embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingRecordType {
    Article,
    Summary,
}

impl EmbeddingRecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingRecordType::Article => "article",
            EmbeddingRecordType::Summary => "summary",
        }
    }
}

impl core::fmt::Display for EmbeddingRecordType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record lacking an embedding, with the text to embed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingCandidate {
    pub id: Uuid,
    pub text: String,
}

/// Stage of the daily summary → script → podcast chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStage {
    Summary,
    Script,
    Podcast,
}

impl ChainStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStage::Summary => "summary",
            ChainStage::Script => "script",
            ChainStage::Podcast => "podcast",
        }
    }
}

/// How a stage ended without producing its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageResolution {
    Skipped,
    Failed,
}

/// Latest output-less ending of one stage for a user and date.
///
/// Outlives the queue's bounded job history, so status reads stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutcomeRecord {
    pub user_id: UserId,
    pub date: NaiveDate,
    pub stage: ChainStage,
    pub resolution: StageResolution,
    /// Skip reason or last error
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}
