//! `dailycast-core` — domain building blocks for the daily content pipeline.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, schedule settings, content records and the civil clock.

pub mod clock;
pub mod content;
pub mod error;
pub mod id;
pub mod schedule;

pub use clock::{CivilTimeZone, Clock, ManualClock, SystemClock};
pub use content::{
    Article, ChainStage, DailySummary, EmbeddingCandidate, EmbeddingRecordType, EpisodeStatus,
    PodcastEpisode, StageOutcomeRecord, StageResolution,
};
pub use error::{DomainError, DomainResult};
pub use id::{ArticleId, EpisodeId, SummaryId, UserId};
pub use schedule::{LocalTime, PodcastLanguage, UserScheduleConfig};
