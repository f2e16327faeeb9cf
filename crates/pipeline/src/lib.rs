//! Daily content pipeline: jittered scheduling, the summary → script →
//! podcast job chain, and embedding backfills.

pub mod capabilities;
pub mod embeddings;
pub mod orchestrator;
pub mod runtime;
pub mod schedule;
pub mod stages;


pub use capabilities::{
    CapabilityError, EmbeddingProvider, NarrateCapability, ObjectMetadata, ObjectStore,
    SummarizeCapability, SynthesizeCapability,
};
pub use embeddings::{BatchCursor, EmbeddingBackfill, EmbeddingBatchHandler, RateLimit};
pub use orchestrator::{FlowStatus, Orchestrator, RunNowReport, StageAction, StageStatus};
pub use runtime::{Capabilities, Pipeline, PipelineHandle};
pub use schedule::{DailyScheduler, SchedulePreview, preview};
pub use stages::{PodcastStage, ScriptStage, Stage, StageContext, StageError, SummaryStage};
