//! Per-user daily triggers with deterministic jitter.

pub mod jitter;
pub mod scheduler;

pub use jitter::{
    JITTER_WINDOW_MINUTES, PODCAST_OFFSET_MINUTES, SchedulePreview, jittered_time, podcast_time,
    preview, user_jitter_minutes,
};
pub use scheduler::{DailyScheduler, FiredTrigger, SchedulerHandle, TriggerKind, UserTriggers};
