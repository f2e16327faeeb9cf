//! Infrastructure layer: coordination primitives, job queues, repository
//! boundary, and configuration.

pub mod config;
pub mod jobs;
pub mod lock;
pub mod repository;

pub use config::{ConfigError, PipelineConfig};
