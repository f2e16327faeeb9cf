//! Process-wide logging setup shared by workers and the scheduler.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, init, init_with};
