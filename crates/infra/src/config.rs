//! Process configuration loaded from the environment.

use std::time::Duration;

use dailycast_core::CivilTimeZone;

use crate::lock::STAGE_LOCK_TTL;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Pipeline runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Redis URL; `None` selects the in-memory lock and job stores
    pub redis_url: Option<String>,
    pub time_zone: CivilTimeZone,
    pub lock_ttl: Duration,
    /// Upper bound on one external capability call
    pub capability_timeout: Duration,
    /// How far back the summary stage looks for source articles
    pub summary_lookback: Duration,
    /// Maximum articles fed into one summary
    pub summary_max_articles: usize,
    pub worker_concurrency: usize,
    pub scheduler_tick: Duration,
    /// Records fetched per embedding job execution
    pub embedding_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            time_zone: CivilTimeZone::default(),
            lock_ttl: STAGE_LOCK_TTL,
            capability_timeout: Duration::from_secs(120),
            summary_lookback: Duration::from_secs(24 * 60 * 60),
            summary_max_articles: 50,
            worker_concurrency: 2,
            scheduler_tick: Duration::from_secs(30),
            embedding_batch_size: 50,
        }
    }
}

impl PipelineConfig {
    /// Load from process environment variables; unset keys keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.redis_url = lookup("REDIS_URL").filter(|v| !v.trim().is_empty());

        if let Some(minutes) = parse::<i32>(&lookup, "DAILYCAST_TZ_OFFSET_MINUTES")? {
            config.time_zone = CivilTimeZone::from_offset_minutes(minutes).map_err(|e| {
                ConfigError::Invalid {
                    key: "DAILYCAST_TZ_OFFSET_MINUTES",
                    value: minutes.to_string(),
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(secs) = positive(&lookup, "DAILYCAST_LOCK_TTL_SECS")? {
            config.lock_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = positive(&lookup, "DAILYCAST_CAPABILITY_TIMEOUT_SECS")? {
            config.capability_timeout = Duration::from_secs(secs);
        }
        if let Some(hours) = positive(&lookup, "DAILYCAST_SUMMARY_LOOKBACK_HOURS")? {
            let secs = hours
                .checked_mul(60 * 60)
                .ok_or_else(|| ConfigError::Invalid {
                    key: "DAILYCAST_SUMMARY_LOOKBACK_HOURS",
                    value: hours.to_string(),
                    reason: "too large".into(),
                })?;
            config.summary_lookback = Duration::from_secs(secs);
        }
        if let Some(n) = positive(&lookup, "DAILYCAST_WORKER_CONCURRENCY")? {
            config.worker_concurrency = n as usize;
        }
        if let Some(secs) = positive(&lookup, "DAILYCAST_SCHEDULER_TICK_SECS")? {
            config.scheduler_tick = Duration::from_secs(secs);
        }
        if let Some(n) = positive(&lookup, "DAILYCAST_EMBEDDING_BATCH_SIZE")? {
            config.embedding_batch_size = n as usize;
        }

        Ok(config)
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match parse::<u64>(lookup, key)? {
        Some(0) => Err(ConfigError::Invalid {
            key,
            value: "0".into(),
            reason: "must be greater than zero".into(),
        }),
        other => Ok(other),
    }
}
