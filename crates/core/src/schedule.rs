//! Per-user schedule settings.

use core::fmt;
use core::str::FromStr;

use chrono::NaiveTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DomainError, DomainResult};

/// A wall-clock `HH:MM` slot in the civil zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalTime {
    hour: u8,
    minute: u8,
}

impl LocalTime {
    pub const MIDNIGHT: LocalTime = LocalTime { hour: 0, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> DomainResult<Self> {
        if hour > 23 || minute > 59 {
            return Err(DomainError::validation(format!(
                "time out of range: {hour:02}:{minute:02}"
            )));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    /// Minutes since local midnight.
    pub fn minutes_of_day(&self) -> u32 {
        u32::from(self.hour) * 60 + u32::from(self.minute)
    }

    /// Shift forward by `minutes`; the hour carries and wraps past midnight.
    pub fn add_minutes(&self, minutes: u32) -> Self {
        const DAY: u32 = 24 * 60;
        let total = (self.minutes_of_day() + minutes % DAY) % DAY;
        Self {
            hour: (total / 60) as u8,
            minute: (total % 60) as u8,
        }
    }

    pub fn to_naive(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for LocalTime {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::validation(format!("expected HH:MM, got {s:?}"));
        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        let two_digits = |part: &str| part.len() == 2 && part.bytes().all(|b| b.is_ascii_digit());
        if !two_digits(h) || !two_digits(m) {
            return Err(invalid());
        }
        let hour: u8 = h.parse().map_err(|_| invalid())?;
        let minute: u8 = m.parse().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl Serialize for LocalTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LocalTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Narration/synthesis language of the podcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodcastLanguage {
    #[default]
    Ja,
    En,
}

impl PodcastLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodcastLanguage::Ja => "ja",
            PodcastLanguage::En => "en",
        }
    }
}

impl FromStr for PodcastLanguage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ja" => Ok(Self::Ja),
            "en" => Ok(Self::En),
            other => Err(DomainError::validation(format!("unsupported language: {other}"))),
        }
    }
}

/// Schedule settings of one user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserScheduleConfig {
    pub summary_enabled: bool,
    pub summary_time: Option<LocalTime>,
    pub podcast_enabled: bool,
    pub podcast_time: Option<LocalTime>,
    #[serde(default)]
    pub podcast_language: PodcastLanguage,
}

impl UserScheduleConfig {
    /// Check the settings invariants.
    ///
    /// - podcast cannot be enabled unless summary is enabled
    /// - an enabled summary needs a time
    pub fn validate(&self) -> DomainResult<()> {
        if self.podcast_enabled && !self.summary_enabled {
            return Err(DomainError::invariant(
                "podcast cannot be enabled while summary is disabled",
            ));
        }
        if self.summary_enabled && self.summary_time.is_none() {
            return Err(DomainError::validation("summary is enabled but has no time"));
        }
        Ok(())
    }

    /// Configured summary slot, if the summary stage is enabled.
    pub fn summary_slot(&self) -> Option<LocalTime> {
        self.summary_time.filter(|_| self.summary_enabled)
    }

    /// Configured podcast time, if the podcast stage is active.
    ///
    /// The effective trigger is derived from the summary slot; this is the
    /// user-facing setting only.
    pub fn podcast_slot(&self) -> Option<LocalTime> {
        self.podcast_time.filter(|_| self.podcast_active())
    }

    /// Whether the chain continues past the script stage.
    pub fn podcast_active(&self) -> bool {
        self.summary_enabled && self.podcast_enabled
    }
}
