//! Clock and civil time zone.
//!
//! Calendar dates and `HH:MM` slots are always computed in one fixed civil
//! zone, never in the host's local zone.

use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::schedule::LocalTime;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Fixed-offset civil time zone (default `+09:00`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CivilTimeZone {
    offset_minutes: i32,
}

impl Default for CivilTimeZone {
    fn default() -> Self {
        Self {
            offset_minutes: 9 * 60,
        }
    }
}

impl CivilTimeZone {
    /// Build a zone from a UTC offset in minutes (must be within ±18h).
    pub fn from_offset_minutes(offset_minutes: i32) -> DomainResult<Self> {
        if offset_minutes.abs() >= 18 * 60 {
            return Err(DomainError::validation(format!(
                "utc offset out of range: {offset_minutes} minutes"
            )));
        }
        Ok(Self { offset_minutes })
    }

    pub fn offset_minutes(&self) -> i32 {
        self.offset_minutes
    }

    fn offset(&self) -> FixedOffset {
        // Range is validated in the constructor.
        FixedOffset::east_opt(self.offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Convert an instant into the civil zone.
    pub fn to_local(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        instant.with_timezone(&self.offset())
    }

    /// Calendar date of `instant` in the civil zone.
    pub fn calendar_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        self.to_local(instant).date_naive()
    }

    /// UTC instant of `time` on `date` in the civil zone.
    pub fn at_local(&self, date: NaiveDate, time: LocalTime) -> DateTime<Utc> {
        let naive = date.and_time(time.to_naive());
        // A fixed offset has no gaps or folds, so the mapping is always single.
        self.offset()
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    }

    /// UTC instant of local midnight starting `date`.
    pub fn start_of_day(&self, date: NaiveDate) -> DateTime<Utc> {
        self.at_local(date, LocalTime::MIDNIGHT)
    }

    /// Next occurrence of `time` strictly after `after`.
    pub fn next_occurrence(&self, time: LocalTime, after: DateTime<Utc>) -> DateTime<Utc> {
        let today = self.calendar_date(after);
        let candidate = self.at_local(today, time);
        if candidate > after {
            candidate
        } else {
            self.at_local(today + Duration::days(1), time)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn calendar_date_uses_civil_zone() {
        let tz = CivilTimeZone::default();
        // 2026-03-01T16:00Z is 2026-03-02T01:00+09:00.
        let date = tz.calendar_date(utc("2026-03-01T16:00:00Z"));
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
    }

    #[test]
    fn at_local_converts_back_to_utc() {
        let tz = CivilTimeZone::default();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let at = tz.at_local(date, "07:30".parse().unwrap());
        assert_eq!(at, utc("2026-03-01T22:30:00Z"));
    }

    #[test]
    fn next_occurrence_rolls_to_tomorrow() {
        let tz = CivilTimeZone::default();
        let time: LocalTime = "07:30".parse().unwrap();
        let now = utc("2026-03-01T22:30:00Z");
        // Exactly at the slot: next run is tomorrow.
        assert_eq!(tz.next_occurrence(time, now), utc("2026-03-02T22:30:00Z"));
        assert_eq!(
            tz.next_occurrence(time, now - Duration::minutes(1)),
            utc("2026-03-01T22:30:00Z")
        );
    }

    #[test]
    fn rejects_out_of_range_offsets() {
        assert!(CivilTimeZone::from_offset_minutes(18 * 60).is_err());
        assert_eq!(
            CivilTimeZone::from_offset_minutes(-300).unwrap().offset_minutes(),
            -300
        );
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(utc("2026-03-01T00:00:00Z"));
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), utc("2026-03-01T01:30:00Z"));
    }
}
