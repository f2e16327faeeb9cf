//! Deterministic per-user trigger offsets.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use dailycast_core::{CivilTimeZone, DomainResult, LocalTime, UserId};

/// Jitter values fall in `0..JITTER_WINDOW_MINUTES`.
pub const JITTER_WINDOW_MINUTES: u32 = 5;

/// Podcast trigger lag behind the jittered summary trigger.
pub const PODCAST_OFFSET_MINUTES: u32 = 10;

/// Stable per-user offset in minutes, `0..=4`.
///
/// Folds the canonical id string, so the value never changes across
/// processes, restarts, or toolchain versions.
pub fn user_jitter_minutes(user_id: UserId) -> u32 {
    let hash = user_id
        .to_string()
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
    hash % JITTER_WINDOW_MINUTES
}

/// The user's configured time shifted by their jitter (hour carry, wraps at midnight).
pub fn jittered_time(user_id: UserId, configured: LocalTime) -> LocalTime {
    configured.add_minutes(user_jitter_minutes(user_id))
}

/// Podcast trigger time for a jittered summary time.
pub fn podcast_time(summary_jittered: LocalTime) -> LocalTime {
    summary_jittered.add_minutes(PODCAST_OFFSET_MINUTES)
}

/// Next run instants shown to a user; computing them has no side effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePreview {
    /// RFC 3339 in the civil zone
    pub summary_at: String,
    /// RFC 3339 in the civil zone; always `summary_at` + 10 minutes
    pub podcast_at: String,
}

/// Next summary and podcast instants for `configured` ("HH:MM") after `now`.
pub fn preview(
    user_id: UserId,
    configured: &str,
    now: DateTime<Utc>,
    time_zone: &CivilTimeZone,
) -> DomainResult<SchedulePreview> {
    let configured: LocalTime = configured.parse()?;
    let summary_at = time_zone.next_occurrence(jittered_time(user_id, configured), now);
    let podcast_at = summary_at + Duration::minutes(i64::from(PODCAST_OFFSET_MINUTES));

    Ok(SchedulePreview {
        summary_at: time_zone.to_local(summary_at).to_rfc3339(),
        podcast_at: time_zone.to_local(podcast_at).to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn user(n: u128) -> UserId {
        UserId::from_uuid(Uuid::from_u128(n))
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn jitter_spreads_users() {
        let distinct: std::collections::HashSet<u32> =
            (0..200).map(|n| user_jitter_minutes(user(n))).collect();
        assert!(distinct.len() > 1);
        assert!(distinct.iter().all(|j| *j < JITTER_WINDOW_MINUTES));
    }

    #[test]
    fn carries_into_the_next_hour() {
        let u = (0..500)
            .map(user)
            .find(|u| user_jitter_minutes(*u) == 4)
            .unwrap();
        let t = jittered_time(u, "07:58".parse().unwrap());
        assert_eq!(t.to_string(), "08:02");
        assert_eq!(podcast_time(t).to_string(), "08:12");
    }

    #[test]
    fn preview_is_deterministic_and_offset() {
        let tz = CivilTimeZone::default();
        let u = user(42);
        let now = utc("2026-03-02T05:00:00+09:00");

        let a = preview(u, "07:30", now, &tz).unwrap();
        let b = preview(u, "07:30", now, &tz).unwrap();
        assert_eq!(a, b);

        let summary = DateTime::parse_from_rfc3339(&a.summary_at).unwrap();
        let podcast = DateTime::parse_from_rfc3339(&a.podcast_at).unwrap();
        assert_eq!(podcast - summary, Duration::minutes(10));
        assert!(a.summary_at.starts_with("2026-03-02T07:3"));
        assert!(a.summary_at.ends_with("+09:00"));
    }

    #[test]
    fn preview_rolls_to_tomorrow_once_passed() {
        let tz = CivilTimeZone::default();
        let a = preview(user(7), "07:30", utc("2026-03-02T09:00:00+09:00"), &tz).unwrap();
        assert!(a.summary_at.starts_with("2026-03-03T07:3"));
    }

    #[test]
    fn preview_rejects_malformed_time() {
        let tz = CivilTimeZone::default();
        assert!(preview(user(1), "25:00", Utc::now(), &tz).is_err());
        assert!(preview(user(1), "soon", Utc::now(), &tz).is_err());
    }

    proptest! {
        #[test]
        fn jitter_is_stable_and_bounded(n in any::<u128>(), hour in 0u8..24, minute in 0u8..60) {
            let u = user(n);
            let configured = LocalTime::new(hour, minute).unwrap();
            let first = jittered_time(u, configured);
            prop_assert_eq!(first, jittered_time(u, configured));

            let shift = (first.minutes_of_day() + 24 * 60 - configured.minutes_of_day()) % (24 * 60);
            prop_assert!(shift < JITTER_WINDOW_MINUTES);
            prop_assert_eq!(
                (podcast_time(first).minutes_of_day() + 24 * 60 - first.minutes_of_day()) % (24 * 60),
                PODCAST_OFFSET_MINUTES
            );
        }
    }
}
