//! In-process registry of daily triggers.
//!
//! Each scheduled user gets up to two triggers per day: the summary trigger at
//! the jittered summary time, and the podcast catch-up trigger ten minutes
//! later. A trigger fires at most once per calendar date; triggers whose slot
//! already passed when registered wait for the next day.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dailycast_core::{CivilTimeZone, Clock, LocalTime, UserId};
use dailycast_infra::repository::{ContentRepository, RepositoryError};

use super::jitter::{PODCAST_OFFSET_MINUTES, jittered_time, podcast_time};
use crate::orchestrator::{Orchestrator, StageAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Summary,
    PodcastCatchUp,
}

impl TriggerKind {
    /// How far the trigger lags the summary slot of the date it serves.
    fn lag(&self) -> chrono::Duration {
        match self {
            TriggerKind::Summary => chrono::Duration::zero(),
            TriggerKind::PodcastCatchUp => chrono::Duration::minutes(i64::from(PODCAST_OFFSET_MINUTES)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Trigger {
    time: LocalTime,
    last_fired: Option<NaiveDate>,
}

/// Effective trigger times registered for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UserTriggers {
    pub summary: Option<LocalTime>,
    pub podcast: Option<LocalTime>,
}

/// A trigger that fired during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTrigger {
    pub user_id: UserId,
    pub kind: TriggerKind,
    /// Calendar date the chain runs for
    pub date: NaiveDate,
}

#[derive(Debug, Default)]
struct Registry {
    triggers: HashMap<(UserId, TriggerKind), Trigger>,
}

/// Daily trigger scheduler.
pub struct DailyScheduler {
    orchestrator: Arc<Orchestrator>,
    repository: Arc<dyn ContentRepository>,
    clock: Arc<dyn Clock>,
    time_zone: CivilTimeZone,
    registry: Mutex<Registry>,
}

impl DailyScheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        repository: Arc<dyn ContentRepository>,
        clock: Arc<dyn Clock>,
        time_zone: CivilTimeZone,
    ) -> Self {
        Self {
            orchestrator,
            repository,
            clock,
            time_zone,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Re-read a user's settings and replace their triggers. Call after every
    /// settings change; no restart needed.
    ///
    /// Settings that fail validation leave the user with no triggers.
    pub async fn reload_user(&self, user_id: UserId) -> Result<UserTriggers, RepositoryError> {
        let config = self
            .repository
            .schedule_config(user_id)
            .await?
            .filter(|config| match config.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "invalid schedule settings; user unscheduled");
                    false
                }
            });
        let now = self.clock.now();

        let summary = config
            .as_ref()
            .and_then(|c| c.summary_slot())
            .map(|t| jittered_time(user_id, t));
        let podcast = summary
            .filter(|_| config.as_ref().is_some_and(|c| c.podcast_active()))
            .map(podcast_time);

        let mut registry = self.registry.lock().unwrap();
        for (kind, time) in [
            (TriggerKind::Summary, summary),
            (TriggerKind::PodcastCatchUp, podcast),
        ] {
            match time {
                Some(time) => {
                    let trigger = self.fresh_trigger(kind, time, now);
                    registry.triggers.insert((user_id, kind), trigger);
                }
                None => {
                    registry.triggers.remove(&(user_id, kind));
                }
            }
        }

        let triggers = UserTriggers { summary, podcast };
        info!(
            user_id = %user_id,
            summary = ?triggers.summary.map(|t| t.to_string()),
            podcast = ?triggers.podcast.map(|t| t.to_string()),
            "schedule reloaded"
        );
        Ok(triggers)
    }

    /// Register triggers for every scheduled user. Returns the user count.
    pub async fn reload_all(&self) -> Result<usize, RepositoryError> {
        let users = self.repository.scheduled_users().await?;
        self.registry.lock().unwrap().triggers.clear();
        for user_id in &users {
            self.reload_user(*user_id).await?;
        }
        info!(users = users.len(), "schedules loaded");
        Ok(users.len())
    }

    /// Triggers currently registered for `user_id`.
    pub fn registered(&self, user_id: UserId) -> UserTriggers {
        let registry = self.registry.lock().unwrap();
        UserTriggers {
            summary: registry
                .triggers
                .get(&(user_id, TriggerKind::Summary))
                .map(|t| t.time),
            podcast: registry
                .triggers
                .get(&(user_id, TriggerKind::PodcastCatchUp))
                .map(|t| t.time),
        }
    }

    /// Fire every trigger that is due at `now` and has not fired for its date.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<FiredTrigger> {
        let due = self.take_due(now);

        for fired in &due {
            let result = match fired.kind {
                TriggerKind::Summary => {
                    self.orchestrator
                        .trigger_summary(fired.user_id, fired.date)
                        .await
                }
                TriggerKind::PodcastCatchUp => {
                    self.orchestrator
                        .trigger_podcast_catch_up(fired.user_id, fired.date)
                        .await
                }
            };
            match result {
                Ok(StageAction::Enqueued) => {
                    info!(user_id = %fired.user_id, trigger = ?fired.kind, date = %fired.date, "trigger fired");
                }
                Ok(action) => {
                    debug!(user_id = %fired.user_id, trigger = ?fired.kind, action = ?action, "trigger fired; nothing queued");
                }
                Err(e) => {
                    error!(user_id = %fired.user_id, trigger = ?fired.kind, error = %e, "trigger failed");
                }
            }
        }

        due
    }

    /// Run ticks every `interval` until the handle shuts down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = self.clock.now();
                        let fired = self.tick(now).await;
                        if !fired.is_empty() {
                            debug!(count = fired.len(), "scheduler tick");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    fn fresh_trigger(&self, kind: TriggerKind, time: LocalTime, now: DateTime<Utc>) -> Trigger {
        // A slot that already passed today waits for tomorrow.
        let today = self.time_zone.calendar_date(now);
        let passed = self.time_zone.at_local(today, time) <= now;
        Trigger {
            time,
            last_fired: passed.then(|| self.serves(kind, today, time)),
        }
    }

    /// Calendar date served by a trigger firing on `fire_date` at `time`.
    ///
    /// Differs from `fire_date` only when the podcast lag crosses midnight.
    fn serves(&self, kind: TriggerKind, fire_date: NaiveDate, time: LocalTime) -> NaiveDate {
        let fire_at = self.time_zone.at_local(fire_date, time);
        self.time_zone.calendar_date(fire_at - kind.lag())
    }

    fn take_due(&self, now: DateTime<Utc>) -> Vec<FiredTrigger> {
        let today = self.time_zone.calendar_date(now);
        let mut registry = self.registry.lock().unwrap();
        let mut due = Vec::new();

        for ((user_id, kind), trigger) in registry.triggers.iter_mut() {
            if self.time_zone.at_local(today, trigger.time) > now {
                continue;
            }
            let date = self.serves(*kind, today, trigger.time);
            if trigger.last_fired == Some(date) {
                continue;
            }
            if trigger.last_fired.is_some_and(|last| last > date) {
                warn!(user_id = %user_id, "trigger date moved backwards; skipping");
                continue;
            }
            trigger.last_fired = Some(date);
            due.push(FiredTrigger {
                user_id: *user_id,
                kind: *kind,
                date,
            });
        }

        due.sort_by_key(|f| (f.date, f.kind == TriggerKind::PodcastCatchUp, f.user_id));
        due
    }
}

/// Handle to stop a spawned scheduler loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}
