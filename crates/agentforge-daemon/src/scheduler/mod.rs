//! Time-window scheduler.
//!
//! Schedules are recurring UTC windows. [`SchedulerService::tick`] is called
//! periodically by the daemon and starts a run when a window opens, stops a
//! schedule-initiated run once its window closes and records failed
//! occurrences so they are not retried inside the same window.

pub mod window;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use agentforge_core::model::{NewSchedule, RunState, RunTrigger, Schedule, ScheduleUpdate};
use agentforge_core::{ErrorKind, OrchestratorEvent};

use crate::events::EventBus;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::storage::{Database, DatabaseError};

pub use window::Window;

/// Per-project schedule cap.
pub const MAX_SCHEDULES: i64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] agentforge_core::Error),

    #[error("Schedule {0} not found")]
    NotFound(i64),

    #[error("At most {max} schedules per project")]
    LimitReached { max: i64 },

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// Answer for `GET /schedules/next`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextRun {
    pub has_schedules: bool,
    /// Earliest upcoming start; unset while a window is open.
    pub next_start: Option<DateTime<Utc>>,
    /// Latest end among open windows.
    pub next_end: Option<DateTime<Utc>>,
    pub is_currently_running: bool,
    pub active_schedule_count: usize,
}

/// The run a schedule started for one window occurrence.
#[derive(Debug, Clone)]
struct Occurrence {
    window_start: i64,
    run_id: String,
    settled: bool,
}

/// Skip state of a schedule for the window `window`.
fn is_skipped(schedule: &Schedule, window: &Window) -> bool {
    schedule.skip_next && schedule.skip_until.is_none_or(|until| window.end_ts() <= until)
}

pub struct SchedulerService {
    db: Database,
    orchestrator: Orchestrator,
    events: EventBus,
    occurrences: Mutex<HashMap<i64, Occurrence>>,
}

impl SchedulerService {
    pub fn new(db: Database, orchestrator: Orchestrator, events: EventBus) -> Self {
        Self {
            db,
            orchestrator,
            events,
            occurrences: Mutex::new(HashMap::new()),
        }
    }

    pub async fn list(&self) -> Result<Vec<Schedule>, SchedulerError> {
        Ok(self.db.list_schedules().await?)
    }

    pub async fn get(&self, id: i64) -> Result<Schedule, SchedulerError> {
        self.db.get_schedule(id).await.map_err(|e| match e {
            DatabaseError::NotFound(_) => SchedulerError::NotFound(id),
            other => other.into(),
        })
    }

    pub async fn create(&self, new: &NewSchedule) -> Result<Schedule, SchedulerError> {
        new.validate()?;
        if self.db.count_schedules().await? >= MAX_SCHEDULES {
            return Err(SchedulerError::LimitReached { max: MAX_SCHEDULES });
        }
        let schedule = self.db.create_schedule(new).await?;
        info!(
            schedule_id = schedule.id,
            weekdays = %schedule.weekdays,
            start = %schedule.start_time,
            duration_minutes = schedule.duration_minutes,
            "Schedule created"
        );
        Ok(schedule)
    }

    pub async fn update(&self, id: i64, update: ScheduleUpdate) -> Result<Schedule, SchedulerError> {
        let mut schedule = self.get(id).await?;
        update.apply(&mut schedule)?;
        Ok(self.db.update_schedule(&schedule).await?)
    }

    pub async fn delete(&self, id: i64) -> Result<(), SchedulerError> {
        if !self.db.delete_schedule(id).await? {
            return Err(SchedulerError::NotFound(id));
        }
        self.occurrences.lock().await.remove(&id);
        info!(schedule_id = id, "Schedule deleted");
        Ok(())
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<Schedule, SchedulerError> {
        self.update(
            id,
            ScheduleUpdate {
                enabled: Some(enabled),
                ..ScheduleUpdate::default()
            },
        )
        .await
    }

    pub async fn set_paused(&self, id: i64, paused: bool) -> Result<Schedule, SchedulerError> {
        self.update(
            id,
            ScheduleUpdate {
                paused: Some(paused),
                ..ScheduleUpdate::default()
            },
        )
        .await
    }

    /// Skip the current window if inside one, else the next. The flag
    /// clears itself once that window has ended.
    pub async fn skip_next(&self, id: i64, now: DateTime<Utc>) -> Result<Schedule, SchedulerError> {
        let mut schedule = self.get(id).await?;
        let target = window::current_window(&schedule, now)
            .or_else(|| window::next_window(&schedule, now))
            .ok_or_else(|| {
                agentforge_core::Error::Validation(format!("schedule {id} has no upcoming window"))
            })?;
        schedule.skip_next = true;
        schedule.skip_until = Some(target.end_ts());
        info!(schedule_id = id, window_start = %target.start, "Skipping schedule occurrence");
        Ok(self.db.update_schedule(&schedule).await?)
    }

    pub async fn next_run(&self, now: DateTime<Utc>) -> Result<NextRun, SchedulerError> {
        let schedules: Vec<Schedule> = self
            .list()
            .await?
            .into_iter()
            .filter(Schedule::is_active)
            .collect();

        let mut next = NextRun {
            has_schedules: !schedules.is_empty(),
            next_start: None,
            next_end: None,
            is_currently_running: false,
            active_schedule_count: 0,
        };
        for schedule in &schedules {
            match window::current_window(schedule, now) {
                Some(open) if !is_skipped(schedule, &open) => {
                    next.active_schedule_count += 1;
                    next.next_end = next.next_end.max(Some(open.end));
                }
                _ => {
                    if let Some(start) = window::next_window_start(schedule, now) {
                        next.next_start = Some(next.next_start.map_or(start, |s| s.min(start)));
                    }
                }
            }
        }
        next.is_currently_running = next.active_schedule_count > 0;
        if next.is_currently_running {
            next.next_start = None;
        }
        Ok(next)
    }

    /// Log windows that elapsed while the daemon was down. They are not
    /// caught up.
    pub async fn log_missed_windows(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let mut missed = 0;
        for schedule in self.list().await? {
            if !schedule.is_active() {
                continue;
            }
            let Some(last) = window::last_completed_window(&schedule, now) else {
                continue;
            };
            if last.end_ts() <= schedule.created_at || is_skipped(&schedule, &last) {
                continue;
            }
            let ran = self
                .db
                .latest_run_for_schedule(schedule.id)
                .await?
                .is_some_and(|run| run.started_at >= last.start_ts());
            if ran {
                continue;
            }
            info!(
                schedule_id = schedule.id,
                kind = ErrorKind::ScheduleWindowMissed.as_str(),
                window_start = %last.start,
                window_end = %last.end,
                "Schedule window elapsed while the daemon was down"
            );
            self.events.publish(OrchestratorEvent::ScheduleWindowMissed {
                schedule_id: schedule.id,
                window_start: last.start_ts(),
            });
            missed += 1;
        }
        Ok(missed)
    }

    /// One scheduling pass.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.settle_occurrences().await?;
        self.close_expired_run(now).await;

        let mut busy = self.orchestrator.status().await.state.is_active();
        for mut schedule in self.list().await? {
            if schedule.skip_next && schedule.skip_until.is_some_and(|until| until <= now.timestamp())
            {
                schedule.skip_next = false;
                schedule.skip_until = None;
                schedule = self.db.update_schedule(&schedule).await?;
                debug!(schedule_id = schedule.id, "Skip flag cleared");
            }
            if !schedule.is_active() {
                continue;
            }
            let Some(open) = window::current_window(&schedule, now) else {
                continue;
            };
            if is_skipped(&schedule, &open)
                || schedule.failed_window_start == Some(open.start_ts())
                || self.started_for(schedule.id, &open).await
            {
                continue;
            }
            if busy {
                debug!(schedule_id = schedule.id, "Window open but a run is already active");
                continue;
            }
            busy = self.start_occurrence(&schedule, open).await;
        }
        Ok(())
    }

    async fn started_for(&self, schedule_id: i64, open: &Window) -> bool {
        self.occurrences
            .lock()
            .await
            .get(&schedule_id)
            .is_some_and(|o| o.window_start == open.start_ts())
    }

    /// Returns whether a run is now active.
    async fn start_occurrence(&self, schedule: &Schedule, open: Window) -> bool {
        let trigger = RunTrigger::Scheduled {
            schedule_id: schedule.id,
            window_start: open.start_ts(),
            window_end: open.end_ts(),
        };
        match self.orchestrator.start(schedule.overrides.clone(), trigger).await {
            Ok(status) => {
                let run_id = status.run_id.unwrap_or_default();
                info!(
                    schedule_id = schedule.id,
                    run_id = %run_id,
                    window_end = %open.end,
                    "Scheduled run started"
                );
                self.occurrences.lock().await.insert(
                    schedule.id,
                    Occurrence {
                        window_start: open.start_ts(),
                        run_id: run_id.clone(),
                        settled: false,
                    },
                );
                self.events.publish(OrchestratorEvent::ScheduleTriggered {
                    schedule_id: schedule.id,
                    run_id,
                });
                true
            }
            Err(OrchestratorError::AlreadyRunning { .. }) => true,
            Err(e) => {
                error!(schedule_id = schedule.id, error = %e, "Failed to start scheduled run");
                false
            }
        }
    }

    /// Stop a schedule-initiated run whose window has closed.
    async fn close_expired_run(&self, now: DateTime<Utc>) {
        let status = self.orchestrator.status().await;
        let Some(RunTrigger::Scheduled {
            schedule_id,
            window_end,
            ..
        }) = status.trigger
        else {
            return;
        };
        if status.state != RunState::Stopping
            && status.state.is_active()
            && window_end <= now.timestamp()
        {
            info!(schedule_id, "Schedule window closed, stopping run");
            match self.orchestrator.stop("schedule window closed").await {
                Ok(_) => {
                    self.events
                        .publish(OrchestratorEvent::ScheduleWindowClosed { schedule_id });
                }
                Err(e) => warn!(schedule_id, error = %e, "Failed to stop scheduled run"),
            }
        }
    }

    /// Record the outcome of scheduled runs that have ended.
    async fn settle_occurrences(&self) -> Result<(), SchedulerError> {
        let active_run = self.orchestrator.status().await.run_id;
        let pending: Vec<(i64, Occurrence)> = self
            .occurrences
            .lock()
            .await
            .iter()
            .filter(|(_, o)| !o.settled && active_run.as_deref() != Some(o.run_id.as_str()))
            .map(|(id, o)| (*id, o.clone()))
            .collect();

        for (schedule_id, occurrence) in pending {
            let run = self.db.get_run(&occurrence.run_id).await?;
            if run.status == "running" {
                continue;
            }
            if run.status == "failed" {
                self.mark_failed(schedule_id, occurrence.window_start, run.reason.as_deref())
                    .await?;
            }
            if let Some(o) = self.occurrences.lock().await.get_mut(&schedule_id)
                && o.run_id == occurrence.run_id
            {
                o.settled = true;
            }
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        schedule_id: i64,
        window_start: i64,
        reason: Option<&str>,
    ) -> Result<(), SchedulerError> {
        let mut schedule = match self.get(schedule_id).await {
            Ok(schedule) => schedule,
            Err(SchedulerError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        schedule.failed_window_start = Some(window_start);
        self.db.update_schedule(&schedule).await?;
        warn!(schedule_id, window_start, reason = ?reason, "Scheduled occurrence failed");
        self.events.publish(OrchestratorEvent::ScheduleOccurrenceFailed {
            schedule_id,
            window_start,
        });
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use agentforge_core::model::{RunSettings, Weekdays};
    use chrono::{TimeDelta, Weekday};

    fn monday_nine() -> Schedule {
        Schedule {
            id: 1,
            weekdays: Weekdays::from_iter([Weekday::Mon]),
            start_time: "09:00".into(),
            duration_minutes: 60,
            enabled: true,
            paused: false,
            skip_next: false,
            skip_until: None,
            overrides: RunSettings::default(),
            failed_window_start: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn skip_applies_only_up_to_target_window() {
        let now = DateTime::parse_from_rfc3339("2026-10-19T09:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut schedule = monday_nine();
        let open = window::current_window(&schedule, now).unwrap();
        assert!(!is_skipped(&schedule, &open));

        schedule.skip_next = true;
        schedule.skip_until = Some(open.end_ts());
        assert!(is_skipped(&schedule, &open));

        let next_week = Window {
            start: open.start + TimeDelta::days(7),
            end: open.end + TimeDelta::days(7),
        };
        assert!(!is_skipped(&schedule, &next_week));
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod service_tests {
    use super::*;

    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use agentforge_core::PolicyEngine;
    use agentforge_core::model::{NewFeature, RunSettings, Weekdays};
    use chrono::{TimeDelta, Timelike};

    use crate::claims::ClaimStore;
    use crate::orchestrator::OrchestratorSettings;
    use crate::project::ProjectContext;
    use crate::supervisor::{Supervisor, SupervisorConfig};

    async fn service(dir: &tempfile::TempDir, script: &str) -> SchedulerService {
        let project = Arc::new(ProjectContext::open(dir.path()).unwrap());
        let events = EventBus::new();
        let db = Database::open_in_memory().await.unwrap();
        let claims = Arc::new(ClaimStore::load(db.clone(), events.clone(), 3).await.unwrap());
        claims.create_feature(NewFeature::named("work")).await.unwrap();
        let config = SupervisorConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            default_model: "test-model".to_string(),
            project_dir: project.root().to_path_buf(),
            data_dir: project.data_dir().to_path_buf(),
            extra_read_paths: Vec::new(),
            coding_limit: 1,
            testing_per_coding: 1,
            terminate_timeout: Duration::from_secs(1),
        };
        let policy = Arc::new(PolicyEngine::new(Some(project.root().to_path_buf())));
        let supervisor = Supervisor::new(config, Arc::clone(&claims), policy, events.clone());
        let settings = OrchestratorSettings {
            features_per_agent: 1,
            idle_interval: Duration::from_millis(50),
            retry_base_delay: Duration::from_millis(5),
            retry_max_attempts: 2,
        };
        let orchestrator = Orchestrator::new(project, claims, supervisor, events.clone(), settings);
        SchedulerService::new(db, orchestrator, events)
    }

    fn minute_now() -> DateTime<Utc> {
        Utc::now()
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap()
    }

    /// A window that is open at `now`, starting at the current minute.
    fn open_now(now: DateTime<Utc>) -> NewSchedule {
        NewSchedule {
            weekdays: Weekdays::ALL,
            start_time: format!("{:02}:{:02}", now.hour(), now.minute()),
            duration_minutes: 30,
            enabled: true,
            overrides: RunSettings {
                yolo: true,
                ..RunSettings::default()
            },
        }
    }

    async fn wait_idle(service: &SchedulerService) {
        tokio::time::timeout(Duration::from_secs(20), service.orchestrator.wait_idle())
            .await
            .expect("run did not finish");
    }

    #[tokio::test]
    async fn create_validates_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, "exit 0").await;
        let mut bad = open_now(Utc::now());
        bad.start_time = "9:0x".into();
        assert!(matches!(
            service.create(&bad).await,
            Err(SchedulerError::Validation(_))
        ));

        for _ in 0..MAX_SCHEDULES {
            service.create(&open_now(Utc::now())).await.unwrap();
        }
        assert!(matches!(
            service.create(&open_now(Utc::now())).await,
            Err(SchedulerError::LimitReached { max: 50 })
        ));
        assert!(matches!(
            service.delete(9999).await,
            Err(SchedulerError::NotFound(9999))
        ));
    }

    #[tokio::test]
    async fn tick_starts_once_per_window_and_stops_at_close() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, "sleep 30").await;
        let now = minute_now();
        let schedule = service.create(&open_now(now)).await.unwrap();
        let mut rx = service.events.subscribe();

        service.tick(now).await.unwrap();
        let status = service.orchestrator.status().await;
        assert_eq!(status.state, RunState::Running);
        assert_eq!(status.trigger.and_then(|t| t.schedule_id()), Some(schedule.id));

        // A manual stop inside the window is not undone.
        service.orchestrator.stop("manual").await.unwrap();
        wait_idle(&service).await;
        service.tick(now + TimeDelta::minutes(1)).await.unwrap();
        assert_eq!(service.orchestrator.status().await.state, RunState::Idle);

        let mut names = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            names.push(envelope.event.name());
        }
        assert_eq!(
            names.iter().filter(|n| **n == "schedule_triggered").count(),
            1
        );
    }

    #[tokio::test]
    async fn run_is_stopped_when_window_closes() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, "sleep 30").await;
        let now = minute_now();
        service.create(&open_now(now)).await.unwrap();

        service.tick(now).await.unwrap();
        assert!(service.orchestrator.status().await.state.is_active());

        service.tick(now + TimeDelta::minutes(31)).await.unwrap();
        wait_idle(&service).await;
        let runs = service.db.list_runs(1).await.unwrap();
        assert_eq!(runs[0].status, "stopped");
        assert_eq!(runs[0].reason.as_deref(), Some("schedule window closed"));
    }

    #[tokio::test]
    async fn failed_occurrence_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, "exit 3").await;
        let now = minute_now();
        let schedule = service.create(&open_now(now)).await.unwrap();

        service.tick(now).await.unwrap();
        wait_idle(&service).await;
        assert_eq!(service.db.list_runs(1).await.unwrap()[0].status, "failed");

        service.tick(now + TimeDelta::minutes(1)).await.unwrap();
        let stored = service.get(schedule.id).await.unwrap();
        let window_start = window::current_window(&stored, now).unwrap().start_ts();
        assert_eq!(stored.failed_window_start, Some(window_start));
        assert_eq!(service.orchestrator.status().await.state, RunState::Idle);
        assert_eq!(service.db.list_runs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn skip_once_suppresses_then_resets() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, "sleep 30").await;
        let now = minute_now();
        let schedule = service.create(&open_now(now)).await.unwrap();

        let skipped = service.skip_next(schedule.id, now).await.unwrap();
        assert!(skipped.skip_next);
        service.tick(now).await.unwrap();
        assert_eq!(service.orchestrator.status().await.state, RunState::Idle);

        service.tick(now + TimeDelta::minutes(30)).await.unwrap();
        assert!(!service.get(schedule.id).await.unwrap().skip_next);
    }

    #[tokio::test]
    async fn next_run_reports_open_and_upcoming_windows() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, "exit 0").await;
        let now = minute_now();
        assert!(!service.next_run(now).await.unwrap().has_schedules);

        service.create(&open_now(now)).await.unwrap();
        let next = service.next_run(now).await.unwrap();
        assert!(next.is_currently_running);
        assert_eq!(next.active_schedule_count, 1);
        assert_eq!(next.next_end, Some(now + TimeDelta::minutes(30)));

        let later = service.next_run(now + TimeDelta::minutes(45)).await.unwrap();
        assert!(!later.is_currently_running);
        assert_eq!(later.next_start, Some(now + TimeDelta::days(1)));
    }

    #[tokio::test]
    async fn missed_windows_are_logged_not_caught_up() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir, "exit 0").await;
        let now = minute_now();
        let schedule = service.create(&open_now(now)).await.unwrap();
        let mut rx = service.events.subscribe();

        // Nothing ran in today's window.
        let missed = service.log_missed_windows(now + TimeDelta::hours(1)).await.unwrap();
        assert_eq!(missed, 1);
        let envelope = rx.try_recv().unwrap();
        assert!(matches!(
            envelope.event,
            OrchestratorEvent::ScheduleWindowMissed { schedule_id, .. } if schedule_id == schedule.id
        ));
        assert_eq!(service.orchestrator.status().await.state, RunState::Idle);
    }
}
