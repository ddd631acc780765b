use chrono::{DateTime, TimeZone, Utc, Weekday};

use agentforge_core::model::{RunSettings, Schedule, Weekdays};
use agentforge_daemon::scheduler::window;

fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// Monday 09:00 UTC for 60 minutes: open at 09:30, closed at 10:01.
#[test]
fn monday_window_opens_and_closes() {
    let schedule = Schedule {
        id: 1,
        weekdays: [Weekday::Mon].into_iter().collect::<Weekdays>(),
        start_time: "09:00".to_string(),
        duration_minutes: 60,
        enabled: true,
        paused: false,
        skip_next: false,
        skip_until: None,
        overrides: RunSettings::default(),
        failed_window_start: None,
        created_at: 0,
        updated_at: 0,
    };
    // 2026-10-19 is a Monday.
    let open = window::current_window(&schedule, utc(2026, 10, 19, 9, 30)).unwrap();
    assert_eq!(open.end, utc(2026, 10, 19, 10, 0));
    assert!(open.end <= utc(2026, 10, 19, 10, 1));
    assert!(window::current_window(&schedule, utc(2026, 10, 19, 10, 1)).is_none());
    assert_eq!(
        window::next_window_start(&schedule, utc(2026, 10, 19, 10, 1)),
        Some(utc(2026, 10, 26, 9, 0))
    );
}

#[cfg(unix)]
mod crash_recovery {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use agentforge_core::model::{FeatureStatus, NewFeature, RunSettings, RunTrigger};
    use agentforge_core::{OrchestratorEvent, PolicyEngine};
    use agentforge_daemon::claims::ClaimStore;
    use agentforge_daemon::events::EventBus;
    use agentforge_daemon::orchestrator::{Orchestrator, OrchestratorSettings};
    use agentforge_daemon::project::ProjectContext;
    use agentforge_daemon::storage::Database;
    use agentforge_daemon::supervisor::{Supervisor, SupervisorConfig};

    /// First attempt crashes; later attempts report their features passing.
    const CRASH_ONCE: &str = r#"
        marker="$AGENTFORGE_PROJECT_DIR/crashed-once"
        if [ ! -f "$marker" ]; then touch "$marker"; exit 1; fi
        for id in $(echo "$AGENTFORGE_FEATURE_IDS" | tr ',' ' '); do
            echo "{\"type\":\"feature_result\",\"feature_id\":$id,\"outcome\":\"passing\"}"
        done
    "#;

    #[tokio::test]
    async fn scheduled_run_recovers_from_crash() {
        let dir = tempfile::tempdir().unwrap();
        let project = Arc::new(ProjectContext::open(dir.path()).unwrap());
        let events = EventBus::new();
        let db = Database::open_in_memory().await.unwrap();
        let claims = Arc::new(ClaimStore::load(db, events.clone(), 3).await.unwrap());
        let feature = claims.create_feature(NewFeature::named("F")).await.unwrap();

        let config = SupervisorConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), CRASH_ONCE.to_string()],
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
        let orchestrator = Orchestrator::new(
            project,
            Arc::clone(&claims),
            supervisor,
            events.clone(),
            OrchestratorSettings {
                features_per_agent: 1,
                idle_interval: Duration::from_millis(50),
                retry_base_delay: Duration::from_millis(20),
                retry_max_attempts: 3,
            },
        );
        let mut rx = orchestrator.subscribe();

        orchestrator
            .start(
                RunSettings {
                    yolo: true,
                    ..RunSettings::default()
                },
                RunTrigger::Scheduled {
                    schedule_id: 1,
                    window_start: 0,
                    window_end: i64::MAX,
                },
            )
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(20), orchestrator.wait_idle())
            .await
            .expect("run did not finish");

        let mut crashed_released = None;
        let mut restart_delay = None;
        let mut completed = false;
        while let Ok(envelope) = rx.try_recv() {
            match envelope.event {
                OrchestratorEvent::AgentCrashed { released, .. } => crashed_released = Some(released),
                OrchestratorEvent::RestartScheduled { attempt, delay_ms, .. } => {
                    assert_eq!(attempt, 1);
                    restart_delay = Some(delay_ms);
                }
                OrchestratorEvent::RunCompleted { .. } => completed = true,
                _ => {}
            }
        }
        assert_eq!(crashed_released, Some(vec![feature.id]));
        assert!(restart_delay.is_some_and(|d| d >= 20));
        assert!(completed);
        assert_eq!(
            claims.get(feature.id).await.unwrap().status,
            FeatureStatus::Passing
        );
    }
}
