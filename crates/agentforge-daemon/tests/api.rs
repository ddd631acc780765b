use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use agentforge_core::PolicyEngine;
use agentforge_daemon::claims::ClaimStore;
use agentforge_daemon::events::EventBus;
use agentforge_daemon::orchestrator::{Orchestrator, OrchestratorSettings};
use agentforge_daemon::project::ProjectContext;
use agentforge_daemon::scheduler::SchedulerService;
use agentforge_daemon::server::{AppState, build_router};
use agentforge_daemon::storage::Database;
use agentforge_daemon::supervisor::{Supervisor, SupervisorConfig};

async fn app(dir: &tempfile::TempDir) -> axum::Router {
    let project = Arc::new(ProjectContext::open(dir.path()).unwrap());
    let events = EventBus::new();
    let db = Database::open_in_memory().await.unwrap();
    let claims = Arc::new(ClaimStore::load(db.clone(), events.clone(), 3).await.unwrap());
    let policy = Arc::new(PolicyEngine::new(Some(project.root().to_path_buf())));
    let config = SupervisorConfig {
        program: PathBuf::from("sh"),
        args: vec!["-c".to_string(), "sleep 30".to_string()],
        default_model: "test-model".to_string(),
        project_dir: project.root().to_path_buf(),
        data_dir: project.data_dir().to_path_buf(),
        extra_read_paths: Vec::new(),
        coding_limit: 1,
        testing_per_coding: 1,
        terminate_timeout: Duration::from_secs(1),
    };
    let supervisor = Supervisor::new(config, Arc::clone(&claims), Arc::clone(&policy), events.clone());
    let settings = OrchestratorSettings {
        features_per_agent: 1,
        idle_interval: Duration::from_millis(50),
        retry_base_delay: Duration::from_millis(5),
        retry_max_attempts: 3,
    };
    let orchestrator = Orchestrator::new(project, claims, supervisor, events.clone(), settings);
    let scheduler = Arc::new(SchedulerService::new(db, orchestrator.clone(), events));
    build_router(AppState {
        orchestrator,
        scheduler,
        policy,
    })
}

/// Send a request and return (status, parsed JSON body or Null).
async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn health_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir).await;
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn feature_lifecycle_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir).await;

    let (status, a) = send(&app, "POST", "/features", Some(json!({"name": "A"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let a_id = a["id"].as_i64().unwrap();

    let (status, batch) = send(
        &app,
        "POST",
        "/features/bulk",
        Some(json!([
            {"name": "B", "dependencies": [a_id]},
            {"name": "C", "depends_on_indices": [0]}
        ])),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let b_id = batch[0]["id"].as_i64().unwrap();

    let (_, ready) = send(&app, "GET", "/features/ready", None).await;
    let ready_ids: Vec<i64> = ready
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ready_ids, vec![a_id]);

    let (_, blocked) = send(&app, "GET", "/features/blocked", None).await;
    assert_eq!(blocked.as_array().unwrap().len(), 2);

    let (status, graph) = send(&app, "GET", "/features/graph", None).await;
    assert_eq!(status, StatusCode::OK);
    let statuses: Vec<&str> = graph["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, vec!["pending", "blocked", "blocked"]);
    assert_eq!(graph["edges"].as_array().unwrap().len(), 2);
    assert_eq!(graph["edges"][0]["source"], a_id);
    assert_eq!(graph["edges"][0]["target"], b_id);

    let (status, body) = send(
        &app,
        "PUT",
        &format!("/features/{a_id}/dependencies"),
        Some(json!({"dependencies": [b_id]})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "cycle_detected");

    let (status, stats) = send(&app, "GET", "/features/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], 3);

    let (status, skipped) = send(&app, "POST", &format!("/features/{a_id}/skip"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(skipped["priority"], 5);

    let (status, _) = send(&app, "POST", &format!("/features/{a_id}/retry"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, "DELETE", &format!("/features/{a_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, "GET", &format!("/features/{a_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn bad_feature_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir).await;
    let (status, _) = send(&app, "POST", "/features", Some(json!({"name": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/features",
        Some(json!({"name": "x", "dependencies": [999]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn schedules_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir).await;

    let (status, _) = send(
        &app,
        "POST",
        "/schedules",
        Some(json!({"weekdays": 1, "start_time": "25:00", "duration_minutes": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, created) = send(
        &app,
        "POST",
        "/schedules",
        Some(json!({"weekdays": 127, "start_time": "09:00", "duration_minutes": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_i64().unwrap();

    let (status, next) = send(&app, "GET", "/schedules/next", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(next["has_schedules"], true);

    let (status, updated) = send(
        &app,
        "PATCH",
        &format!("/schedules/{id}"),
        Some(json!({"paused": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["paused"], true);

    let (status, skipped) = send(&app, "POST", &format!("/schedules/{id}/skip"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(skipped["skip_next"], true);

    let (status, _) = send(&app, "DELETE", &format!("/schedules/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, "GET", &format!("/schedules/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn policy_evaluation_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir).await;

    let (status, denied) = send(
        &app,
        "POST",
        "/policy/evaluate",
        Some(json!({"command": "sudo rm -rf /"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(denied["decision"], "deny");

    let (_, allowed) = send(
        &app,
        "POST",
        "/policy/evaluate",
        Some(json!({"command": "git status"})),
    )
    .await;
    assert_eq!(allowed["decision"], "allow");
}

#[cfg(unix)]
#[tokio::test]
async fn run_control_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir).await;

    let (status, body) = send(&app, "POST", "/run/pause", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["ok"], false);

    send(&app, "POST", "/features", Some(json!({"name": "slow"}))).await;
    let (status, body) = send(&app, "POST", "/run/start", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["state"], "running");

    let (status, body) = send(
        &app,
        "POST",
        "/run/start",
        Some(json!({"yolo": true})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["state"], "running");

    let (_, body) = send(&app, "POST", "/run/pause", None).await;
    assert_eq!(body["state"], "paused");
    let (_, body) = send(&app, "POST", "/run/resume", None).await;
    assert_eq!(body["state"], "running");

    let (_, status_body) = send(&app, "GET", "/status", None).await;
    assert_eq!(status_body["run"]["state"], "running");

    let (status, body) = send(&app, "POST", "/run/stop", Some(json!({"reason": "test"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "stopping");
}
