//! Run control, status, agents, events and policy endpoints.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::Stream;
use tracing::warn;

use agentforge_core::Decision;
use agentforge_core::model::{
    AgentInfo, ControlResponse, FeatureStats, RunSettings, RunStatus, RunTrigger,
};

use super::AppState;
use crate::orchestrator::control_response;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub run: RunStatus,
    pub features: FeatureStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub command: String,
}

/// `GET /health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `GET /status`
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        run: state.orchestrator.status().await,
        features: state.orchestrator.claims().stats().await,
    })
}

/// `GET /agents`
pub async fn agents(State(state): State<AppState>) -> Json<Vec<AgentInfo>> {
    Json(state.orchestrator.supervisor().agents().await)
}

fn control(response: ControlResponse) -> (StatusCode, Json<ControlResponse>) {
    let status = if response.ok {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(response))
}

/// `POST /run/start` with an optional `RunSettings` body.
pub async fn start(
    State(state): State<AppState>,
    settings: Option<Json<RunSettings>>,
) -> (StatusCode, Json<ControlResponse>) {
    let settings = settings.map(|Json(s)| s).unwrap_or_default();
    let result = state.orchestrator.start(settings, RunTrigger::Manual).await;
    control(control_response(result, "run started"))
}

/// `POST /run/stop`
pub async fn stop(
    State(state): State<AppState>,
    body: Option<Json<StopRequest>>,
) -> (StatusCode, Json<ControlResponse>) {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "stopped by user".to_string());
    let result = state.orchestrator.stop(&reason).await;
    control(control_response(result, "stop requested"))
}

/// `POST /run/pause`
pub async fn pause(State(state): State<AppState>) -> (StatusCode, Json<ControlResponse>) {
    control(control_response(state.orchestrator.pause().await, "run paused"))
}

/// `POST /run/resume`
pub async fn resume(State(state): State<AppState>) -> (StatusCode, Json<ControlResponse>) {
    control(control_response(state.orchestrator.resume().await, "run resumed"))
}

/// `GET /events` as Server-Sent Events. A lagging client skips ahead.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.orchestrator.subscribe();
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    match Event::default().event(envelope.event.name()).json_data(&envelope) {
                        Ok(event) => yield Ok(event),
                        Err(e) => warn!(error = %e, "Failed to encode event"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, skipped events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

/// `POST /policy/evaluate`
pub async fn evaluate_policy(
    State(state): State<AppState>,
    Json(request): Json<EvaluateRequest>,
) -> Json<Decision> {
    Json(state.policy.evaluate(&request.command))
}
