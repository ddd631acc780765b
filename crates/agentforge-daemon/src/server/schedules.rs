//! Schedule endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;

use agentforge_core::model::{NewSchedule, Schedule, ScheduleUpdate};

use super::AppState;
use super::error::ApiError;
use crate::scheduler::NextRun;

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Schedule>>, ApiError> {
    Ok(Json(state.scheduler.list().await?))
}

pub async fn create(
    State(state): State<AppState>,
    Json(new): Json<NewSchedule>,
) -> Result<(StatusCode, Json<Schedule>), ApiError> {
    let schedule = state.scheduler.create(&new).await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn next(State(state): State<AppState>) -> Result<Json<NextRun>, ApiError> {
    Ok(Json(state.scheduler.next_run(Utc::now()).await?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Schedule>, ApiError> {
    Ok(Json(state.scheduler.get(id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<ScheduleUpdate>,
) -> Result<Json<Schedule>, ApiError> {
    Ok(Json(state.scheduler.update(id, update).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn skip(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Schedule>, ApiError> {
    Ok(Json(state.scheduler.skip_next(id, Utc::now()).await?))
}
