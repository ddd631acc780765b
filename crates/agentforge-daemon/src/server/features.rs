//! Feature endpoints.

use std::collections::BTreeSet;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use agentforge_core::model::{
    BlockedFeature, Feature, FeatureId, FeatureStats, GraphView, NewFeature, NewFeatureSpec,
};

use super::AppState;
use super::error::ApiError;

#[derive(Debug, Serialize, Deserialize)]
pub struct DependenciesRequest {
    pub dependencies: BTreeSet<FeatureId>,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<Feature>> {
    Json(state.orchestrator.claims().list().await)
}

pub async fn create(
    State(state): State<AppState>,
    Json(new): Json<NewFeature>,
) -> Result<(StatusCode, Json<Feature>), ApiError> {
    if new.name.trim().is_empty() {
        return Err(ApiError::bad_request("feature name must not be empty"));
    }
    let feature = state.orchestrator.claims().create_feature(new).await?;
    Ok((StatusCode::CREATED, Json(feature)))
}

pub async fn create_bulk(
    State(state): State<AppState>,
    Json(specs): Json<Vec<NewFeatureSpec>>,
) -> Result<(StatusCode, Json<Vec<Feature>>), ApiError> {
    if specs.iter().any(|s| s.feature.name.trim().is_empty()) {
        return Err(ApiError::bad_request("feature name must not be empty"));
    }
    let features = state.orchestrator.claims().create_bulk(specs).await?;
    Ok((StatusCode::CREATED, Json(features)))
}

pub async fn ready(State(state): State<AppState>) -> Json<Vec<Feature>> {
    Json(state.orchestrator.claims().ready_set().await)
}

pub async fn blocked(State(state): State<AppState>) -> Json<Vec<BlockedFeature>> {
    Json(state.orchestrator.claims().blocked().await)
}

pub async fn stats(State(state): State<AppState>) -> Json<FeatureStats> {
    Json(state.orchestrator.claims().stats().await)
}

pub async fn graph(State(state): State<AppState>) -> Json<GraphView> {
    Json(state.orchestrator.claims().graph_view().await)
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<FeatureId>,
) -> Result<Json<Feature>, ApiError> {
    state
        .orchestrator
        .claims()
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Feature {id} not found")))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<FeatureId>,
) -> Result<Json<Feature>, ApiError> {
    Ok(Json(state.orchestrator.claims().remove_feature(id).await?))
}

pub async fn skip(
    State(state): State<AppState>,
    Path(id): Path<FeatureId>,
) -> Result<Json<Feature>, ApiError> {
    Ok(Json(state.orchestrator.claims().skip(id).await?))
}

pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<FeatureId>,
) -> Result<Json<Feature>, ApiError> {
    Ok(Json(state.orchestrator.claims().retry(id).await?))
}

/// `PUT /features/{id}/dependencies` replaces the whole set.
pub async fn set_dependencies(
    State(state): State<AppState>,
    Path(id): Path<FeatureId>,
    Json(request): Json<DependenciesRequest>,
) -> Result<Json<Feature>, ApiError> {
    let feature = state
        .orchestrator
        .claims()
        .set_dependencies(id, request.dependencies)
        .await?;
    Ok(Json(feature))
}
