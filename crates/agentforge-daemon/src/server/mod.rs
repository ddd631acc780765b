//! HTTP control surface for the agentforge daemon.
//!
//! JSON endpoints for run control, features and schedules, plus a
//! Server-Sent Events stream of orchestrator events.

mod error;
pub mod features;
pub mod run;
pub mod schedules;

pub use error::ApiError;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use tower_http::trace::TraceLayer;
use tracing::info;

use agentforge_core::PolicyEngine;

use crate::orchestrator::Orchestrator;
use crate::scheduler::SchedulerService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub scheduler: Arc<SchedulerService>,
    pub policy: Arc<PolicyEngine>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(run::health))
        .route("/status", get(run::status))
        .route("/agents", get(run::agents))
        .route("/run/start", post(run::start))
        .route("/run/stop", post(run::stop))
        .route("/run/pause", post(run::pause))
        .route("/run/resume", post(run::resume))
        .route("/events", get(run::events))
        .route("/policy/evaluate", post(run::evaluate_policy))
        .route("/features", get(features::list).post(features::create))
        .route("/features/bulk", post(features::create_bulk))
        .route("/features/ready", get(features::ready))
        .route("/features/blocked", get(features::blocked))
        .route("/features/stats", get(features::stats))
        .route("/features/graph", get(features::graph))
        .route(
            "/features/{id}",
            get(features::get).delete(features::remove),
        )
        .route("/features/{id}/skip", post(features::skip))
        .route("/features/{id}/retry", post(features::retry))
        .route(
            "/features/{id}/dependencies",
            put(features::set_dependencies),
        )
        .route("/schedules", get(schedules::list).post(schedules::create))
        .route("/schedules/next", get(schedules::next))
        .route(
            "/schedules/{id}",
            get(schedules::get)
                .patch(schedules::update)
                .delete(schedules::delete),
        )
        .route("/schedules/{id}/skip", post(schedules::skip))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP API listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
