//! Error-to-response mapping for the HTTP API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use agentforge_core::ErrorKind;

use crate::claims::ClaimError;
use crate::graph::GraphError;
use crate::orchestrator::OrchestratorError;
use crate::scheduler::SchedulerError;
use crate::storage::DatabaseError;
use crate::supervisor::SupervisorError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: Option<ErrorKind>,
}

/// An error rendered as `{error, kind}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    kind: Option<ErrorKind>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    #[must_use]
    fn with_kind(mut self, kind: Option<ErrorKind>) -> Self {
        self.kind = kind;
        self
    }

    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "Request failed");
        }
        let body = ErrorBody {
            error: self.message,
            kind: self.kind,
        };
        (self.status, Json(body)).into_response()
    }
}

fn internal(e: &impl std::fmt::Display) -> ApiError {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn database_status(e: &DatabaseError) -> StatusCode {
    match e {
        DatabaseError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ClaimError> for ApiError {
    fn from(e: ClaimError) -> Self {
        let status = match &e {
            ClaimError::NotFound(_) | ClaimError::Graph(GraphError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ClaimError::Graph(GraphError::CycleDetected { .. })
            | ClaimError::InvalidState { .. }
            | ClaimError::NotHeld { .. } => StatusCode::CONFLICT,
            ClaimError::Graph(_) | ClaimError::InvalidIndex { .. } => StatusCode::BAD_REQUEST,
            ClaimError::Database(db) => database_status(db),
        };
        Self::new(status, e.to_string()).with_kind(e.kind())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match &e {
            SchedulerError::Validation(_) | SchedulerError::LimitReached { .. } => {
                Self::bad_request(e.to_string())
            }
            SchedulerError::NotFound(_) => Self::not_found(e.to_string()),
            SchedulerError::Database(db) => Self::new(database_status(db), e.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        let status = match &e {
            SupervisorError::NotFound { .. } => StatusCode::NOT_FOUND,
            SupervisorError::ConcurrencyExceeded { .. } | SupervisorError::Stopping => {
                StatusCode::CONFLICT
            }
            SupervisorError::Sandbox(_) => StatusCode::FORBIDDEN,
            SupervisorError::SpawnFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string()).with_kind(e.kind())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::AlreadyRunning { .. }
            | OrchestratorError::NotRunning
            | OrchestratorError::InvalidState { .. } => {
                Self::new(StatusCode::CONFLICT, e.to_string())
            }
            OrchestratorError::Claim(e) => e.into(),
            OrchestratorError::Supervisor(e) => e.into(),
            OrchestratorError::Database(e) => internal(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_maps_to_conflict_with_kind() {
        let err: ApiError = ClaimError::Graph(GraphError::CycleDetected { path: vec![1, 2, 1] }).into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.kind, Some(ErrorKind::CycleDetected));
    }

    #[test]
    fn not_found_and_validation_statuses() {
        let err: ApiError = ClaimError::NotFound(7).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err: ApiError = ClaimError::Graph(GraphError::SelfDependency(3)).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = SchedulerError::NotFound(2).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err: ApiError = OrchestratorError::NotRunning.into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }
}
