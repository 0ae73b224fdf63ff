use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use engine::{orchestrator::ExecutionView, EngineError};

use crate::AppState;

pub async fn trigger(
    Path(workflow_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    match state.orchestrator.trigger(workflow_id).await {
        Ok(execution_id) => {
            Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "execution_id": execution_id }))))
        }
        Err(EngineError::Database(db::DbError::NotFound)) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(error = %e, "failed to trigger execution");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn inspect(
    Path(execution_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<ExecutionView>, StatusCode> {
    match state.orchestrator.inspect(execution_id).await {
        Ok(view) => Ok(Json(view)),
        Err(EngineError::ExecutionNotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(error = %e, "failed to inspect execution");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn cancel(
    Path(execution_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, StatusCode> {
    match state.orchestrator.cancel(execution_id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            tracing::error!(error = %e, "failed to cancel execution");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
