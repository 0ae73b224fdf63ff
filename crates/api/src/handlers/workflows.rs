use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use uuid::Uuid;

use engine::{NodeDefinition, WorkflowDefinition};

use crate::AppState;
use db::repository::workflows as wf_repo;

#[derive(serde::Deserialize)]
pub struct CreateWorkflowDto {
    pub name: String,
    pub nodes: Vec<NodeDefinition>,
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<db::models::WorkflowRow>>, StatusCode> {
    match wf_repo::list_dags(&state.pool).await {
        Ok(workflows) => Ok(Json(workflows)),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<db::models::WorkflowRow>, StatusCode> {
    match wf_repo::load_dag(&state.pool, id).await {
        Ok(wf) => Ok(Json(wf)),
        Err(db::DbError::NotFound) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Register a DAG. Validation beyond JSON shape (cycles, dangling
/// dependencies, duplicate ids) is `engine::Graph::validate`'s job, run
/// inside `Orchestrator::register`.
pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowDto>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let workflow = WorkflowDefinition::new(payload.name, payload.nodes);

    match state.orchestrator.register(workflow).await {
        Ok(workflow_id) => Ok((StatusCode::CREATED, Json(serde_json::json!({ "workflow_id": workflow_id })))),
        Err(engine::EngineError::Graph(e)) => {
            tracing::warn!(error = %e, "rejected invalid DAG");
            Err(StatusCode::BAD_REQUEST)
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to register workflow");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
