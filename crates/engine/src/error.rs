//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

use crate::graph::GraphError;
use crate::orchestrator::template::TemplateError;

/// Errors produced by the engine (validation, orchestration, dispatch).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("state store error: {0}")]
    Store(#[from] queue::StoreError),

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("execution '{0}' is unknown to the state store")]
    ExecutionNotFound(Uuid),
}
