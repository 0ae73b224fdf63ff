//! Terminal execution history.
//!
//! The orchestrator never writes here until an execution reaches a
//! terminal status — until then its live status lives in
//! `queue::ExecutionMeta`. This is the one write, `record_terminal`.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::ExecutionRow, DbError};

/// Record the final outcome of an execution. Called exactly once, when
/// the orchestrator observes the execution's last node settle.
pub async fn record_terminal(
    pool: &PgPool,
    execution_id: Uuid,
    workflow_id: Uuid,
    final_status: &str,
    per_node_outputs: serde_json::Value,
) -> Result<ExecutionRow, DbError> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        INSERT INTO executions (id, workflow_id, status, created_at, finished_at, node_outputs)
        VALUES ($1, $2, $3, $4, $4, $5)
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            finished_at = EXCLUDED.finished_at,
            node_outputs = EXCLUDED.node_outputs
        RETURNING id, workflow_id, status, created_at, finished_at, node_outputs
        "#,
    )
    .bind(execution_id)
    .bind(workflow_id)
    .bind(final_status)
    .bind(Utc::now())
    .bind(per_node_outputs)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Fetch a recorded execution by id. Used by the gateway's inspect
/// endpoint; `NotFound` also covers executions still in flight (their
/// record does not exist here until they go terminal).
pub async fn get_execution(pool: &PgPool, execution_id: Uuid) -> Result<ExecutionRow, DbError> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"SELECT id, workflow_id, status, created_at, finished_at, node_outputs FROM executions WHERE id = $1"#,
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}
