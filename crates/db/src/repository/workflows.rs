//! DAG definition persistence.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::WorkflowRow, DbError};

/// Persist a DAG definition, overwriting any prior definition with the
/// same `workflow_id`.
pub async fn save_dag(
    pool: &PgPool,
    workflow_id: Uuid,
    name: &str,
    definition: serde_json::Value,
) -> Result<WorkflowRow, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"
        INSERT INTO workflows (id, name, definition, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE
        SET name = EXCLUDED.name, definition = EXCLUDED.definition
        RETURNING id, name, definition, created_at
        "#,
    )
    .bind(workflow_id)
    .bind(name)
    .bind(definition)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Load a DAG definition by `workflow_id`.
pub async fn load_dag(pool: &PgPool, workflow_id: Uuid) -> Result<WorkflowRow, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"SELECT id, name, definition, created_at FROM workflows WHERE id = $1"#,
    )
    .bind(workflow_id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Return all DAG definitions, newest first. Used by the gateway's list
/// endpoint; not part of the core's required operation set.
pub async fn list_dags(pool: &PgPool) -> Result<Vec<WorkflowRow>, DbError> {
    let rows = sqlx::query_as::<_, WorkflowRow>(
        r#"SELECT id, name, definition, created_at FROM workflows ORDER BY created_at DESC"#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
