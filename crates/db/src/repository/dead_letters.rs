//! Dead-letter storage: append-only, deleted only by explicit operator
//! action — never by the orchestrator, worker, or reaper.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::DeadLetterRow, DbError};

/// Insert a dead-letter entry for a task the worker gave up on, or that
/// the reaper diverted after exceeding its reclaim cap.
#[allow(clippy::too_many_arguments)]
pub async fn insert(
    pool: &PgPool,
    execution_id: Uuid,
    node_id: &str,
    handler: &str,
    original_config: serde_json::Value,
    resolved_config: Option<serde_json::Value>,
    error_detail: serde_json::Value,
    retry_count: i32,
) -> Result<DeadLetterRow, DbError> {
    let row = sqlx::query_as::<_, DeadLetterRow>(
        r#"
        INSERT INTO dead_letters
            (entry_id, execution_id, node_id, handler, original_config, resolved_config, error_detail, retry_count, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING entry_id, execution_id, node_id, handler, original_config, resolved_config, error_detail, retry_count, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(execution_id)
    .bind(node_id)
    .bind(handler)
    .bind(original_config)
    .bind(resolved_config)
    .bind(error_detail)
    .bind(retry_count)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// List dead-letter entries, newest first. Used by the gateway's
/// `list-dead-letters` endpoint.
pub async fn list(pool: &PgPool) -> Result<Vec<DeadLetterRow>, DbError> {
    let rows = sqlx::query_as::<_, DeadLetterRow>(
        r#"
        SELECT entry_id, execution_id, node_id, handler, original_config, resolved_config, error_detail, retry_count, created_at
        FROM dead_letters
        ORDER BY created_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Permanently remove a dead-letter entry. Only ever called by an
/// operator-driven path (e.g. a CLI/gateway action), never by the core.
pub async fn delete(pool: &PgPool, entry_id: Uuid) -> Result<(), DbError> {
    let result = sqlx::query("DELETE FROM dead_letters WHERE entry_id = $1")
        .bind(entry_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}
