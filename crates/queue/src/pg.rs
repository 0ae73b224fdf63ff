//! Postgres-backed `StateStore`.
//!
//! Grounded in `db::repository::jobs::fetch_next_job`'s
//! `SELECT ... FOR UPDATE SKIP LOCKED` idiom, extended from a single job
//! queue into general-purpose streams with consumer groups and a
//! pending-entry list, plus the hot key-value operations (status, output,
//! idempotency, locks, rate limiting) as plain tables.
//!
//! Queries are built with `sqlx`'s runtime-checked query builder rather
//! than the `query!`/`query_as!` macros, so this crate builds without a
//! live database or a committed `.sqlx` query cache (see DESIGN.md).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    ErrorDetail, ExecutionMeta, ExecutionStatus, NodeStatus, NodeStatusRecord, RateResult,
    StatusExtra, StreamRecord,
};
use crate::store::StateStore;

/// Poll interval used while a `stream_consume` call is blocking for new
/// messages. Real brokers push; Postgres makes us poll.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn status_init(&self, execution_id: Uuid, node_ids: &[String]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for node_id in node_ids {
            sqlx::query(
                "INSERT INTO node_status (execution_id, node_id, status, retry_count)
                 VALUES ($1, $2, $3, 0)
                 ON CONFLICT (execution_id, node_id) DO NOTHING",
            )
            .bind(execution_id)
            .bind(node_id)
            .bind(NodeStatus::Waiting.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn status_get(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeStatusRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT status, retry_count, started_at, finished_at
             FROM node_status WHERE execution_id = $1 AND node_id = $2",
        )
        .bind(execution_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_status_record))
    }

    async fn status_mget(
        &self,
        execution_id: Uuid,
        node_ids: &[String],
    ) -> Result<HashMap<String, NodeStatusRecord>, StoreError> {
        if node_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT node_id, status, retry_count, started_at, finished_at
             FROM node_status WHERE execution_id = $1 AND node_id = ANY($2)",
        )
        .bind(execution_id)
        .bind(node_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let node_id: String = row.get("node_id");
                (node_id, row_to_status_record(row))
            })
            .collect())
    }

    async fn status_cas(
        &self,
        execution_id: Uuid,
        node_id: &str,
        expected: NodeStatus,
        new: NodeStatus,
        extra: StatusExtra,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE node_status
             SET status = $1,
                 retry_count = COALESCE($2, retry_count),
                 started_at = COALESCE($3, started_at),
                 finished_at = COALESCE($4, finished_at)
             WHERE execution_id = $5 AND node_id = $6 AND status = $7",
        )
        .bind(new.as_str())
        .bind(extra.retry_count.map(|v| v as i32))
        .bind(extra.started_at)
        .bind(extra.finished_at)
        .bind(execution_id)
        .bind(node_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn output_put(
        &self,
        execution_id: Uuid,
        node_id: &str,
        output: Option<serde_json::Value>,
        error: Option<ErrorDetail>,
    ) -> Result<(), StoreError> {
        let error_json = error.map(|e| serde_json::to_value(e).expect("ErrorDetail serializes"));
        sqlx::query(
            "INSERT INTO node_output (execution_id, node_id, output, error)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (execution_id, node_id)
             DO UPDATE SET output = EXCLUDED.output, error = EXCLUDED.error",
        )
        .bind(execution_id)
        .bind(node_id)
        .bind(output)
        .bind(error_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn output_mget(
        &self,
        execution_id: Uuid,
        node_ids: &[String],
    ) -> Result<HashMap<String, serde_json::Value>, StoreError> {
        if node_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT node_id, output FROM node_output
             WHERE execution_id = $1 AND node_id = ANY($2) AND output IS NOT NULL",
        )
        .bind(execution_id)
        .bind(node_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let node_id: String = row.get("node_id");
                let output: serde_json::Value = row.get("output");
                (node_id, output)
            })
            .collect())
    }

    async fn idempotency_try_claim(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let row = sqlx::query(
            "INSERT INTO idempotency_mark (fingerprint, claimed_at, expires_at)
             VALUES ($1, now(), $2)
             ON CONFLICT (fingerprint) DO UPDATE
                 SET claimed_at = now(), expires_at = EXCLUDED.expires_at
                 WHERE idempotency_mark.expires_at < now()
             RETURNING fingerprint",
        )
        .bind(fingerprint)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn lock_acquire(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let row = sqlx::query(
            "INSERT INTO distributed_lock (key, owner, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE
                 SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                 WHERE distributed_lock.expires_at < now()
             RETURNING key",
        )
        .bind(key)
        .bind(owner_token)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn lock_release(&self, key: &str, owner_token: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM distributed_lock WHERE key = $1 AND owner = $2")
            .bind(key)
            .bind(owner_token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn stream_publish(
        &self,
        stream: &str,
        fields: serde_json::Value,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query("INSERT INTO stream_entry (stream, fields) VALUES ($1, $2) RETURNING id")
            .bind(stream)
            .bind(fields)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    async fn stream_consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let records = self.try_consume_once(stream, group, consumer, count).await?;
            if !records.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(records);
            }
            tokio::time::sleep(POLL_INTERVAL.min(block)).await;
        }
    }

    async fn stream_ack(&self, stream: &str, group: &str, ids: &[i64]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE stream_delivery SET acked_at = now()
             WHERE stream = $1 AND group_name = $2 AND entry_id = ANY($3)",
        )
        .bind(stream)
        .bind(group)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stream_reclaim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(min_idle).unwrap_or_default();
        let mut tx = self.pool.begin().await?;

        let claimable: Vec<i64> = sqlx::query(
            "SELECT entry_id FROM stream_delivery
             WHERE stream = $1 AND group_name = $2 AND acked_at IS NULL AND delivered_at < $3
             ORDER BY delivered_at ASC
             LIMIT $4
             FOR UPDATE SKIP LOCKED",
        )
        .bind(stream)
        .bind(group)
        .bind(cutoff)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| row.get("entry_id"))
        .collect();

        if claimable.is_empty() {
            tx.commit().await?;
            return Ok(vec![]);
        }

        sqlx::query(
            "UPDATE stream_delivery SET consumer = $1, delivered_at = now()
             WHERE stream = $2 AND group_name = $3 AND entry_id = ANY($4)",
        )
        .bind(new_consumer)
        .bind(stream)
        .bind(group)
        .bind(&claimable)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query(
            "SELECT id, fields FROM stream_entry WHERE id = ANY($1) ORDER BY id ASC",
        )
        .bind(&claimable)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(rows.into_iter().map(row_to_stream_record).collect())
    }

    async fn rate_window_incr(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<RateResult, StoreError> {
        let window_secs = window.as_secs().max(1) as i64;
        let now_epoch = Utc::now().timestamp();
        let window_start_epoch = now_epoch - now_epoch.rem_euclid(window_secs);
        let window_start = DateTime::from_timestamp(window_start_epoch, 0).unwrap_or_else(Utc::now);
        let reset_at = window_start + chrono::Duration::seconds(window_secs);

        let row = sqlx::query(
            "INSERT INTO rate_window (key, window_start, count)
             VALUES ($1, $2, 1)
             ON CONFLICT (key, window_start) DO UPDATE SET count = rate_window.count + 1
             RETURNING count",
        )
        .bind(key)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;

        let count: i32 = row.get("count");
        Ok(RateResult {
            allowed: (count as u32) <= limit,
            remaining: limit.saturating_sub(count as u32),
            reset_at,
        })
    }

    async fn execution_meta_get(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionMeta>, StoreError> {
        let row = sqlx::query(
            "SELECT workflow_id, status, created_at FROM execution_meta WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let status: String = row.get("status");
            ExecutionMeta {
                workflow_id: row.get("workflow_id"),
                status: status.parse().expect("status stored by this crate is always valid"),
                created_at: row.get("created_at"),
            }
        }))
    }

    async fn execution_meta_init(&self, execution_id: Uuid, workflow_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO execution_meta (execution_id, workflow_id, status, created_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (execution_id) DO NOTHING",
        )
        .bind(execution_id)
        .bind(workflow_id)
        .bind(ExecutionStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn execution_meta_set_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE execution_meta SET status = $1 WHERE execution_id = $2")
            .bind(status.as_str())
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl PgStateStore {
    async fn try_consume_once(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<i64> = sqlx::query(
            "SELECT se.id FROM stream_entry se
             WHERE se.stream = $1
               AND NOT EXISTS (
                   SELECT 1 FROM stream_delivery sd
                   WHERE sd.stream = se.stream AND sd.group_name = $2 AND sd.entry_id = se.id
               )
             ORDER BY se.id ASC
             LIMIT $3
             FOR UPDATE SKIP LOCKED",
        )
        .bind(stream)
        .bind(group)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| row.get("id"))
        .collect();

        if candidates.is_empty() {
            tx.commit().await?;
            return Ok(vec![]);
        }

        for id in &candidates {
            sqlx::query(
                "INSERT INTO stream_delivery (stream, group_name, entry_id, consumer, delivered_at)
                 VALUES ($1, $2, $3, $4, now())",
            )
            .bind(stream)
            .bind(group)
            .bind(id)
            .bind(consumer)
            .execute(&mut *tx)
            .await?;
        }

        let rows = sqlx::query("SELECT id, fields FROM stream_entry WHERE id = ANY($1) ORDER BY id ASC")
            .bind(&candidates)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(rows.into_iter().map(row_to_stream_record).collect())
    }
}

fn row_to_status_record(row: sqlx::postgres::PgRow) -> NodeStatusRecord {
    let status: String = row.get("status");
    let retry_count: i32 = row.get("retry_count");
    NodeStatusRecord {
        status: status.parse().expect("status stored by this crate is always valid"),
        retry_count: retry_count as u32,
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    }
}

fn row_to_stream_record(row: sqlx::postgres::PgRow) -> StreamRecord {
    StreamRecord {
        id: row.get("id"),
        fields: row.get("fields"),
    }
}
