//! The State Store facade: a narrow interface over a key-value store that
//! also provides durable append-only streams with consumer groups and
//! pending-entry tracking.
//!
//! `status_cas` and `lock_acquire`/`lock_release` must be atomic, and every
//! operation here non-blocking / cancellable by the caller — an `async fn`
//! dropped by the caller's `tokio::select!` or task abort must leave no
//! partial state behind.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    ExecutionStatus, ExecutionMeta, NodeStatus, NodeStatusRecord, RateResult, StatusExtra,
    StreamRecord,
};

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Seed every node of a freshly submitted execution as `WAITING`.
    async fn status_init(&self, execution_id: Uuid, node_ids: &[String]) -> Result<(), StoreError>;

    async fn status_get(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeStatusRecord>, StoreError>;

    async fn status_mget(
        &self,
        execution_id: Uuid,
        node_ids: &[String],
    ) -> Result<HashMap<String, NodeStatusRecord>, StoreError>;

    /// Compare-and-set: transition `(execution_id, node_id)` from
    /// `expected` to `new`, atomically applying `extra`. Returns whether
    /// the CAS succeeded.
    async fn status_cas(
        &self,
        execution_id: Uuid,
        node_id: &str,
        expected: NodeStatus,
        new: NodeStatus,
        extra: StatusExtra,
    ) -> Result<bool, StoreError>;

    async fn output_put(
        &self,
        execution_id: Uuid,
        node_id: &str,
        output: Option<serde_json::Value>,
        error: Option<crate::model::ErrorDetail>,
    ) -> Result<(), StoreError>;

    async fn output_mget(
        &self,
        execution_id: Uuid,
        node_ids: &[String],
    ) -> Result<HashMap<String, serde_json::Value>, StoreError>;

    /// Set-if-absent with TTL. Returns true iff this caller claimed it.
    async fn idempotency_try_claim(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn lock_acquire(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Ownership-checked release: only the current owner can release.
    async fn lock_release(&self, key: &str, owner_token: &str) -> Result<bool, StoreError>;

    async fn stream_publish(
        &self,
        stream: &str,
        fields: serde_json::Value,
    ) -> Result<i64, StoreError>;

    /// Read up to `count` undelivered messages for `group`, blocking for up
    /// to `block` if none are immediately available.
    async fn stream_consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamRecord>, StoreError>;

    async fn stream_ack(&self, stream: &str, group: &str, ids: &[i64]) -> Result<(), StoreError>;

    /// Take ownership of messages whose current consumer has been silent
    /// longer than `min_idle`.
    async fn stream_reclaim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamRecord>, StoreError>;

    async fn rate_window_incr(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<RateResult, StoreError>;

    /// Live execution-level metadata (`meta:execution:{execution_id}`),
    /// used by the orchestrator's cancellation gate and the worker's
    /// cancellation check. Distinct from the Definition Repository's
    /// terminal record — this one is mutable until the execution finishes.
    async fn execution_meta_get(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionMeta>, StoreError>;

    async fn execution_meta_init(&self, execution_id: Uuid, workflow_id: Uuid) -> Result<(), StoreError>;

    async fn execution_meta_set_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<(), StoreError>;
}

/// The slice of `StateStore` the reaper needs. It only ever touches broker
/// pending-entry metadata, never business state — this trait enforces that
/// at the type level: a `Reaper` can't accidentally be handed a method that
/// would let it read or mutate node/execution status.
#[async_trait]
pub trait ReaperStore: Send + Sync {
    async fn stream_reclaim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamRecord>, StoreError>;

    async fn stream_publish(
        &self,
        stream: &str,
        fields: serde_json::Value,
    ) -> Result<i64, StoreError>;

    async fn stream_ack(&self, stream: &str, group: &str, ids: &[i64]) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: StateStore> ReaperStore for T {
    async fn stream_reclaim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamRecord>, StoreError> {
        StateStore::stream_reclaim(self, stream, group, new_consumer, min_idle, count).await
    }

    async fn stream_publish(
        &self,
        stream: &str,
        fields: serde_json::Value,
    ) -> Result<i64, StoreError> {
        StateStore::stream_publish(self, stream, fields).await
    }

    async fn stream_ack(&self, stream: &str, group: &str, ids: &[i64]) -> Result<(), StoreError> {
        StateStore::stream_ack(self, stream, group, ids).await
    }
}
