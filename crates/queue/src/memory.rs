//! In-memory `StateStore`, the way the teacher's `MockNode` let
//! `executor_tests.rs` exercise retry logic without a real node
//! implementation. Lets `engine`'s orchestrator/worker/reaper tests run
//! without a Postgres instance.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    ErrorDetail, ExecutionMeta, ExecutionStatus, NodeStatus, NodeStatusRecord, RateResult,
    StatusExtra, StreamRecord,
};
use crate::store::StateStore;

#[derive(Default)]
struct Inner {
    statuses: HashMap<(Uuid, String), NodeStatusRecord>,
    outputs: HashMap<(Uuid, String), (Option<serde_json::Value>, Option<ErrorDetail>)>,
    idempotency: HashMap<String, DateTime<Utc>>,
    locks: HashMap<String, (String, DateTime<Utc>)>,
    streams: HashMap<String, Vec<(i64, serde_json::Value)>>,
    next_id: i64,
    deliveries: HashMap<(String, String, i64), Delivery>,
    execution_meta: HashMap<Uuid, ExecutionMeta>,
    rate_windows: HashMap<(String, DateTime<Utc>), u32>,
}

struct Delivery {
    delivered_at: DateTime<Utc>,
    acked: bool,
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn status_init(&self, execution_id: Uuid, node_ids: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for node_id in node_ids {
            inner
                .statuses
                .entry((execution_id, node_id.clone()))
                .or_insert(NodeStatusRecord {
                    status: NodeStatus::Waiting,
                    retry_count: 0,
                    started_at: None,
                    finished_at: None,
                });
        }
        Ok(())
    }

    async fn status_get(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeStatusRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .statuses
            .get(&(execution_id, node_id.to_string()))
            .cloned())
    }

    async fn status_mget(
        &self,
        execution_id: Uuid,
        node_ids: &[String],
    ) -> Result<HashMap<String, NodeStatusRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(node_ids
            .iter()
            .filter_map(|id| {
                inner
                    .statuses
                    .get(&(execution_id, id.clone()))
                    .map(|rec| (id.clone(), rec.clone()))
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
        let mut inner = self.inner.lock().unwrap();
        let key = (execution_id, node_id.to_string());
        match inner.statuses.get_mut(&key) {
            Some(rec) if rec.status as u8 == expected as u8 => {
                rec.status = new;
                if let Some(rc) = extra.retry_count {
                    rec.retry_count = rc;
                }
                if let Some(s) = extra.started_at {
                    rec.started_at = Some(s);
                }
                if let Some(f) = extra.finished_at {
                    rec.finished_at = Some(f);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn output_put(
        &self,
        execution_id: Uuid,
        node_id: &str,
        output: Option<serde_json::Value>,
        error: Option<ErrorDetail>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .outputs
            .insert((execution_id, node_id.to_string()), (output, error));
        Ok(())
    }

    async fn output_mget(
        &self,
        execution_id: Uuid,
        node_ids: &[String],
    ) -> Result<HashMap<String, serde_json::Value>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(node_ids
            .iter()
            .filter_map(|id| {
                inner
                    .outputs
                    .get(&(execution_id, id.clone()))
                    .and_then(|(out, _)| out.clone())
                    .map(|v| (id.clone(), v))
            })
            .collect())
    }

    async fn idempotency_try_claim(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        match inner.idempotency.get(fingerprint) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                inner.idempotency.insert(
                    fingerprint.to_string(),
                    now + chrono::Duration::from_std(ttl).unwrap_or_default(),
                );
                Ok(true)
            }
        }
    }

    async fn lock_acquire(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        match inner.locks.get(key) {
            Some((_, expires)) if *expires > now => Ok(false),
            _ => {
                inner.locks.insert(
                    key.to_string(),
                    (
                        owner_token.to_string(),
                        now + chrono::Duration::from_std(ttl).unwrap_or_default(),
                    ),
                );
                Ok(true)
            }
        }
    }

    async fn lock_release(&self, key: &str, owner_token: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.locks.get(key) {
            Some((owner, _)) if owner == owner_token => {
                inner.locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stream_publish(
        &self,
        stream: &str,
        fields: serde_json::Value,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .push((id, fields));
        Ok(id)
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
            let records = self.consume_once(stream, group, consumer, count);
            if !records.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(records);
            }
            tokio::time::sleep(Duration::from_millis(10).min(block)).await;
        }
    }

    async fn stream_ack(&self, stream: &str, group: &str, ids: &[i64]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for id in ids {
            if let Some(d) = inner
                .deliveries
                .get_mut(&(stream.to_string(), group.to_string(), *id))
            {
                d.acked = true;
            }
        }
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
        let mut inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::from_std(min_idle).unwrap_or_default();

        let mut claimable: Vec<i64> = inner
            .deliveries
            .iter()
            .filter(|(k, d)| k.0 == stream && k.1 == group && !d.acked && d.delivered_at < cutoff)
            .map(|(k, _)| k.2)
            .collect();
        claimable.sort_unstable();
        claimable.truncate(count);

        let now = Utc::now();
        for id in &claimable {
            if let Some(d) = inner
                .deliveries
                .get_mut(&(stream.to_string(), group.to_string(), *id))
            {
                d.delivered_at = now;
            }
        }
        let _ = new_consumer;

        let entries = inner.streams.get(stream).cloned().unwrap_or_default();
        Ok(claimable
            .into_iter()
            .filter_map(|id| entries.iter().find(|(eid, _)| *eid == id).cloned())
            .map(|(id, fields)| StreamRecord { id, fields })
            .collect())
    }

    async fn rate_window_incr(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> Result<RateResult, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let window_secs = window.as_secs().max(1) as i64;
        let now_epoch = Utc::now().timestamp();
        let window_start_epoch = now_epoch - now_epoch.rem_euclid(window_secs);
        let window_start = DateTime::from_timestamp(window_start_epoch, 0).unwrap_or_else(Utc::now);
        let reset_at = window_start + chrono::Duration::seconds(window_secs);

        let count = inner
            .rate_windows
            .entry((key.to_string(), window_start))
            .or_insert(0);
        *count += 1;

        Ok(RateResult {
            allowed: *count <= limit,
            remaining: limit.saturating_sub(*count),
            reset_at,
        })
    }

    async fn execution_meta_get(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionMeta>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.execution_meta.get(&execution_id).cloned())
    }

    async fn execution_meta_init(&self, execution_id: Uuid, workflow_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.execution_meta.entry(execution_id).or_insert(ExecutionMeta {
            workflow_id,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn execution_meta_set_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(meta) = inner.execution_meta.get_mut(&execution_id) {
            meta.status = status;
        }
        Ok(())
    }
}

impl MemoryStateStore {
    fn consume_once(&self, stream: &str, group: &str, consumer: &str, count: usize) -> Vec<StreamRecord> {
        let mut inner = self.inner.lock().unwrap();
        let entries = inner.streams.get(stream).cloned().unwrap_or_default();
        let mut picked = Vec::new();
        for (id, fields) in entries {
            if picked.len() >= count {
                break;
            }
            let key = (stream.to_string(), group.to_string(), id);
            if inner.deliveries.contains_key(&key) {
                continue;
            }
            inner.deliveries.insert(
                key,
                Delivery {
                    delivered_at: Utc::now(),
                    acked: false,
                },
            );
            let _ = consumer;
            picked.push(StreamRecord { id, fields });
        }
        picked
    }
}
