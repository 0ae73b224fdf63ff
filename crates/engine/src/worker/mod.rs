//! The worker: consumes `workflow:tasks`, runs the registered handler,
//! and publishes a completion. Replaces the teacher's in-process
//! `WorkflowExecutor` node loop with a distributed consumer that never
//! touches a node's own status transition beyond claiming it.

pub mod breaker;

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use db::DbPool;
use nodes::{Handler, HandlerError};
use queue::model::{
    CompletionMessage, CompletionStatus, ErrorCategory, ErrorDetail, ExecutionStatus, NodeStatus,
    StatusExtra, StreamRecord, TaskMessage, CURRENT_SCHEMA_VERSION,
};
use queue::StateStore;

use crate::config::{StreamConfig, WorkerConfig};
use crate::worker::breaker::CircuitBreakerRegistry;
use crate::EngineError;

pub type HandlerRegistry = HashMap<String, Arc<dyn Handler>>;

pub struct Worker {
    store: Arc<dyn StateStore>,
    db: DbPool,
    registry: HandlerRegistry,
    breaker: CircuitBreakerRegistry,
    config: WorkerConfig,
    streams: StreamConfig,
    consumer_name: String,
}

impl Worker {
    pub fn new(
        store: Arc<dyn StateStore>,
        db: DbPool,
        registry: HandlerRegistry,
        config: WorkerConfig,
        streams: StreamConfig,
        consumer_name: impl Into<String>,
    ) -> Self {
        let breaker = CircuitBreakerRegistry::new(config.cb_threshold, config.cb_open_timeout);
        Self { store, db, registry, breaker, config, streams, consumer_name: consumer_name.into() }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("worker shutting down");
                        return Ok(());
                    }
                }
                result = self.store.stream_consume(
                    &self.streams.tasks,
                    &self.streams.group_worker,
                    &self.consumer_name,
                    self.config.batch_size,
                    self.config.block,
                ) => {
                    match result {
                        Ok(records) => {
                            for record in records {
                                self.process_task(record, &mut shutdown).await;
                            }
                        }
                        Err(e) => warn!(error = %e, "tasks stream read failed"),
                    }
                }
            }
        }
    }

    #[instrument(skip(self, record, shutdown), fields(message_id = record.id))]
    async fn process_task(&self, record: StreamRecord, shutdown: &mut watch::Receiver<bool>) {
        let task: TaskMessage = match serde_json::from_value(record.fields.clone()) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "malformed task message, leaving unacknowledged");
                return;
            }
        };

        if task.schema_version > CURRENT_SCHEMA_VERSION {
            warn!(version = task.schema_version, "unsupported schema version, leaving unacknowledged");
            return;
        }

        if let Err(e) = self.run_pipeline(&task, shutdown).await {
            warn!(error = %e, "task pipeline failed, leaving for the reaper to reassign");
            return;
        }

        if let Err(e) = self
            .store
            .stream_ack(&self.streams.tasks, &self.streams.group_worker, &[record.id])
            .await
        {
            warn!(error = %e, "failed to ack task");
        }
    }

    async fn run_pipeline(
        &self,
        task: &TaskMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        // Step 1: cancellation check.
        if let Some(meta) = self.store.execution_meta_get(task.execution_id).await? {
            if meta.status == ExecutionStatus::Cancelled {
                return Ok(());
            }
        }

        // Step 2/3: claim the node. Accept either PENDING (first delivery)
        // or RUNNING (redelivery after a crash mid-execution) so a reaper
        // hand-off to a new worker isn't permanently blocked by the dead
        // worker's earlier transition.
        let mut claimed = self
            .store
            .status_cas(
                task.execution_id,
                &task.node_id,
                NodeStatus::Pending,
                NodeStatus::Running,
                StatusExtra {
                    started_at: Some(chrono::Utc::now()),
                    retry_count: Some(task.retry_count),
                    ..Default::default()
                },
            )
            .await?;
        if !claimed {
            claimed = self
                .store
                .status_cas(
                    task.execution_id,
                    &task.node_id,
                    NodeStatus::Running,
                    NodeStatus::Running,
                    StatusExtra::default(),
                )
                .await?;
        }
        if !claimed {
            return Ok(());
        }

        let Some(handler) = self.registry.get(&task.handler).cloned() else {
            let detail = ErrorDetail::new(
                ErrorCategory::Validation,
                format!("no handler registered for '{}'", task.handler),
            );
            self.give_up(task, detail).await?;
            return Ok(());
        };

        // Step 4: circuit breaker gate.
        if !self.breaker.allow(&task.handler) {
            let detail = ErrorDetail::new(
                ErrorCategory::CircuitOpen,
                format!("circuit open for handler '{}'", task.handler),
            );
            self.handle_failure(task, detail, shutdown).await?;
            return Ok(());
        }

        // Step 5: bounded handler execution.
        let outcome =
            tokio::time::timeout(self.config.handler_timeout, handler.call(task.resolved_config.clone())).await;

        match outcome {
            Ok(Ok(output)) => self.handle_success(task, output).await,
            Ok(Err(handler_err)) => {
                self.breaker.on_failure(&task.handler);
                self.handle_failure(task, classify(&handler_err), shutdown).await
            }
            Err(_elapsed) => {
                self.breaker.on_failure(&task.handler);
                let detail = ErrorDetail::new(ErrorCategory::Timeout, "handler exceeded configured timeout");
                self.handle_failure(task, detail, shutdown).await
            }
        }
    }

    async fn handle_success(&self, task: &TaskMessage, output: serde_json::Value) -> Result<(), EngineError> {
        let fingerprint = format!("completion:{}:{}", task.execution_id, task.node_id);
        if !self.store.idempotency_try_claim(&fingerprint, self.config.idempotency_ttl).await? {
            // A previous attempt already published this node's completion.
            return Ok(());
        }

        self.breaker.on_success(&task.handler);
        let completion = CompletionMessage {
            execution_id: task.execution_id,
            node_id: task.node_id.clone(),
            status: CompletionStatus::Completed,
            output: Some(output),
            error: None,
            schema_version: CURRENT_SCHEMA_VERSION,
        };
        self.store
            .stream_publish(
                &self.streams.completions,
                serde_json::to_value(&completion).expect("CompletionMessage always serialises"),
            )
            .await?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        task: &TaskMessage,
        detail: ErrorDetail,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        if detail.retryable && task.retry_count < self.config.max_retries {
            self.retry_with_backoff(task, shutdown).await
        } else {
            self.give_up(task, detail).await
        }
    }

    async fn retry_with_backoff(
        &self,
        task: &TaskMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let delay = backoff_delay(
            task.retry_count,
            self.config.retry_base,
            self.config.retry_cap,
            self.config.retry_jitter,
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return Ok(()),
        }

        let retry = TaskMessage { retry_count: task.retry_count + 1, ..task.clone() };
        self.store
            .stream_publish(&self.streams.tasks, serde_json::to_value(&retry).expect("TaskMessage always serialises"))
            .await?;
        Ok(())
    }

    async fn give_up(&self, task: &TaskMessage, detail: ErrorDetail) -> Result<(), EngineError> {
        // Claim before writing anything: two concurrently-running workers can
        // both reach `give_up` for the same redelivered task (the PENDING->
        // RUNNING CAS deliberately tolerates RUNNING->RUNNING), and only the
        // first should produce a dead-letter row or a completion.
        let fingerprint = format!("completion:{}:{}", task.execution_id, task.node_id);
        if !self.store.idempotency_try_claim(&fingerprint, self.config.idempotency_ttl).await? {
            return Ok(());
        }

        db::repository::dead_letters::insert(
            &self.db,
            task.execution_id,
            &task.node_id,
            &task.handler,
            task.resolved_config.clone(),
            Some(task.resolved_config.clone()),
            serde_json::to_value(&detail).expect("ErrorDetail always serialises"),
            task.retry_count as i32,
        )
        .await?;

        let completion = CompletionMessage {
            execution_id: task.execution_id,
            node_id: task.node_id.clone(),
            status: CompletionStatus::Failed,
            output: None,
            error: Some(detail),
            schema_version: CURRENT_SCHEMA_VERSION,
        };
        self.store
            .stream_publish(
                &self.streams.completions,
                serde_json::to_value(&completion).expect("CompletionMessage always serialises"),
            )
            .await?;
        Ok(())
    }
}

fn classify(err: &HandlerError) -> ErrorDetail {
    match err {
        HandlerError::Validation(msg) => ErrorDetail::new(ErrorCategory::Validation, msg.clone()),
        HandlerError::Retryable(msg) => ErrorDetail::new(ErrorCategory::Handler, msg.clone()),
        HandlerError::Fatal(msg) => ErrorDetail::new(ErrorCategory::Handler, msg.clone()),
    }
}

/// Full jitter exponential backoff: `min(cap, base * 2^retry_count)` plus a
/// uniform `[0, jitter)` term.
fn backoff_delay(
    retry_count: u32,
    base: std::time::Duration,
    cap: std::time::Duration,
    jitter: std::time::Duration,
) -> std::time::Duration {
    let exp = base.saturating_mul(1u32.checked_shl(retry_count).unwrap_or(u32::MAX));
    let bounded = exp.min(cap);
    let jitter_ms = rand::thread_rng().gen_range(0..=jitter.as_millis().max(1) as u64);
    bounded + std::time::Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_is_capped() {
        let d = backoff_delay(10, Duration::from_secs(1), Duration::from_secs(30), Duration::from_secs(1));
        assert!(d <= Duration::from_secs(31));
        assert!(d >= Duration::from_secs(30));
    }

    #[test]
    fn backoff_grows_exponentially_before_cap() {
        let d0 = backoff_delay(0, Duration::from_secs(1), Duration::from_secs(30), Duration::from_secs(1));
        let d2 = backoff_delay(2, Duration::from_secs(1), Duration::from_secs(30), Duration::from_secs(1));
        assert!(d0 >= Duration::from_secs(1) && d0 < Duration::from_secs(2));
        assert!(d2 >= Duration::from_secs(4) && d2 < Duration::from_secs(5));
    }

    #[test]
    fn backoff_jitter_uses_configured_bound_not_base() {
        let d = backoff_delay(0, Duration::from_millis(1), Duration::from_secs(30), Duration::from_secs(5));
        assert!(d >= Duration::from_millis(1));
        assert!(d <= Duration::from_millis(1) + Duration::from_secs(5));
    }
}
