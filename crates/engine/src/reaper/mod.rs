//! The reaper: reclaims stream entries stuck in a consumer group's
//! pending-entry list past `min_idle`, redelivering them for another
//! attempt, or diverting them to the dead-letter store once they are too
//! far gone to retry.
//!
//! Deliberately typed against `ReaperStore`, not the full `StateStore` — it
//! only ever touches broker bookkeeping, never node or execution status.

use std::collections::HashMap;

use tokio::sync::watch;
use tracing::{info, warn};

use db::DbPool;
use queue::model::{CompletionMessage, ErrorCategory, ErrorDetail, StreamRecord, TaskMessage};
use queue::ReaperStore;

use crate::config::{ReaperConfig, StreamConfig};
use crate::EngineError;

pub struct Reaper {
    store: std::sync::Arc<dyn ReaperStore>,
    db: DbPool,
    config: ReaperConfig,
    streams: StreamConfig,
    consumer_name: String,
    // Redelivery mints a new stream id every cycle, so an id-keyed counter
    // can never accumulate past one. `TaskMessage` carries its own
    // `retry_count`, which survives redelivery and is used directly; this
    // map only backstops payloads that don't carry such a field (a stalled
    // `CompletionMessage` has no retry counter of its own), keyed by the
    // stable `execution_id:node_id` pair instead of the ephemeral id.
    reclaim_counts: std::sync::Mutex<HashMap<String, u32>>,
}

impl Reaper {
    pub fn new(
        store: std::sync::Arc<dyn ReaperStore>,
        db: DbPool,
        config: ReaperConfig,
        streams: StreamConfig,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            db,
            config,
            streams,
            consumer_name: consumer_name.into(),
            reclaim_counts: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let mut tick = tokio::time::interval(self.config.check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reaper shutting down");
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    self.sweep(&self.streams.tasks, &self.streams.group_worker).await;
                    self.sweep(&self.streams.completions, &self.streams.group_orchestrator).await;
                }
            }
        }
    }

    async fn sweep(&self, stream: &str, group: &str) {
        let records = match self
            .store
            .stream_reclaim(stream, group, &self.consumer_name, self.config.min_idle, self.config.batch_size)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, stream, "reclaim failed");
                return;
            }
        };

        for record in records {
            let attempt = self.reclaim_attempt(&record);

            if attempt > self.config.max_reclaims {
                self.divert_to_dead_letter(stream, group, record).await;
                continue;
            }

            info!(stream, message_id = record.id, attempt, "redelivering stalled message");
            if let Err(e) = self.store.stream_publish(stream, record.fields).await {
                warn!(error = %e, "failed to redeliver reclaimed message");
                continue;
            }
            if let Err(e) = self.store.stream_ack(stream, group, &[record.id]).await {
                warn!(error = %e, "failed to ack original reclaimed message");
            }
        }
    }

    /// How many times this logical message has already been reclaimed.
    /// `TaskMessage.retry_count` survives redelivery and is the source of
    /// truth when present; other payload shapes fall back to a counter
    /// keyed by a stable identity pulled out of the message itself.
    fn reclaim_attempt(&self, record: &StreamRecord) -> u32 {
        if let Ok(task) = serde_json::from_value::<TaskMessage>(record.fields.clone()) {
            return task.retry_count + 1;
        }

        let key = match serde_json::from_value::<CompletionMessage>(record.fields.clone()) {
            Ok(completion) => format!("{}:{}", completion.execution_id, completion.node_id),
            Err(_) => record.id.to_string(),
        };
        let mut counts = self.reclaim_counts.lock().unwrap();
        let c = counts.entry(key).or_insert(0);
        *c += 1;
        *c
    }

    async fn divert_to_dead_letter(&self, stream: &str, group: &str, record: StreamRecord) {
        match serde_json::from_value::<TaskMessage>(record.fields.clone()) {
            Ok(task) => {
                let detail = ErrorDetail::new(
                    ErrorCategory::Unknown,
                    format!("exceeded {} broker reclaims without completing", self.config.max_reclaims),
                );
                if let Err(e) = db::repository::dead_letters::insert(
                    &self.db,
                    task.execution_id,
                    &task.node_id,
                    &task.handler,
                    task.resolved_config.clone(),
                    Some(task.resolved_config),
                    serde_json::to_value(&detail).expect("ErrorDetail always serialises"),
                    task.retry_count as i32,
                )
                .await
                {
                    warn!(error = %e, "failed to record dead-letter entry for exhausted reclaim");
                }
            }
            Err(_) => {
                warn!(
                    stream,
                    message_id = record.id,
                    "stalled message exceeded max reclaims but could not be parsed as a task; dropping without a dead-letter row"
                );
            }
        }

        if let Err(e) = self.store.stream_ack(stream, group, &[record.id]).await {
            warn!(error = %e, "failed to ack diverted message");
        }
    }
}
