//! The orchestrator: consumes completion events and advances the graph.
//! Replaces the teacher's single-process sequential
//! `WorkflowExecutor::run`, which executed a whole DAG inline passing
//! prev-output-as-next-input, with the distributed evaluation-transaction
//! model.

pub mod template;

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use db::DbPool;
use queue::model::{
    CompletionMessage, CompletionStatus, ErrorCategory, ErrorDetail, ExecutionStatus, NodeStatus,
    StatusExtra, StreamRecord, TaskMessage, CURRENT_SCHEMA_VERSION,
};
use queue::StateStore;

use crate::config::{OrchestratorConfig, StreamConfig};
use crate::graph::Graph;
use crate::model::{NodeDefinition, WorkflowDefinition};
use crate::EngineError;

struct CachedWorkflow {
    def: WorkflowDefinition,
    graph: Graph,
}

/// A point-in-time execution snapshot returned by [`Orchestrator::inspect`].
#[derive(Debug, serde::Serialize)]
pub struct ExecutionView {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub nodes: std::collections::HashMap<String, NodeStatus>,
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    db: DbPool,
    config: OrchestratorConfig,
    streams: StreamConfig,
    consumer_name: String,
    cache: DashMap<Uuid, Arc<CachedWorkflow>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        db: DbPool,
        config: OrchestratorConfig,
        streams: StreamConfig,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            db,
            config,
            streams,
            consumer_name: consumer_name.into(),
            cache: DashMap::new(),
        }
    }

    /// Validate and persist `workflow`. Returns its `workflow_id`; callers
    /// trigger one or more executions of it via [`Self::trigger`].
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.workflow_id))]
    pub async fn register(&self, workflow: WorkflowDefinition) -> Result<Uuid, EngineError> {
        Graph::validate(&workflow)?;

        db::repository::workflows::save_dag(
            &self.db,
            workflow.workflow_id,
            &workflow.name,
            serde_json::to_value(&workflow).expect("WorkflowDefinition always serialises"),
        )
        .await?;

        Ok(workflow.workflow_id)
    }

    /// Seed a new execution of the previously registered `workflow_id` and
    /// dispatch its root nodes. Returns the new `execution_id`.
    ///
    /// The spec describes this as publishing a synthetic completion event
    /// for a virtual root that the main loop then consumes; dispatching
    /// the roots directly here is behaviourally identical (a root has no
    /// parents, so the readiness check in step 4 is vacuously satisfied)
    /// without needing a fabricated message on the wire.
    #[instrument(skip(self), fields(%workflow_id))]
    pub async fn trigger(&self, workflow_id: Uuid) -> Result<Uuid, EngineError> {
        let row = db::repository::workflows::load_dag(&self.db, workflow_id).await?;
        let def: WorkflowDefinition =
            serde_json::from_value(row.definition).map_err(|e| db::DbError::Decode(e.to_string()))?;
        let graph = Graph::validate(&def)?;

        let execution_id = Uuid::new_v4();
        let node_ids: Vec<String> = def.nodes.iter().map(|n| n.id.clone()).collect();

        self.store.execution_meta_init(execution_id, workflow_id).await?;
        self.store.status_init(execution_id, &node_ids).await?;
        self.store
            .execution_meta_set_status(execution_id, ExecutionStatus::Running)
            .await?;

        let cached = Arc::new(CachedWorkflow { def, graph });
        self.cache.insert(execution_id, cached.clone());

        for root in cached.graph.roots().to_vec() {
            self.dispatch_candidate(execution_id, &root, &cached).await?;
        }

        info!(%execution_id, "execution triggered");
        Ok(execution_id)
    }

    /// A point-in-time view of an execution, for the gateway's inspect
    /// endpoint.
    pub async fn inspect(&self, execution_id: Uuid) -> Result<ExecutionView, EngineError> {
        let meta = self
            .store
            .execution_meta_get(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        let cached = self.workflow_for(execution_id).await?;
        let node_ids: Vec<String> = cached.def.nodes.iter().map(|n| n.id.clone()).collect();
        let statuses = self.store.status_mget(execution_id, &node_ids).await?;

        Ok(ExecutionView {
            execution_id,
            workflow_id: meta.workflow_id,
            status: meta.status,
            nodes: statuses.into_iter().map(|(id, rec)| (id, rec.status)).collect(),
        })
    }

    /// Cancel a running execution. Observed by the orchestrator's
    /// cancellation gate and the worker's own check before it starts a
    /// handler.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        self.store
            .execution_meta_set_status(execution_id, ExecutionStatus::Cancelled)
            .await?;
        Ok(())
    }

    /// Run the consumer-group main loop until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let mut reclaim_tick = tokio::time::interval(self.config.completion_reclaim_idle);
        reclaim_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("orchestrator shutting down");
                        return Ok(());
                    }
                }
                _ = reclaim_tick.tick() => {
                    self.reclaim_idle_completions().await;
                }
                result = self.store.stream_consume(
                    &self.streams.completions,
                    &self.streams.group_orchestrator,
                    &self.consumer_name,
                    self.config.batch_size,
                    self.config.block,
                ) => {
                    match result {
                        Ok(records) => {
                            for record in records {
                                self.process_completion(record).await;
                            }
                        }
                        Err(e) => warn!(error = %e, "completions stream read failed"),
                    }
                }
            }
        }
    }

    async fn reclaim_idle_completions(&self) {
        match self
            .store
            .stream_reclaim(
                &self.streams.completions,
                &self.streams.group_orchestrator,
                &self.consumer_name,
                self.config.completion_reclaim_idle,
                self.config.batch_size,
            )
            .await
        {
            Ok(records) => {
                for record in records {
                    self.process_completion(record).await;
                }
            }
            Err(e) => warn!(error = %e, "completion reclaim failed"),
        }
    }

    #[instrument(skip(self, record), fields(message_id = record.id))]
    async fn process_completion(&self, record: StreamRecord) {
        let msg: CompletionMessage = match serde_json::from_value(record.fields.clone()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "malformed completion message, leaving unacknowledged");
                return;
            }
        };

        if msg.schema_version > CURRENT_SCHEMA_VERSION {
            warn!(version = msg.schema_version, "unsupported schema version, leaving unacknowledged");
            return;
        }

        match self.evaluate_completion(msg).await {
            Ok(()) => {
                if let Err(e) = self
                    .store
                    .stream_ack(&self.streams.completions, &self.streams.group_orchestrator, &[record.id])
                    .await
                {
                    warn!(error = %e, "failed to ack completion");
                }
            }
            Err(e) => {
                warn!(error = %e, "evaluation failed, leaving message for the reaper to reassign");
            }
        }
    }

    /// The six-step evaluation transaction for a completion of node `X`.
    async fn evaluate_completion(&self, msg: CompletionMessage) -> Result<(), EngineError> {
        let execution_id = msg.execution_id;
        let node_id = msg.node_id.clone();

        let new_status = match msg.status {
            CompletionStatus::Completed => NodeStatus::Completed,
            CompletionStatus::Failed => NodeStatus::Failed,
        };
        let finished_at = chrono::Utc::now();

        // Step 1: apply the completion, CAS-guarded. The worker may have
        // skipped PENDING (crash-recovery redelivery), so accept either
        // predecessor state.
        let mut applied = self
            .store
            .status_cas(
                execution_id,
                &node_id,
                NodeStatus::Running,
                new_status,
                StatusExtra { finished_at: Some(finished_at), ..Default::default() },
            )
            .await?;
        if !applied {
            applied = self
                .store
                .status_cas(
                    execution_id,
                    &node_id,
                    NodeStatus::Pending,
                    new_status,
                    StatusExtra { finished_at: Some(finished_at), ..Default::default() },
                )
                .await?;
        }
        if !applied {
            debug!(%execution_id, node_id = %node_id, "duplicate completion, already terminal");
            return Ok(());
        }
        self.store
            .output_put(execution_id, &node_id, msg.output.clone(), msg.error.clone())
            .await?;

        // Step 2: cancellation gate.
        if let Some(meta) = self.store.execution_meta_get(execution_id).await? {
            if meta.status == ExecutionStatus::Cancelled {
                return Ok(());
            }
        }

        let cached = self.workflow_for(execution_id).await?;

        // Step 3: fail-fast propagation.
        if matches!(msg.status, CompletionStatus::Failed) {
            self.skip_descendants(execution_id, &node_id, &cached).await?;
        }

        // Steps 4-5: evaluate direct children for dispatch.
        for child in cached.graph.children(&node_id).to_vec() {
            self.dispatch_candidate(execution_id, &child, &cached).await?;
        }

        // Step 6: terminal execution transition.
        self.maybe_finalize(execution_id, &cached).await?;

        Ok(())
    }

    /// Transitively mark every strict descendant of `node_id` currently
    /// `WAITING` as `SKIPPED`.
    async fn skip_descendants(
        &self,
        execution_id: Uuid,
        node_id: &str,
        cached: &CachedWorkflow,
    ) -> Result<(), EngineError> {
        let mut queue: VecDeque<String> = cached.graph.children(node_id).to_vec().into();
        while let Some(descendant) = queue.pop_front() {
            let skipped = self
                .store
                .status_cas(
                    execution_id,
                    &descendant,
                    NodeStatus::Waiting,
                    NodeStatus::Skipped,
                    StatusExtra { finished_at: Some(chrono::Utc::now()), ..Default::default() },
                )
                .await?;
            if skipped {
                for child in cached.graph.children(&descendant) {
                    queue.push_back(child.clone());
                }
            }
        }
        Ok(())
    }

    /// Attempt to dispatch `child` if every parent is settled, serialised
    /// by a per-(execution, node) distributed lock.
    async fn dispatch_candidate(
        &self,
        execution_id: Uuid,
        child_id: &str,
        cached: &CachedWorkflow,
    ) -> Result<(), EngineError> {
        let parents = cached.graph.parents(child_id);
        if !parents.is_empty() {
            let parent_statuses = self.store.status_mget(execution_id, parents).await?;
            let ready = parents.iter().all(|p| {
                parent_statuses
                    .get(p)
                    .map(|rec| matches!(rec.status, NodeStatus::Completed | NodeStatus::Skipped))
                    .unwrap_or(false)
            });
            if !ready {
                return Ok(());
            }
        }

        let lock_key = format!("lock:eval:{execution_id}:{child_id}");
        let token = Uuid::new_v4().to_string();
        if !self.store.lock_acquire(&lock_key, &token, self.config.lock_ttl).await? {
            return Ok(());
        }

        let result = self.try_dispatch(execution_id, child_id, cached).await;
        self.store.lock_release(&lock_key, &token).await.ok();
        result
    }

    async fn try_dispatch(
        &self,
        execution_id: Uuid,
        child_id: &str,
        cached: &CachedWorkflow,
    ) -> Result<(), EngineError> {
        let current = self.store.status_get(execution_id, child_id).await?;
        if !matches!(current.map(|r| r.status), Some(NodeStatus::Waiting)) {
            return Ok(());
        }

        let node_def = cached
            .def
            .nodes
            .iter()
            .find(|n| n.id == child_id)
            .expect("graph and definition share the same node ids");

        let outputs = self.store.output_mget(execution_id, cached.graph.parents(child_id)).await?;

        match template::resolve(&node_def.config, &outputs) {
            Ok(resolved_config) => {
                let cas_ok = self
                    .store
                    .status_cas(
                        execution_id,
                        child_id,
                        NodeStatus::Waiting,
                        NodeStatus::Pending,
                        StatusExtra::default(),
                    )
                    .await?;
                if !cas_ok {
                    return Ok(());
                }
                let task = TaskMessage {
                    execution_id,
                    node_id: child_id.to_string(),
                    handler: node_def.handler.clone(),
                    resolved_config,
                    retry_count: 0,
                    schema_version: CURRENT_SCHEMA_VERSION,
                };
                self.store
                    .stream_publish(&self.streams.tasks, serde_json::to_value(&task).expect("TaskMessage always serialises"))
                    .await?;
                info!(%execution_id, node_id = %child_id, "dispatched");
            }
            Err(e) => {
                self.fail_unresolved(execution_id, child_id, node_def, &e).await?;
            }
        }
        Ok(())
    }

    async fn fail_unresolved(
        &self,
        execution_id: Uuid,
        node_id: &str,
        node_def: &NodeDefinition,
        error: &template::TemplateError,
    ) -> Result<(), EngineError> {
        let detail = ErrorDetail::new(ErrorCategory::Validation, error.to_string());
        let cas_ok = self
            .store
            .status_cas(
                execution_id,
                node_id,
                NodeStatus::Waiting,
                NodeStatus::Failed,
                StatusExtra { finished_at: Some(chrono::Utc::now()), ..Default::default() },
            )
            .await?;
        if !cas_ok {
            return Ok(());
        }
        self.store.output_put(execution_id, node_id, None, Some(detail.clone())).await?;
        warn!(%execution_id, node_id = %node_id, error = %error, "template resolution failed, routing to dead-letter");
        db::repository::dead_letters::insert(
            &self.db,
            execution_id,
            node_id,
            &node_def.handler,
            node_def.config.clone(),
            None,
            serde_json::to_value(&detail).expect("ErrorDetail always serialises"),
            0,
        )
        .await?;
        Ok(())
    }

    async fn maybe_finalize(&self, execution_id: Uuid, cached: &CachedWorkflow) -> Result<(), EngineError> {
        let all_ids: Vec<String> = cached.def.nodes.iter().map(|n| n.id.clone()).collect();
        let statuses = self.store.status_mget(execution_id, &all_ids).await?;

        let in_flight = all_ids.iter().any(|id| {
            statuses
                .get(id)
                .map(|r| matches!(r.status, NodeStatus::Waiting | NodeStatus::Pending | NodeStatus::Running))
                .unwrap_or(true)
        });
        if in_flight {
            return Ok(());
        }

        let any_failed = all_ids
            .iter()
            .any(|id| statuses.get(id).map(|r| r.status == NodeStatus::Failed).unwrap_or(false));
        let final_status = if any_failed { ExecutionStatus::Failed } else { ExecutionStatus::Completed };

        self.store.execution_meta_set_status(execution_id, final_status).await?;

        let node_outputs = self.store.output_mget(execution_id, &all_ids).await?;

        db::repository::executions::record_terminal(
            &self.db,
            execution_id,
            cached.def.workflow_id,
            final_status.as_str(),
            serde_json::to_value(&node_outputs).expect("outputs always serialise"),
        )
        .await?;

        info!(%execution_id, status = %final_status, "execution finalized");
        Ok(())
    }

    async fn workflow_for(&self, execution_id: Uuid) -> Result<Arc<CachedWorkflow>, EngineError> {
        if let Some(cached) = self.cache.get(&execution_id) {
            return Ok(cached.clone());
        }

        let meta = self
            .store
            .execution_meta_get(execution_id)
            .await?
            .expect("execution_meta is seeded at submission time");
        let row = db::repository::workflows::load_dag(&self.db, meta.workflow_id).await?;
        let def: WorkflowDefinition =
            serde_json::from_value(row.definition).expect("persisted definitions are always valid");
        let graph = Graph::validate(&def)?;

        let cached = Arc::new(CachedWorkflow { def, graph });
        self.cache.insert(execution_id, cached.clone());
        Ok(cached)
    }
}
