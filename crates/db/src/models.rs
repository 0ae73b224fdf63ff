//! Row structs that map 1-to-1 onto Definition Repository tables.
//!
//! These are *persistence* models — they carry no domain behaviour.
//! Domain types live in the `engine` crate; hot, ephemeral state lives in
//! `queue::model`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted DAG definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    /// Full JSON DAG definition (nodes + their dependency sets).
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// A persisted, terminal execution record. Written exactly once, by
/// `record_terminal`, when an execution reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-node outputs, keyed by node id, as of the terminal transition.
    pub node_outputs: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// dead_letters
// ---------------------------------------------------------------------------

/// An append-only dead-letter entry: a task the worker gave up on, or the
/// reaper diverted after too many reclaims.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeadLetterRow {
    pub entry_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub handler: String,
    pub original_config: serde_json::Value,
    pub resolved_config: Option<serde_json::Value>,
    pub error_detail: serde_json::Value,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}
