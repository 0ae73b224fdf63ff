//! Shared data contracts over the persistent queue and state store.
//!
//! These types cross process boundaries: they are serialised onto stream
//! messages or persisted as hot-store rows. Both the orchestrator and the
//! worker (in `engine`) build and consume them; none of them carry
//! behaviour of their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-node execution status, stored in the hot store keyed by
/// `(execution_id, node_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Waiting,
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Waiting => "WAITING",
            NodeStatus::Pending => "PENDING",
            NodeStatus::Running => "RUNNING",
            NodeStatus::Completed => "COMPLETED",
            NodeStatus::Failed => "FAILED",
            NodeStatus::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(Self::Waiting),
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Overall execution status, tracked live in the hot store (`meta:execution:*`)
/// and written to the Definition Repository only once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The error taxonomy. Carried on every failure record, from a handler
/// failure through to a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Timeout,
    Connection,
    Handler,
    CircuitOpen,
    Unknown,
}

impl ErrorCategory {
    /// Validation errors are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Validation)
    }
}

/// A structured error record, carried on `CompletionMessage` and
/// dead-letter entries. Plain JSON across the wire — never a
/// language-native exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub category: ErrorCategory,
    pub message: String,
    /// Truncated stack trace / context, if any.
    pub traceback: Option<String>,
    pub retryable: bool,
}

impl ErrorDetail {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let retryable = category.is_retryable();
        Self {
            category,
            message: message.into(),
            traceback: None,
            retryable,
        }
    }
}

/// Message published on `workflow:tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub execution_id: Uuid,
    pub node_id: String,
    pub handler: String,
    pub resolved_config: serde_json::Value,
    pub retry_count: u32,
    pub schema_version: u32,
}

/// Message published on `workflow:completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: CompletionStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<ErrorDetail>,
    pub schema_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

/// Current schema version for `TaskMessage`/`CompletionMessage`. Consumers
/// that see a message with a higher version must leave it unacknowledged.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// A row from `node_status`, plus the fields a CAS can atomically update.
#[derive(Debug, Clone)]
pub struct NodeStatusRecord {
    pub status: NodeStatus,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Extra fields a `status_cas` may atomically update alongside the status
/// transition itself.
#[derive(Debug, Clone, Default)]
pub struct StatusExtra {
    pub retry_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Live, mutable execution-level metadata held in the hot store
/// (`meta:execution:{execution_id}`), distinct from the Definition
/// Repository's terminal record.
#[derive(Debug, Clone)]
pub struct ExecutionMeta {
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
}

/// A message delivered from a stream, with enough identity to ack/reclaim it.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub id: i64,
    pub fields: serde_json::Value,
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}
