//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a DAG looks like in
//! memory. They serialise to/from the JSONB `definition` column of the
//! `workflows` table (see `db::models::WorkflowRow`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single step in the DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique identifier within this DAG (referenced by `dependencies`).
    pub id: String,
    /// Maps to a registered `Handler` implementation.
    pub handler: String,
    /// Arbitrary configuration, possibly containing `{{node.path}}` templates.
    pub config: serde_json::Value,
    /// Node ids this node depends on. Must be a strict subset of the
    /// DAG's own ids.
    pub dependencies: Vec<String>,
}

/// A complete DAG definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: Uuid,
    pub name: String,
    pub nodes: Vec<NodeDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, nodes: Vec<NodeDefinition>) -> Self {
        Self {
            workflow_id: Uuid::new_v4(),
            name: name.into(),
            nodes,
        }
    }
}
