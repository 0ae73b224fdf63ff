//! `engine` crate — DAG validation, template resolution, and the
//! orchestrator/worker/reaper services that together execute a workflow.

pub mod config;
pub mod error;
pub mod graph;
pub mod model;
pub mod orchestrator;
pub mod reaper;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use error::EngineError;
pub use graph::{Graph, GraphError};
pub use model::{NodeDefinition, WorkflowDefinition};
pub use orchestrator::Orchestrator;
pub use reaper::Reaper;
pub use worker::Worker;
