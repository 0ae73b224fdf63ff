//! `EchoHandler` — returns its resolved config verbatim.
//!
//! Used by the linear-chain and fan-in/fan-out example workflows: each node
//! echoes `{"v": i}` (or a template-substituted object referencing upstream
//! outputs) so tests can assert on dataflow through the graph without a real
//! handler implementation.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Handler, HandlerError};

pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn call(&self, config: Value) -> Result<Value, HandlerError> {
        Ok(config)
    }
}
