//! The `Handler` trait — the contract every handler must fulfil.

use async_trait::async_trait;
use serde_json::Value;

use crate::HandlerError;

/// The core handler trait. Handlers are opaque: they take a resolved
/// configuration and produce a JSON-serialisable output, or fail. The
/// orchestrator has already substituted upstream outputs into `config`
/// via template resolution, so handlers never reach into execution state
/// themselves.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the handler against its resolved configuration.
    async fn call(&self, config: Value) -> Result<Value, HandlerError>;
}
