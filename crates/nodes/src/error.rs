//! Handler-level error type.

use thiserror::Error;

/// Errors returned by a handler's `call` method.
///
/// The worker pipeline uses the variant to decide what happens next:
/// - `Validation` — the resolved config was malformed; routed straight to
///   the dead-letter queue, never retried, never counted against the
///   circuit breaker (it never made the call).
/// - `Retryable` — a transient failure; the task is republished with
///   backoff up to `max_retries`.
/// - `Fatal` — a permanent business-logic failure, still subject to the
///   normal retry budget (handlers only skip retries via `Validation`).
#[derive(Debug, Error, Clone)]
pub enum HandlerError {
    /// The resolved config failed the handler's own validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Transient failure; the worker should retry with backoff.
    #[error("retryable handler error: {0}")]
    Retryable(String),

    /// Permanent failure; still subject to the normal retry budget.
    #[error("fatal handler error: {0}")]
    Fatal(String),
}
