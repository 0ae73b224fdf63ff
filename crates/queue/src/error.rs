//! Typed error type for the queue (state store) crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("lock '{0}' is held by another owner")]
    LockContended(String),

    #[error("unsupported schema_version {0}, leaving message unacknowledged")]
    UnsupportedSchemaVersion(u32),
}
