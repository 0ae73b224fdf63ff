//! The State Store facade.
//!
//! `PgStateStore` is the production implementation, built over the same
//! `SELECT ... FOR UPDATE SKIP LOCKED` pattern the teacher's `job_queue`
//! used for a single table, generalised to arbitrary named streams with
//! consumer groups. `MemoryStateStore` is a test-only fake used by
//! `engine`'s orchestrator/worker/reaper tests.

pub mod error;
pub mod memory;
pub mod model;
pub mod pg;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryStateStore;
pub use pg::PgStateStore;
pub use store::{ReaperStore, StateStore};
