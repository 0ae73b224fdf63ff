//! `nodes` crate — the `Handler` trait and built-in handler implementations.
//!
//! Every handler — built-in or externally registered — must implement
//! [`Handler`]. The worker dispatches execution through this trait object,
//! looking handlers up by name in a `HandlerRegistry` (see `engine::worker`).

pub mod echo;
pub mod error;
pub mod mock;
pub mod traits;

pub use echo::EchoHandler;
pub use error::HandlerError;
pub use mock::MockHandler;
pub use traits::Handler;
