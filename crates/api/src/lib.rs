//! `api` crate — HTTP REST API layer
//!
//! Thin gateway in front of the engine: request validation beyond JSON
//! shape is left to `engine::Graph::validate` and the orchestrator itself.
//!
//! Exposes:
//!   GET    /api/v1/workflows
//!   POST   /api/v1/workflows
//!   GET    /api/v1/workflows/:id
//!   POST   /api/v1/workflows/:id/trigger
//!   GET    /api/v1/executions/:id
//!   POST   /api/v1/executions/:id/cancel
//!   GET    /api/v1/dead-letters

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use db::DbPool;
use engine::Orchestrator;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub orchestrator: Arc<Orchestrator>,
}

pub async fn serve(bind: &str, pool: DbPool, orchestrator: Arc<Orchestrator>) -> Result<(), std::io::Error> {
    let state = AppState { pool, orchestrator };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_router = Router::new()
        .route("/workflows", get(handlers::workflows::list).post(handlers::workflows::create))
        .route("/workflows/:id", get(handlers::workflows::get))
        .route("/workflows/:id/trigger", post(handlers::executions::trigger))
        .route("/executions/:id", get(handlers::executions::inspect))
        .route("/executions/:id/cancel", post(handlers::executions::cancel))
        .route("/dead-letters", get(handlers::dead_letters::list));

    let app = Router::new()
        .nest("/api/v1", api_router)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await
}
