use axum::{extract::State, http::StatusCode, Json};

use crate::AppState;
use db::repository::dead_letters as dl_repo;

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<db::models::DeadLetterRow>>, StatusCode> {
    match dl_repo::list(&state.pool).await {
        Ok(rows) => Ok(Json(rows)),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
