//! Health endpoint
//!
//! GET /health - model status without waiting for loading to finish

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use std::sync::Arc;

use crate::protocol::HealthResponse;
use crate::runner::RunnerStatus;
use crate::state::AppState;

/// GET /health
///
/// 200 with `ok` or `loading model`; 500 with `error` and the reason once
/// the runner has failed.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.runner.health();
    let code = match health.status {
        RunnerStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
        RunnerStatus::LoadingModel | RunnerStatus::Ready => StatusCode::OK,
    };
    (
        code,
        Json(HealthResponse {
            status: health.status.as_str().to_string(),
            error: health.error,
            slots_in_use: health.slots_in_use,
            slots_total: health.slots_total,
        }),
    )
}

pub fn health_router() -> axum::Router<Arc<AppState>> {
    use axum::routing::get;
    axum::Router::new().route("/health", get(health))
}
