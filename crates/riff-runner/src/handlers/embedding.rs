//! POST /embedding

use axum::{Json, extract::State, extract::rejection::JsonRejection};
use std::sync::Arc;
use std::time::Instant;

use super::rejection;
use crate::error::RunnerError;
use crate::protocol::{EmbeddingRequest, EmbeddingResponse};
use crate::state::AppState;

pub async fn embedding(
    State(state): State<Arc<AppState>>,
    body: Result<Json<EmbeddingRequest>, JsonRejection>,
) -> Result<Json<EmbeddingResponse>, RunnerError> {
    let Json(req) = body.map_err(rejection)?;
    let start = Instant::now();
    let embedding = state.runner.embedding(req.content).await?;
    let duration_ms = start.elapsed().as_millis() as u64;
    tracing::debug!(
        dimensions = embedding.len(),
        duration_ms = duration_ms,
        "embedding computed"
    );
    Ok(Json(EmbeddingResponse { embedding }))
}

pub fn embedding_router() -> axum::Router<Arc<AppState>> {
    use axum::routing::post;
    axum::Router::new().route("/embedding", post(embedding))
}
