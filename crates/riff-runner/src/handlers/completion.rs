//! POST /completion
//!
//! Plain requests get one JSON body. With `"stream": true` the response is
//! NDJSON: one line per generated piece, then a final line with `done: true`
//! carrying either the stop reason and timings or an error.

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{State, rejection::JsonRejection},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::rejection;
use crate::error::RunnerError;
use crate::protocol::{CompletionRequest, CompletionResponse, StreamLine, Timings};
use crate::runner::CompletionEvent;
use crate::state::AppState;

pub const NDJSON: &str = "application/x-ndjson";

pub async fn completion(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Response, RunnerError> {
    let Json(req) = body.map_err(rejection)?;
    let id = Uuid::new_v4().to_string();
    let created = Utc::now().timestamp();
    let start = Instant::now();

    tracing::debug!(
        request_id = %id,
        prompt_bytes = req.prompt.len(),
        n_predict = req.n_predict,
        stream = req.stream,
        "completion request"
    );

    if req.stream {
        let events = state.runner.completion_stream(req).await?;
        let lines = ReceiverStream::new(events).map(move |event| {
            let line = stream_line(&id, created, start, event);
            let mut bytes = serde_json::to_vec(&line)?;
            bytes.push(b'\n');
            Ok::<_, serde_json::Error>(Bytes::from(bytes))
        });
        return Ok(([(CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response());
    }

    let completion = state.runner.completion(req).await?;
    let duration_ms = start.elapsed().as_millis() as u64;
    tracing::info!(
        request_id = %id,
        predicted = completion.stats.tokens_predicted,
        stop_reason = ?completion.stats.stop_reason,
        duration_ms = duration_ms,
        "completion finished"
    );
    Ok(Json(CompletionResponse {
        id,
        created,
        content: completion.content,
        stop_reason: completion.stats.stop_reason,
        timings: Timings::new(&completion.stats, duration_ms),
    })
    .into_response())
}

fn stream_line(id: &str, created: i64, start: Instant, event: CompletionEvent) -> StreamLine {
    match event {
        CompletionEvent::Piece(content) => StreamLine::Piece {
            id: id.to_string(),
            content,
            done: false,
        },
        CompletionEvent::Done(stats) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::info!(
                request_id = %id,
                predicted = stats.tokens_predicted,
                stop_reason = ?stats.stop_reason,
                duration_ms = duration_ms,
                "streamed completion finished"
            );
            StreamLine::Done {
                id: id.to_string(),
                created,
                done: true,
                stop_reason: stats.stop_reason,
                timings: Timings::new(&stats, duration_ms),
            }
        }
        CompletionEvent::Failed(err) => {
            tracing::warn!(request_id = %id, error = %err, "streamed completion failed");
            StreamLine::Error {
                id: id.to_string(),
                done: true,
                error: err.body()["error"].clone(),
            }
        }
    }
}

pub fn completion_router() -> axum::Router<Arc<AppState>> {
    use axum::routing::post;
    axum::Router::new().route("/completion", post(completion))
}
