//! Structured access log
//!
//! Records method, path, response status and latency for every request.
//! Streaming responses are logged when their headers are sent.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, warn};

pub async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_millis() as u64;
    if response.status().is_server_error() {
        warn!(
            method = %method,
            path = %path,
            status = status,
            latency_ms = latency_ms,
            "request failed"
        );
    } else {
        debug!(
            method = %method,
            path = %path,
            status = status,
            latency_ms = latency_ms,
            "request served"
        );
    }
    response
}
