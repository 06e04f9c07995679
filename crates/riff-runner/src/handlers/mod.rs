//! Request handlers for the runner API

pub mod completion;
pub mod embedding;
pub mod health;

pub use completion::completion_router;
pub use embedding::embedding_router;
pub use health::health_router;

use crate::error::RunnerError;
use axum::extract::rejection::JsonRejection;

/// Turn a body that failed to parse into a 400 with the standard error body
pub(crate) fn rejection(err: JsonRejection) -> RunnerError {
    RunnerError::InvalidRequest(err.body_text())
}
