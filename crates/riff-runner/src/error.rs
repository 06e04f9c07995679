//! Runner error types

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Errors at the native engine boundary
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The request could not be served; the model is still usable
    #[error("{0}")]
    Request(String),

    /// The engine can no longer serve anything
    #[error("{0}")]
    Fatal(String),
}

/// Runner-level errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunnerError {
    /// Invalid startup parameters; no load was attempted
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The model, a LoRA adapter or the KV cache could not be set up
    #[error("failed to load model: {0}")]
    Load(String),

    /// One request failed inside the engine
    #[error("request failed: {0}")]
    Request(String),

    /// The engine failed after loading; the runner is unusable
    #[error("engine failure: {0}")]
    Fatal(String),

    /// The request body is malformed or empty
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The runner is shutting down and accepts no new work
    #[error("runner is shutting down")]
    ShuttingDown,
}

impl RunnerError {
    /// True for errors that leave the runner in its `Error` state
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerError::Load(_) | RunnerError::Fatal(_))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RunnerError::InvalidRequest(_) | RunnerError::Request(_) => StatusCode::BAD_REQUEST,
            RunnerError::Configuration(_) | RunnerError::Load(_) | RunnerError::Fatal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RunnerError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::Configuration(_) => "CONFIGURATION_ERROR",
            RunnerError::Load(_) => "LOAD_ERROR",
            RunnerError::Request(_) => "REQUEST_ERROR",
            RunnerError::Fatal(_) => "ENGINE_FAILURE",
            RunnerError::InvalidRequest(_) => "INVALID_REQUEST",
            RunnerError::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// JSON body shared by plain responses and stream error lines
    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

impl From<EngineError> for RunnerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Request(msg) => RunnerError::Request(msg),
            EngineError::Fatal(msg) => RunnerError::Fatal(msg),
        }
    }
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
