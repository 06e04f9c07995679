//! Request and response bodies of the HTTP API

use crate::engine::{CompletionStats, SamplingParams, StopReason};
use serde::{Deserialize, Serialize};

fn default_n_predict() -> i32 {
    -1
}

/// Body of `POST /completion`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionRequest {
    pub prompt: String,

    /// Stream NDJSON lines instead of one JSON body
    #[serde(default)]
    pub stream: bool,

    /// Tokens to predict; `-1` generates until end of sequence or context
    #[serde(default = "default_n_predict")]
    pub n_predict: i32,

    /// Generation ends before the first occurrence of any of these
    #[serde(default)]
    pub stop: Vec<String>,

    #[serde(default)]
    pub options: SamplingParams,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            stream: false,
            n_predict: default_n_predict(),
            stop: Vec::new(),
            options: SamplingParams::default(),
        }
    }
}

/// Final counters shared by the plain body and the last stream line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timings {
    pub prompt_tokens: usize,
    pub predicted_tokens: usize,
    pub duration_ms: u64,
}

impl Timings {
    pub fn new(stats: &CompletionStats, duration_ms: u64) -> Self {
        Self {
            prompt_tokens: stats.tokens_evaluated,
            predicted_tokens: stats.tokens_predicted,
            duration_ms,
        }
    }
}

/// Non-streaming completion body
#[derive(Debug, Clone, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub created: i64,
    pub content: String,
    pub stop_reason: StopReason,
    pub timings: Timings,
}

/// One NDJSON line of a streaming completion
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StreamLine {
    Piece {
        id: String,
        content: String,
        done: bool,
    },
    Done {
        id: String,
        created: i64,
        done: bool,
        stop_reason: StopReason,
        timings: Timings,
    },
    Error {
        id: String,
        done: bool,
        error: serde_json::Value,
    },
}

/// Body of `POST /embedding`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
}

/// Body of `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub slots_in_use: usize,
    pub slots_total: usize,
}
