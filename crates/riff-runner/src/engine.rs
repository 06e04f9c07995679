//! Native inference engine boundary
//!
//! The runner only needs three things from an engine: load a model, run a
//! completion on one sequence slot, and compute an embedding. Everything
//! behind these traits (tensor math, tokenization, sampling) is opaque.
//! [`NativeEngine`](crate::native::NativeEngine) implements them over the
//! `riff_engine_*` C ABI; tests use in-memory fakes.

use crate::config::{KvCacheType, RunnerConfig};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Parameters handed to [`InferenceEngine::load`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadParams {
    pub model_path: PathBuf,
    pub lora_paths: Vec<PathBuf>,
    pub parallelism: usize,
    pub batch_size: usize,
    pub context_size: usize,
    pub kv_cache_type: Option<KvCacheType>,
}

impl From<&RunnerConfig> for LoadParams {
    fn from(cfg: &RunnerConfig) -> Self {
        Self {
            model_path: cfg.model_path.clone(),
            lora_paths: cfg.lora_paths.clone(),
            parallelism: cfg.parallelism,
            batch_size: cfg.batch_size,
            context_size: cfg.context_size,
            kv_cache_type: cfg.kv_cache_type,
        }
    }
}

/// Sampling settings for one completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub repeat_penalty: f32,
    pub repeat_last_n: i32,
    pub seed: Option<u32>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.9,
            min_p: 0.0,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: None,
        }
    }
}

/// What the engine generates for one completion
#[derive(Debug, Clone, PartialEq)]
pub struct Generation<'a> {
    pub prompt: &'a str,
    /// Tokens to predict; negative means until the context is full
    pub n_predict: i32,
    pub sampling: &'a SamplingParams,
}

/// Sequence slot chosen by the input cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotAssignment {
    pub slot: usize,
    /// Prompt bytes already present in this slot's KV cache
    pub reuse_prefix: usize,
    /// Slot whose cache holds a longer shared prefix, to copy from first
    pub copy_from: Option<SlotCopy>,
}

/// Cache region to copy into the assigned slot before evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotCopy {
    pub slot: usize,
    pub prefix: usize,
}

/// Returned by a token sink to continue or end generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFlow {
    Continue,
    Stop,
}

/// Why a completion ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced end-of-sequence
    Eos,
    /// `n_predict` or the slot's context was exhausted
    Limit,
    /// A requested stop sequence was produced
    Stop,
    /// The caller went away or the runner is shutting down
    Cancelled,
}

/// Counters reported by the engine at the end of a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionStats {
    pub tokens_evaluated: usize,
    pub tokens_predicted: usize,
    pub stop_reason: StopReason,
}

/// A loaded model. Calls for distinct slots may run concurrently.
pub trait LoadedModel: Send + Sync {
    /// Generate text, handing every decoded piece to `sink`
    fn complete(
        &self,
        slot: &SlotAssignment,
        generation: &Generation<'_>,
        sink: &mut dyn FnMut(&str) -> TokenFlow,
    ) -> Result<CompletionStats, EngineError>;

    /// Embedding vector for `content`
    fn embed(&self, slot: &SlotAssignment, content: &str) -> Result<Vec<f32>, EngineError>;
}

/// Factory for loaded models
pub trait InferenceEngine: Send + Sync {
    /// Build/feature string of the engine, logged at start-up
    fn system_info(&self) -> String;

    /// Load a model; blocks for as long as loading takes
    fn load(&self, params: &LoadParams) -> Result<Arc<dyn LoadedModel>, EngineError>;
}
