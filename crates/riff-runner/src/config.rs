//! Runner startup parameters

use crate::error::RunnerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Quantization of the KV cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvCacheType {
    F16,
    Q8_0,
    Q4_0,
}

impl KvCacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvCacheType::F16 => "f16",
            KvCacheType::Q8_0 => "q8_0",
            KvCacheType::Q4_0 => "q4_0",
        }
    }
}

impl fmt::Display for KvCacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KvCacheType {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f16" => Ok(KvCacheType::F16),
            "q8_0" => Ok(KvCacheType::Q8_0),
            "q4_0" => Ok(KvCacheType::Q4_0),
            other => Err(RunnerError::Configuration(format!(
                "unsupported kv cache type '{other}' (expected f16, q8_0 or q4_0)"
            ))),
        }
    }
}

/// Configuration for one model runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Path to the model weights
    pub model_path: PathBuf,

    /// LoRA adapters applied in order after the model loads
    pub lora_paths: Vec<PathBuf>,

    /// Number of sequences served at the same time
    pub parallelism: usize,

    /// Tokens per decode batch
    pub batch_size: usize,

    /// Total KV cache size in tokens, shared by all sequences
    pub context_size: usize,

    /// KV cache quantization; `None` keeps the engine default
    pub kv_cache_type: Option<KvCacheType>,

    /// Pick input-cache slots for many independent users
    pub multi_user_cache: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            lora_paths: Vec::new(),
            parallelism: 1,
            batch_size: 512,
            context_size: 2048,
            kv_cache_type: None,
            multi_user_cache: false,
        }
    }
}

impl RunnerConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Default::default()
        }
    }

    pub fn with_lora(mut self, path: impl Into<PathBuf>) -> Self {
        self.lora_paths.push(path.into());
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_context_size(mut self, context_size: usize) -> Self {
        self.context_size = context_size;
        self
    }

    pub fn with_kv_cache_type(mut self, kv_cache_type: KvCacheType) -> Self {
        self.kv_cache_type = Some(kv_cache_type);
        self
    }

    pub fn with_multi_user_cache(mut self, enabled: bool) -> Self {
        self.multi_user_cache = enabled;
        self
    }

    /// Context tokens available to each sequence
    pub fn context_per_slot(&self) -> usize {
        self.context_size / self.parallelism.max(1)
    }

    /// Reject parameters no engine could load with
    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.model_path.as_os_str().is_empty() {
            return Err(RunnerError::Configuration("model path must not be empty".into()));
        }
        if self.parallelism == 0 {
            return Err(RunnerError::Configuration("parallel must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(RunnerError::Configuration("batch-size must be > 0".into()));
        }
        if self.context_size == 0 {
            return Err(RunnerError::Configuration("ctx-size must be > 0".into()));
        }
        if self.context_size < self.parallelism {
            return Err(RunnerError::Configuration(format!(
                "ctx-size {} is too small for {} parallel sequences",
                self.context_size, self.parallelism
            )));
        }
        if let Some(empty) = self.lora_paths.iter().position(|p| p.as_os_str().is_empty()) {
            return Err(RunnerError::Configuration(format!("lora path #{} is empty", empty + 1)));
        }
        Ok(())
    }
}
