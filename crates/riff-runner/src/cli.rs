//! Command-line flags of the runner binary

use crate::config::{KvCacheType, RunnerConfig};
use crate::server::ServerConfig;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

/// Riff model runner - serves one model over local HTTP
#[derive(Parser, Debug)]
#[command(name = "riff-runner")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the model weights
    #[arg(short, long, env = "RIFF_MODEL")]
    pub model: PathBuf,

    /// LoRA adapter to apply after loading (repeatable)
    #[arg(long = "lora", env = "RIFF_LORA", value_delimiter = ',')]
    pub lora: Vec<PathBuf>,

    /// Number of sequences served at once
    #[arg(long = "parallel", env = "RIFF_PARALLEL", default_value_t = 1)]
    pub parallel: usize,

    /// Tokens per decode batch
    #[arg(long, env = "RIFF_BATCH_SIZE", default_value_t = 512)]
    pub batch_size: usize,

    /// Total context size in tokens, shared by all parallel sequences
    #[arg(long, env = "RIFF_CTX_SIZE", default_value_t = 2048)]
    pub ctx_size: usize,

    /// KV cache quantization (f16, q8_0, q4_0)
    #[arg(long, env = "RIFF_KV_CACHE_TYPE")]
    pub kv_cache_type: Option<KvCacheType>,

    /// Keep each user's prompt cache separate when serving many users
    #[arg(long = "multiuser-cache", env = "RIFF_MULTIUSER_CACHE")]
    pub multiuser_cache: bool,

    /// Address to bind
    #[arg(long, env = "RIFF_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "RIFF_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Path to the native engine library; found from the device placement when omitted
    #[arg(long, env = "RIFF_ENGINE_LIBRARY")]
    pub engine_library: Option<PathBuf>,

    /// Discovery settings file
    #[arg(short = 'c', long = "config", env = "RIFF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "RIFF_LOG_JSON")]
    pub log_json: bool,
}

impl Cli {
    pub fn runner_config(&self) -> RunnerConfig {
        let mut cfg = RunnerConfig::new(&self.model)
            .with_parallelism(self.parallel)
            .with_batch_size(self.batch_size)
            .with_context_size(self.ctx_size)
            .with_multi_user_cache(self.multiuser_cache);
        for lora in &self.lora {
            cfg = cfg.with_lora(lora);
        }
        if let Some(kv) = self.kv_cache_type {
            cfg = cfg.with_kv_cache_type(kv);
        }
        cfg
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
        }
    }
}
