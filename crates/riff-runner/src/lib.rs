//! `riff-runner` serves one model over a process-local HTTP API.
//!
//! The runner loads a native inference engine, starts loading a model in the
//! background and answers requests as soon as the model is ready:
//!
//! | Piece | Role |
//! |-------|------|
//! | [`engine`] | Traits the native engine is driven through |
//! | [`native`] | [`engine`] over the `riff_engine` shared library |
//! | [`runner::ModelRunner`] | Load state machine, admission and slot selection |
//! | [`server::RunnerServer`] | axum front door: `/completion`, `/embedding`, `/health` |
//! | [`launch`] | Engine library lookup and environment for a device placement |
//!
//! # Quick start
//!
//! ```rust,no_run
//! use riff_runner::config::RunnerConfig;
//! use riff_runner::native::NativeEngine;
//! use riff_runner::runner::ModelRunner;
//! use riff_runner::server::{RunnerServer, ServerConfig};
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Arc::new(NativeEngine::open(Path::new("/opt/riff/cpu_avx2/libriff_engine.so"))?);
//!     let runner = ModelRunner::start_load(engine, RunnerConfig::new("/models/llama.gguf"))?;
//!     RunnerServer::new(ServerConfig::default())
//!         .start(runner, CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod launch;
pub mod middleware;
pub mod native;
pub mod protocol;
pub mod runner;
pub mod server;
pub mod slots;
pub mod state;
pub mod stop;

pub use config::{KvCacheType, RunnerConfig};
pub use error::{EngineError, RunnerError, RunnerResult};
pub use runner::{ModelRunner, RunnerStatus};
