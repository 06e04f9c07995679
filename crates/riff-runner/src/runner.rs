//! Model runner: load once, then serve completions and embeddings
//!
//! A runner moves `LoadingModel → Ready` or `LoadingModel → Error`, and from
//! `Ready` to `Error` on a fatal engine failure. It never leaves `Error`.
//! Requests wait on the readiness gate, then take one of `parallelism`
//! admission permits in arrival order, then run the native call on the
//! blocking pool.

use crate::config::RunnerConfig;
use crate::engine::{
    CompletionStats, Generation, InferenceEngine, LoadParams, LoadedModel, StopReason, TokenFlow,
};
use crate::error::{EngineError, RunnerError, RunnerResult};
use crate::gate::ReadinessGate;
use crate::protocol::CompletionRequest;
use crate::slots::{InputCache, SlotLease};
use crate::stop::StopMatcher;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pieces buffered between the engine thread and the HTTP writer
pub const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    LoadingModel,
    Ready,
    Error,
}

impl RunnerStatus {
    /// Text reported by the health endpoint
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::LoadingModel => "loading model",
            RunnerStatus::Ready => "ok",
            RunnerStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct RunnerState {
    status: RunnerStatus,
    model: Option<Arc<dyn LoadedModel>>,
    error: Option<RunnerError>,
}

/// Point-in-time health of a runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Health {
    pub status: RunnerStatus,
    pub error: Option<String>,
    pub slots_in_use: usize,
    pub slots_total: usize,
}

/// One item of a completion stream
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    Piece(String),
    Done(CompletionStats),
    Failed(RunnerError),
}

/// Collected result of a non-streaming completion
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub stats: CompletionStats,
}

pub struct ModelRunner {
    config: RunnerConfig,
    state: Mutex<RunnerState>,
    gate: ReadinessGate,
    admission: Arc<Semaphore>,
    cache: Arc<InputCache>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ModelRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRunner")
            .field("model", &self.config.model_path)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ModelRunner {
    /// Validate `config` and start loading the model in the background
    ///
    /// Must be called from within a tokio runtime. Returns as soon as the
    /// load task is spawned; use [`wait_ready`](Self::wait_ready) or
    /// [`health`](Self::health) to follow progress.
    pub fn start_load(engine: Arc<dyn InferenceEngine>, config: RunnerConfig) -> RunnerResult<Arc<Self>> {
        config.validate()?;

        let (gate, release) = ReadinessGate::armed();
        let runner = Arc::new(Self {
            admission: Arc::new(Semaphore::new(config.parallelism)),
            cache: InputCache::new(config.parallelism, config.multi_user_cache),
            state: Mutex::new(RunnerState {
                status: RunnerStatus::LoadingModel,
                model: None,
                error: None,
            }),
            gate,
            shutdown: CancellationToken::new(),
            config,
        });

        let params = LoadParams::from(&runner.config);
        let task_runner = Arc::clone(&runner);
        tokio::spawn(async move {
            let started = Instant::now();
            info!(
                model = %params.model_path.display(),
                parallel = params.parallelism,
                ctx_size = params.context_size,
                batch_size = params.batch_size,
                kv_cache_type = ?params.kv_cache_type,
                loras = params.lora_paths.len(),
                "Loading model"
            );
            let loaded = tokio::task::spawn_blocking(move || {
                info!(system_info = %engine.system_info(), "Inference engine");
                engine.load(&params)
            })
            .await;

            match loaded {
                Ok(Ok(model)) => {
                    task_runner.mark_ready(model);
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    info!(elapsed_ms = elapsed_ms, "Model loaded");
                }
                Ok(Err(e)) => task_runner.fail(RunnerError::Load(e.to_string())),
                Err(join) if join.is_panic() => {
                    task_runner.fail(RunnerError::Load("engine panicked while loading".into()))
                }
                Err(_) => task_runner.fail(RunnerError::Load("load task was cancelled".into())),
            }
            release.release();
        });

        Ok(runner)
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn status(&self) -> RunnerStatus {
        self.state.lock().status
    }

    /// Current health; never waits for loading
    pub fn health(&self) -> Health {
        let state = self.state.lock();
        Health {
            status: state.status,
            error: state.error.as_ref().map(|e| e.to_string()),
            slots_in_use: self.cache.in_use(),
            slots_total: self.config.parallelism,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Refuse new work and stop streaming generations at the next token
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Runner shutting down");
        }
        self.shutdown.cancel();
        self.admission.close();
    }

    /// Wait until loading has finished, then report its outcome
    pub async fn wait_ready(&self) -> RunnerResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(RunnerError::ShuttingDown);
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(RunnerError::ShuttingDown),
            _ = self.gate.wait() => {}
        }
        self.loaded_model().map(|_| ())
    }

    /// Generate a full completion
    pub async fn completion(self: &Arc<Self>, request: CompletionRequest) -> RunnerResult<Completion> {
        let mut events = self.completion_stream(request).await?;
        let mut content = String::new();
        while let Some(event) = events.recv().await {
            match event {
                CompletionEvent::Piece(piece) => content.push_str(&piece),
                CompletionEvent::Done(stats) => return Ok(Completion { content, stats }),
                CompletionEvent::Failed(err) => return Err(err),
            }
        }
        Err(RunnerError::Fatal("completion ended without a result".into()))
    }

    /// Start a completion and receive its pieces as they are produced
    ///
    /// Returns once the request has been admitted. The stream ends with
    /// exactly one `Done` or `Failed` event. Dropping the receiver stops
    /// generation at the next token.
    pub async fn completion_stream(
        self: &Arc<Self>,
        request: CompletionRequest,
    ) -> RunnerResult<mpsc::Receiver<CompletionEvent>> {
        if request.prompt.is_empty() {
            return Err(RunnerError::InvalidRequest("prompt must not be empty".into()));
        }
        let (permit, model) = self.admit().await?;
        let lease = self.cache.acquire(&request.prompt)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let runner = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                runner.generate(model.as_ref(), &lease, &request, &tx)
            }))
            .unwrap_or_else(|_| {
                lease.invalidate();
                Err(RunnerError::Fatal("engine panicked during completion".into()))
            });
            // Fail before the permit is returned so no queued caller slips in.
            let event = match outcome {
                Ok(stats) => CompletionEvent::Done(stats),
                Err(err) => {
                    if err.is_terminal() {
                        runner.fail(err.clone());
                    }
                    CompletionEvent::Failed(err)
                }
            };
            drop(lease);
            drop(permit);
            // The receiver may already be gone.
            let _ = tx.blocking_send(event);
        });

        Ok(rx)
    }

    /// Embedding vector for `content`
    pub async fn embedding(self: &Arc<Self>, content: String) -> RunnerResult<Vec<f32>> {
        if content.is_empty() {
            return Err(RunnerError::InvalidRequest("content must not be empty".into()));
        }
        let (permit, model) = self.admit().await?;
        // Embedding inputs are not kept for reuse.
        let lease = self.cache.acquire("")?;

        let joined = tokio::task::spawn_blocking(move || {
            let result = catch_unwind(AssertUnwindSafe(|| model.embed(lease.assignment(), &content)))
                .unwrap_or_else(|_| {
                    Err(EngineError::Fatal("engine panicked during embedding".into()))
                });
            lease.invalidate();
            (result, permit)
        })
        .await;

        let (result, permit) = match joined {
            Ok((r, permit)) => (r.map_err(RunnerError::from), Some(permit)),
            Err(_) => (Err(RunnerError::Fatal("embedding task was cancelled".into())), None),
        };
        if let Err(err) = &result {
            if err.is_terminal() {
                self.fail(err.clone());
            }
        }
        drop(permit);
        result
    }

    async fn admit(&self) -> RunnerResult<(OwnedSemaphorePermit, Arc<dyn LoadedModel>)> {
        self.wait_ready().await?;
        let acquired = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(RunnerError::ShuttingDown),
            permit = Arc::clone(&self.admission).acquire_owned() => permit,
        };
        let permit = acquired.map_err(|_| self.closed_error())?;
        // The runner may have failed while this caller was queued.
        let model = self.loaded_model()?;
        Ok((permit, model))
    }

    fn loaded_model(&self) -> RunnerResult<Arc<dyn LoadedModel>> {
        let state = self.state.lock();
        match (state.status, &state.model) {
            (RunnerStatus::Ready, Some(model)) => Ok(Arc::clone(model)),
            (RunnerStatus::Error, _) => Err(state
                .error
                .clone()
                .unwrap_or_else(|| RunnerError::Fatal("runner failed".into()))),
            _ => Err(RunnerError::Fatal("model load did not complete".into())),
        }
    }

    fn closed_error(&self) -> RunnerError {
        if self.shutdown.is_cancelled() {
            return RunnerError::ShuttingDown;
        }
        match self.loaded_model() {
            Err(err) => err,
            Ok(_) => RunnerError::Fatal("runner stopped accepting work".into()),
        }
    }

    fn mark_ready(&self, model: Arc<dyn LoadedModel>) {
        let mut state = self.state.lock();
        if state.status == RunnerStatus::LoadingModel {
            state.status = RunnerStatus::Ready;
            state.model = Some(model);
        }
    }

    /// Enter `Error` and wake every queued caller
    fn fail(&self, err: RunnerError) {
        {
            let mut state = self.state.lock();
            if state.status == RunnerStatus::Error {
                return;
            }
            error!(error = %err, from = %state.status, "Runner entered error state");
            state.status = RunnerStatus::Error;
            state.model = None;
            state.error = Some(err);
        }
        self.admission.close();
    }

    /// Runs on the blocking pool
    fn generate(
        &self,
        model: &dyn LoadedModel,
        lease: &SlotLease,
        request: &CompletionRequest,
        tx: &mpsc::Sender<CompletionEvent>,
    ) -> RunnerResult<CompletionStats> {
        let mut matcher = StopMatcher::new(&request.stop);
        let mut generated = String::new();
        let mut hit_stop = false;
        let mut cancelled = false;

        let generation = Generation {
            prompt: &request.prompt,
            n_predict: request.n_predict,
            sampling: &request.options,
        };

        let result = model.complete(lease.assignment(), &generation, &mut |piece: &str| {
            if self.shutdown.is_cancelled() {
                cancelled = true;
                return TokenFlow::Stop;
            }
            let scan = matcher.push(piece);
            if !scan.emit.is_empty() {
                generated.push_str(&scan.emit);
                if tx.blocking_send(CompletionEvent::Piece(scan.emit)).is_err() {
                    cancelled = true;
                    return TokenFlow::Stop;
                }
            }
            if scan.stopped {
                hit_stop = true;
                return TokenFlow::Stop;
            }
            TokenFlow::Continue
        });

        let mut stats = match result {
            Ok(stats) => stats,
            Err(e) => {
                lease.invalidate();
                let err = RunnerError::from(e);
                warn!(slot = lease.assignment().slot, error = %err, "Completion failed");
                return Err(err);
            }
        };

        if cancelled {
            stats.stop_reason = StopReason::Cancelled;
            debug!(slot = lease.assignment().slot, "Completion cancelled");
        } else if hit_stop {
            stats.stop_reason = StopReason::Stop;
        } else {
            let tail = matcher.finish();
            if !tail.is_empty() {
                generated.push_str(&tail);
                let _ = tx.blocking_send(CompletionEvent::Piece(tail));
            }
        }
        lease.append(&generated);

        debug!(
            slot = lease.assignment().slot,
            evaluated = stats.tokens_evaluated,
            predicted = stats.tokens_predicted,
            stop_reason = ?stats.stop_reason,
            "Completion finished"
        );
        Ok(stats)
    }
}
