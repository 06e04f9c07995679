//! In-memory [`InferenceEngine`] with scripted behavior.
//!
//! The model's reaction is chosen by the prompt prefix:
//!
//! | Prefix | Result |
//! |--------|--------|
//! | `fatal:` | fatal engine error |
//! | `reject:` | per-request error |
//! | `panic:` | the engine call panics |
//! | anything else | emits [`MockModel::pieces`] one at a time |
//!
//! Loading can be held open with a [`LoadLatch`] so tests can observe the
//! `LoadingModel` state.

use parking_lot::{Condvar, Mutex};
use riff_runner::EngineError;
use riff_runner::engine::{
    CompletionStats, Generation, InferenceEngine, LoadParams, LoadedModel, SlotAssignment,
    StopReason, TokenFlow,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Blocks the engine's load call until opened
#[derive(Default)]
pub struct LoadLatch {
    open: Mutex<bool>,
    cv: Condvar,
}

impl LoadLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }
}

#[derive(Clone)]
pub enum LoadBehavior {
    Succeed,
    Fail(String),
    Panic,
}

pub struct MockEngine {
    model: Arc<MockModel>,
    behavior: LoadBehavior,
    latch: Option<Arc<LoadLatch>>,
    pub loads: AtomicUsize,
    pub last_params: Mutex<Option<LoadParams>>,
}

impl MockEngine {
    pub fn new(model: Arc<MockModel>) -> Self {
        Self {
            model,
            behavior: LoadBehavior::Succeed,
            latch: None,
            loads: AtomicUsize::new(0),
            last_params: Mutex::new(None),
        }
    }

    pub fn behavior(mut self, behavior: LoadBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn latch(mut self, latch: Arc<LoadLatch>) -> Self {
        self.latch = Some(latch);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for MockEngine {
    fn system_info(&self) -> String {
        "MOCK = 1 | AVX2 = 0".to_string()
    }

    fn load(&self, params: &LoadParams) -> Result<Arc<dyn LoadedModel>, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock() = Some(params.clone());
        if let Some(latch) = &self.latch {
            latch.wait();
        }
        match &self.behavior {
            LoadBehavior::Succeed => Ok(Arc::clone(&self.model) as Arc<dyn LoadedModel>),
            LoadBehavior::Fail(msg) => Err(EngineError::Fatal(msg.clone())),
            LoadBehavior::Panic => panic!("mock engine exploded while loading"),
        }
    }
}

pub struct MockModel {
    pub pieces: Vec<String>,
    pub piece_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    stopped_early: AtomicUsize,
    started: Mutex<Vec<String>>,
    assignments: Mutex<Vec<SlotAssignment>>,
}

impl MockModel {
    pub fn new(pieces: &[&str]) -> Self {
        Self {
            pieces: pieces.iter().map(|p| p.to_string()).collect(),
            piece_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            stopped_early: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            assignments: Mutex::new(Vec::new()),
        }
    }

    pub fn hello() -> Self {
        Self::new(&["Hello", ",", " world", "!"])
    }

    pub fn piece_delay(mut self, delay: Duration) -> Self {
        self.piece_delay = delay;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Most calls observed running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Completions the sink ended before the model was done
    pub fn stopped_early(&self) -> usize {
        self.stopped_early.load(Ordering::SeqCst)
    }

    /// Prompts in the order the engine started them
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn assignments(&self) -> Vec<SlotAssignment> {
        self.assignments.lock().clone()
    }

    fn enter(&self, prompt: &str, slot: &SlotAssignment) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.lock().push(prompt.to_string());
        self.assignments.lock().push(*slot);
        InFlight(&self.in_flight)
    }

    fn scripted_failure(&self, text: &str) -> Option<EngineError> {
        if let Some(msg) = text.strip_prefix("fatal:") {
            std::thread::sleep(self.piece_delay.max(Duration::from_millis(20)));
            return Some(EngineError::Fatal(msg.trim().to_string()));
        }
        if let Some(msg) = text.strip_prefix("reject:") {
            return Some(EngineError::Request(msg.trim().to_string()));
        }
        if text.starts_with("panic:") {
            panic!("mock model exploded");
        }
        None
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LoadedModel for MockModel {
    fn complete(
        &self,
        slot: &SlotAssignment,
        generation: &Generation<'_>,
        sink: &mut dyn FnMut(&str) -> TokenFlow,
    ) -> Result<CompletionStats, EngineError> {
        let _guard = self.enter(generation.prompt, slot);
        if let Some(err) = self.scripted_failure(generation.prompt) {
            return Err(err);
        }

        let limit = usize::try_from(generation.n_predict).unwrap_or(usize::MAX);
        let mut predicted = 0;
        for piece in self.pieces.iter().take(limit) {
            if !self.piece_delay.is_zero() {
                std::thread::sleep(self.piece_delay);
            }
            predicted += 1;
            if sink(piece) == TokenFlow::Stop {
                self.stopped_early.fetch_add(1, Ordering::SeqCst);
                return Ok(CompletionStats {
                    tokens_evaluated: generation.prompt.len().saturating_sub(slot.reuse_prefix),
                    tokens_predicted: predicted,
                    stop_reason: StopReason::Stop,
                });
            }
        }
        if self.piece_delay.is_zero() {
            // Long enough for concurrent callers to overlap.
            std::thread::sleep(Duration::from_millis(5));
        }

        Ok(CompletionStats {
            tokens_evaluated: generation.prompt.len().saturating_sub(slot.reuse_prefix),
            tokens_predicted: predicted,
            stop_reason: if predicted < self.pieces.len() {
                StopReason::Limit
            } else {
                StopReason::Eos
            },
        })
    }

    fn embed(&self, slot: &SlotAssignment, content: &str) -> Result<Vec<f32>, EngineError> {
        let _guard = self.enter(content, slot);
        if let Some(err) = self.scripted_failure(content) {
            return Err(err);
        }
        Ok(vec![content.len() as f32, 1.0, 0.0, -1.0])
    }
}
