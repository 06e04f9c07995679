//! Common test utilities shared across the `riff-runner` integration tests.
//!
//! Declared with `mod common;` inside each test file that needs it.

pub mod mock_engine;

use riff_runner::RunnerConfig;
use riff_runner::runner::ModelRunner;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single wait in these tests
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn config(parallelism: usize) -> RunnerConfig {
    RunnerConfig::new("/models/test.gguf").with_parallelism(parallelism)
}

/// Poll until the runner has left `LoadingModel`
pub async fn settle(runner: &Arc<ModelRunner>) {
    tokio::time::timeout(TIMEOUT, async {
        while runner.status() == riff_runner::RunnerStatus::LoadingModel {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("runner settled");
}
