//! Shared application state for the runner's HTTP server

use crate::runner::ModelRunner;
use std::sync::Arc;

/// State shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    /// The one model this process serves
    pub runner: Arc<ModelRunner>,
}

impl AppState {
    pub fn new(runner: Arc<ModelRunner>) -> Self {
        Self { runner }
    }
}
