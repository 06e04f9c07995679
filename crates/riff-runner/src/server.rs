//! Axum-based HTTP server for one model runner.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/completion` | Generate text, optionally streamed as NDJSON. |
//! | `POST` | `/embedding` | Embedding vector for `content`. |
//! | `GET`  | `/health` | Runner status; never waits for the model to load. |

use crate::handlers::{completion_router, embedding_router, health_router};
use crate::middleware::access_log;
use crate::runner::ModelRunner;
use crate::state::AppState;
use axum::Router;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runtime configuration for [`RunnerServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind; loopback unless the operator says otherwise
    pub host: IpAddr,
    /// TCP port to listen on (default: 8080)
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

pub struct RunnerServer {
    config: ServerConfig,
}

impl RunnerServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Build the axum [`Router`] serving `runner`
    pub fn build_app(runner: Arc<ModelRunner>) -> Router {
        let state = Arc::new(AppState::new(runner));
        Router::new()
            .merge(completion_router())
            .merge(embedding_router())
            .merge(health_router())
            .layer(axum::middleware::from_fn(access_log))
            .with_state(state)
    }

    /// Bind and serve until `shutdown` is cancelled
    ///
    /// Cancelling stops accepting connections, tells the runner to refuse new
    /// work and ends in-flight streams at their next token.
    pub async fn start(self, runner: Arc<ModelRunner>, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.addr()).await?;
        info!(addr = %listener.local_addr()?, "Runner listening");
        Self::serve(listener, runner, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        listener: TcpListener,
        runner: Arc<ModelRunner>,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let app = Self::build_app(Arc::clone(&runner));
        let signal = async move {
            shutdown.cancelled().await;
            runner.shutdown();
        };
        axum::serve(listener, app).with_graceful_shutdown(signal).await
    }
}
