//! Riff model runner entry point.
//!
//! Discovers devices, picks the engine build for the best placement, exports
//! the device filter and library path, then serves the model until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use riff_discover::{DiscoveryCache, DiscoveryConfig, Placement};
use riff_runner::cli::Cli;
use riff_runner::launch::{find_engine_library, placement_environment};
use riff_runner::native::NativeEngine;
use riff_runner::runner::ModelRunner;
use riff_runner::server::RunnerServer;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let discovery = DiscoveryConfig::load(cli.config.as_deref()).context("loading discovery settings")?;
    let debug = cli.verbose || discovery.debug;
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let install_dir = discovery.install_dir.clone();
    let cache = DiscoveryCache::new(discovery);
    let snapshot = cache.snapshot();
    for err in &snapshot.discovery_errors {
        warn!(error = %err, "device discovery");
    }
    for gpu in &snapshot.unsupported_gpus {
        warn!(id = %gpu.id, name = %gpu.name, compute = ?gpu.compute, "GPU not supported");
    }
    let placement = Placement::choose(&snapshot);

    let engine_path = find_engine_library(cli.engine_library.as_deref(), &placement, &install_dir)?;

    let platform = riff_discover::platform::current();
    let search = std::env::var_os(platform.search_var());
    for (name, value) in placement_environment(&placement, platform, search) {
        info!(name = %name, value = %value.to_string_lossy(), "setting environment");
        // SAFETY: no other threads exist yet; the tokio runtime is built below.
        unsafe { std::env::set_var(&name, &value) };
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    runtime.block_on(serve(cli, engine_path))
}

async fn serve(cli: Cli, engine_path: std::path::PathBuf) -> anyhow::Result<()> {
    let engine = NativeEngine::open(&engine_path)?;
    info!(path = %engine.path().display(), "Inference engine library");

    let runner = ModelRunner::start_load(Arc::new(engine), cli.runner_config())?;

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                ctrl_c.cancel();
            }
            Err(e) => warn!(error = %e, "unable to listen for Ctrl-C"),
        }
    });

    RunnerServer::new(cli.server_config())
        .start(runner, shutdown)
        .await
        .context("runner server failed")
}
