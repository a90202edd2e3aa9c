//! Stats Agent - per-host container stats and telemetry agent
//!
//! Tracks the containers of every task on this host through the cgroup v2
//! hierarchy, aggregates their resource usage and publishes per-task
//! telemetry and health messages.

use anyhow::{Context, Result};
use stats_lib::{
    health::{components, HealthRegistry},
    CgroupStatsSource, ManifestResolver, StatsEngine, StructuredLogger,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod sink;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Container lifecycle events buffered between the watcher and the engine
const EVENT_BUFFER: usize = 64;

/// Keep the resolver in step with the task manifest
async fn refresh_manifest(
    resolver: Arc<ManifestResolver>,
    path: std::path::PathBuf,
    every: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Loaded once at startup already
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = resolver.reload(&path).await {
                    warn!(path = %path.display(), error = %format!("{:#}", e), "Failed to refresh task manifest");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting stats-agent");

    let config = config::AgentConfig::load()?;
    info!(
        cluster = %config.cluster,
        container_instance = %config.container_instance,
        cgroup_root = %config.cgroup_root.display(),
        "Agent configured"
    );

    let logger = StructuredLogger::new(&config.container_instance);
    logger.log_startup(AGENT_VERSION, &config.cluster);

    let health_registry = HealthRegistry::new();

    let resolver = Arc::new(match ManifestResolver::load(&config.task_manifest_path).await {
        Ok(resolver) => resolver,
        Err(e) => {
            warn!(error = %format!("{:#}", e), "Starting with an empty task manifest");
            ManifestResolver::new()
        }
    });

    let runtime = Arc::new(
        CgroupStatsSource::new(&config.cgroup_root).with_poll_interval(config.poll_interval()),
    );
    if !runtime.is_available().await {
        warn!(cgroup_root = %config.cgroup_root.display(), "cgroup v2 hierarchy not detected");
    }

    let (engine, receivers) = StatsEngine::builder()
        .config(config.engine_config())
        .runtime(runtime.clone())
        .resolver(resolver.clone())
        .health_registry(health_registry.clone())
        .build()
        .context("Failed to build stats engine")?;

    let supervisor = engine.start().await?;

    let shutdown = engine.shutdown_token();
    let sink_handle = tokio::spawn(sink::drain(receivers, shutdown.clone()));

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let watcher = {
        let runtime = runtime.clone();
        let every = config.discovery_interval();
        let cancel = shutdown.clone();
        tokio::spawn(async move { runtime.watch(every, events_tx, cancel).await })
    };
    let listener = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_events(events_rx).await })
    };
    let refresher = tokio::spawn(refresh_manifest(
        resolver,
        config.task_manifest_path.clone(),
        config.manifest_refresh_interval(),
        shutdown.clone(),
    ));

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), engine.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            let reason = match result {
                Ok(Ok(())) => "API server exited".to_string(),
                Ok(Err(e)) => format!("API server failed: {:#}", e),
                Err(e) => format!("API server panicked: {}", e),
            };
            health_registry.set_unhealthy(components::ENGINE, reason.clone()).await;
            logger.log_shutdown(&reason);
        }
    }

    engine.shutdown();
    supervisor.await?;
    for handle in [watcher, listener, refresher] {
        handle.await?;
    }
    sink_handle.await?;

    info!("Shut down cleanly");
    Ok(())
}
