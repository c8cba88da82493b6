//! Review engine server binary.
//!
//! Wires config -> telemetry -> db (write + read pools) -> scheduler ->
//! poller -> axum server, then serves until SIGTERM/ctrl-c, at which point
//! the HTTP listener and poller ticker both stop but in-flight tasks are
//! left to finish (the scheduler has no drain step of its own; workers are
//! daemon tasks that die with the process once their current task returns).

use std::sync::Arc;

use review_engine::assistant_runner::AssistantRunConfig;
use review_engine::batch_planner::BatchPlanConfig;
use review_engine::comment_adapter::CommentAdapterConfig;
use review_engine::db;
use review_engine::poller::{Poller, PollerConfig};
use review_engine::scheduler::{Scheduler, SchedulerConfig};
use review_engine::telemetry::{self, TelemetryConfig};
use review_engine::{server, AppState, Config, Result};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let telemetry_config = TelemetryConfig {
        enabled: config.telemetry.enabled,
        otlp_endpoint: config.telemetry.otlp_endpoint.clone(),
        log_level: config.telemetry.log_level.clone(),
        ..TelemetryConfig::default()
    };
    telemetry::init(telemetry_config)
        .await
        .map_err(|e| review_engine::ReviewError::Fatal(format!("telemetry init failed: {e}")))?;

    info!(version = env!("CARGO_PKG_VERSION"), "review engine starting");

    std::fs::create_dir_all(config.data_dir_path())
        .map_err(|e| review_engine::ReviewError::Fatal(format!("failed to create data dir: {e}")))?;

    let database_url = config.database_url();
    let write_pool = db::init_db(&database_url).await?;
    let read_pool = db::init_read_pool(&database_url).await?;

    let scheduler = Arc::new(Scheduler::new(
        write_pool.clone(),
        config.working_copy_base_path(),
        AssistantRunConfig {
            command: config.assistant.binary.clone(),
            timeout: std::time::Duration::from_secs(config.assistant.batch_timeout_secs),
            ..AssistantRunConfig::default()
        },
        BatchPlanConfig {
            max_tokens_per_batch: config.assistant.max_tokens_per_batch,
            context_map_tokens: config.assistant.context_map_tokens,
            ..BatchPlanConfig::default()
        },
        CommentAdapterConfig { dry_run: config.comment.dry_run },
        &SchedulerConfig {
            worker_count: config.scheduler.worker_count,
            channel_capacity: config.scheduler.channel_capacity,
        },
    )?);

    let scheduler_handle = Arc::clone(&scheduler);
    tokio::spawn(async move {
        if let Err(e) = scheduler_handle.run().await {
            tracing::error!(error = %e, "scheduler exited with error");
        }
    });

    let poller = Arc::new(Poller::new(
        write_pool.clone(),
        Arc::clone(&scheduler),
        PollerConfig {
            tick_interval: std::time::Duration::from_secs(config.poller.tick_interval_secs),
            max_concurrent_polls: config.poller.max_concurrent_polls,
        },
    ));

    let poller_handle = Arc::clone(&poller);
    tokio::spawn(async move {
        poller_handle.run().await;
    });

    let state = AppState {
        config: Arc::new(config),
        write_pool,
        read_pool,
        scheduler,
        poller,
        metrics: review_engine::metrics::global_registry(),
    };

    tokio::select! {
        result = server::run(state) => result?,
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping");
        }
    }

    telemetry::shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
