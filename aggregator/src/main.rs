//! Accept events over HTTP, queue them, and persist each `(topic, event_id)` exactly once.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aggregator::config::Config;
use aggregator::lifecycle::{self, LifecycleState, LifecycleStatus};
use ingest_common::metrics::{add_metrics_route, setup_metrics_recorder};
use ingest_common::queue::{EventQueue, QueueError, RedisQueue};
use ingest_common::store::{EventStore, PgStore, StoreError};

async fn shutdown_signal() -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    };
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::init_from_env()?;
    let recorder_handle = setup_metrics_recorder()?;

    let status = LifecycleStatus::new();
    let mut pipeline = lifecycle::start(
        &status,
        config.startup_retry(),
        || async {
            let store = PgStore::connect(
                config.database_url.as_str(),
                config.max_pg_connections,
                config.pg_acquire_timeout.0,
            )
            .await?;
            Ok::<Arc<dyn EventStore>, StoreError>(Arc::new(store))
        },
        || async {
            let queue =
                RedisQueue::new(config.queue_name.as_str(), config.broker_url.as_str()).await?;
            Ok::<Arc<dyn EventQueue>, QueueError>(Arc::new(queue))
        },
        config.worker_count.get(),
        config.worker_settings(),
    )
    .await?;

    let router = add_metrics_route(
        pipeline.router(config.max_body_size, config.max_concurrent_publishes),
        recorder_handle,
    );

    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    info!("listening on {}", config.bind());

    let stop_serving = CancellationToken::new();
    let server = {
        let stop_serving = stop_serving.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop_serving.cancelled().await })
                .await
        })
    };

    let outcome = tokio::select! {
        signal = shutdown_signal() => signal.map_err(eyre::Report::from),
        failure = pipeline.worker_failure() => {
            error!("stopping: {}", failure);
            Err(failure.into())
        }
    };

    // Stop taking traffic before the workers drain.
    pipeline.status().set(LifecycleState::Draining);
    stop_serving.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => error!("server error: {}", error),
        Err(error) => error!("server task failed: {}", error),
    }

    let report = pipeline.shutdown(config.shutdown_timeout.0).await;
    info!(
        stopped = report.stopped,
        failed = report.failed,
        aborted = report.aborted,
        "shutdown complete"
    );

    outcome
}
