//! Startup, readiness and shutdown of the aggregator pipeline.
//!
//! The controller moves through `Starting -> Ready -> Draining -> Stopped`. A store that
//! stays unreachable, or a queue that cannot be opened, ends startup in `StartupFailed`.
use std::future::Future;
use std::sync::Arc;
use std::time;

use axum::{http::StatusCode, routing, Router};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use ingest_api::handlers::{add_routes, AppState};
use ingest_common::health::HealthRegistry;
use ingest_common::queue::{EventQueue, QueueError};
use ingest_common::retry::{RetryError, StartupRetry};
use ingest_common::stats::IngestStats;
use ingest_common::store::{EventStore, StoreError};
use ingest_worker::error::WorkerError;
use ingest_worker::worker::{DrainReport, WorkerContext, WorkerPool, WorkerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Ready,
    Draining,
    Stopped,
    StartupFailed,
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("startup failed: {0}")]
    StartupFailure(#[from] RetryError<StoreError>),
    #[error("startup failed, queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),
    #[error("{name} exited: {error}")]
    WorkerDied { name: String, error: WorkerError },
    #[error("{name} stopped before shutdown was requested")]
    WorkerStopped { name: String },
}

/// Observable lifecycle state, shared between the controller and the `/_readiness` route.
#[derive(Clone)]
pub struct LifecycleStatus {
    state: Arc<watch::Sender<LifecycleState>>,
}

impl Default for LifecycleStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleStatus {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn get(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn set(&self, state: LifecycleState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("lifecycle state: {:?} -> {:?}", previous, state);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Readiness check: only a `Ready` pipeline takes traffic.
    pub fn readiness(&self) -> StatusCode {
        match self.get() {
            LifecycleState::Ready => StatusCode::OK,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// A started pipeline: connected collaborators and a running worker pool.
pub struct Pipeline {
    pub queue: Arc<dyn EventQueue>,
    pub store: Arc<dyn EventStore>,
    pub stats: Arc<IngestStats>,
    pub liveness: HealthRegistry,
    status: LifecycleStatus,
    pool: WorkerPool,
}

/// Connect the store (retrying), then the queue, then spawn `worker_count` workers.
///
/// `connect_store` is called once per attempt. On failure the state ends in
/// `StartupFailed` and nothing keeps running.
pub async fn start<S, SFut, Q, QFut>(
    status: &LifecycleStatus,
    retry: StartupRetry,
    connect_store: S,
    connect_queue: Q,
    worker_count: usize,
    settings: WorkerSettings,
) -> Result<Pipeline, LifecycleError>
where
    S: FnMut() -> SFut,
    SFut: Future<Output = Result<Arc<dyn EventStore>, StoreError>>,
    Q: FnOnce() -> QFut,
    QFut: Future<Output = Result<Arc<dyn EventQueue>, QueueError>>,
{
    status.set(LifecycleState::Starting);

    let store = match retry.run("store", connect_store).await {
        Ok(store) => store,
        Err(error) => {
            error!("{}", error);
            status.set(LifecycleState::StartupFailed);
            return Err(LifecycleError::StartupFailure(error));
        }
    };

    let queue = match connect_queue().await {
        Ok(queue) => queue,
        Err(error) => {
            error!("failed to connect to the queue: {}", error);
            store.close().await;
            status.set(LifecycleState::StartupFailed);
            return Err(LifecycleError::QueueUnavailable(error));
        }
    };

    let stats = Arc::new(IngestStats::new());
    let liveness = HealthRegistry::new("liveness");
    let context = WorkerContext {
        queue: queue.clone(),
        store: store.clone(),
        stats: stats.clone(),
        settings,
    };
    let pool = WorkerPool::spawn(worker_count, context, &liveness);

    status.set(LifecycleState::Ready);

    Ok(Pipeline {
        queue,
        store,
        stats,
        liveness,
        status: status.clone(),
        pool,
    })
}

impl Pipeline {
    pub fn status(&self) -> &LifecycleStatus {
        &self.status
    }

    /// HTTP surface of the pipeline, including `/_readiness`.
    pub fn router(&self, max_body_size: usize, concurrency_limit: usize) -> Router {
        let state = AppState::new(self.queue.clone(), self.store.clone(), self.stats.clone());
        let status = self.status.clone();

        let router = Router::new().route(
            "/_readiness",
            routing::get(move || std::future::ready(status.readiness())),
        );

        add_routes(
            router,
            state,
            self.liveness.clone(),
            max_body_size,
            concurrency_limit,
        )
    }

    /// Resolve once a worker exits without having been asked to.
    /// Pends forever while every worker is running.
    pub async fn worker_failure(&mut self) -> LifecycleError {
        let (name, result) = self.pool.next_exit().await;
        match result {
            Err(error) => LifecycleError::WorkerDied { name, error },
            Ok(()) => LifecycleError::WorkerStopped { name },
        }
    }

    /// Drain the workers, bounded by `timeout`, then release the queue and the store.
    pub async fn shutdown(self, timeout: time::Duration) -> DrainReport {
        self.status.set(LifecycleState::Draining);

        let report = self.pool.shutdown(timeout).await;
        if report.aborted > 0 {
            warn!("{} workers aborted during drain", report.aborted);
        }

        self.queue.close().await;
        self.store.close().await;

        let counters = self.stats.counters();
        info!(
            received = counters.received,
            unique_processed = counters.unique_processed,
            duplicate_dropped = counters.duplicate_dropped,
            store_errors = counters.store_errors,
            "pipeline drained"
        );

        self.status.set(LifecycleState::Stopped);
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use ingest_common::queue::MemoryQueue;
    use ingest_common::store::MemoryStore;

    use super::*;

    fn fast_settings() -> WorkerSettings {
        WorkerSettings {
            pop_timeout: time::Duration::from_millis(10),
            idle_delay: time::Duration::from_millis(1),
            error_backoff: time::Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[test]
    fn test_readiness_follows_state() {
        let status = LifecycleStatus::new();
        assert_eq!(status.readiness(), StatusCode::SERVICE_UNAVAILABLE);

        status.set(LifecycleState::Ready);
        assert_eq!(status.readiness(), StatusCode::OK);

        status.set(LifecycleState::Draining);
        assert_eq!(status.readiness(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let status = LifecycleStatus::new();
        let mut states = status.subscribe();

        let pipeline = start(
            &status,
            StartupRetry::new(1, time::Duration::ZERO),
            || async { Ok::<Arc<dyn EventStore>, StoreError>(Arc::new(MemoryStore::new())) },
            || async { Ok::<Arc<dyn EventQueue>, QueueError>(Arc::new(MemoryQueue::new())) },
            3,
            fast_settings(),
        )
        .await
        .expect("failed to start");

        assert_eq!(status.get(), LifecycleState::Ready);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), LifecycleState::Ready);

        let report = pipeline.shutdown(time::Duration::from_secs(5)).await;

        assert_eq!(
            report,
            DrainReport {
                stopped: 3,
                failed: 0,
                aborted: 0
            }
        );
        assert_eq!(status.get(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_store_unreachable_fails_startup() {
        let status = LifecycleStatus::new();
        let attempts = AtomicU32::new(0);

        let result = start(
            &status,
            StartupRetry::new(3, time::Duration::from_millis(1)),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<Arc<dyn EventStore>, _>(StoreError::ConnectionError {
                        error: sqlx::Error::PoolTimedOut,
                    })
                }
            },
            || async { Ok::<Arc<dyn EventQueue>, QueueError>(Arc::new(MemoryQueue::new())) },
            3,
            fast_settings(),
        )
        .await;

        match result {
            Err(LifecycleError::StartupFailure(error)) => assert_eq!(error.attempts, 3),
            _ => panic!("expected a startup failure"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(status.get(), LifecycleState::StartupFailed);
    }

    #[tokio::test]
    async fn test_queue_unavailable_fails_startup() {
        let status = LifecycleStatus::new();

        let result = start(
            &status,
            StartupRetry::new(1, time::Duration::ZERO),
            || async { Ok::<Arc<dyn EventStore>, StoreError>(Arc::new(MemoryStore::new())) },
            || async { Err::<Arc<dyn EventQueue>, _>(QueueError::Closed) },
            3,
            fast_settings(),
        )
        .await;

        assert!(matches!(result, Err(LifecycleError::QueueUnavailable(_))));
        assert_eq!(status.get(), LifecycleState::StartupFailed);
    }

    #[tokio::test]
    async fn test_closed_queue_surfaces_as_worker_exit() {
        let status = LifecycleStatus::new();
        let queue = MemoryQueue::new();
        let shared = queue.clone();

        let mut pipeline = start(
            &status,
            StartupRetry::new(1, time::Duration::ZERO),
            || async { Ok::<Arc<dyn EventStore>, StoreError>(Arc::new(MemoryStore::new())) },
            move || async move { Ok::<Arc<dyn EventQueue>, QueueError>(Arc::new(shared)) },
            1,
            fast_settings(),
        )
        .await
        .expect("failed to start");

        // The worker reports healthy once its consumer is open.
        let deadline = tokio::time::Instant::now() + time::Duration::from_secs(5);
        while !pipeline.liveness.get_status().healthy {
            assert!(tokio::time::Instant::now() < deadline, "worker never started");
            tokio::time::sleep(time::Duration::from_millis(5)).await;
        }
        queue.close().await;

        let exit = tokio::time::timeout(time::Duration::from_secs(5), pipeline.worker_failure())
            .await
            .expect("worker did not exit");
        assert!(matches!(exit, LifecycleError::WorkerStopped { .. }));

        pipeline.shutdown(time::Duration::from_secs(1)).await;
        assert_eq!(status.get(), LifecycleState::Stopped);
    }
}
