use std::sync::Arc;
use std::time;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ingest_common::event::NewEvent;
use ingest_common::health::{ComponentStatus, HealthHandle, HealthRegistry};
use ingest_common::queue::{EventQueue, QueueConsumer, QueueError};
use ingest_common::stats::IngestStats;
use ingest_common::store::{EventStore, InsertOutcome};

use crate::error::WorkerError;

/// Settings shared by every worker of a pool.
#[derive(Clone, Copy, Debug)]
pub struct WorkerSettings {
    /// Maximum time a single pop waits for an item.
    pub pop_timeout: time::Duration,
    /// Pause after an empty pop before polling again.
    pub idle_delay: time::Duration,
    /// Pause after a failed pop before polling again.
    pub error_backoff: time::Duration,
    /// Log progress every this many processed attempts. 0 disables progress logs.
    pub progress_log_interval: u64,
    /// Liveness deadline: a worker not looping for this long is considered stalled.
    pub liveness_deadline: time::Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pop_timeout: time::Duration::from_secs(1),
            idle_delay: time::Duration::from_millis(1),
            error_backoff: time::Duration::from_secs(1),
            progress_log_interval: 500,
            liveness_deadline: time::Duration::from_secs(30),
        }
    }
}

/// What happened to one item popped from the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// First time this key was seen; persisted with the given sequence id.
    Inserted(i64),
    /// The key was already persisted. Nothing was written.
    Duplicate,
    /// The store failed. The item is dropped and no counter besides `store_errors` moves.
    StoreFailed,
    /// The item could not be deserialized into an event. It is dropped.
    Undecodable,
}

/// Resources every worker uses.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn EventQueue>,
    pub store: Arc<dyn EventStore>,
    pub stats: Arc<IngestStats>,
    pub settings: WorkerSettings,
}

/// Decode a queue item and run it through `process_event`.
pub async fn process_item(context: &WorkerContext, item: &[u8]) -> ItemOutcome {
    let arrived_at = Utc::now();

    let event: NewEvent = match serde_json::from_slice(item) {
        Ok(event) => event,
        Err(error) => {
            warn!("dropping undecodable queue item: {}", error);
            metrics::counter!("aggregator_undecodable_items_total").increment(1);
            return ItemOutcome::Undecodable;
        }
    };

    process_event(context, &event, arrived_at).await
}

/// Persist an event exactly once and account for the attempt.
///
/// The store's conditional insert is the only deduplication mechanism: the worker never
/// reads before writing, so racing workers cannot both observe a key as absent.
pub async fn process_event(
    context: &WorkerContext,
    event: &NewEvent,
    arrived_at: DateTime<Utc>,
) -> ItemOutcome {
    let latency = event.producer_time().map(|produced_at| arrived_at - produced_at);

    let outcome = match context.store.insert_if_absent(event).await {
        Ok(InsertOutcome::Inserted(sequence_id)) => {
            let attempts = context.stats.record_unique();
            log_progress(context, attempts);
            ItemOutcome::Inserted(sequence_id)
        }
        Ok(InsertOutcome::Rejected) => {
            let attempts = context.stats.record_duplicate();
            log_progress(context, attempts);
            ItemOutcome::Duplicate
        }
        Err(error) => {
            error!(
                topic = %event.topic,
                event_id = %event.event_id,
                "dropping event after store error: {}",
                error
            );
            context.stats.record_store_error();
            return ItemOutcome::StoreFailed;
        }
    };

    match latency {
        Some(latency) => context.stats.record_latency(latency),
        None => context.stats.record_unparseable_timestamp(),
    }

    outcome
}

fn log_progress(context: &WorkerContext, attempts: u64) {
    let interval = context.settings.progress_log_interval;
    if interval > 0 && attempts % interval == 0 {
        let counters = context.stats.counters();
        info!(
            "processed {} attempts: {} unique, {} duplicates dropped",
            attempts, counters.unique_processed, counters.duplicate_dropped
        );
    }
}

/// A single consumer loop.
pub struct IngestWorker {
    /// An identifier for this worker, used in logs and health reports.
    name: String,
    context: WorkerContext,
    /// The liveness check handle, reported on every loop turn.
    liveness: HealthHandle,
}

impl IngestWorker {
    pub fn new(name: &str, context: WorkerContext, liveness: HealthHandle) -> Self {
        Self {
            name: name.to_owned(),
            context,
            liveness,
        }
    }

    /// Consume the queue until `shutdown` is cancelled.
    ///
    /// Cancellation is only observed between items: a pop or write that has started always
    /// completes. The only error returned is failing to open the first consumer. After a
    /// failed pop the consumer is dropped and reopened once the backoff has elapsed.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let settings = self.context.settings;

        let mut consumer = match self.context.queue.consumer().await {
            Ok(consumer) => Some(consumer),
            Err(error) => {
                self.liveness.report_status(ComponentStatus::Unhealthy);
                return Err(WorkerError::QueueUnavailable(error));
            }
        };

        info!("{} started", self.name);

        while !shutdown.is_cancelled() {
            self.liveness.report_healthy();

            let Some(active) = consumer.as_mut() else {
                match self.context.queue.consumer().await {
                    Ok(reopened) => {
                        info!("{} reopened its queue consumer", self.name);
                        consumer = Some(reopened);
                    }
                    Err(QueueError::Closed) => {
                        info!("{} stopping: queue closed", self.name);
                        break;
                    }
                    Err(error) => {
                        error!("{} failed to reopen queue consumer: {}", self.name, error);
                        backoff(&shutdown, settings.error_backoff).await;
                    }
                }
                continue;
            };

            match active.pop(settings.pop_timeout).await {
                Ok(Some(item)) => {
                    let outcome = process_item(&self.context, &item).await;
                    debug!("{} processed item: {:?}", self.name, outcome);
                }
                Ok(None) => {
                    tokio::time::sleep(settings.idle_delay).await;
                }
                Err(QueueError::Closed) => {
                    info!("{} stopping: queue closed", self.name);
                    break;
                }
                Err(error) => {
                    error!("{} failed to pop from queue: {}", self.name, error);
                    metrics::counter!("aggregator_queue_pop_errors_total").increment(1);
                    consumer = None;
                    backoff(&shutdown, settings.error_backoff).await;
                }
            }
        }

        info!("{} stopped", self.name);
        Ok(())
    }
}

/// Sleep for `delay`, waking early on shutdown.
async fn backoff(shutdown: &CancellationToken, delay: time::Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {},
        _ = tokio::time::sleep(delay) => {},
    }
}

/// Summary of a pool shutdown.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Workers that finished their current iteration and exited.
    pub stopped: usize,
    /// Workers that exited with an error.
    pub failed: usize,
    /// Workers still running when the drain deadline elapsed. They were aborted.
    pub aborted: usize,
}

/// A fixed-size set of `IngestWorker`s sharing one cancellation token.
pub struct WorkerPool {
    shutdown: CancellationToken,
    workers: JoinSet<(String, Result<(), WorkerError>)>,
}

impl WorkerPool {
    /// Spawn `size` workers, each registered with the liveness registry.
    pub fn spawn(size: usize, context: WorkerContext, liveness: &HealthRegistry) -> Self {
        let shutdown = CancellationToken::new();
        let mut workers = JoinSet::new();
        let deadline = context.settings.liveness_deadline;

        for index in 0..size {
            let name = format!("worker-{}", index);
            let handle = liveness.register(name.clone(), deadline);
            let worker = IngestWorker::new(&name, context.clone(), handle);
            let token = shutdown.clone();

            workers.spawn(async move {
                let result = worker.run(token).await;
                (name, result)
            });
        }

        metrics::gauge!("aggregator_workers").set(size as f64);
        info!("spawned {} ingest workers", size);

        Self { shutdown, workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for the next worker to exit on its own. Workers only exit early when they
    /// cannot reach the queue, so any value returned here before shutdown is a failure.
    /// Pends forever when the pool is empty.
    pub async fn next_exit(&mut self) -> (String, Result<(), WorkerError>) {
        match self.workers.join_next().await {
            Some(joined) => flatten_join(joined),
            None => std::future::pending().await,
        }
    }

    /// Stop every worker: no new pop starts, in-flight items finish, and workers still
    /// running after `timeout` are aborted.
    pub async fn shutdown(mut self, timeout: time::Duration) -> DrainReport {
        self.shutdown.cancel();
        let mut report = DrainReport::default();

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = self.workers.join_next().await {
                match flatten_join(joined) {
                    (_, Ok(())) => report.stopped += 1,
                    (name, Err(error)) => {
                        warn!("{} exited with error during drain: {}", name, error);
                        report.failed += 1;
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            report.aborted = self.workers.len();
            warn!(
                "{} workers did not stop within {:?}, aborting them",
                report.aborted, timeout
            );
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }

        metrics::gauge!("aggregator_workers").set(0f64);
        report
    }
}

fn flatten_join(
    joined: Result<(String, Result<(), WorkerError>), tokio::task::JoinError>,
) -> (String, Result<(), WorkerError>) {
    match joined {
        Ok(exit) => exit,
        Err(error) => (
            "unknown worker".to_owned(),
            Err(WorkerError::TaskFailed(error.to_string())),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ingest_common::event::EventRecord;
    use ingest_common::queue::{MemoryQueue, QueueConsumer, QueueResult};
    use ingest_common::store::{MemoryStore, StoreError, StoreResult};

    fn new_event(topic: &str, event_id: &str, timestamp: &str) -> NewEvent {
        NewEvent {
            topic: topic.to_owned(),
            event_id: event_id.to_owned(),
            timestamp: timestamp.to_owned(),
            source: None,
            payload: None,
        }
    }

    fn context_with(queue: Arc<dyn EventQueue>, store: Arc<dyn EventStore>) -> WorkerContext {
        WorkerContext {
            queue,
            store,
            stats: Arc::new(IngestStats::new()),
            settings: WorkerSettings {
                pop_timeout: time::Duration::from_millis(20),
                ..Default::default()
            },
        }
    }

    fn memory_context() -> WorkerContext {
        context_with(Arc::new(MemoryQueue::new()), Arc::new(MemoryStore::new()))
    }

    /// A store whose writes always fail.
    struct FailingStore;

    #[async_trait]
    impl EventStore for FailingStore {
        async fn insert_if_absent(&self, _: &NewEvent) -> StoreResult<InsertOutcome> {
            Err(StoreError::QueryError {
                command: "INSERT",
                error: sqlx::Error::PoolTimedOut,
            })
        }

        async fn count(&self) -> StoreResult<i64> {
            Ok(0)
        }

        async fn list_recent(&self, _: Option<&str>, _: i64) -> StoreResult<Vec<EventRecord>> {
            Ok(vec![])
        }

        async fn close(&self) {}
    }

    /// A queue that cannot be reached.
    struct UnreachableQueue;

    #[async_trait]
    impl EventQueue for UnreachableQueue {
        async fn push(&self, _: Vec<u8>) -> QueueResult<()> {
            Err(QueueError::Closed)
        }

        async fn depth(&self) -> QueueResult<u64> {
            Err(QueueError::Closed)
        }

        async fn consumer(&self) -> QueueResult<Box<dyn QueueConsumer>> {
            Err(QueueError::Closed)
        }

        async fn close(&self) {}
    }

    /// A queue whose first consumer has lost its broker connection. Consumers opened after
    /// it read from an in-memory queue.
    #[derive(Default)]
    struct ReconnectingQueue {
        items: MemoryQueue,
        consumers_opened: AtomicUsize,
    }

    struct DisconnectedConsumer;

    #[async_trait]
    impl QueueConsumer for DisconnectedConsumer {
        async fn pop(&mut self, _: time::Duration) -> QueueResult<Option<Vec<u8>>> {
            Err(QueueError::CommandError {
                command: "BRPOP",
                error: redis::RedisError::from((redis::ErrorKind::IoError, "connection reset")),
            })
        }
    }

    #[async_trait]
    impl EventQueue for ReconnectingQueue {
        async fn push(&self, item: Vec<u8>) -> QueueResult<()> {
            self.items.push(item).await
        }

        async fn depth(&self) -> QueueResult<u64> {
            self.items.depth().await
        }

        async fn consumer(&self) -> QueueResult<Box<dyn QueueConsumer>> {
            if self.consumers_opened.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Box::new(DisconnectedConsumer))
            } else {
                self.items.consumer().await
            }
        }

        async fn close(&self) {
            self.items.close().await
        }
    }

    #[tokio::test]
    async fn test_first_insert_then_duplicate() {
        let context = memory_context();
        let event = new_event("order.created", "abc", &Utc::now().to_rfc3339());

        let first = process_event(&context, &event, Utc::now()).await;
        assert!(matches!(first, ItemOutcome::Inserted(_)));
        assert_eq!(context.stats.counters().unique_processed, 1);

        let second = process_event(&context, &event, Utc::now()).await;
        assert_eq!(second, ItemOutcome::Duplicate);

        let counters = context.stats.counters();
        assert_eq!(counters.unique_processed, 1);
        assert_eq!(counters.duplicate_dropped, 1);
        assert_eq!(context.store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_event_id_under_different_topics() {
        let context = memory_context();
        let timestamp = Utc::now().to_rfc3339();

        let a = process_event(&context, &new_event("A", "x", &timestamp), Utc::now()).await;
        let b = process_event(&context, &new_event("B", "x", &timestamp), Utc::now()).await;

        assert!(matches!(a, ItemOutcome::Inserted(_)));
        assert!(matches!(b, ItemOutcome::Inserted(_)));
        assert_eq!(context.store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_latency_accounting() {
        let context = memory_context();
        let arrived_at = Utc::now();

        let past = (arrived_at - chrono::Duration::milliseconds(500)).to_rfc3339();
        process_event(&context, &new_event("t", "past", &past), arrived_at).await;
        assert_eq!(context.stats.counters().total_latency_seconds, 0.5);

        let future = (arrived_at + chrono::Duration::seconds(60)).to_rfc3339();
        process_event(&context, &new_event("t", "future", &future), arrived_at).await;
        assert_eq!(context.stats.counters().total_latency_seconds, 0.5);

        let unparseable = new_event("t", "bad", "not a time");
        let outcome = process_event(&context, &unparseable, arrived_at).await;
        assert!(matches!(outcome, ItemOutcome::Inserted(_)));

        let counters = context.stats.counters();
        assert_eq!(counters.total_latency_seconds, 0.5);
        assert_eq!(counters.unparseable_timestamps, 1);
        assert_eq!(counters.unique_processed, 3);
    }

    #[tokio::test]
    async fn test_store_error_drops_item_without_counting_it() {
        let context = context_with(Arc::new(MemoryQueue::new()), Arc::new(FailingStore));
        let event = new_event("order.created", "abc", &Utc::now().to_rfc3339());

        let outcome = process_event(&context, &event, Utc::now()).await;

        assert_eq!(outcome, ItemOutcome::StoreFailed);
        let counters = context.stats.counters();
        assert_eq!(counters.unique_processed, 0);
        assert_eq!(counters.duplicate_dropped, 0);
        assert_eq!(counters.store_errors, 1);
        assert_eq!(counters.total_latency_seconds, 0f64);
    }

    #[tokio::test]
    async fn test_undecodable_item_is_dropped() {
        let context = memory_context();

        let outcome = process_item(&context, b"definitely not json").await;

        assert_eq!(outcome, ItemOutcome::Undecodable);
        assert_eq!(context.stats.counters().processed_attempts(), 0);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        let context = context_with(queue.clone(), store.clone());
        let stats = context.stats.clone();
        let registry = HealthRegistry::new("liveness");

        let timestamp = Utc::now().to_rfc3339();
        for i in 0..50 {
            let event = new_event("order.created", &i.to_string(), &timestamp);
            queue.push(serde_json::to_vec(&event).unwrap()).await.unwrap();
        }

        let pool = WorkerPool::spawn(3, context, &registry);
        assert_eq!(pool.len(), 3);

        let deadline = tokio::time::Instant::now() + time::Duration::from_secs(5);
        while stats.counters().processed_attempts() < 50
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(time::Duration::from_millis(10)).await;
        }

        let report = pool.shutdown(time::Duration::from_secs(5)).await;

        assert_eq!(
            report,
            DrainReport {
                stopped: 3,
                failed: 0,
                aborted: 0
            }
        );
        assert_eq!(stats.counters().unique_processed, 50);
        assert_eq!(store.count().await.unwrap(), 50);
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_without_queue_exits_with_error() {
        let context = context_with(Arc::new(UnreachableQueue), Arc::new(MemoryStore::new()));
        let registry = HealthRegistry::new("liveness");

        let mut pool = WorkerPool::spawn(1, context, &registry);
        let (name, result) = pool.next_exit().await;

        assert_eq!(name, "worker-0");
        assert!(matches!(result, Err(WorkerError::QueueUnavailable(_))));
        assert_eq!(
            registry.get_status().components.get("worker-0"),
            Some(&ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn test_worker_reopens_consumer_after_pop_failure() {
        let queue = Arc::new(ReconnectingQueue::default());
        let mut context = context_with(queue.clone(), Arc::new(MemoryStore::new()));
        context.settings.error_backoff = time::Duration::from_millis(10);
        let stats = context.stats.clone();
        let registry = HealthRegistry::new("liveness");

        let event = new_event("order.created", "abc", &Utc::now().to_rfc3339());
        queue.push(serde_json::to_vec(&event).unwrap()).await.unwrap();

        let pool = WorkerPool::spawn(1, context, &registry);

        let deadline = tokio::time::Instant::now() + time::Duration::from_secs(5);
        while stats.counters().unique_processed < 1 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker never recovered from the failed pop"
            );
            tokio::time::sleep(time::Duration::from_millis(10)).await;
        }

        assert!(queue.consumers_opened.load(Ordering::SeqCst) >= 2);
        assert!(registry.get_status().healthy);

        let report = pool.shutdown(time::Duration::from_secs(5)).await;
        assert_eq!(
            report,
            DrainReport {
                stopped: 1,
                failed: 0,
                aborted: 0
            }
        );
    }
}
