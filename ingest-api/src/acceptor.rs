use std::sync::Arc;
use std::time::Instant;

use ingest_common::event::NewEvent;
use ingest_common::queue::{EventQueue, QueueError};
use ingest_common::stats::IngestStats;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum AcceptError {
    #[error("failed to serialize event: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("failed to push event to the queue: {0}")]
    BrokerError(#[from] QueueError),
}

/// Entry point of the pipeline: counts validated events and pushes them on the queue.
/// It never touches the store, so accepting an event never waits on persistence.
#[derive(Clone)]
pub struct IngressAcceptor {
    queue: Arc<dyn EventQueue>,
    stats: Arc<IngestStats>,
}

impl IngressAcceptor {
    pub fn new(queue: Arc<dyn EventQueue>, stats: Arc<IngestStats>) -> Self {
        Self { queue, stats }
    }

    /// Queue a validated event.
    ///
    /// `received` counts accepted requests, so it moves even if the push then fails;
    /// the caller gets the error and is expected to retry.
    pub async fn accept(&self, event: &NewEvent) -> Result<(), AcceptError> {
        self.stats.record_received();

        let item = serde_json::to_vec(event)?;

        let start_time = Instant::now();
        if let Err(error) = self.queue.push(item).await {
            error!(
                topic = %event.topic,
                event_id = %event.event_id,
                "failed to queue event: {}",
                error
            );
            metrics::counter!("aggregator_queue_push_errors_total").increment(1);
            return Err(AcceptError::BrokerError(error));
        }
        metrics::histogram!("aggregator_enqueue_duration_seconds")
            .record(start_time.elapsed().as_secs_f64());

        Ok(())
    }
}
