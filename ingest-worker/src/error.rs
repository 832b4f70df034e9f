use ingest_common::queue::QueueError;
use thiserror::Error;

/// Enumeration of errors that stop an ingest worker.
/// Per-item failures never show up here: they are handled inside the worker loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("could not open a consumer on the queue: {0}")]
    QueueUnavailable(QueueError),
    #[error("worker task panicked or was aborted: {0}")]
    TaskFailed(String),
}
