use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Notify;

/// Enumeration of errors for operations against the queue transport.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection to the queue transport failed with: {error}")]
    ConnectionError { error: redis::RedisError },
    #[error("{command} command failed with: {error}")]
    CommandError {
        command: &'static str,
        error: redis::RedisError,
    },
    #[error("queue has been closed")]
    Closed,
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// The producing side of a queue of serialized events.
///
/// Items are pushed to the head and popped from the tail, so a single producer and a single
/// consumer observe FIFO order. With several consumers each pop is a race.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Append an item to the queue.
    async fn push(&self, item: Vec<u8>) -> QueueResult<()>;

    /// Number of items currently buffered.
    async fn depth(&self) -> QueueResult<u64>;

    /// Open a consumer. Consumers may block while popping, so each worker holds its own.
    async fn consumer(&self) -> QueueResult<Box<dyn QueueConsumer>>;

    /// Release connections held by the producing side.
    async fn close(&self);
}

/// A connection dedicated to popping. Once `pop` fails with anything but `Closed` the
/// connection may be dead: drop the consumer and open a new one.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait up to `timeout` for an item, returning `None` if none became available.
    async fn pop(&mut self, timeout: time::Duration) -> QueueResult<Option<Vec<u8>>>;
}

/// Redis reads a BRPOP timeout of 0 as "block forever".
const MIN_BLOCKING_TIMEOUT_SECS: f64 = 0.01;

/// A queue implemented on top of a Redis list.
///
/// Pushes and reads share a `ConnectionManager`, which reconnects on its own after the
/// broker goes away. Blocking pops use dedicated connections handed out by `consumer`.
pub struct RedisQueue {
    name: String,
    client: redis::Client,
    connection: tokio::sync::Mutex<Option<ConnectionManager>>,
}

impl RedisQueue {
    /// Connect to the Redis server at `url` and use the list called `name`.
    pub async fn new(name: &str, url: &str) -> QueueResult<Self> {
        let client =
            redis::Client::open(url).map_err(|error| QueueError::ConnectionError { error })?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Self {
            name: name.to_owned(),
            client,
            connection: tokio::sync::Mutex::new(Some(connection)),
        })
    }

    async fn connection(&self) -> QueueResult<ConnectionManager> {
        self.connection.lock().await.clone().ok_or(QueueError::Closed)
    }
}

#[async_trait]
impl EventQueue for RedisQueue {
    async fn push(&self, item: Vec<u8>) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let _: i64 = conn
            .lpush(&self.name, item)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "LPUSH",
                error,
            })?;
        Ok(())
    }

    async fn depth(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        conn.llen(&self.name)
            .await
            .map_err(|error| QueueError::CommandError {
                command: "LLEN",
                error,
            })
    }

    async fn consumer(&self) -> QueueResult<Box<dyn QueueConsumer>> {
        let connection = self
            .client
            .get_async_connection()
            .await
            .map_err(|error| QueueError::ConnectionError { error })?;

        Ok(Box::new(RedisConsumer {
            name: self.name.clone(),
            connection,
        }))
    }

    async fn close(&self) {
        self.connection.lock().await.take();
    }
}

/// A dedicated connection used for blocking pops, so BRPOP never stalls pushes.
pub struct RedisConsumer {
    name: String,
    connection: redis::aio::Connection,
}

#[async_trait]
impl QueueConsumer for RedisConsumer {
    async fn pop(&mut self, timeout: time::Duration) -> QueueResult<Option<Vec<u8>>> {
        let popped: Option<(String, Vec<u8>)> = self
            .connection
            .brpop(&self.name, blocking_timeout(timeout))
            .await
            .map_err(|error| QueueError::CommandError {
                command: "BRPOP",
                error,
            })?;

        Ok(popped.map(|(_, item)| item))
    }
}

/// BRPOP timeout in seconds. Sub-second timeouts are kept, zero is raised to the floor.
fn blocking_timeout(timeout: time::Duration) -> f64 {
    timeout.as_secs_f64().max(MIN_BLOCKING_TIMEOUT_SECS)
}

/// An in-process queue. Useful for tests and running without a broker.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<MemoryQueueInner>,
}

#[derive(Default)]
struct MemoryQueueInner {
    items: Mutex<VecDeque<Vec<u8>>>,
    available: Notify,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_pop(&self) -> QueueResult<Option<Vec<u8>>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(self
            .inner
            .items
            .lock()
            .expect("poisoned MemoryQueue mutex")
            .pop_back())
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn push(&self, item: Vec<u8>) -> QueueResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.inner
            .items
            .lock()
            .expect("poisoned MemoryQueue mutex")
            .push_front(item);
        self.inner.available.notify_one();
        Ok(())
    }

    async fn depth(&self) -> QueueResult<u64> {
        let items = self.inner.items.lock().expect("poisoned MemoryQueue mutex");
        Ok(items.len() as u64)
    }

    async fn consumer(&self) -> QueueResult<Box<dyn QueueConsumer>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(Box::new(self.clone()))
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.available.notify_waiters();
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn pop(&mut self, timeout: time::Duration) -> QueueResult<Option<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.inner.available.notified();
            if let Some(item) = self.try_pop()? {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }
}
