use std::collections::HashMap;
use std::sync::Mutex;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use thiserror::Error;

use crate::event::{EventRecord, NewEvent};

/// Enumeration of errors for operations against the durable store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("running migrations failed with: {error}")]
    MigrationError { error: sqlx::migrate::MigrateError },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// No row existed for the key; a row was created with this sequence id.
    Inserted(i64),
    /// A row already existed for the key. Nothing was written.
    Rejected,
}

/// Durable storage of events, unique on `(topic, event_id)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert the event unless a row with the same `(topic, event_id)` exists.
    /// This is a single atomic operation, so concurrent callers racing on the same key
    /// observe exactly one `Inserted`.
    async fn insert_if_absent(&self, event: &NewEvent) -> StoreResult<InsertOutcome>;

    /// Total number of persisted events.
    async fn count(&self) -> StoreResult<i64>;

    /// Most recently persisted events, newest first, optionally restricted to a topic.
    async fn list_recent(&self, topic: Option<&str>, limit: i64) -> StoreResult<Vec<EventRecord>>;

    /// Release any connections held by the store.
    async fn close(&self);
}

/// Events stored in the `processed_events` PostgreSQL table.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    topic: String,
    event_id: String,
    timestamp: String,
    source: Option<String>,
    payload: Option<Json<serde_json::Value>>,
    ingested_at: DateTime<Utc>,
}

impl From<EventRow> for EventRecord {
    fn from(row: EventRow) -> Self {
        EventRecord {
            sequence_id: row.id,
            topic: row.topic,
            event_id: row.event_id,
            timestamp: row.timestamp,
            source: row.source,
            payload: row.payload.map(|Json(value)| value),
            ingested_at: row.ingested_at,
        }
    }
}

impl PgStore {
    /// Connect to PostgreSQL and make sure the schema is up to date.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: time::Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        sqlx::migrate!("../migrations")
            .run(&pool)
            .await
            .map_err(|error| StoreError::MigrationError { error })?;

        Ok(Self { pool })
    }

    /// Build a store from an existing pool. The schema is assumed to exist.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_if_absent(&self, event: &NewEvent) -> StoreResult<InsertOutcome> {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
INSERT INTO processed_events
    (topic, event_id, timestamp, source, payload)
VALUES
    ($1, $2, $3, $4, $5)
ON CONFLICT ON CONSTRAINT uq_topic_event_id DO NOTHING
RETURNING id
            "#,
        )
        .bind(&event.topic)
        .bind(&event.event_id)
        .bind(&event.timestamp)
        .bind(&event.source)
        .bind(event.payload.as_ref().map(Json))
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT",
            error,
        })?;

        Ok(match inserted {
            Some(id) => InsertOutcome::Inserted(id),
            None => InsertOutcome::Rejected,
        })
    }

    async fn count(&self) -> StoreResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "COUNT",
                error,
            })
    }

    async fn list_recent(&self, topic: Option<&str>, limit: i64) -> StoreResult<Vec<EventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
SELECT
    id, topic, event_id, timestamp, source, payload, ingested_at
FROM
    processed_events
WHERE
    $1::text IS NULL OR topic = $1
ORDER BY
    id DESC
LIMIT $2
            "#,
        )
        .bind(topic)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT",
            error,
        })?;

        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// An in-process store keeping the same uniqueness guarantees as `PgStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    next_id: i64,
    keys: HashMap<(String, String), usize>,
    rows: Vec<EventRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the persisted row for a key.
    pub fn get(&self, topic: &str, event_id: &str) -> Option<EventRecord> {
        let inner = self.inner.lock().expect("poisoned MemoryStore mutex");
        inner
            .keys
            .get(&(topic.to_owned(), event_id.to_owned()))
            .map(|index| inner.rows[*index].clone())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_if_absent(&self, event: &NewEvent) -> StoreResult<InsertOutcome> {
        let mut inner = self.inner.lock().expect("poisoned MemoryStore mutex");
        let key = (event.topic.clone(), event.event_id.clone());

        if inner.keys.contains_key(&key) {
            return Ok(InsertOutcome::Rejected);
        }

        inner.next_id += 1;
        let sequence_id = inner.next_id;
        let index = inner.rows.len();
        inner.rows.push(EventRecord {
            sequence_id,
            topic: event.topic.clone(),
            event_id: event.event_id.clone(),
            timestamp: event.timestamp.clone(),
            source: event.source.clone(),
            payload: event.payload.clone(),
            ingested_at: Utc::now(),
        });
        inner.keys.insert(key, index);

        Ok(InsertOutcome::Inserted(sequence_id))
    }

    async fn count(&self) -> StoreResult<i64> {
        let inner = self.inner.lock().expect("poisoned MemoryStore mutex");
        Ok(inner.rows.len() as i64)
    }

    async fn list_recent(&self, topic: Option<&str>, limit: i64) -> StoreResult<Vec<EventRecord>> {
        let inner = self.inner.lock().expect("poisoned MemoryStore mutex");
        let limit = usize::try_from(limit).unwrap_or(0);

        Ok(inner
            .rows
            .iter()
            .rev()
            .filter(|row| topic.map_or(true, |topic| row.topic == topic))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn close(&self) {}
}
