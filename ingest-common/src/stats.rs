//! Process-wide ingestion counters and the statistics derived from them.
//!
//! Counters are independent atomics: each one is only ever incremented, and no invariant
//! spans two of them, so no lock is needed. Derived values (throughput, average latency,
//! duplicate rate) are computed when a snapshot is taken.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time;

use serde::Serialize;

use crate::queue::EventQueue;
use crate::store::EventStore;

/// Shared ingestion counters. Wrap in an `Arc` and hand a clone to every component.
pub struct IngestStats {
    start_time: time::Instant,
    received: AtomicU64,
    unique_processed: AtomicU64,
    duplicate_dropped: AtomicU64,
    store_errors: AtomicU64,
    unparseable_timestamps: AtomicU64,
    total_latency_micros: AtomicU64,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self::started_at(time::Instant::now())
    }

    pub fn started_at(start_time: time::Instant) -> Self {
        Self {
            start_time,
            received: AtomicU64::new(0),
            unique_processed: AtomicU64::new(0),
            duplicate_dropped: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            unparseable_timestamps: AtomicU64::new(0),
            total_latency_micros: AtomicU64::new(0),
        }
    }

    /// Record an event accepted by the ingress.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("aggregator_events_received_total").increment(1);
    }

    /// Record a first-time persist. Returns the number of processed attempts so far.
    pub fn record_unique(&self) -> u64 {
        let unique = self.unique_processed.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!("aggregator_events_unique_total").increment(1);
        unique + self.duplicate_dropped.load(Ordering::Relaxed)
    }

    /// Record a persist rejected because the key already existed.
    /// Returns the number of processed attempts so far.
    pub fn record_duplicate(&self) -> u64 {
        let duplicates = self.duplicate_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!("aggregator_events_duplicate_total").increment(1);
        duplicates + self.unique_processed.load(Ordering::Relaxed)
    }

    /// Record an item dropped because the store failed.
    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("aggregator_store_errors_total").increment(1);
    }

    /// Record a producer timestamp that could not be parsed.
    pub fn record_unparseable_timestamp(&self) {
        self.unparseable_timestamps.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("aggregator_unparseable_timestamps_total").increment(1);
    }

    /// Add an end-to-end latency sample. Negative samples (clock skew) are ignored.
    pub fn record_latency(&self, latency: chrono::Duration) {
        let Ok(latency) = latency.to_std() else {
            return;
        };
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.total_latency_micros.fetch_add(micros, Ordering::Relaxed);
        metrics::histogram!("aggregator_event_latency_seconds").record(latency.as_secs_f64());
    }

    pub fn counters(&self) -> Counters {
        Counters {
            received: self.received.load(Ordering::Relaxed),
            unique_processed: self.unique_processed.load(Ordering::Relaxed),
            duplicate_dropped: self.duplicate_dropped.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            unparseable_timestamps: self.unparseable_timestamps.load(Ordering::Relaxed),
            total_latency_seconds: self.total_latency_micros.load(Ordering::Relaxed) as f64
                / 1_000_000f64,
        }
    }

    pub fn uptime(&self) -> time::Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all counters, reading queue depth and row count from their sources.
    /// A collaborator that cannot be read reports `None`.
    pub async fn snapshot(&self, queue: &dyn EventQueue, store: &dyn EventStore) -> StatsSnapshot {
        let queue_depth = match queue.depth().await {
            Ok(depth) => Some(depth),
            Err(error) => {
                tracing::warn!("failed to read queue depth: {}", error);
                None
            }
        };
        let store_row_count = match store.count().await {
            Ok(count) => Some(count),
            Err(error) => {
                tracing::warn!("failed to count stored events: {}", error);
                None
            }
        };

        StatsSnapshot::derive(self.counters(), self.uptime(), queue_depth, store_row_count)
    }
}

/// Raw counter values at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Counters {
    pub received: u64,
    pub unique_processed: u64,
    pub duplicate_dropped: u64,
    pub store_errors: u64,
    pub unparseable_timestamps: u64,
    pub total_latency_seconds: f64,
}

impl Counters {
    pub fn processed_attempts(&self) -> u64 {
        self.unique_processed + self.duplicate_dropped
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub unique_processed: u64,
    pub duplicate_dropped: u64,
    pub store_errors: u64,
    pub unparseable_timestamps: u64,
    pub throughput_eps: f64,
    pub avg_latency_ms: f64,
    pub duplicate_rate_percent: f64,
    pub uptime_seconds: f64,
    pub queue_depth: Option<u64>,
    pub store_row_count: Option<i64>,
}

impl StatsSnapshot {
    pub fn derive(
        counters: Counters,
        uptime: time::Duration,
        queue_depth: Option<u64>,
        store_row_count: Option<i64>,
    ) -> Self {
        let uptime_seconds = uptime.as_secs_f64();
        let attempts = counters.processed_attempts() as f64;

        let throughput_eps = if uptime_seconds > 0f64 {
            attempts / uptime_seconds
        } else {
            0f64
        };
        let (avg_latency_ms, duplicate_rate_percent) = if attempts > 0f64 {
            (
                counters.total_latency_seconds / attempts * 1000f64,
                counters.duplicate_dropped as f64 / attempts * 100f64,
            )
        } else {
            (0f64, 0f64)
        };

        Self {
            received: counters.received,
            unique_processed: counters.unique_processed,
            duplicate_dropped: counters.duplicate_dropped,
            store_errors: counters.store_errors,
            unparseable_timestamps: counters.unparseable_timestamps,
            throughput_eps: round2(throughput_eps),
            avg_latency_ms: round2(avg_latency_ms),
            duplicate_rate_percent: round2(duplicate_rate_percent),
            uptime_seconds: round2(uptime_seconds),
            queue_depth,
            store_row_count,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100f64).round() / 100f64
}
