use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ingest_common::event::ValidationError;
use ingest_common::stats::StatsSnapshot;
use ingest_common::store::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::acceptor::AcceptError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),
    #[error("Internal Broker Error")]
    Broker(#[from] AcceptError),
    #[error("failed to read from the store")]
    Store(#[from] StoreError),
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Broker(_) | ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PublishResponse {
    pub status: String,
    pub id: String,
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct StatsResponse {
    pub uptime_stats: UptimeStats,
    pub performance_metrics: PerformanceMetrics,
    pub system_state: SystemState,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct UptimeStats {
    pub received_api: u64,
    pub processed_worker: u64,
    pub dropped_worker: u64,
    pub unparseable_timestamps: u64,
    pub store_errors: u64,
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct PerformanceMetrics {
    pub throughput_eps: f64,
    pub avg_latency_ms: f64,
    pub duplicate_rate_percent: f64,
    pub uptime_seconds: f64,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SystemState {
    pub database_rows: Option<i64>,
    pub queue_depth: Option<u64>,
}

impl From<StatsSnapshot> for StatsResponse {
    fn from(snapshot: StatsSnapshot) -> Self {
        StatsResponse {
            uptime_stats: UptimeStats {
                received_api: snapshot.received,
                processed_worker: snapshot.unique_processed,
                dropped_worker: snapshot.duplicate_dropped,
                unparseable_timestamps: snapshot.unparseable_timestamps,
                store_errors: snapshot.store_errors,
            },
            performance_metrics: PerformanceMetrics {
                throughput_eps: snapshot.throughput_eps,
                avg_latency_ms: snapshot.avg_latency_ms,
                duplicate_rate_percent: snapshot.duplicate_rate_percent,
                uptime_seconds: snapshot.uptime_seconds,
            },
            system_state: SystemState {
                database_rows: snapshot.store_row_count,
                queue_depth: snapshot.queue_depth,
            },
        }
    }
}
