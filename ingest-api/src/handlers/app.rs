use std::convert::Infallible;
use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, routing, Json, Router};
use serde_json::{json, Value};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use ingest_common::health::HealthRegistry;
use ingest_common::metrics::track_metrics;
use ingest_common::queue::EventQueue;
use ingest_common::stats::IngestStats;
use ingest_common::store::EventStore;

use crate::acceptor::IngressAcceptor;

use super::{events, publish, stats};

#[derive(Clone)]
pub struct AppState {
    pub acceptor: IngressAcceptor,
    pub queue: Arc<dyn EventQueue>,
    pub store: Arc<dyn EventStore>,
    pub stats: Arc<IngestStats>,
}

impl AppState {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        store: Arc<dyn EventStore>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            acceptor: IngressAcceptor::new(queue.clone(), stats.clone()),
            queue,
            store,
            stats,
        }
    }
}

pub fn add_routes(
    router: Router,
    state: AppState,
    liveness: HealthRegistry,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router
        .route("/", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .route(
            "/publish",
            routing::post(publish::post)
                .with_state(state.clone())
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/events", routing::get(events::get).with_state(state.clone()))
        .route("/stats", routing::get(stats::get).with_state(state))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
}

pub async fn index() -> Json<Value> {
    Json(json!({"status": "alive", "service": "aggregator"}))
}
