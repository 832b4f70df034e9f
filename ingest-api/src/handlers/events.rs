use axum::extract::{Query, State};
use axum::Json;
use ingest_common::event::EventRecord;
use serde::Deserialize;

use crate::api::ApiError;

use super::AppState;

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 1000;

#[derive(Deserialize, Debug, Default)]
pub struct ListParams {
    topic: Option<String>,
    limit: Option<i64>,
}

/// List the most recently persisted events, newest first.
pub async fn get(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    let topic = params.topic.as_deref().filter(|topic| !topic.is_empty());
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let events = state.store.list_recent(topic, limit).await?;

    Ok(Json(events))
}
