use axum::extract::State;
use axum::Json;

use crate::api::StatsResponse;

use super::AppState;

pub async fn get(State(state): State<AppState>) -> Json<StatsResponse> {
    let snapshot = state
        .stats
        .snapshot(state.queue.as_ref(), state.store.as_ref())
        .await;

    Json(snapshot.into())
}
