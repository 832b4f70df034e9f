use axum::body::Bytes;
use axum::{extract::State, http::StatusCode, Json};
use ingest_common::event::NewEvent;
use tracing::debug;

use crate::api::{ApiError, PublishResponse};

use super::AppState;

/// Accept one event. The body is parsed here rather than with the `Json` extractor so that
/// every malformed payload, including invalid JSON, is a validation error.
pub async fn post(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let event = NewEvent::from_json_slice(&body)?;
    debug!(topic = %event.topic, event_id = %event.event_id, "received event");

    state.acceptor.accept(&event).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            status: "queued".to_owned(),
            id: event.event_id,
        }),
    ))
}
