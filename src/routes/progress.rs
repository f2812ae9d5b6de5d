use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse,
        Sse,
    },
};
use tracing::info;

use super::RouteState;

/// Stream progress of an upload session
///
/// Each event carries a progress snapshot; the stream ends after a final
/// `complete` or `failed` status. Events produced before the stream is
/// opened are not replayed.
#[utoipa::path(
    get,
    path = "/progress/{session_id}",
    params(("session_id" = String, Path, description = "Upload session to follow")),
    tag = "progress",
    responses(
        (status = 200, description = "SSE events of an upload session"),
    ),
)]
#[axum::debug_handler]
pub async fn progress_stream(
    Path(session_id): Path<String>,
    State(state): State<RouteState>,
) -> impl IntoResponse {
    let mut subscription = state.progress.subscribe(&session_id);
    info!(session_id = %session_id, "progress stream attached");

    let events = async_stream::stream! {
        while let Some(message) = subscription.recv().await {
            yield Event::default().json_data(&message);
        }
        info!(session_id = %subscription.session_id(), "progress stream finished");
    };

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(1))
            .text("keep-alive-text"),
    )
}
