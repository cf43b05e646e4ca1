use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use hyper::header::{self, HeaderName};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::{ApiError, AppState, bad_request, error_response};

/// POST /sandbox/{id}/repl/start
pub(crate) async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = state
        .supervisor
        .open_session(&id)
        .await
        .map_err(|e| error_response("failed to start session", &e))?;

    Ok(Json(json!({ "success": true, "sessionId": session_id })))
}

/// GET /sandbox/repl/{session_id}/stream: one SSE frame per event.
pub(crate) async fn stream_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let events = state
        .supervisor
        .attach_stream(&session_id)
        .await
        .map_err(|e| error_response("session not found", &e))?;

    let stream = events.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().data(data))
    });

    let sse = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15)));

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response())
}

#[derive(Deserialize)]
pub(crate) struct InputBody {
    #[serde(default)]
    pub input: String,
}

/// POST /sandbox/repl/{session_id}/input
pub(crate) async fn send_input(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<InputBody>,
) -> Result<Json<Value>, ApiError> {
    if body.input.is_empty() {
        return Err(bad_request("input is required"));
    }

    state
        .supervisor
        .write_session(&session_id, &body.input)
        .await
        .map_err(|e| error_response("failed to send input", &e))?;

    Ok(Json(json!({ "success": true })))
}

/// DELETE /sandbox/repl/{session_id}
pub(crate) async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    state.supervisor.close_session(&session_id).await;
    Json(json!({ "success": true }))
}
