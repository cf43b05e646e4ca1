pub mod middleware;
pub mod repl;
mod routes;
pub mod sandbox;

use std::sync::Arc;

use axum::{Json, Router};
use hyper::StatusCode;
use serde_json::{Value, json};

use crate::sandbox::SandboxError;
use crate::supervisor::SandboxSupervisor;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<SandboxSupervisor>,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}

pub(crate) type ApiError = (StatusCode, Json<Value>);

/// Map a core error onto a status code and the `{success: false}` body.
pub(crate) fn error_response(context: &str, e: &SandboxError) -> ApiError {
    let status = if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else if matches!(e, SandboxError::SessionClosed(_)) {
        StatusCode::CONFLICT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "{context}");
    } else {
        tracing::debug!(error = %e, "{context}");
    }
    (
        status,
        Json(json!({
            "success": false,
            "message": context,
            "error": e.to_string(),
        })),
    )
}

pub(crate) fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "message": message })),
    )
}
