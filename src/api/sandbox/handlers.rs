use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::{ApiError, AppState, bad_request, error_response};

/// GET /sandbox: active sandboxes, newest first.
pub(crate) async fn list_sandboxes(State(state): State<AppState>) -> Json<Value> {
    let sandboxes = state.supervisor.list_sandboxes().await;
    Json(json!({ "success": true, "sandboxes": sandboxes }))
}

/// POST /sandbox
pub(crate) async fn create_sandbox(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let record = state
        .supervisor
        .provision_sandbox()
        .await
        .map_err(|e| error_response("failed to create sandbox", &e))?;

    Ok(Json(json!({
        "success": true,
        "sandboxId": record.id,
        "backend": record.backend,
    })))
}

#[derive(Deserialize)]
pub(crate) struct DeleteQuery {
    pub id: Option<String>,
}

/// DELETE /sandbox?id=
pub(crate) async fn delete_sandbox(
    State(state): State<AppState>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(id) = query.id.filter(|id| !id.is_empty()) else {
        return Err(bad_request("sandbox id is required"));
    };

    state
        .supervisor
        .destroy_sandbox(&id)
        .await
        .map_err(|e| error_response("failed to delete sandbox", &e))?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub(crate) struct ExecBody {
    #[serde(default)]
    pub command: String,
}

/// POST /sandbox/{id}/exec
pub(crate) async fn exec_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExecBody>,
) -> Result<Json<Value>, ApiError> {
    if body.command.trim().is_empty() {
        return Err(bad_request("command is required"));
    }

    let result = state
        .supervisor
        .run_command(&id, &body.command)
        .await
        .map_err(|e| error_response("failed to execute command", &e))?;

    Ok(Json(json!({ "success": true, "result": result })))
}
