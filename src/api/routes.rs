use axum::response::IntoResponse;
use axum::routing::get;
use axum::extract::State;
use axum::{Json, Router};
use hyper::StatusCode;
use hyper::header;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use super::AppState;
use super::middleware;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .merge(super::sandbox::router())
        .merge(super::repl::router())
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "backend": state.supervisor.backend(),
        "sessions": state.supervisor.registry().len().await,
    }))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "message": "Not Found" })),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::records::FileSandboxRepository;
    use crate::sandbox::testing::ScriptedAdapter;
    use crate::supervisor::SandboxSupervisor;

    fn app(tmp: &tempfile::TempDir) -> Router {
        let adapter = Arc::new(ScriptedAdapter::new());
        let records = Arc::new(FileSandboxRepository::new(tmp.path()));
        build_router(AppState {
            supervisor: Arc::new(SandboxSupervisor::new(adapter, records)),
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn create_sandbox(app: &Router) -> String {
        let (status, body) = send(app, "POST", "/sandbox", None).await;
        assert_eq!(status, StatusCode::OK);
        body["sandboxId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, body) = send(&app(&tmp), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["backend"], "container");
    }

    #[tokio::test]
    async fn unknown_path_is_json_404() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, body) = send(&app(&tmp), "GET", "/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn trailing_slash_redirects() {
        let tmp = tempfile::tempdir().unwrap();
        let response = app(&tmp)
            .oneshot(Request::builder().uri("/sandbox/?x=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/sandbox?x=1");
    }

    #[tokio::test]
    async fn sandbox_lifecycle_over_http() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(&tmp);
        let id = create_sandbox(&app).await;

        let (status, body) = send(&app, "GET", "/sandbox", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sandboxes"][0]["id"], id.as_str());

        let (status, body) = send(
            &app,
            "POST",
            &format!("/sandbox/{id}/exec"),
            Some(json!({ "command": "echo hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["stdout"], "hi");
        assert_eq!(body["result"]["stderr"], "");
        assert_eq!(body["result"]["exitCode"], 0);

        let (status, _) = send(&app, "DELETE", &format!("/sandbox?id={id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/sandbox/{id}/exec"),
            Some(json!({ "command": "echo hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn validation_errors_are_400() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(&tmp);
        let id = create_sandbox(&app).await;

        let (status, _) = send(&app, "DELETE", "/sandbox", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            &format!("/sandbox/{id}/exec"),
            Some(json!({ "command": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = send(&app, "POST", &format!("/sandbox/{id}/repl/start"), None).await;
        let session_id = body["sessionId"].as_str().unwrap().to_string();
        let (status, _) = send(
            &app,
            "POST",
            &format!("/sandbox/repl/{session_id}/input"),
            Some(json!({ "input": "" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_of_unknown_session_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, body) = send(&app(&tmp), "GET", "/sandbox/repl/missing/stream", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn repl_session_streams_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(&tmp);
        let id = create_sandbox(&app).await;

        let (status, body) = send(&app, "POST", &format!("/sandbox/{id}/repl/start"), None).await;
        assert_eq!(status, StatusCode::OK);
        let session_id = body["sessionId"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/sandbox/repl/{session_id}/stream"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()["x-accel-buffering"], "no");

        let (status, _) = send(
            &app,
            "POST",
            &format!("/sandbox/repl/{session_id}/input"),
            Some(json!({ "input": "echo 42" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&app, "DELETE", &format!("/sandbox/repl/{session_id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let bytes = tokio::time::timeout(
            Duration::from_secs(2),
            to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .unwrap()
        .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let frames: Vec<Value> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect();

        assert_eq!(frames.first().unwrap()["type"], "connected");
        assert_eq!(frames.last().unwrap()["type"], "end");
        assert!(
            frames
                .iter()
                .any(|f| f["type"] == "output" && f["data"].as_str().unwrap().contains("42"))
        );

        let (status, _) = send(
            &app,
            "POST",
            &format!("/sandbox/repl/{session_id}/input"),
            Some(json!({ "input": "ls" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
