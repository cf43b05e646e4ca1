pub mod handlers;

use axum::Router;
use axum::routing::{delete, get, post};

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sandbox/{id}/repl/start", post(handlers::start_session))
        .route(
            "/sandbox/repl/{session_id}/stream",
            get(handlers::stream_session),
        )
        .route(
            "/sandbox/repl/{session_id}/input",
            post(handlers::send_input),
        )
        .route("/sandbox/repl/{session_id}", delete(handlers::stop_session))
}
