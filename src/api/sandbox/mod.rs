pub mod handlers;

use axum::Router;
use axum::routing::{get, post};

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/sandbox",
            get(handlers::list_sandboxes)
                .post(handlers::create_sandbox)
                .delete(handlers::delete_sandbox),
        )
        .route("/sandbox/{id}/exec", post(handlers::exec_command))
}
