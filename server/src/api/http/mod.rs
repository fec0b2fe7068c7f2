//! HTTP API handlers

mod environment;
mod health;

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Environment routes
        .route(
            "/environments",
            post(environment::create_environment).get(environment::list_environments),
        )
        .route("/environments/open", post(environment::open_environment))
        .route(
            "/environments/{id}",
            get(environment::get_environment)
                .put(environment::update_environment)
                .delete(environment::delete_environment),
        )
        .route("/environments/{id}/history", get(environment::get_history))
        // Command routes
        .route("/environments/{id}/run", post(environment::run_command))
        .route(
            "/environments/{id}/run/background",
            post(environment::run_background),
        )
        .route("/environments/{id}/env", post(environment::set_env))
        // History routes
        .route("/environments/{id}/revert", post(environment::revert))
        .route("/environments/{id}/fork", post(environment::fork))
        .route("/environments/{id}/checkpoint", post(environment::checkpoint))
        // Advisory lock routes
        .route(
            "/environments/{id}/lock",
            get(environment::get_lock)
                .post(environment::acquire_lock)
                .delete(environment::release_lock),
        );

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Token cancelled when the returned guard drops with the request future
fn request_token() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}
