pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod models;
pub mod provider;
pub mod quota;
pub mod state;
pub mod streaming;
pub mod telemetry;
pub mod tools;
pub mod translate;
pub mod validate;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.limits.max_body_bytes;
    Router::new()
        .route("/v1/messages", post(handlers::post_messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::post_count_tokens),
        )
        .route("/v1/models", get(handlers::get_models))
        .route("/health", get(handlers::health))
        .route("/admin/quota/reset", post(handlers::post_quota_reset))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
