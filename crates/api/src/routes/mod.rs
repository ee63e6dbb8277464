//! HTTP routes

mod admin;
mod health;
mod webhooks;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::require_admin;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/invariants", get(admin::run_invariants))
        .route("/invariants/{check}", get(admin::run_invariant_check))
        .route("/callbacks", get(admin::list_callbacks))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health::health))
        .route("/webhooks/campay", post(webhooks::campay_webhook))
        .nest("/admin", admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
