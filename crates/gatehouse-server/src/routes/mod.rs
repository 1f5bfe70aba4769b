//! Route assembly.
//!
//! Public surface: health, login, refresh, and the session WebSocket
//! (which authenticates itself — browsers cannot set headers on socket
//! upgrades). Everything else sits behind the bearer-token middleware.

pub mod active;
pub mod audit;
pub mod auth;
pub mod connections;
pub mod permissions;
pub mod protocols;
pub mod sessions;
pub mod users;
pub mod vault;
pub mod ws;

use std::sync::Arc;

use axum::http::header;
use axum::middleware as axum_mw;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::middleware::auth_middleware;
use crate::state::AppState;

/// Build the complete router.
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .merge(auth::router())
        .merge(sessions::router())
        .merge(users::router())
        .merge(permissions::router())
        .merge(vault::router())
        .merge(connections::router())
        .merge(active::router())
        .merge(protocols::router())
        .merge(audit::router())
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    // Bound concurrent logins: password hashing is deliberately expensive.
    let public = Router::new()
        .route("/v1/health", get(health))
        .merge(
            auth::public_router()
                .layer(tower::limit::ConcurrencyLimitLayer::new(32)),
        )
        .merge(ws::router());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Liveness probe. No auth, no side effects.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
