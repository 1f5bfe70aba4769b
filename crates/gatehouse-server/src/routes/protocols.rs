//! Protocol catalog.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use gatehouse_broker::CatalogEntry;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/protocols", get(catalog))
}

/// The driver catalog with capability flags and enablement. Also synced
/// into system settings at boot so UIs can render without this call.
async fn catalog(State(state): State<Arc<AppState>>) -> Json<Vec<CatalogEntry>> {
    Json(state.drivers.catalog())
}
