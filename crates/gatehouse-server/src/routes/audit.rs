//! Audit log reads.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;

use gatehouse_storage::models::AuditEvent;

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/audit", get(recent))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<u32>,
}

async fn recent(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>, AppError> {
    if !state.checker.check(&current.user, "audit.view").await {
        return Err(AppError::Forbidden("audit.view required".to_owned()));
    }
    let limit = query.limit.unwrap_or(100).min(1000);
    Ok(Json(state.audit.recent(limit).await?))
}
