//! Auth-session routes: list mine, revoke.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/sessions", get(list_mine))
        .route("/v1/sessions/{id}", delete(revoke))
}

/// A session row without its refresh token.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Whether this row backs the caller's current token.
    pub current: bool,
}

async fn list_mine(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<Vec<SessionView>>, AppError> {
    let sessions = state.sessions.list_for_user(current.user.id).await?;
    let views = sessions
        .into_iter()
        .map(|s| SessionView {
            current: s.id == current.session_id,
            id: s.id,
            ip: s.ip,
            user_agent: s.user_agent,
            device: s.device,
            created_at: s.created_at,
            last_used_at: s.last_used_at,
            expires_at: s.expires_at,
            revoked_at: s.revoked_at,
        })
        .collect();
    Ok(Json(views))
}

async fn revoke(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let session = state.sessions.get(id).await?;
    if session.user_id != current.user.id
        && !state.checker.check(&current.user, "session.manage").await
    {
        return Err(AppError::Forbidden(
            "cannot revoke another user's session".to_owned(),
        ));
    }
    state.sessions.revoke(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
