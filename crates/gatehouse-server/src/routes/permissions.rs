//! Permission registry and effective-capability routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Extension, Json, Router};
use uuid::Uuid;

use gatehouse_core::permission::{EffectiveCapabilities, PermissionDef};
use gatehouse_storage::models::Subject;

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/permissions/registry", get(registry))
        .route("/v1/permissions/effective/user/{id}", get(effective_user))
        .route("/v1/permissions/effective/team/{id}", get(effective_team))
}

/// The declarative permission tree. Any authenticated caller may read it;
/// it contains no per-principal data.
async fn registry(State(state): State<Arc<AppState>>) -> Json<Vec<PermissionDef>> {
    Json(state.checker.registry().iter().cloned().collect())
}

async fn effective_user(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<EffectiveCapabilities>, AppError> {
    if id != current.user.id && !state.checker.check(&current.user, "user.view").await {
        return Err(AppError::Forbidden(
            "user.view required for other users".to_owned(),
        ));
    }
    let effective = state.checker.effective(Subject::User(id)).await?;
    Ok(Json(effective))
}

async fn effective_team(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<EffectiveCapabilities>, AppError> {
    if !state.checker.check(&current.user, "team.view").await {
        return Err(AppError::Forbidden("team.view required".to_owned()));
    }
    let effective = state.checker.effective(Subject::Team(id)).await?;
    Ok(Json(effective))
}
