//! User listing.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Extension, Json, Router};

use gatehouse_storage::models::User;

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/users", get(list))
}

async fn list(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<Vec<User>>, AppError> {
    if !state.checker.check(&current.user, "user.view").await {
        return Err(AppError::Forbidden("user.view required".to_owned()));
    }
    Ok(Json(state.store.list_users().await?))
}
