//! Authentication middleware.
//!
//! Extracts the bearer access token, validates it (signature, expiry, and
//! the session's revocation state through the cache), loads the user row,
//! and injects a [`CurrentUser`] into request extensions for handlers.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use gatehouse_storage::models::User;

use crate::error::AppError;
use crate::state::AppState;

/// The authenticated principal, available to every protected handler.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub session_id: Uuid,
}

/// Pull a bearer token out of the `Authorization` header.
fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// Validate the access token and resolve the current user.
pub async fn authenticate(
    state: &AppState,
    token: &str,
) -> Result<CurrentUser, AppError> {
    let claims = state.sessions.validate_access(token).await?;
    let user = state
        .store
        .user(claims.sub)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| AppError::Unauthenticated("unknown user".to_owned()))?;
    if !user.is_active {
        return Err(AppError::Forbidden("account is locked out".to_owned()));
    }
    Ok(CurrentUser {
        user,
        session_id: claims.sid,
    })
}

/// Middleware guarding the protected route tree.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(&request) else {
        return AppError::Unauthenticated("missing bearer token".to_owned()).into_response();
    };

    match authenticate(&state, &token).await {
        Ok(current) => {
            request.extensions_mut().insert(current);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}
