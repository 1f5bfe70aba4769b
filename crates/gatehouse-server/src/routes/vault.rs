//! Vault routes: identity CRUD, secret reads, sharing.
//!
//! Secret payloads travel as UTF-8 when possible, base64 otherwise, with
//! an explicit `encoding` marker either way.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Extension, Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gatehouse_storage::models::{Subject, VaultIdentity, VaultShare};

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/vault/identities", get(list).post(create))
        .route(
            "/v1/vault/identities/{id}",
            get(read).put(update).delete(remove),
        )
        .route(
            "/v1/vault/identities/{id}/shares",
            get(list_shares).post(share),
        )
        .route(
            "/v1/vault/identities/{id}/shares/{share_id}",
            delete(revoke_share),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreateIdentityRequest {
    pub name: String,
    pub secret: String,
    /// `utf8` (default) or `base64`.
    #[serde(default)]
    pub encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateIdentityRequest {
    pub secret: String,
    #[serde(default)]
    pub encoding: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SecretResponse {
    pub id: Uuid,
    pub name: String,
    pub secret: String,
    pub encoding: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ShareRequest {
    pub subject_type: String,
    pub subject_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
}

fn decode_secret(raw: &str, encoding: Option<&str>) -> Result<Vec<u8>, AppError> {
    match encoding {
        None | Some("utf8") => Ok(raw.as_bytes().to_vec()),
        Some("base64") => STANDARD
            .decode(raw)
            .map_err(|e| AppError::InvalidInput(format!("invalid base64 secret: {e}"))),
        Some(other) => Err(AppError::InvalidInput(format!(
            "unknown encoding '{other}'"
        ))),
    }
}

fn encode_secret(plaintext: Vec<u8>) -> (String, &'static str) {
    match String::from_utf8(plaintext) {
        Ok(text) => (text, "utf8"),
        Err(err) => (STANDARD.encode(err.into_bytes()), "base64"),
    }
}

fn parse_subject(kind: &str, id: Uuid) -> Result<Subject, AppError> {
    Subject::from_parts(kind, id)
        .ok_or_else(|| AppError::InvalidInput(format!("unknown subject type '{kind}'")))
}

async fn list(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<Vec<VaultIdentity>>, AppError> {
    Ok(Json(state.vault.list_accessible_by(&current.user).await?))
}

async fn create(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Json(body): Json<CreateIdentityRequest>,
) -> Result<(StatusCode, Json<VaultIdentity>), AppError> {
    if body.name.is_empty() {
        return Err(AppError::InvalidInput("name is required".to_owned()));
    }
    let secret = decode_secret(&body.secret, body.encoding.as_deref())?;
    let identity = state
        .vault
        .create(&current.user, &body.name, &secret)
        .await?;
    Ok((StatusCode::CREATED, Json(identity)))
}

async fn read(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<SecretResponse>, AppError> {
    let identity = state
        .store
        .identity(id)
        .await?
        .ok_or_else(|| AppError::NotFound("vault identity not found".to_owned()))?;
    let plaintext = state.vault.read(&current.user, id).await?;
    let (secret, encoding) = encode_secret(plaintext);
    Ok(Json(SecretResponse {
        id,
        name: identity.name,
        secret,
        encoding,
    }))
}

async fn update(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateIdentityRequest>,
) -> Result<StatusCode, AppError> {
    let secret = decode_secret(&body.secret, body.encoding.as_deref())?;
    state.vault.update(&current.user, id, &secret).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.vault.delete(&current.user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_shares(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<VaultShare>>, AppError> {
    let identity = state
        .store
        .identity(id)
        .await?
        .ok_or_else(|| AppError::NotFound("vault identity not found".to_owned()))?;
    if identity.owner_id != current.user.id {
        return Err(AppError::Forbidden("only the owner sees shares".to_owned()));
    }
    Ok(Json(state.store.shares_for_identity(id).await?))
}

async fn share(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<ShareRequest>,
) -> Result<(StatusCode, Json<VaultShare>), AppError> {
    let subject = parse_subject(&body.subject_type, body.subject_id)?;
    let share = state
        .vault
        .share(&current.user, id, subject, body.expires_at)
        .await?;
    Ok((StatusCode::CREATED, Json(share)))
}

async fn revoke_share(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, share_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state
        .vault
        .revoke_share(&current.user, id, share_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
