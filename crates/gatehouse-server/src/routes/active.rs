//! Live-session routes: listing, participants, write token, recording
//! state, termination.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gatehouse_broker::{BrokerError, ParticipantInfo, SessionSummary};
use gatehouse_storage::models::SessionRecording;

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/active-sessions", get(list))
        .route("/v1/active-sessions/{id}", delete(close))
        .route("/v1/active-sessions/{id}/participants", get(participants))
        .route(
            "/v1/active-sessions/{id}/participants/{user_id}",
            delete(remove_participant),
        )
        .route(
            "/v1/active-sessions/{id}/participants/{user_id}/write",
            post(grant_write),
        )
        .route("/v1/active-sessions/{id}/recording", get(recording_state))
        .route("/v1/recordings/{id}/data", get(recording_data))
}

#[derive(Debug, Deserialize, Default)]
pub struct GrantWriteBody {
    /// The holder the caller believes is current; a mismatch means a
    /// concurrent transfer won.
    pub expected_holder: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct RecordingState {
    pub recording: bool,
    pub recordings: Vec<SessionRecording>,
}

async fn list(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<Vec<SessionSummary>>, AppError> {
    let mut sessions = state.broker.list().await;
    if !state
        .checker
        .check(&current.user, "active_session.view")
        .await
    {
        sessions.retain(|s| s.owner_user_id == current.user.id);
    }
    Ok(Json(sessions))
}

async fn close(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let session = state.broker.get(id).await?;
    if session.owner_user_id != current.user.id
        && !state
            .checker
            .check(&current.user, "active_session.manage")
            .await
    {
        return Err(AppError::Forbidden(
            "only the owner can close this session".to_owned(),
        ));
    }
    state.broker.close(id, "closed by user").await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn participants(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ParticipantInfo>>, AppError> {
    let session = state.broker.get(id).await?;
    let participants = session.participants().await;
    let attached = participants.iter().any(|p| p.user_id == current.user.id);
    if !attached
        && !state
            .checker
            .check(&current.user, "active_session.view")
            .await
    {
        return Err(AppError::Forbidden(
            "active_session.view required".to_owned(),
        ));
    }
    Ok(Json(participants))
}

async fn remove_participant(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    if user_id == current.user.id {
        state.broker.leave(id, user_id).await?;
    } else {
        state
            .broker
            .remove_participant(id, &current.user, user_id)
            .await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn grant_write(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<GrantWriteBody>,
) -> Result<StatusCode, AppError> {
    state
        .broker
        .grant_write(id, &current.user, user_id, body.expected_holder)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn recording_state(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<Json<RecordingState>, AppError> {
    let session = state.broker.get(id).await?;
    if session.owner_user_id != current.user.id
        && !state.checker.check(&current.user, "recording.view").await
    {
        return Err(AppError::Forbidden("recording.view required".to_owned()));
    }

    let recordings = state.store.recordings_for_session(id).await?;
    if recordings.is_empty() {
        return Err(AppError::from(BrokerError::NotRecording));
    }
    let live = recordings.iter().any(|r| r.ended_at.is_none());
    Ok(Json(RecordingState {
        recording: live,
        recordings,
    }))
}

/// Stream a finished recording's bytes (JSON lines of timestamped
/// base64 chunks).
async fn recording_data(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    if !state.checker.check(&current.user, "recording.view").await {
        return Err(AppError::Forbidden("recording.view required".to_owned()));
    }
    let recording = state
        .store
        .recording(id)
        .await?
        .ok_or_else(|| AppError::NotFound("recording not found".to_owned()))?;

    let bytes = tokio::fs::read(&recording.storage_uri)
        .await
        .map_err(|e| AppError::Internal(format!("recording read failed: {e}")))?;

    let response = axum::response::Response::builder()
        .header(axum::http::header::CONTENT_TYPE, "application/x-ndjson")
        .body(axum::body::Body::from(bytes))
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(response)
}
