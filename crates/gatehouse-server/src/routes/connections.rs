//! Connection routes: listing, creation, and launch.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gatehouse_broker::LaunchRequest;
use gatehouse_storage::models::Connection;

use crate::error::AppError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/connections", get(list).post(create))
        .route("/v1/connections/{id}/launch", post(launch))
}

#[derive(Debug, Deserialize)]
pub struct CreateConnectionRequest {
    pub name: String,
    pub protocol_id: String,
    pub host: String,
    pub port: i32,
    #[serde(default)]
    pub transport: Option<String>,
    pub default_identity_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    #[serde(default)]
    pub settings: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
pub struct LaunchBody {
    pub identity_id: Option<Uuid>,
    #[serde(default)]
    pub record_consent: bool,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct LaunchResponse {
    pub session_id: Uuid,
    pub ws_url: String,
}

async fn list(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<Vec<Connection>>, AppError> {
    if !state.checker.check(&current.user, "connection.view").await {
        return Err(AppError::Forbidden("connection.view required".to_owned()));
    }
    Ok(Json(state.store.list_connections().await?))
}

async fn create(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Json(body): Json<CreateConnectionRequest>,
) -> Result<(StatusCode, Json<Connection>), AppError> {
    if !state.checker.check(&current.user, "connection.manage").await {
        return Err(AppError::Forbidden("connection.manage required".to_owned()));
    }
    if body.port <= 0 || body.port > i32::from(u16::MAX) {
        return Err(AppError::InvalidInput("port out of range".to_owned()));
    }

    // Let the driver vet its own settings when it implements the facet.
    if let Some(driver) = state.drivers.get(&body.protocol_id) {
        driver
            .validate_config(&body.settings)
            .await
            .map_err(|e| AppError::InvalidInput(e.to_string()))?;
    }

    let connection = Connection {
        id: Uuid::new_v4(),
        name: body.name,
        protocol_id: body.protocol_id,
        host: body.host,
        port: body.port,
        transport: body.transport.unwrap_or_else(|| "tcp".to_owned()),
        default_identity_id: body.default_identity_id,
        team_id: body.team_id,
        settings: body.settings,
        created_at: Utc::now(),
    };
    state.store.insert_connection(&connection).await?;
    Ok((StatusCode::CREATED, Json(connection)))
}

async fn launch(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(body): Json<LaunchBody>,
) -> Result<Json<LaunchResponse>, AppError> {
    let initial_size = match (body.cols, body.rows) {
        (Some(cols), Some(rows)) => Some((cols, rows)),
        _ => None,
    };

    let launched = state
        .broker
        .launch(
            &current.user,
            LaunchRequest {
                connection_id: id,
                identity_id: body.identity_id,
                record_consent: body.record_consent,
                initial_size,
            },
        )
        .await?;

    let session_id = launched.session.id;
    // The opener attaches through the WebSocket; this attachment handle is
    // dropped and the socket re-joins as the owner.
    Ok(Json(LaunchResponse {
        session_id,
        ws_url: format!("/v1/active-sessions/{session_id}/ws"),
    }))
}
