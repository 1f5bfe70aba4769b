//! The live-session WebSocket.
//!
//! One socket per participant. Binary messages carry the frames defined in
//! `gatehouse_broker::protocol`; text messages are ignored, unknown frame
//! types are dropped. Browsers cannot set headers on socket upgrades, so
//! the access token arrives as a `token` query parameter (an
//! `Authorization` header also works for non-browser clients).
//!
//! The owner's socket going away closes the session; other participants
//! just leave.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use gatehouse_broker::protocol::Frame;
use gatehouse_broker::{LaunchedSession, SessionBroker};
use gatehouse_storage::models::User;

use crate::error::AppError;
use crate::middleware::{self, CurrentUser};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/active-sessions/{id}/ws", get(attach))
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

async fn attach(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<WsQuery>,
    headers: axum::http::HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let token = query
        .token
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_owned)
        })
        .ok_or_else(|| AppError::Unauthenticated("missing token".to_owned()))?;

    let CurrentUser { user, .. } = middleware::authenticate(&state, &token).await?;

    // Join before upgrading so authorization failures surface as HTTP
    // errors instead of an immediately-closed socket.
    let attachment = state.broker.join(id, &user).await?;
    let broker = Arc::clone(&state.broker);

    Ok(upgrade.on_upgrade(move |socket| drive_socket(socket, broker, attachment, user)))
}

async fn drive_socket(
    socket: WebSocket,
    broker: Arc<SessionBroker>,
    attachment: LaunchedSession,
    user: User,
) {
    let LaunchedSession {
        session,
        mut frames,
        input,
    } = attachment;
    let session_id = session.id;
    let is_owner = session.owner_user_id == user.id;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outbound = frames.recv() => match outbound {
                Ok(frame) => {
                    let Ok(encoded) = frame.encode() else { continue };
                    let closing = matches!(
                        frame,
                        Frame::Participant(
                            gatehouse_broker::protocol::ParticipantEvent::SessionClosed { .. }
                        )
                    );
                    if sink.send(Message::Binary(encoded.into())).await.is_err() {
                        break;
                    }
                    if closing {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(session = %session_id, missed, "slow session socket dropped frames");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Binary(bytes))) => {
                    match Frame::decode(&bytes) {
                        Ok(Some(frame)) => {
                            handle_inbound(&broker, session_id, &user, &input, frame, &mut sink)
                                .await;
                        }
                        // Unknown frame types are dropped.
                        Ok(None) => {}
                        Err(err) => {
                            debug!(session = %session_id, error = %err, "bad frame, closing socket");
                            break;
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => {}
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            },
        }
    }

    if is_owner {
        let _ = broker.close(session_id, "owner disconnected").await;
    } else {
        let _ = broker.leave(session_id, user.id).await;
    }
}

async fn handle_inbound(
    broker: &SessionBroker,
    session_id: Uuid,
    user: &User,
    input: &tokio::sync::mpsc::Sender<Vec<u8>>,
    frame: Frame,
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
) {
    match frame {
        Frame::Data(data) => {
            // Blocks while this participant is not the write holder and
            // their channel is full — that backpressure is the contract.
            let _ = input.send(data).await;
        }
        Frame::Resize { cols, rows } => {
            let _ = broker.resize(session_id, user.id, cols, rows).await;
        }
        Frame::Ping => {
            if let Ok(encoded) = Frame::Ping.encode() {
                let _ = sink.send(Message::Binary(encoded.into())).await;
            }
        }
        Frame::Chat(message) => {
            // The sender field is server-assigned; clients cannot spoof it.
            let _ = broker.chat(session_id, user.id, message.text).await;
        }
        Frame::Control(request) => {
            let _ = broker.handle_control(session_id, user, request).await;
        }
        // Server → client only; ignore if a client echoes one back.
        Frame::Participant(_) => {}
    }
}
