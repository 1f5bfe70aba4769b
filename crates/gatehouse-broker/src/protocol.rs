//! Wire framing for live sessions.
//!
//! A session WebSocket carries binary frames: one discriminator byte
//! followed by the payload. `data` is raw protocol bytes; `resize` is four
//! big-endian bytes (cols, rows); the sibling channels (`participant`,
//! `chat`, `control`) carry JSON. Frames above [`MAX_FRAME_LEN`] are
//! rejected, frames with an unknown discriminator are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::ParticipantRole;

/// Maximum encoded frame size: 1 MiB.
pub const MAX_FRAME_LEN: usize = 1 << 20;

const TYPE_DATA: u8 = 0x00;
const TYPE_RESIZE: u8 = 0x01;
const TYPE_PING: u8 = 0x02;
const TYPE_PARTICIPANT: u8 = 0x03;
const TYPE_CHAT: u8 = 0x04;
const TYPE_CONTROL: u8 = 0x05;

/// Framing errors. Unknown types are not errors — they decode to `None`.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte bound")]
    TooLarge { len: usize, max: usize },

    #[error("frame is empty")]
    Empty,

    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// One frame on the session socket, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Protocol bytes.
    Data(Vec<u8>),
    /// Terminal geometry change (client → server only).
    Resize { cols: u16, rows: u16 },
    /// Keepalive.
    Ping,
    /// Participant lifecycle event (server → client).
    Participant(ParticipantEvent),
    /// Chat message on the session's sibling channel.
    Chat(ChatMessage),
    /// Participant control request (client → server).
    Control(ControlRequest),
}

/// Participant lifecycle events fanned out to every attached client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ParticipantEvent {
    Joined { user_id: Uuid, role: ParticipantRole },
    Left { user_id: Uuid },
    Removed { user_id: Uuid },
    WriteGranted { user_id: Uuid },
    SessionClosed { reason: String },
}

/// A chat line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: Uuid,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Control requests a client can issue on its session socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    GrantWrite { user_id: Uuid },
    RemoveParticipant { user_id: Uuid },
}

impl Frame {
    /// Encode to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooLarge`] when the payload exceeds the bound
    /// and [`FrameError::Malformed`] when a JSON payload fails to encode.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        match self {
            Self::Data(bytes) => {
                out.reserve(1 + bytes.len());
                out.push(TYPE_DATA);
                out.extend_from_slice(bytes);
            }
            Self::Resize { cols, rows } => {
                out.push(TYPE_RESIZE);
                out.extend_from_slice(&cols.to_be_bytes());
                out.extend_from_slice(&rows.to_be_bytes());
            }
            Self::Ping => out.push(TYPE_PING),
            Self::Participant(event) => {
                out.push(TYPE_PARTICIPANT);
                encode_json(&mut out, "participant", event)?;
            }
            Self::Chat(message) => {
                out.push(TYPE_CHAT);
                encode_json(&mut out, "chat", message)?;
            }
            Self::Control(request) => {
                out.push(TYPE_CONTROL);
                encode_json(&mut out, "control", request)?;
            }
        }

        if out.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                len: out.len(),
                max: MAX_FRAME_LEN,
            });
        }
        Ok(out)
    }

    /// Decode wire bytes. Unknown discriminators decode to `Ok(None)` and
    /// are dropped by the caller.
    ///
    /// # Errors
    ///
    /// - [`FrameError::Empty`] / [`FrameError::TooLarge`] on size bounds.
    /// - [`FrameError::Malformed`] on a bad payload for a known type.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, FrameError> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge {
                len: bytes.len(),
                max: MAX_FRAME_LEN,
            });
        }
        let (&frame_type, payload) = bytes.split_first().ok_or(FrameError::Empty)?;

        match frame_type {
            TYPE_DATA => Ok(Some(Self::Data(payload.to_vec()))),
            TYPE_RESIZE => {
                if payload.len() != 4 {
                    return Err(FrameError::Malformed {
                        kind: "resize",
                        reason: format!("expected 4 payload bytes, got {}", payload.len()),
                    });
                }
                Ok(Some(Self::Resize {
                    cols: u16::from_be_bytes([payload[0], payload[1]]),
                    rows: u16::from_be_bytes([payload[2], payload[3]]),
                }))
            }
            TYPE_PING => Ok(Some(Self::Ping)),
            TYPE_PARTICIPANT => decode_json(payload, "participant").map(Self::Participant).map(Some),
            TYPE_CHAT => decode_json(payload, "chat").map(Self::Chat).map(Some),
            TYPE_CONTROL => decode_json(payload, "control").map(Self::Control).map(Some),
            _ => Ok(None),
        }
    }
}

fn encode_json<T: Serialize>(
    out: &mut Vec<u8>,
    kind: &'static str,
    value: &T,
) -> Result<(), FrameError> {
    serde_json::to_writer(&mut *out, value).map_err(|e| FrameError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

fn decode_json<T: for<'de> Deserialize<'de>>(
    payload: &[u8],
    kind: &'static str,
) -> Result<T, FrameError> {
    serde_json::from_slice(payload).map_err(|e| FrameError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_roundtrips() {
        let frame = Frame::Data(b"ls -la\n".to_vec());
        let encoded = frame.encode().unwrap();
        assert_eq!(Frame::decode(&encoded).unwrap(), Some(frame));
    }

    #[test]
    fn resize_frame_roundtrips() {
        let frame = Frame::Resize { cols: 120, rows: 40 };
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), 5);
        assert_eq!(Frame::decode(&encoded).unwrap(), Some(frame));
    }

    #[test]
    fn chat_frame_roundtrips() {
        let frame = Frame::Chat(ChatMessage {
            from: Uuid::new_v4(),
            text: "anyone else seeing this?".to_owned(),
            sent_at: Utc::now(),
        });
        let encoded = frame.encode().unwrap();
        assert_eq!(Frame::decode(&encoded).unwrap(), Some(frame));
    }

    #[test]
    fn control_frame_roundtrips() {
        let frame = Frame::Control(ControlRequest::GrantWrite {
            user_id: Uuid::new_v4(),
        });
        let encoded = frame.encode().unwrap();
        assert_eq!(Frame::decode(&encoded).unwrap(), Some(frame));
    }

    #[test]
    fn unknown_type_is_dropped_not_fatal() {
        assert_eq!(Frame::decode(&[0x7f, 1, 2, 3]).unwrap(), None);
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(Frame::decode(&[]), Err(FrameError::Empty)));
    }

    #[test]
    fn oversized_frame_is_rejected_both_ways() {
        let frame = Frame::Data(vec![0u8; MAX_FRAME_LEN]);
        assert!(matches!(frame.encode(), Err(FrameError::TooLarge { .. })));

        let wire = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(
            Frame::decode(&wire),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn truncated_resize_is_malformed() {
        assert!(matches!(
            Frame::decode(&[0x01, 0, 120]),
            Err(FrameError::Malformed { kind: "resize", .. })
        ));
    }
}
