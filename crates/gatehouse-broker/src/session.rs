//! Live-session state.
//!
//! A [`LiveSession`] is a small state machine — `opening → active →
//! closing → closed` — whose transitions are the only public mutations.
//! Per-session state sits behind its own lock; the broker's registry lock
//! is never held while a session lock is taken.
//!
//! Fan-out uses a broadcast bus: the ingest task publishes frames, every
//! attached client consumes its own subscription. Participant input runs
//! through per-participant bounded channels; the drain task forwards only
//! the current write holder's channel, so non-holders' senders fill up and
//! block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::driver::DriverInput;
use crate::protocol::Frame;
use crate::recording::RecorderHandle;

/// Bus capacity per session; laggards drop frames rather than stall the
/// producer.
const BUS_CAPACITY: usize = 256;

/// Per-participant inbound channel depth. When a non-holder fills theirs,
/// their sends block.
pub(crate) const PARTICIPANT_INPUT_DEPTH: usize = 32;

/// Lifecycle of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Opening,
    Active,
    Closing,
    Closed,
}

/// A participant's standing within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    Write,
    Read,
}

/// Participant summary for APIs.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub is_write_holder: bool,
}

pub(crate) struct Seat {
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
}

/// Commands to the drain task.
pub(crate) enum DrainCmd {
    Attach(Uuid, mpsc::Receiver<Vec<u8>>),
    Detach(Uuid),
    SetHolder(Uuid),
}

pub(crate) struct Inner {
    pub state: SessionState,
    pub write_holder: Uuid,
    pub participants: HashMap<Uuid, Seat>,
    /// Present while active; dropped on close so the driver sees EOF.
    pub input_tx: Option<mpsc::Sender<DriverInput>>,
    pub drain_ctrl: Option<mpsc::UnboundedSender<DrainCmd>>,
    pub recorder: Option<RecorderHandle>,
    pub recording_id: Option<Uuid>,
}

/// One brokered live session.
pub struct LiveSession {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub driver_id: String,
    pub owner_user_id: Uuid,
    pub opened_at: DateTime<Utc>,
    started: Instant,
    idle_anchor_millis: AtomicU64,
    bus: broadcast::Sender<Frame>,
    cancel: CancellationToken,
    pub(crate) inner: Mutex<Inner>,
}

impl LiveSession {
    pub(crate) fn new(connection_id: Uuid, driver_id: &str, owner_user_id: Uuid) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        let now = Utc::now();
        let mut participants = HashMap::new();
        participants.insert(
            owner_user_id,
            Seat {
                role: ParticipantRole::Owner,
                joined_at: now,
            },
        );
        Self {
            id: Uuid::new_v4(),
            connection_id,
            driver_id: driver_id.to_owned(),
            owner_user_id,
            opened_at: now,
            started: Instant::now(),
            idle_anchor_millis: AtomicU64::new(0),
            bus,
            cancel: CancellationToken::new(),
            inner: Mutex::new(Inner {
                state: SessionState::Opening,
                write_holder: owner_user_id,
                participants,
                input_tx: None,
                drain_ctrl: None,
                recorder: None,
                recording_id: None,
            }),
        }
    }

    /// Record traffic: resets the idle clock.
    pub(crate) fn touch(&self) {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.idle_anchor_millis.store(elapsed, Ordering::Relaxed);
    }

    /// Time since the last byte crossed the session.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let anchor = self.idle_anchor_millis.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.saturating_sub(anchor))
    }

    /// Subscribe to the session's frame bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.bus.subscribe()
    }

    /// Publish a frame to every subscriber. A send error just means no
    /// subscriber is currently attached.
    pub(crate) fn publish(&self, frame: Frame) {
        let _ = self.bus.send(frame);
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current state.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Current write holder.
    pub async fn write_holder(&self) -> Uuid {
        self.inner.lock().await.write_holder
    }

    /// Participant list with the write-holder bit set.
    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        let inner = self.inner.lock().await;
        let mut infos: Vec<ParticipantInfo> = inner
            .participants
            .iter()
            .map(|(user_id, seat)| ParticipantInfo {
                user_id: *user_id,
                role: seat.role,
                joined_at: seat.joined_at,
                is_write_holder: *user_id == inner.write_holder,
            })
            .collect();
        infos.sort_by_key(|p| p.joined_at);
        infos
    }

    /// Transition `opening → active`, wiring up the channels the launch
    /// produced. Any other starting state is a bug and is left unchanged.
    pub(crate) async fn activate(
        &self,
        input_tx: mpsc::Sender<DriverInput>,
        drain_ctrl: mpsc::UnboundedSender<DrainCmd>,
        recorder: Option<RecorderHandle>,
        recording_id: Option<Uuid>,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Opening {
            return false;
        }
        inner.state = SessionState::Active;
        inner.input_tx = Some(input_tx);
        inner.drain_ctrl = Some(drain_ctrl);
        inner.recorder = recorder;
        inner.recording_id = recording_id;
        true
    }

    /// Transition into `closing`. Returns `false` when already closing or
    /// closed, making teardown idempotent across the idle timer, explicit
    /// close, admin revoke and shutdown.
    pub(crate) async fn begin_close(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SessionState::Closing | SessionState::Closed => false,
            SessionState::Opening | SessionState::Active => {
                inner.state = SessionState::Closing;
                true
            }
        }
    }

    /// Drop the channels and recorder, ending producer/drain tasks, and
    /// transition to `closed`. Returns the recording ID if one was active.
    pub(crate) async fn finish_close(&self) -> Option<Uuid> {
        self.cancel.cancel();
        let mut inner = self.inner.lock().await;
        inner.state = SessionState::Closed;
        inner.input_tx = None;
        inner.drain_ctrl = None;
        inner.recorder = None;
        inner.recording_id.take()
    }
}

impl std::fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSession")
            .field("id", &self.id)
            .field("driver", &self.driver_id)
            .field("owner", &self.owner_user_id)
            .finish_non_exhaustive()
    }
}
