//! The session broker.
//!
//! Owns the live-session registry and the launch pipeline: permission
//! check, concurrent-limit enforcement, vault credential resolution, driver
//! launch, registration, recording, and the `session.opened` audit event.
//!
//! Each active session runs one ingest task (driver output → fan-out bus)
//! and one drain task (current write holder's input → driver). An idle
//! watcher closes sessions that carry no traffic for longer than the
//! configured timeout. Termination is idempotent and safe to race from the
//! idle timer, the opener's close, administrative revoke and shutdown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use gatehouse_core::audit::AuditRecorder;
use gatehouse_core::permission::PermissionChecker;
use gatehouse_core::settings::{DEFAULT_IDLE_TIMEOUT, SettingsService, keys};
use gatehouse_core::vault::VaultService;
use gatehouse_storage::Store;
use gatehouse_storage::models::{Connection, User};

use crate::driver::{Driver, DriverError, DriverInput, SessionRequest};
use crate::error::BrokerError;
use crate::protocol::{ChatMessage, ControlRequest, Frame, ParticipantEvent};
use crate::recording::{self, RecorderHandle, RecordingMode, RecordingPolicy};
use crate::registry::DriverRegistry;
use crate::session::{
    DrainCmd, LiveSession, PARTICIPANT_INPUT_DEPTH, ParticipantRole, Seat, SessionState,
};

/// What a launch asks for.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub connection_id: Uuid,
    /// Overrides the connection's default identity.
    pub identity_id: Option<Uuid>,
    /// The opener's consent to recording (required in `optional` mode).
    pub record_consent: bool,
    pub initial_size: Option<(u16, u16)>,
}

/// A participant's attachment to a live session: their outbound frame
/// subscription and inbound data channel.
pub struct LaunchedSession {
    pub session: Arc<LiveSession>,
    pub frames: broadcast::Receiver<Frame>,
    pub input: mpsc::Sender<Vec<u8>>,
}

impl std::fmt::Debug for LaunchedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedSession").finish_non_exhaustive()
    }
}

/// Live-session summary for list endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub driver_id: String,
    pub owner_user_id: Uuid,
    pub opened_at: DateTime<Utc>,
    pub state: SessionState,
    pub participants: usize,
    pub recording: bool,
}

/// The membership registry shared with the per-session background tasks.
/// A single reader-writer lock guards membership; per-session state has
/// its own lock inside [`LiveSession`].
struct LiveRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<LiveSession>>>,
    active_gauge: AtomicI64,
    audit: Arc<AuditRecorder>,
}

impl LiveRegistry {
    async fn get(&self, session_id: Uuid) -> Option<Arc<LiveSession>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Idempotent teardown: state transition, final frame, channel drop,
    /// deregistration, audit, gauge.
    async fn close(&self, session_id: Uuid, reason: &str) -> Result<(), BrokerError> {
        let session = self.get(session_id).await.ok_or(BrokerError::NotFound)?;

        if !session.begin_close().await {
            return Ok(());
        }

        session.publish(Frame::Participant(ParticipantEvent::SessionClosed {
            reason: reason.to_owned(),
        }));
        // Drops the driver input (driver sees EOF), the drain control
        // channel, and the recorder (writer finalizes).
        session.finish_close().await;

        self.sessions.write().await.remove(&session_id);
        self.active_gauge.fetch_sub(1, Ordering::Relaxed);

        self.audit
            .record(
                "session.closed",
                None,
                Some(("connection", session.connection_id)),
                serde_json::json!({ "session": session_id, "reason": reason }),
                None,
            )
            .await;
        info!(session = %session_id, reason, "live session closed");
        Ok(())
    }
}

/// Brokers live sessions between authenticated clients and drivers.
pub struct SessionBroker {
    store: Arc<dyn Store>,
    drivers: Arc<DriverRegistry>,
    checker: Arc<PermissionChecker>,
    vault: Arc<VaultService>,
    settings: Arc<SettingsService>,
    recording_root: PathBuf,
    live: Arc<LiveRegistry>,
    refusing_launches: AtomicBool,
}

impl SessionBroker {
    pub fn new(
        store: Arc<dyn Store>,
        drivers: Arc<DriverRegistry>,
        checker: Arc<PermissionChecker>,
        vault: Arc<VaultService>,
        settings: Arc<SettingsService>,
        audit: Arc<AuditRecorder>,
        recording_root: PathBuf,
    ) -> Self {
        Self {
            store,
            drivers,
            checker,
            vault,
            settings,
            recording_root,
            live: Arc::new(LiveRegistry {
                sessions: RwLock::new(HashMap::new()),
                active_gauge: AtomicI64::new(0),
                audit,
            }),
            refusing_launches: AtomicBool::new(false),
        }
    }

    /// Current number of live sessions.
    #[must_use]
    pub fn active_count(&self) -> i64 {
        self.live.active_gauge.load(Ordering::Relaxed)
    }

    /// Launch pipeline. See the module docs for the step order; failures
    /// before the driver call never invoke the driver.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`], [`BrokerError::ConcurrencyExceeded`],
    /// [`BrokerError::DriverUnavailable`], [`BrokerError::LaunchFailed`],
    /// or store/vault errors.
    pub async fn launch(
        &self,
        user: &User,
        request: LaunchRequest,
    ) -> Result<LaunchedSession, BrokerError> {
        if self.refusing_launches.load(Ordering::Relaxed) {
            return Err(BrokerError::Closed);
        }

        // 1. Resolve the connection.
        let connection = self
            .store
            .connection(request.connection_id)
            .await?
            .ok_or(BrokerError::NotFound)?;

        // 2. connection.launch plus the protocol's connect permission, both
        //    scoped to this connection.
        let proto_permission = format!("{}.connect", connection.protocol_id);
        let allowed = self
            .checker
            .check_resource(user, "connection.launch", "connection", connection.id)
            .await
            && self
                .checker
                .check_resource(user, &proto_permission, "connection", connection.id)
                .await;
        if !allowed {
            return Err(BrokerError::Forbidden);
        }

        // 3. Driver must be registered, available, and config-enabled.
        let driver = self
            .drivers
            .get_enabled(&connection.protocol_id)
            .ok_or_else(|| BrokerError::DriverUnavailable {
                driver: connection.protocol_id.clone(),
            })?;

        // 4. Concurrent limit; the placeholder is registered under the same
        //    write lock that counts, so racing launches cannot overshoot.
        let limit = self.settings.max_sessions_per_user().await?;
        let session = Arc::new(LiveSession::new(
            connection.id,
            &connection.protocol_id,
            user.id,
        ));
        {
            let mut sessions = self.live.sessions.write().await;
            let owned = sessions
                .values()
                .filter(|s| s.owner_user_id == user.id)
                .count();
            if owned >= limit as usize {
                return Err(BrokerError::ConcurrencyExceeded { limit });
            }
            sessions.insert(session.id, Arc::clone(&session));
        }

        match self
            .launch_inner(user, &connection, &*driver, request, &session)
            .await
        {
            Ok(launched) => Ok(launched),
            Err(err) => {
                self.live.sessions.write().await.remove(&session.id);
                Err(err)
            }
        }
    }

    async fn launch_inner(
        &self,
        user: &User,
        connection: &Connection,
        driver: &dyn Driver,
        request: LaunchRequest,
        session: &Arc<LiveSession>,
    ) -> Result<LaunchedSession, BrokerError> {
        let driver_id = connection.protocol_id.clone();

        // 5. Resolve the credential through the vault. The secret flows to
        //    the driver only; it never reaches a client.
        let identity_id = request.identity_id.or(connection.default_identity_id);
        let secret = match identity_id {
            Some(id) => Some(Zeroizing::new(self.vault.read(user, id).await?)),
            None => None,
        };

        // 6. Recording policy is read at launch time, not boot time.
        let policy: RecordingPolicy = self
            .settings
            .get(keys::RECORDING_POLICY)
            .await?
            .unwrap_or_default();
        let caps = driver.capabilities();
        if policy.mode == RecordingMode::Forced && !caps.recording {
            return Err(BrokerError::LaunchFailed {
                driver: driver_id,
                source: DriverError::Config {
                    reason: "recording is forced but the driver cannot record".to_owned(),
                },
            });
        }
        if policy.mode == RecordingMode::Forced
            && policy.require_consent
            && !request.record_consent
        {
            return Err(BrokerError::LaunchFailed {
                driver: driver_id,
                source: DriverError::Config {
                    reason: "recording is forced and requires consent".to_owned(),
                },
            });
        }
        let record = policy.should_record(request.record_consent) && caps.recording;

        // 7. Hand over to the driver.
        let handle = driver
            .launch(SessionRequest {
                connection: connection.clone(),
                secret,
                initial_size: request.initial_size,
            })
            .await
            .map_err(|source| BrokerError::LaunchFailed {
                driver: driver_id.clone(),
                source,
            })?;

        // 8. Recorder, if policy demands one. Forced recording that cannot
        //    start fails the launch; optional recording degrades.
        let mut recorder: Option<RecorderHandle> = None;
        let mut recording_id = None;
        if record {
            match recording::start(
                Arc::clone(&self.store),
                &self.recording_root,
                session.id,
                &policy,
            )
            .await
            {
                Ok((id, handle)) => {
                    recording_id = Some(id);
                    recorder = Some(handle);
                }
                Err(err) if policy.mode == RecordingMode::Forced => return Err(err),
                Err(err) => {
                    warn!(session = %session.id, error = %err, "optional recording unavailable");
                }
            }
        }

        // 9. Wire the tasks and activate.
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        session
            .activate(
                handle.input.clone(),
                ctrl_tx.clone(),
                recorder.clone(),
                recording_id,
            )
            .await;

        let (owner_in_tx, owner_in_rx) = mpsc::channel(PARTICIPANT_INPUT_DEPTH);
        let _ = ctrl_tx.send(DrainCmd::Attach(user.id, owner_in_rx));

        tokio::spawn(ingest(
            Arc::clone(&self.live),
            Arc::clone(session),
            handle.output,
            recorder.clone(),
        ));
        tokio::spawn(drain(
            Arc::clone(session),
            ctrl_rx,
            handle.input,
            recorder,
        ));
        tokio::spawn(idle_watch(
            Arc::clone(&self.live),
            Arc::clone(&self.settings),
            Arc::clone(session),
        ));

        self.live.active_gauge.fetch_add(1, Ordering::Relaxed);

        // 10. Audit.
        self.live
            .audit
            .record(
                "session.opened",
                Some(user.id),
                Some(("connection", connection.id)),
                serde_json::json!({ "driver": driver_id, "session": session.id }),
                None,
            )
            .await;
        info!(session = %session.id, driver = %driver_id, owner = %user.id, "live session opened");

        Ok(LaunchedSession {
            session: Arc::clone(session),
            frames: session.subscribe(),
            input: owner_in_tx,
        })
    }

    /// Fetch a live session.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotFound`] for unknown IDs.
    pub async fn get(&self, session_id: Uuid) -> Result<Arc<LiveSession>, BrokerError> {
        self.live.get(session_id).await.ok_or(BrokerError::NotFound)
    }

    /// Summaries of every live session.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<LiveSession>> =
            self.live.sessions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            let inner = session.inner.lock().await;
            summaries.push(SessionSummary {
                id: session.id,
                connection_id: session.connection_id,
                driver_id: session.driver_id.clone(),
                owner_user_id: session.owner_user_id,
                opened_at: session.opened_at,
                state: inner.state,
                participants: inner.participants.len(),
                recording: inner.recording_id.is_some(),
            });
        }
        summaries.sort_by_key(|s| s.opened_at);
        summaries
    }

    /// Attach a user to a session as a read-only participant. The owner
    /// re-attaches with their original role.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] unless the caller is the owner or holds
    /// `active_session.manage`; [`BrokerError::Closed`] for a session that
    /// is not active.
    pub async fn join(
        &self,
        session_id: Uuid,
        user: &User,
    ) -> Result<LaunchedSession, BrokerError> {
        let session = self.get(session_id).await?;

        let is_owner = session.owner_user_id == user.id;
        if !is_owner && !self.checker.check(user, "active_session.manage").await {
            return Err(BrokerError::Forbidden);
        }
        let role = if is_owner {
            ParticipantRole::Owner
        } else {
            ParticipantRole::Read
        };

        let (in_tx, in_rx) = mpsc::channel(PARTICIPANT_INPUT_DEPTH);
        {
            let mut inner = session.inner.lock().await;
            if inner.state != SessionState::Active {
                return Err(BrokerError::Closed);
            }
            inner.participants.entry(user.id).or_insert(Seat {
                role,
                joined_at: Utc::now(),
            });
            if let Some(ctrl) = &inner.drain_ctrl {
                let _ = ctrl.send(DrainCmd::Attach(user.id, in_rx));
            }
        }

        session.publish(Frame::Participant(ParticipantEvent::Joined {
            user_id: user.id,
            role,
        }));

        Ok(LaunchedSession {
            frames: session.subscribe(),
            input: in_tx,
            session,
        })
    }

    /// Detach a participant who is leaving on their own. If they held the
    /// write token it returns to the owner.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotFound`] / [`BrokerError::NotParticipant`].
    pub async fn leave(&self, session_id: Uuid, user_id: Uuid) -> Result<(), BrokerError> {
        let session = self.get(session_id).await?;
        {
            let mut inner = session.inner.lock().await;
            if inner.participants.remove(&user_id).is_none() {
                return Err(BrokerError::NotParticipant);
            }
            if let Some(ctrl) = &inner.drain_ctrl {
                let _ = ctrl.send(DrainCmd::Detach(user_id));
            }
            if inner.write_holder == user_id {
                inner.write_holder = session.owner_user_id;
                if let Some(ctrl) = &inner.drain_ctrl {
                    let _ = ctrl.send(DrainCmd::SetHolder(session.owner_user_id));
                }
                session.publish(Frame::Participant(ParticipantEvent::WriteGranted {
                    user_id: session.owner_user_id,
                }));
            }
        }
        session.publish(Frame::Participant(ParticipantEvent::Left { user_id }));
        Ok(())
    }

    /// Transfer the write token. `expected_holder` makes racing transfers
    /// explicit: when two race, the one whose expectation still matches
    /// wins and the other observes [`BrokerError::WriteTokenRaced`].
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotOwner`] unless the caller is the owner or a
    /// session admin; [`BrokerError::NotParticipant`] if the grantee is
    /// not attached.
    pub async fn grant_write(
        &self,
        session_id: Uuid,
        actor: &User,
        grantee: Uuid,
        expected_holder: Option<Uuid>,
    ) -> Result<(), BrokerError> {
        let session = self.get(session_id).await?;

        if session.owner_user_id != actor.id
            && !self.checker.check(actor, "active_session.manage").await
        {
            return Err(BrokerError::NotOwner);
        }

        {
            // The per-session lock serialises concurrent transfers.
            let mut inner = session.inner.lock().await;
            if !inner.participants.contains_key(&grantee) {
                return Err(BrokerError::NotParticipant);
            }
            if let Some(expected) = expected_holder {
                if inner.write_holder != expected {
                    return Err(BrokerError::WriteTokenRaced);
                }
            }
            if inner.write_holder == grantee {
                return Ok(());
            }
            inner.write_holder = grantee;
            if let Some(ctrl) = &inner.drain_ctrl {
                let _ = ctrl.send(DrainCmd::SetHolder(grantee));
            }
        }

        session.publish(Frame::Participant(ParticipantEvent::WriteGranted {
            user_id: grantee,
        }));
        Ok(())
    }

    /// Kick a participant. The owner cannot be removed — close the session
    /// instead.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotOwner`] / [`BrokerError::NotParticipant`].
    pub async fn remove_participant(
        &self,
        session_id: Uuid,
        actor: &User,
        target: Uuid,
    ) -> Result<(), BrokerError> {
        let session = self.get(session_id).await?;
        if session.owner_user_id != actor.id
            && !self.checker.check(actor, "active_session.manage").await
        {
            return Err(BrokerError::NotOwner);
        }
        if target == session.owner_user_id {
            return Err(BrokerError::NotOwner);
        }

        {
            let mut inner = session.inner.lock().await;
            if inner.participants.remove(&target).is_none() {
                return Err(BrokerError::NotParticipant);
            }
            if let Some(ctrl) = &inner.drain_ctrl {
                let _ = ctrl.send(DrainCmd::Detach(target));
            }
            if inner.write_holder == target {
                inner.write_holder = session.owner_user_id;
                if let Some(ctrl) = &inner.drain_ctrl {
                    let _ = ctrl.send(DrainCmd::SetHolder(session.owner_user_id));
                }
            }
        }

        session.publish(Frame::Participant(ParticipantEvent::Removed {
            user_id: target,
        }));
        Ok(())
    }

    /// Post a chat line to the session's sibling channel.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotParticipant`] for outsiders.
    pub async fn chat(
        &self,
        session_id: Uuid,
        from: Uuid,
        text: String,
    ) -> Result<(), BrokerError> {
        let session = self.get(session_id).await?;
        if !session.inner.lock().await.participants.contains_key(&from) {
            return Err(BrokerError::NotParticipant);
        }
        session.publish(Frame::Chat(ChatMessage {
            from,
            text,
            sent_at: Utc::now(),
        }));
        Ok(())
    }

    /// Forward a terminal resize from the current write holder.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Forbidden`] when the sender does not hold the write
    /// token.
    pub async fn resize(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        cols: u16,
        rows: u16,
    ) -> Result<(), BrokerError> {
        let session = self.get(session_id).await?;
        let input_tx = {
            let inner = session.inner.lock().await;
            if inner.write_holder != user_id {
                return Err(BrokerError::Forbidden);
            }
            inner.input_tx.clone()
        };
        if let Some(tx) = input_tx {
            let _ = tx.send(DriverInput::Resize { cols, rows }).await;
        }
        Ok(())
    }

    /// Dispatch a control frame from a session socket.
    ///
    /// # Errors
    ///
    /// Propagates the underlying operation's error.
    pub async fn handle_control(
        &self,
        session_id: Uuid,
        actor: &User,
        request: ControlRequest,
    ) -> Result<(), BrokerError> {
        match request {
            ControlRequest::GrantWrite { user_id } => {
                self.grant_write(session_id, actor, user_id, None).await
            }
            ControlRequest::RemoveParticipant { user_id } => {
                self.remove_participant(session_id, actor, user_id).await
            }
        }
    }

    /// Terminate a session. Idempotent: the idle timer, the opener's
    /// explicit close, an administrative revoke, and shutdown can all call
    /// this concurrently; teardown runs once.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotFound`] for unknown IDs (already-closed sessions
    /// return `Ok`).
    pub async fn close(&self, session_id: Uuid, reason: &str) -> Result<(), BrokerError> {
        self.live.close(session_id, reason).await
    }

    /// Graceful shutdown: refuse new launches, give current sessions a
    /// bounded grace to end on their own, then force-close the rest.
    pub async fn shutdown(&self, grace: Duration) {
        self.refusing_launches.store(true, Ordering::Relaxed);

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.live.sessions.read().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining: Vec<Uuid> = self.live.sessions.read().await.keys().copied().collect();
        for session_id in remaining {
            let _ = self.live.close(session_id, "shutdown").await;
        }
    }
}

impl std::fmt::Debug for SessionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBroker")
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

/// Producer task: driver output → recorder tee → fan-out bus.
async fn ingest(
    live: Arc<LiveRegistry>,
    session: Arc<LiveSession>,
    mut output: mpsc::Receiver<Vec<u8>>,
    recorder: Option<RecorderHandle>,
) {
    let cancel = session.cancel_token();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            chunk = output.recv() => match chunk {
                Some(data) => {
                    session.touch();
                    if let Some(recorder) = &recorder {
                        recorder.write_output(&data);
                    }
                    session.publish(Frame::Data(data));
                }
                None => {
                    let _ = live.close(session.id, "driver closed").await;
                    break;
                }
            },
        }
    }
}

/// Drain task: exactly one participant's in-channel — the write holder's —
/// feeds the driver at any instant. Everything a previous holder managed
/// to enqueue is forwarded before the new holder's first byte, because one
/// task forwards sequentially from one channel at a time.
async fn drain(
    session: Arc<LiveSession>,
    mut ctrl: mpsc::UnboundedReceiver<DrainCmd>,
    input: mpsc::Sender<DriverInput>,
    recorder: Option<RecorderHandle>,
) {
    let cancel = session.cancel_token();
    let mut inputs: HashMap<Uuid, mpsc::Receiver<Vec<u8>>> = HashMap::new();
    let mut holder = session.owner_user_id;

    enum Step {
        Cancelled,
        Cmd(Option<DrainCmd>),
        Data(Option<Vec<u8>>),
    }

    loop {
        let step = {
            let holder_rx = inputs.get_mut(&holder);
            tokio::select! {
                () = cancel.cancelled() => Step::Cancelled,
                cmd = ctrl.recv() => Step::Cmd(cmd),
                data = recv_or_pending(holder_rx) => Step::Data(data),
            }
        };

        match step {
            Step::Cancelled | Step::Cmd(None) => break,
            Step::Cmd(Some(DrainCmd::Attach(user_id, rx))) => {
                inputs.insert(user_id, rx);
            }
            Step::Cmd(Some(DrainCmd::Detach(user_id))) => {
                inputs.remove(&user_id);
            }
            Step::Cmd(Some(DrainCmd::SetHolder(user_id))) => {
                holder = user_id;
            }
            Step::Data(Some(data)) => {
                session.touch();
                if let Some(recorder) = &recorder {
                    recorder.write_input(&data);
                }
                if input.send(DriverInput::Data(data)).await.is_err() {
                    break;
                }
            }
            Step::Data(None) => {
                // Holder's socket went away; hold the line until a command
                // reassigns the token or the session closes.
                inputs.remove(&holder);
            }
        }
    }
}

async fn recv_or_pending(rx: Option<&mut mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Closes the session once it has been idle past the configured timeout.
/// The timeout is a system setting, re-read on every check so an admin
/// change applies to running sessions.
async fn idle_watch(
    live: Arc<LiveRegistry>,
    settings: Arc<SettingsService>,
    session: Arc<LiveSession>,
) {
    let cancel = session.cancel_token();
    loop {
        let timeout = settings
            .idle_timeout()
            .await
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);
        let check_every = (timeout / 4)
            .max(Duration::from_millis(50))
            .min(Duration::from_secs(30));

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(check_every) => {
                if session.idle_for() > timeout {
                    let _ = live.close(session.id, "idle timeout").await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering as AtomicOrdering;

    use gatehouse_core::crypto::SecretKey;
    use gatehouse_core::permission::{PermissionDef, RegistryBuilder, Scope};
    use gatehouse_storage::MemoryStore;
    use gatehouse_storage::models::ResourceGrant;
    use gatehouse_storage::{AuditStore, ConnectionStore, GrantStore, RecordingStore, UserStore};

    use crate::testsupport::EchoDriver;

    struct Fixture {
        broker: Arc<SessionBroker>,
        store: Arc<MemoryStore>,
        settings: Arc<SettingsService>,
        driver: Arc<EchoDriver>,
        root: User,
        connection: Connection,
    }

    fn make_user(is_root: bool, name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: name.to_owned(),
            email: format!("{name}@example.com"),
            password_hash: "x".to_owned(),
            first_name: None,
            last_name: None,
            is_active: true,
            is_root,
            auth_provider: "local".to_owned(),
            auth_subject: None,
            last_login_at: None,
            last_login_ip: None,
            created_at: Utc::now(),
        }
    }

    fn make_connection(port: i32) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            name: format!("lab-{port}"),
            protocol_id: "echo".to_owned(),
            host: "127.0.0.1".to_owned(),
            port,
            transport: "tcp".to_owned(),
            default_identity_id: None,
            team_id: None,
            settings: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    /// Tests pass in a tailored registry instead of the built-in one.
    fn test_registry() -> gatehouse_core::permission::Registry {
        let mut builder = RegistryBuilder::new();
        builder
            .register_all([
                PermissionDef::new("connection.view", "connection", Scope::Global, ""),
                PermissionDef::new("connection.launch", "connection", Scope::Resource, "")
                    .depends_on("connection.view"),
                PermissionDef::new("echo.connect", "echo", Scope::Resource, "")
                    .depends_on("connection.launch"),
                PermissionDef::new("active_session.view", "active_session", Scope::Global, ""),
                PermissionDef::new("active_session.manage", "active_session", Scope::Global, "")
                    .depends_on("active_session.view"),
            ])
            .unwrap();
        builder.build().unwrap()
    }

    async fn fixture() -> Fixture {
        fixture_with_driver(EchoDriver::new()).await
    }

    async fn fixture_with_driver(driver: Arc<EchoDriver>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;

        let root = make_user(true, "root");
        store.insert_user(&root).await.unwrap();

        let connection = make_connection(4242);
        store.insert_connection(&connection).await.unwrap();

        let registry = Arc::new(test_registry());
        let checker = Arc::new(PermissionChecker::new(registry, Arc::clone(&store_dyn)));
        let audit = Arc::new(AuditRecorder::new(Arc::clone(&store_dyn), 90));
        let vault = Arc::new(VaultService::new(
            Arc::clone(&store_dyn),
            SecretKey::generate(),
            Arc::clone(&audit),
        ));
        let settings = Arc::new(SettingsService::new(Arc::clone(&store_dyn)));

        let drivers = Arc::new(DriverRegistry::new());
        drivers
            .register(Arc::clone(&driver) as Arc<dyn Driver>)
            .unwrap();

        let broker = Arc::new(SessionBroker::new(
            store_dyn,
            drivers,
            checker,
            vault,
            Arc::clone(&settings),
            audit,
            std::env::temp_dir().join(format!("gh-broker-{}", Uuid::new_v4())),
        ));

        Fixture {
            broker,
            store,
            settings,
            driver,
            root,
            connection,
        }
    }

    fn launch_request(connection_id: Uuid) -> LaunchRequest {
        LaunchRequest {
            connection_id,
            identity_id: None,
            record_consent: false,
            initial_size: None,
        }
    }

    async fn next_data(frames: &mut broadcast::Receiver<Frame>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(Frame::Data(data)) = frames.recv().await {
                    return data;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn launch_echo_roundtrip_and_close() {
        let fx = fixture().await;
        let before = fx.broker.active_count();

        let mut launched = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap();
        assert_eq!(fx.broker.active_count(), before + 1);
        assert_eq!(launched.session.state().await, SessionState::Active);

        launched.input.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(next_data(&mut launched.frames).await, b"ping");

        fx.broker.close(launched.session.id, "test").await.unwrap();
        assert_eq!(fx.broker.active_count(), before);

        let actions: Vec<String> = fx
            .store
            .recent_audit(10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert!(actions.contains(&"session.opened".to_owned()));
        assert!(actions.contains(&"session.closed".to_owned()));
    }

    #[tokio::test]
    async fn close_is_idempotent_while_racing() {
        let fx = fixture().await;
        let launched = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap();
        let id = launched.session.id;

        // Simulated race: explicit close, idle timer, admin revoke.
        let (a, b, c) = tokio::join!(
            fx.broker.close(id, "explicit"),
            fx.broker.close(id, "idle timeout"),
            fx.broker.close(id, "admin"),
        );
        // Whoever found the session succeeded; nobody double-tore-down.
        assert!(a.is_ok() || b.is_ok() || c.is_ok());
        assert_eq!(fx.broker.active_count(), 0);
        assert!(fx.broker.get(id).await.is_err());
    }

    #[tokio::test]
    async fn non_root_without_grants_is_forbidden_and_driver_untouched() {
        let fx = fixture().await;
        let user = make_user(false, "pleb");
        fx.store.insert_user(&user).await.unwrap();

        let err = fx
            .broker
            .launch(&user, launch_request(fx.connection.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Forbidden));
        assert_eq!(fx.driver.launches.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scoped_grants_allow_launch_on_that_connection_only() {
        let fx = fixture().await;
        let user = make_user(false, "operator");
        fx.store.insert_user(&user).await.unwrap();

        for permission in ["connection.launch", "echo.connect"] {
            fx.store
                .insert_grant(&ResourceGrant {
                    id: Uuid::new_v4(),
                    subject_kind: "user".to_owned(),
                    subject_id: user.id,
                    permission_id: permission.to_owned(),
                    resource_type: "connection".to_owned(),
                    resource_id: fx.connection.id,
                    expires_at: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let launched = fx
            .broker
            .launch(&user, launch_request(fx.connection.id))
            .await
            .unwrap();
        fx.broker.close(launched.session.id, "done").await.unwrap();

        let other = make_connection(4243);
        fx.store.insert_connection(&other).await.unwrap();
        assert!(matches!(
            fx.broker.launch(&user, launch_request(other.id)).await,
            Err(BrokerError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn concurrent_limit_refuses_without_invoking_driver() {
        let fx = fixture().await;
        fx.settings
            .put(keys::MAX_SESSIONS_PER_USER, &2u32)
            .await
            .unwrap();

        let first = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap();
        let _second = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap();
        assert_eq!(fx.driver.launches.load(AtomicOrdering::SeqCst), 2);

        let err = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ConcurrencyExceeded { limit: 2 }));
        assert_eq!(fx.driver.launches.load(AtomicOrdering::SeqCst), 2);

        fx.broker.close(first.session.id, "done").await.unwrap();
        assert!(
            fx.broker
                .launch(&fx.root, launch_request(fx.connection.id))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn disabled_driver_is_unavailable() {
        let fx = fixture().await;
        let mut config = HashMap::new();
        config.insert("echo".to_owned(), false);
        fx.broker.drivers.configure(&config);

        assert!(matches!(
            fx.broker
                .launch(&fx.root, launch_request(fx.connection.id))
                .await,
            Err(BrokerError::DriverUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn write_token_gates_input() {
        let fx = fixture().await;
        let guest = make_user(true, "guest");
        fx.store.insert_user(&guest).await.unwrap();

        let mut owner_side = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap();
        let session_id = owner_side.session.id;
        let guest_side = fx.broker.join(session_id, &guest).await.unwrap();

        // Guest has no write token: their bytes must not reach the driver.
        guest_side.input.send(b"guest".to_vec()).await.unwrap();
        owner_side.input.send(b"owner".to_vec()).await.unwrap();
        assert_eq!(next_data(&mut owner_side.frames).await, b"owner");

        // Hand the token over; the guest's queued bytes start draining.
        fx.broker
            .grant_write(session_id, &fx.root, guest.id, Some(fx.root.id))
            .await
            .unwrap();
        assert_eq!(next_data(&mut owner_side.frames).await, b"guest");
    }

    #[tokio::test]
    async fn racing_write_transfer_first_wins() {
        let fx = fixture().await;
        let guest = make_user(true, "guest");
        fx.store.insert_user(&guest).await.unwrap();

        let launched = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap();
        let session_id = launched.session.id;
        fx.broker.join(session_id, &guest).await.unwrap();

        fx.broker
            .grant_write(session_id, &fx.root, guest.id, Some(fx.root.id))
            .await
            .unwrap();
        let err = fx
            .broker
            .grant_write(session_id, &fx.root, fx.root.id, Some(fx.root.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::WriteTokenRaced));
        assert_eq!(launched.session.write_holder().await, guest.id);
    }

    #[tokio::test]
    async fn removed_participant_loses_write_token_to_owner() {
        let fx = fixture().await;
        let guest = make_user(true, "guest");
        fx.store.insert_user(&guest).await.unwrap();

        let launched = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap();
        let session_id = launched.session.id;
        fx.broker.join(session_id, &guest).await.unwrap();
        fx.broker
            .grant_write(session_id, &fx.root, guest.id, None)
            .await
            .unwrap();

        fx.broker
            .remove_participant(session_id, &fx.root, guest.id)
            .await
            .unwrap();
        assert_eq!(launched.session.write_holder().await, fx.root.id);
        assert_eq!(launched.session.participants().await.len(), 1);
    }

    #[tokio::test]
    async fn idle_session_closes_itself() {
        let fx = fixture().await;
        fx.settings.put(keys::IDLE_TIMEOUT_SECS, &0u64).await.unwrap();

        let launched = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap();
        let id = launched.session.id;

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if fx.broker.get(id).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let actions: Vec<String> = fx
            .store
            .recent_audit(10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert!(actions.contains(&"session.closed".to_owned()));
        assert_eq!(fx.broker.active_count(), 0);
    }

    #[tokio::test]
    async fn forced_recording_without_capability_refuses_launch() {
        let fx = fixture_with_driver(EchoDriver::without_recording()).await;
        fx.settings
            .put(
                keys::RECORDING_POLICY,
                &RecordingPolicy {
                    mode: RecordingMode::Forced,
                    record_input: false,
                    retention_days: 7,
                    require_consent: false,
                },
            )
            .await
            .unwrap();

        let err = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::LaunchFailed { .. }));
        assert_eq!(fx.driver.launches.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn forced_recording_records_the_session() {
        let fx = fixture().await;
        fx.settings
            .put(
                keys::RECORDING_POLICY,
                &RecordingPolicy {
                    mode: RecordingMode::Forced,
                    record_input: true,
                    retention_days: 7,
                    require_consent: false,
                },
            )
            .await
            .unwrap();

        let mut launched = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap();
        launched.input.send(b"recorded".to_vec()).await.unwrap();
        assert_eq!(next_data(&mut launched.frames).await, b"recorded");

        let session_id = launched.session.id;
        fx.broker.close(session_id, "done").await.unwrap();

        // Writer finalizes after close drops the recorder handle.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let rows = fx.store.recordings_for_session(session_id).await.unwrap();
                if rows.first().is_some_and(|r| r.ended_at.is_some()) {
                    assert!(rows[0].size_bytes > 0);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn chat_reaches_every_participant() {
        let fx = fixture().await;
        let guest = make_user(true, "guest");
        fx.store.insert_user(&guest).await.unwrap();

        let launched = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap();
        let mut guest_side = fx.broker.join(launched.session.id, &guest).await.unwrap();

        fx.broker
            .chat(launched.session.id, fx.root.id, "anyone there?".to_owned())
            .await
            .unwrap();

        let chat = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(Frame::Chat(message)) = guest_side.frames.recv().await {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(chat.from, fx.root.id);
        assert_eq!(chat.text, "anyone there?");

        let outsider = make_user(false, "outsider");
        fx.store.insert_user(&outsider).await.unwrap();
        assert!(matches!(
            fx.broker
                .chat(launched.session.id, outsider.id, "hi".to_owned())
                .await,
            Err(BrokerError::NotParticipant)
        ));
    }

    #[tokio::test]
    async fn shutdown_refuses_new_launches_and_closes_all() {
        let fx = fixture().await;
        let _launched = fx
            .broker
            .launch(&fx.root, launch_request(fx.connection.id))
            .await
            .unwrap();

        fx.broker.shutdown(Duration::from_millis(50)).await;
        assert_eq!(fx.broker.active_count(), 0);

        assert!(matches!(
            fx.broker
                .launch(&fx.root, launch_request(fx.connection.id))
                .await,
            Err(BrokerError::Closed)
        ));
    }
}
