//! Session recording.
//!
//! When policy demands it, the broker tees driver output (and input, when
//! configured) into a writer task appending JSON lines to a file under the
//! recording root. Metadata lives in the `session_recordings` table; the
//! writer finalizes the row when its channel closes. The sweep deletes
//! rows past retention and unlinks their files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use gatehouse_core::maintenance::Sweeper;
use gatehouse_storage::Store;
use gatehouse_storage::models::SessionRecording;

use crate::error::BrokerError;

/// Recording stance, a system setting read at launch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    Disabled,
    Optional,
    Forced,
}

/// The full recording policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingPolicy {
    pub mode: RecordingMode,
    /// Also record the write holder's input stream.
    #[serde(default)]
    pub record_input: bool,
    pub retention_days: u32,
    /// In `optional` mode, record only when the opener consents.
    #[serde(default)]
    pub require_consent: bool,
}

impl Default for RecordingPolicy {
    fn default() -> Self {
        Self {
            mode: RecordingMode::Disabled,
            record_input: false,
            retention_days: 30,
            require_consent: false,
        }
    }
}

impl RecordingPolicy {
    /// Whether a launch with this policy records, given the opener's
    /// consent.
    #[must_use]
    pub fn should_record(&self, consent: bool) -> bool {
        match self.mode {
            RecordingMode::Disabled => false,
            RecordingMode::Forced => true,
            RecordingMode::Optional => consent,
        }
    }
}

/// One recorded traffic event.
pub(crate) enum RecordEvent {
    Output(Vec<u8>),
    Input(Vec<u8>),
}

/// Sender half of the recorder tee. Dropping it finalizes the recording.
#[derive(Clone)]
pub(crate) struct RecorderHandle {
    tx: mpsc::Sender<RecordEvent>,
    record_input: bool,
}

impl RecorderHandle {
    pub fn write_output(&self, data: &[u8]) {
        let _ = self.tx.try_send(RecordEvent::Output(data.to_vec()));
    }

    pub fn write_input(&self, data: &[u8]) {
        if self.record_input {
            let _ = self.tx.try_send(RecordEvent::Input(data.to_vec()));
        }
    }
}

#[derive(Serialize)]
struct RecordLine<'a> {
    /// Milliseconds since the recording started.
    t: u64,
    /// `o` for output, `i` for input.
    d: &'a str,
    /// Base64 payload.
    b: String,
}

/// Start recording a session: inserts the metadata row and spawns the
/// writer task.
///
/// # Errors
///
/// Returns [`BrokerError::RecordingUnavailable`] when the file cannot be
/// created, [`BrokerError::Store`] when the row insert fails.
pub(crate) async fn start(
    store: Arc<dyn Store>,
    root: &Path,
    session_id: Uuid,
    policy: &RecordingPolicy,
) -> Result<(Uuid, RecorderHandle), BrokerError> {
    let recording_id = Uuid::new_v4();
    let path: PathBuf = root.join(format!("{recording_id}.jsonl"));

    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| BrokerError::RecordingUnavailable {
            reason: format!("create recording root: {e}"),
        })?;
    let file = tokio::fs::File::create(&path).await.map_err(|e| {
        BrokerError::RecordingUnavailable {
            reason: format!("create recording file: {e}"),
        }
    })?;

    let row = SessionRecording {
        id: recording_id,
        session_id,
        started_at: Utc::now(),
        ended_at: None,
        storage_uri: path.to_string_lossy().into_owned(),
        size_bytes: 0,
        retention_until: Utc::now() + ChronoDuration::days(i64::from(policy.retention_days)),
    };
    store.insert_recording(&row).await?;

    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(writer(store, recording_id, file, rx));

    info!(recording = %recording_id, session = %session_id, "recording started");
    Ok((
        recording_id,
        RecorderHandle {
            tx,
            record_input: policy.record_input,
        },
    ))
}

async fn writer(
    store: Arc<dyn Store>,
    recording_id: Uuid,
    file: tokio::fs::File,
    mut rx: mpsc::Receiver<RecordEvent>,
) {
    let started = Instant::now();
    let mut out = tokio::io::BufWriter::new(file);
    let mut size: i64 = 0;

    while let Some(event) = rx.recv().await {
        let (direction, data) = match &event {
            RecordEvent::Output(data) => ("o", data),
            RecordEvent::Input(data) => ("i", data),
        };
        let line = RecordLine {
            t: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            d: direction,
            b: STANDARD.encode(data),
        };
        let Ok(mut bytes) = serde_json::to_vec(&line) else {
            continue;
        };
        bytes.push(b'\n');
        if let Err(err) = out.write_all(&bytes).await {
            warn!(recording = %recording_id, error = %err, "recording write failed, stopping");
            break;
        }
        size = size.saturating_add(bytes.len() as i64);
    }

    if let Err(err) = out.flush().await {
        warn!(recording = %recording_id, error = %err, "recording flush failed");
    }
    if let Err(err) = store
        .finalize_recording(recording_id, Utc::now(), size)
        .await
    {
        warn!(recording = %recording_id, error = %err, "recording finalize failed");
    }
    info!(recording = %recording_id, size, "recording finalized");
}

/// Maintenance hook: drop expired recording rows and unlink their files.
pub struct RecordingSweeper {
    store: Arc<dyn Store>,
}

impl RecordingSweeper {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Sweeper for RecordingSweeper {
    fn name(&self) -> &'static str {
        "recordings"
    }

    async fn sweep(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let expired = self.store.delete_expired_recordings(Utc::now()).await?;
        for recording in &expired {
            if let Err(err) = tokio::fs::remove_file(&recording.storage_uri).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(uri = %recording.storage_uri, error = %err, "recording unlink failed");
                }
            }
        }
        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use gatehouse_storage::MemoryStore;
    use gatehouse_storage::RecordingStore;

    #[test]
    fn policy_decisions() {
        let disabled = RecordingPolicy::default();
        assert!(!disabled.should_record(true));

        let forced = RecordingPolicy {
            mode: RecordingMode::Forced,
            ..RecordingPolicy::default()
        };
        assert!(forced.should_record(false));

        let optional = RecordingPolicy {
            mode: RecordingMode::Optional,
            ..RecordingPolicy::default()
        };
        assert!(optional.should_record(true));
        assert!(!optional.should_record(false));
    }

    #[tokio::test]
    async fn record_write_finalize_cycle() {
        let store = Arc::new(MemoryStore::new());
        let dir = std::env::temp_dir().join(format!("gh-rec-{}", Uuid::new_v4()));
        let policy = RecordingPolicy {
            mode: RecordingMode::Forced,
            record_input: true,
            retention_days: 7,
            require_consent: false,
        };

        let session_id = Uuid::new_v4();
        let (recording_id, handle) = start(
            Arc::clone(&store) as Arc<dyn Store>,
            &dir,
            session_id,
            &policy,
        )
        .await
        .unwrap();

        handle.write_output(b"login:");
        handle.write_input(b"admin\n");
        drop(handle);

        // Writer finalizes asynchronously after the channel closes.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let row = store.recording(recording_id).await.unwrap().unwrap();
            if row.ended_at.is_some() {
                assert!(row.size_bytes > 0);
                let contents = tokio::fs::read_to_string(&row.storage_uri).await.unwrap();
                assert_eq!(contents.lines().count(), 2);
                return;
            }
        }
        panic!("recording never finalized");
    }

    #[tokio::test]
    async fn input_suppressed_unless_configured() {
        let store = Arc::new(MemoryStore::new());
        let dir = std::env::temp_dir().join(format!("gh-rec-{}", Uuid::new_v4()));
        let policy = RecordingPolicy {
            mode: RecordingMode::Forced,
            record_input: false,
            retention_days: 7,
            require_consent: false,
        };

        let (recording_id, handle) = start(
            Arc::clone(&store) as Arc<dyn Store>,
            &dir,
            Uuid::new_v4(),
            &policy,
        )
        .await
        .unwrap();
        handle.write_input(b"secret keystrokes");
        handle.write_output(b"shown");
        drop(handle);

        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let row = store.recording(recording_id).await.unwrap().unwrap();
            if row.ended_at.is_some() {
                let contents = tokio::fs::read_to_string(&row.storage_uri).await.unwrap();
                assert_eq!(contents.lines().count(), 1);
                assert!(!contents.contains(&STANDARD.encode(b"secret keystrokes")));
                return;
            }
        }
        panic!("recording never finalized");
    }

    #[tokio::test]
    async fn sweep_removes_expired_rows_and_files() {
        let store = Arc::new(MemoryStore::new());
        let dir = std::env::temp_dir().join(format!("gh-rec-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("old.jsonl");
        tokio::fs::write(&path, b"{}\n").await.unwrap();

        store
            .insert_recording(&SessionRecording {
                id: Uuid::new_v4(),
                session_id: Uuid::new_v4(),
                started_at: Utc::now() - ChronoDuration::days(60),
                ended_at: Some(Utc::now() - ChronoDuration::days(60)),
                storage_uri: path.to_string_lossy().into_owned(),
                size_bytes: 3,
                retention_until: Utc::now() - ChronoDuration::days(30),
            })
            .await
            .unwrap();

        let sweeper = RecordingSweeper::new(Arc::clone(&store) as Arc<dyn Store>);
        assert_eq!(sweeper.sweep().await.unwrap(), 1);
        assert!(!path.exists());
    }
}
