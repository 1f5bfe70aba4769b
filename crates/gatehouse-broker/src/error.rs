//! Error types for the session broker.

use gatehouse_core::error::VaultError;
use gatehouse_storage::StoreError;

use crate::driver::DriverError;

/// Errors from broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The caller lacks the permission or vault access the operation needs.
    #[error("forbidden")]
    Forbidden,

    /// No such connection, live session, or recording.
    #[error("not found")]
    NotFound,

    /// The caller is attached to the session but may not perform this
    /// operation; only the owner (or a session admin) can.
    #[error("only the session owner can do this")]
    NotOwner,

    /// The target user is not attached to the session.
    #[error("user is not a participant of this session")]
    NotParticipant,

    /// The per-user concurrent live-session limit is reached.
    #[error("concurrent session limit of {limit} reached")]
    ConcurrencyExceeded { limit: u32 },

    /// The connection's protocol has no enabled driver.
    #[error("driver '{driver}' is not available")]
    DriverUnavailable { driver: String },

    /// Boot-time registration collision.
    #[error("driver '{driver}' already registered")]
    DuplicateDriver { driver: String },

    /// The driver refused or failed the launch. The driver's reason is
    /// retained as the cause.
    #[error("launch via driver '{driver}' failed")]
    LaunchFailed {
        driver: String,
        #[source]
        source: DriverError,
    },

    /// A write-token transfer raced a concurrent transfer and lost.
    #[error("write token changed hands concurrently")]
    WriteTokenRaced,

    /// The session is closing or closed.
    #[error("session is closed")]
    Closed,

    /// Recording was requested or required but is not possible.
    #[error("recording unavailable: {reason}")]
    RecordingUnavailable { reason: String },

    /// The session has no recording to operate on.
    #[error("session is not being recorded")]
    NotRecording,

    /// Credential resolution failed.
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// The durable store failed.
    #[error("broker store error: {0}")]
    Store(#[from] StoreError),
}
