//! Typed system settings.
//!
//! Runtime-mutable configuration stored as JSON rows in the durable store.
//! Callers that should pick up administrative changes without a redeploy
//! (idle timeout, concurrent-session limit, recording policy) read through
//! this service at use time, not at boot.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use gatehouse_storage::{Store, StoreError};

/// Setting keys. Namespaced `component.name`.
pub mod keys {
    pub const IDLE_TIMEOUT_SECS: &str = "broker.idle_timeout_secs";
    pub const MAX_SESSIONS_PER_USER: &str = "broker.max_sessions_per_user";
    pub const RECORDING_POLICY: &str = "broker.recording_policy";
    pub const ENABLED_DRIVERS: &str = "protocols.enabled";
    pub const VAULT_KEY: &str = "vault.encryption_key";
}

/// Default idle timeout for live sessions: 45 minutes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// Default per-user concurrent live-session limit.
pub const DEFAULT_MAX_SESSIONS_PER_USER: u32 = 10;

/// Reads and writes typed settings.
pub struct SettingsService {
    store: Arc<dyn Store>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Fetch and decode a setting. Absent or undecodable values read as
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the read fails.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        Ok(self
            .store
            .setting(key)
            .await?
            .and_then(|v| serde_json::from_value(v).ok()))
    }

    /// Encode and store a setting.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write fails.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_value(value).map_err(|e| StoreError::Write {
            what: key.to_owned(),
            reason: e.to_string(),
        })?;
        self.store.put_setting(key, &json).await
    }

    /// Remove a setting, falling back to its default.
    ///
    /// # Errors
    ///
    /// Returns the store error if the delete fails.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete_setting(key).await
    }

    /// Idle timeout for live sessions.
    ///
    /// # Errors
    ///
    /// Returns the store error if the read fails.
    pub async fn idle_timeout(&self) -> Result<Duration, StoreError> {
        Ok(self
            .get::<u64>(keys::IDLE_TIMEOUT_SECS)
            .await?
            .map_or(DEFAULT_IDLE_TIMEOUT, Duration::from_secs))
    }

    /// Per-user concurrent live-session limit.
    ///
    /// # Errors
    ///
    /// Returns the store error if the read fails.
    pub async fn max_sessions_per_user(&self) -> Result<u32, StoreError> {
        Ok(self
            .get::<u32>(keys::MAX_SESSIONS_PER_USER)
            .await?
            .unwrap_or(DEFAULT_MAX_SESSIONS_PER_USER))
    }
}

impl std::fmt::Debug for SettingsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsService").finish_non_exhaustive()
    }
}
