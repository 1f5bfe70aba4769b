//! The protocol driver contract.
//!
//! A driver adapts one backend protocol (SSH, raw TCP, a desktop protocol,
//! a container exec …) to the broker's channel model: one input channel of
//! [`DriverInput`] events, one output channel of raw bytes. Capability
//! flags describe what the driver can do; downstream code branches on the
//! flags, never on the concrete type.
//!
//! `health_check`, `validate_config` and `test_connection` are optional
//! facets with conservative defaults, so minimal drivers stay minimal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use gatehouse_storage::models::Connection;

/// Errors originating inside a driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Could not reach or negotiate with the target.
    #[error("connect failed: {reason}")]
    Connect { reason: String },

    /// The connection's driver settings are invalid.
    #[error("invalid driver config: {reason}")]
    Config { reason: String },

    /// The driver does not implement this optional facet.
    #[error("not supported by this driver")]
    Unsupported,

    /// Transport failure after the session was established.
    #[error("driver i/o error: {reason}")]
    Io { reason: String },
}

/// Static identity of a driver, rendered in the protocol catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Descriptor {
    /// Stable protocol ID, matches `Connection::protocol_id`.
    pub id: String,
    /// Config module name gating enablement.
    pub module: String,
    pub title: String,
    /// `terminal`, `desktop`, `database`, …
    pub category: String,
    pub icon: String,
    pub version: String,
    pub sort_order: i32,
}

/// Feature flags a driver declares.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub terminal: bool,
    pub desktop: bool,
    pub file_transfer: bool,
    pub clipboard: bool,
    pub recording: bool,
    pub metrics: bool,
    pub reconnect: bool,
    /// Driver-specific extras, keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, bool>,
}

/// Events flowing from the broker into a driver.
#[derive(Debug, Clone)]
pub enum DriverInput {
    /// Raw bytes from the current write holder.
    Data(Vec<u8>),
    /// Terminal geometry change.
    Resize { cols: u16, rows: u16 },
}

/// Everything a driver needs to open one session.
pub struct SessionRequest {
    pub connection: Connection,
    /// Decrypted credential from the vault, zeroized on drop. Never
    /// forwarded to clients.
    pub secret: Option<Zeroizing<Vec<u8>>>,
    pub initial_size: Option<(u16, u16)>,
}

impl std::fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRequest")
            .field("connection", &self.connection.id)
            .field("has_secret", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}

/// The duplex handle a successful launch returns.
///
/// Dropping `input` asks the driver to shut down; the driver closing
/// `output` tells the broker the session ended remotely.
pub struct SessionHandle {
    pub input: mpsc::Sender<DriverInput>,
    pub output: mpsc::Receiver<Vec<u8>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").finish_non_exhaustive()
    }
}

/// A pluggable protocol adapter.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    fn descriptor(&self) -> Descriptor;

    fn capabilities(&self) -> Capabilities;

    /// Whether the driver can run in this process (native deps present,
    /// licence accepted, …).
    fn available(&self) -> bool {
        true
    }

    /// Cheap self-check for the catalog and health endpoint.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`] describing the failing dependency.
    async fn health_check(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Validate connection settings before they are persisted.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Config`] on invalid settings.
    async fn validate_config(&self, _settings: &serde_json::Value) -> Result<(), DriverError> {
        Ok(())
    }

    /// Probe the target without opening a full session.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Unsupported`] unless the driver implements
    /// the facet.
    async fn test_connection(&self, _connection: &Connection) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }

    /// Open a live session.
    ///
    /// # Errors
    ///
    /// Returns a [`DriverError`] with the driver's reason; the broker wraps
    /// it with the driver ID.
    async fn launch(&self, request: SessionRequest) -> Result<SessionHandle, DriverError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_default_to_nothing() {
        let caps = Capabilities::default();
        assert!(!caps.terminal);
        assert!(!caps.recording);
        assert!(caps.extras.is_empty());
    }

    #[test]
    fn capabilities_serialize_without_empty_extras() {
        let caps = Capabilities {
            terminal: true,
            ..Capabilities::default()
        };
        let json = serde_json::to_value(&caps).unwrap();
        assert!(json.get("extras").is_none());
        assert_eq!(json.get("terminal"), Some(&serde_json::Value::Bool(true)));
    }
}
