//! Live-session broker for Gatehouse.
//!
//! Defines the protocol driver contract ([`Driver`], [`Capabilities`]),
//! the driver registry with config-gated enablement and catalog sync, the
//! wire framing shared with the WebSocket layer, session recording, and the
//! broker itself: launch pipeline, participant fan-out, single-write-holder
//! arbitration, idle timeout, and idempotent termination.
//!
//! Wire-protocol drivers beyond the built-in TCP bridge are collaborators:
//! anything implementing [`Driver`] can be registered at boot.

mod broker;
mod driver;
mod error;
pub mod protocol;
mod recording;
mod registry;
mod session;
pub mod tcp;

pub use broker::{LaunchRequest, LaunchedSession, SessionBroker, SessionSummary};
pub use driver::{
    Capabilities, Descriptor, Driver, DriverError, DriverInput, SessionHandle, SessionRequest,
};
pub use error::BrokerError;
pub use recording::{RecordingMode, RecordingPolicy, RecordingSweeper};
pub use registry::{CatalogEntry, DriverRegistry};
pub use session::{LiveSession, ParticipantInfo, ParticipantRole, SessionState};
