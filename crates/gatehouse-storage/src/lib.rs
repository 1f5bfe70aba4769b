//! Storage layer for Gatehouse.
//!
//! This crate defines the persistence contracts the rest of the gateway is
//! built against and ships two backends for each:
//!
//! - [`KvStore`] — a small key/value contract with an atomic
//!   counter-with-sliding-window primitive. Powers the rate limiter and the
//!   session token cache. Implemented by [`MemoryKv`] (sharded in-process
//!   hot path) and [`PostgresKv`] (durable, row-locked counters).
//! - The entity store traits ([`UserStore`], [`SessionStore`],
//!   [`VaultStore`], …) — typed repositories for users, teams, roles,
//!   grants, auth sessions, vault identities, connections, settings, audit
//!   rows and recording metadata. Implemented by [`MemoryStore`] (tests and
//!   single-node development) and [`PostgresStore`] (production).
//!
//! This crate knows nothing about HTTP, permissions semantics, or crypto.
//! Vault secret envelopes arrive here already encrypted; refresh tokens
//! arrive as opaque strings.

mod error;
mod kv;
mod memory;
mod memory_kv;
pub mod models;
mod postgres;
mod postgres_kv;
mod store;

pub use error::StoreError;
pub use kv::KvStore;
pub use memory::MemoryStore;
pub use memory_kv::MemoryKv;
pub use postgres::PostgresStore;
pub use postgres_kv::PostgresKv;
pub use store::{
    AuditStore, ConnectionStore, GrantStore, RecordingStore, RoleStore, SessionStore,
    SettingsStore, Store, TeamStore, UserStore, VaultStore,
};
