//! Entity store traits.
//!
//! One trait per aggregate; [`Store`] bundles them so services can hold a
//! single `Arc<dyn Store>`. Relationships are sets of IDs resolved through
//! the store — no in-memory pointer graphs between entities.
//!
//! Every method that reads a single entity returns `Ok(None)` when the row
//! is absent; mapping that to a domain `NotFound` is the caller's job.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::StoreError;
use crate::models::{
    AuditEvent, AuthSession, Connection, ResourceGrant, Role, SessionRecording, Subject, Team,
    User, VaultIdentity, VaultShare,
};

/// User accounts. `email` arguments must already be lower-cased.
#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] on duplicate username or email.
    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;

    async fn user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn user_by_email(&self, email_lower: &str) -> Result<Option<User>, StoreError>;

    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    /// Bind an account to an external provider, refreshing name fields.
    async fn bind_provider(
        &self,
        id: Uuid,
        provider: &str,
        subject: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Record a successful login.
    async fn record_login(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        ip: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// Teams, membership, and team-held roles.
#[async_trait::async_trait]
pub trait TeamStore: Send + Sync {
    async fn insert_team(&self, team: &Team) -> Result<(), StoreError>;

    async fn team(&self, id: Uuid) -> Result<Option<Team>, StoreError>;

    async fn add_team_member(&self, team_id: Uuid, user_id: Uuid) -> Result<(), StoreError>;

    async fn remove_team_member(&self, team_id: Uuid, user_id: Uuid) -> Result<(), StoreError>;

    /// Every team the user belongs to.
    async fn teams_of_user(&self, user_id: Uuid) -> Result<Vec<Team>, StoreError>;

    async fn assign_team_role(&self, team_id: Uuid, role_id: Uuid) -> Result<(), StoreError>;

    async fn team_role_ids(&self, team_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
}

/// Roles and the persisted role→permission closure.
#[async_trait::async_trait]
pub trait RoleStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] on duplicate role name.
    async fn insert_role(&self, role: &Role) -> Result<(), StoreError>;

    async fn role(&self, id: Uuid) -> Result<Option<Role>, StoreError>;

    async fn role_by_name(&self, name: &str) -> Result<Option<Role>, StoreError>;

    async fn delete_role(&self, id: Uuid) -> Result<(), StoreError>;

    async fn assign_user_role(&self, user_id: Uuid, role_id: Uuid) -> Result<(), StoreError>;

    async fn user_role_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// Replace the role's permission set atomically. An evaluator sees the
    /// full old set or the full new set, never a partial view. The caller
    /// passes the closure-expanded set.
    async fn replace_role_permissions(
        &self,
        role_id: Uuid,
        permission_ids: &[String],
    ) -> Result<(), StoreError>;

    async fn role_permission_ids(&self, role_id: Uuid) -> Result<Vec<String>, StoreError>;

    /// Union of permission IDs across the given roles, resolved in one pass.
    async fn permissions_of_roles(
        &self,
        role_ids: &[Uuid],
    ) -> Result<HashSet<String>, StoreError>;
}

/// Resource-scoped permission grants.
#[async_trait::async_trait]
pub trait GrantStore: Send + Sync {
    async fn insert_grant(&self, grant: &ResourceGrant) -> Result<(), StoreError>;

    async fn delete_grant(&self, id: Uuid) -> Result<(), StoreError>;

    /// All grants held by any of the given subjects, including expired ones;
    /// the evaluator applies per-grant expiry.
    async fn grants_for_subjects(
        &self,
        subjects: &[Subject],
    ) -> Result<Vec<ResourceGrant>, StoreError>;

    async fn delete_expired_grants(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Token-bearing auth sessions.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &AuthSession) -> Result<(), StoreError>;

    async fn auth_session(&self, id: Uuid) -> Result<Option<AuthSession>, StoreError>;

    async fn session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<AuthSession>, StoreError>;

    /// Rotate the refresh token, conditioned on the old token still being
    /// current. Returns `false` when another rotation won the race (or the
    /// row is gone) — at most one of two concurrent refreshes succeeds.
    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        old_token: &str,
        new_token: &str,
        last_used_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Set `revoked_at`, returning the revoked row (for cache eviction),
    /// or `None` if the session does not exist.
    async fn revoke_session(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<AuthSession>, StoreError>;

    /// Revoke every active session of a user, returning the affected rows.
    async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<AuthSession>, StoreError>;

    async fn sessions_for_user(&self, user_id: Uuid) -> Result<Vec<AuthSession>, StoreError>;

    /// Remove rows with `expires_at < now` or `revoked_at IS NOT NULL`,
    /// returning them so the caller can evict cache entries and keep the
    /// active-sessions gauge honest.
    async fn delete_dead_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuthSession>, StoreError>;
}

/// Vault identities and shares. Envelopes arrive encrypted.
#[async_trait::async_trait]
pub trait VaultStore: Send + Sync {
    async fn insert_identity(&self, identity: &VaultIdentity) -> Result<(), StoreError>;

    async fn identity(&self, id: Uuid) -> Result<Option<VaultIdentity>, StoreError>;

    async fn update_identity_envelope(
        &self,
        id: Uuid,
        envelope: &str,
        rotated_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn delete_identity(&self, id: Uuid) -> Result<(), StoreError>;

    /// Every identity in the vault. Used by two-phase key rotation.
    async fn list_identities(&self) -> Result<Vec<VaultIdentity>, StoreError>;

    async fn identities_owned_by(&self, user_id: Uuid) -> Result<Vec<VaultIdentity>, StoreError>;

    async fn insert_share(&self, share: &VaultShare) -> Result<(), StoreError>;

    /// Returns `false` if no such share existed.
    async fn delete_share(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn shares_for_identity(&self, identity_id: Uuid) -> Result<Vec<VaultShare>, StoreError>;

    async fn shares_for_subjects(
        &self,
        subjects: &[Subject],
    ) -> Result<Vec<VaultShare>, StoreError>;

    async fn delete_expired_shares(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Connection target records.
#[async_trait::async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn insert_connection(&self, connection: &Connection) -> Result<(), StoreError>;

    async fn connection(&self, id: Uuid) -> Result<Option<Connection>, StoreError>;

    async fn list_connections(&self) -> Result<Vec<Connection>, StoreError>;
}

/// Runtime-mutable system settings.
#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync {
    async fn setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    async fn put_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError>;

    async fn delete_setting(&self, key: &str) -> Result<(), StoreError>;
}

/// Append-only audit log with retention trimming.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError>;

    async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEvent>, StoreError>;

    async fn trim_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Session recording metadata.
#[async_trait::async_trait]
pub trait RecordingStore: Send + Sync {
    async fn insert_recording(&self, recording: &SessionRecording) -> Result<(), StoreError>;

    async fn recording(&self, id: Uuid) -> Result<Option<SessionRecording>, StoreError>;

    async fn finalize_recording(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
        size_bytes: i64,
    ) -> Result<(), StoreError>;

    async fn recordings_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<SessionRecording>, StoreError>;

    /// Remove metadata rows past retention, returning them so the caller
    /// can unlink the recording files.
    async fn delete_expired_recordings(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRecording>, StoreError>;
}

/// The full durable store, one object implementing every entity trait.
pub trait Store:
    UserStore
    + TeamStore
    + RoleStore
    + GrantStore
    + SessionStore
    + VaultStore
    + ConnectionStore
    + SettingsStore
    + AuditStore
    + RecordingStore
    + Send
    + Sync
    + 'static
{
}

impl<T> Store for T where
    T: UserStore
        + TeamStore
        + RoleStore
        + GrantStore
        + SessionStore
        + VaultStore
        + ConnectionStore
        + SettingsStore
        + AuditStore
        + RecordingStore
        + Send
        + Sync
        + 'static
{
}
