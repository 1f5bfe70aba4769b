//! Entity models persisted by the durable store.
//!
//! All IDs are UUIDs, all timestamps UTC. Secret material only ever appears
//! here in encrypted form (`VaultIdentity::secret_envelope`) or hashed form
//! (`User::password_hash`); the one exception is `AuthSession::refresh_token`,
//! which is an opaque bearer secret matched by indexed equality.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A principal that can hold grants and shares: a user or a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Subject {
    User(Uuid),
    Team(Uuid),
}

impl Subject {
    /// Storage discriminator column value.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Team(_) => "team",
        }
    }

    /// The principal's ID.
    #[must_use]
    pub fn id(&self) -> Uuid {
        match self {
            Self::User(id) | Self::Team(id) => *id,
        }
    }

    /// Rebuild from storage columns. Unknown kinds map to `None`.
    #[must_use]
    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "user" => Some(Self::User(id)),
            "team" => Some(Self::Team(id)),
            _ => None,
        }
    }
}

/// A gateway user account.
///
/// `email` is stored lower-cased; uniqueness is enforced on that form.
/// `auth_provider` is sticky — rebinding a non-local account requires an
/// explicit admin action, not a login.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_active: bool,
    pub is_root: bool,
    /// `local`, `oidc`, `saml`, `ldap`, …
    pub auth_provider: String,
    pub auth_subject: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A team of users. Hierarchy is display-level: a flat set of teams plus an
/// optional parent pointer.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A named bundle of permissions. System roles cannot be deleted.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

/// A permission held by a subject only on a named resource.
///
/// Scoped grants narrow, never widen: they do not substitute for a missing
/// base permission on unrelated resources.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ResourceGrant {
    pub id: Uuid,
    pub subject_kind: String,
    pub subject_id: Uuid,
    pub permission_id: String,
    pub resource_type: String,
    pub resource_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ResourceGrant {
    /// The granting subject, if the stored kind is recognised.
    #[must_use]
    pub fn subject(&self) -> Option<Subject> {
        Subject::from_parts(&self.subject_kind, self.subject_id)
    }

    /// Whether the grant is live at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// A token-bearing login session.
///
/// Active iff `revoked_at IS NULL ∧ expires_at > now`. The refresh token is
/// rotated atomically with `last_used_at` and `expires_at` on every use.
/// This type serializes in full for the session cache; HTTP responses go
/// through a view type that omits the token.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuthSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl AuthSession {
    /// Whether the session is active at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// An encrypted credential held in the vault.
///
/// `secret_envelope` is `nonce ∥ ciphertext ∥ tag` under the active vault
/// key, URL-safe base64 encoded. This crate never sees the plaintext.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct VaultIdentity {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    #[serde(skip)]
    pub secret_envelope: String,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

/// A read grant on a vault identity for a user or team.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct VaultShare {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub subject_kind: String,
    pub subject_id: Uuid,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl VaultShare {
    /// The shared-with subject, if the stored kind is recognised.
    #[must_use]
    pub fn subject(&self) -> Option<Subject> {
        Subject::from_parts(&self.subject_kind, self.subject_id)
    }

    /// Whether the share is live at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// A connection target record, consumed by drivers and permission checks.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Connection {
    pub id: Uuid,
    pub name: String,
    /// Driver/protocol ID, e.g. `tcp`, `ssh`.
    pub protocol_id: String,
    pub host: String,
    pub port: i32,
    /// Transport hint for the driver (`tcp`, `tls`, …).
    pub transport: String,
    pub default_identity_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    /// Driver-specific settings, passed through opaquely.
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A runtime-mutable configuration row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SystemSetting {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// One audit log row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub actor_id: Option<Uuid>,
    /// Dotted action name, e.g. `session.opened`, `vault.read`.
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<Uuid>,
    pub detail: serde_json::Value,
    pub remote_addr: Option<String>,
}

/// Metadata for one recorded live session. The recording bytes live on the
/// filesystem at `storage_uri`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SessionRecording {
    pub id: Uuid,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub storage_uri: String,
    pub size_bytes: i64,
    pub retention_until: DateTime<Utc>,
}
