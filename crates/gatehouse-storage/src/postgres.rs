//! PostgreSQL entity store.
//!
//! All queries are parameterized sqlx statements. The schema is created by
//! [`PostgresStore::migrate`] with `CREATE TABLE IF NOT EXISTS`, the same
//! self-migration approach the gateway uses for the `cache_entries` table.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use crate::StoreError;
use crate::models::{
    AuditEvent, AuthSession, Connection, ResourceGrant, Role, SessionRecording, Subject, Team,
    User, VaultIdentity, VaultShare,
};
use crate::store::{
    AuditStore, ConnectionStore, GrantStore, RecordingStore, RoleStore, SessionStore,
    SettingsStore, TeamStore, UserStore, VaultStore,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        first_name TEXT,
        last_name TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        is_root BOOLEAN NOT NULL DEFAULT FALSE,
        auth_provider TEXT NOT NULL DEFAULT 'local',
        auth_subject TEXT,
        last_login_at TIMESTAMPTZ,
        last_login_ip TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS teams (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        parent_id UUID REFERENCES teams(id) ON DELETE SET NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS team_members (
        team_id UUID NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        PRIMARY KEY (team_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS roles (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        is_system BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS user_roles (
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        role_id UUID NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        PRIMARY KEY (user_id, role_id)
    )",
    "CREATE TABLE IF NOT EXISTS team_roles (
        team_id UUID NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
        role_id UUID NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        PRIMARY KEY (team_id, role_id)
    )",
    "CREATE TABLE IF NOT EXISTS role_permissions (
        role_id UUID NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        permission_id TEXT NOT NULL,
        PRIMARY KEY (role_id, permission_id)
    )",
    "CREATE TABLE IF NOT EXISTS resource_grants (
        id UUID PRIMARY KEY,
        subject_kind TEXT NOT NULL,
        subject_id UUID NOT NULL,
        permission_id TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        resource_id UUID NOT NULL,
        expires_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_resource_grants_subject
        ON resource_grants (subject_kind, subject_id)",
    "CREATE TABLE IF NOT EXISTS auth_sessions (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        refresh_token TEXT NOT NULL UNIQUE,
        ip TEXT,
        user_agent TEXT,
        device TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        last_used_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        expires_at TIMESTAMPTZ NOT NULL,
        revoked_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_auth_sessions_user ON auth_sessions (user_id)",
    "CREATE TABLE IF NOT EXISTS vault_identities (
        id UUID PRIMARY KEY,
        owner_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        secret_envelope TEXT NOT NULL,
        algorithm TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        rotated_at TIMESTAMPTZ,
        UNIQUE (owner_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS vault_shares (
        id UUID PRIMARY KEY,
        identity_id UUID NOT NULL REFERENCES vault_identities(id) ON DELETE CASCADE,
        subject_kind TEXT NOT NULL,
        subject_id UUID NOT NULL,
        granted_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        expires_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_vault_shares_subject
        ON vault_shares (subject_kind, subject_id)",
    "CREATE TABLE IF NOT EXISTS connections (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        protocol_id TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        transport TEXT NOT NULL DEFAULT 'tcp',
        default_identity_id UUID REFERENCES vault_identities(id) ON DELETE SET NULL,
        team_id UUID REFERENCES teams(id) ON DELETE SET NULL,
        settings JSONB NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS system_settings (
        key TEXT PRIMARY KEY,
        value JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS audit_events (
        id UUID PRIMARY KEY,
        occurred_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        actor_id UUID,
        action TEXT NOT NULL,
        resource_type TEXT,
        resource_id UUID,
        detail JSONB NOT NULL DEFAULT '{}',
        remote_addr TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_events_time ON audit_events (occurred_at)",
    "CREATE TABLE IF NOT EXISTS session_recordings (
        id UUID PRIMARY KEY,
        session_id UUID NOT NULL,
        started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        ended_at TIMESTAMPTZ,
        storage_uri TEXT NOT NULL,
        size_bytes BIGINT NOT NULL DEFAULT 0,
        retention_until TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS cache_entries (
        key TEXT PRIMARY KEY,
        value BYTEA NOT NULL,
        counter BIGINT NOT NULL DEFAULT 0,
        expires_at TIMESTAMPTZ
    )",
];

/// A durable entity store backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

fn read_err(what: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Read {
        what: what.to_owned(),
        reason: e.to_string(),
    }
}

fn delete_err(what: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Delete {
        what: what.to_owned(),
        reason: e.to_string(),
    }
}

impl PostgresStore {
    /// Connect and run the schema migration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Open {
                target: "postgres".to_owned(),
                reason: e.to_string(),
            })?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create all tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] if a DDL statement fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Open {
                    target: "postgres".to_owned(),
                    reason: format!("migration failed: {e}"),
                })?;
        }
        Ok(())
    }

    /// The underlying connection pool (shared with [`crate::PostgresKv`]).
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn subject_params(subjects: &[Subject]) -> (Vec<String>, Vec<Uuid>) {
        subjects
            .iter()
            .map(|s| (s.kind().to_owned(), s.id()))
            .unzip()
    }
}

#[async_trait::async_trait]
impl UserStore for PostgresStore {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, first_name, last_name, \
             is_active, is_root, auth_provider, auth_subject, last_login_at, last_login_ip, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.is_active)
        .bind(user.is_root)
        .bind(&user.auth_provider)
        .bind(&user.auth_subject)
        .bind(user.last_login_at)
        .bind(&user.last_login_ip)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("users", &e))?;
        Ok(())
    }

    async fn user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("users"))
    }

    async fn user_by_email(&self, email_lower: &str) -> Result<Option<User>, StoreError> {
        sqlx::query_as("SELECT * FROM users WHERE email = $1")
            .bind(email_lower)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("users"))
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        sqlx::query_as("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("users"))
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        sqlx::query_as("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("users"))
    }

    async fn bind_provider(
        &self,
        id: Uuid,
        provider: &str,
        subject: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE users SET auth_provider = $2, auth_subject = $3, \
             first_name = COALESCE($4, first_name), last_name = COALESCE($5, last_name) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(provider)
        .bind(subject)
        .bind(first_name)
        .bind(last_name)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("users", &e))?;
        Ok(())
    }

    async fn record_login(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        ip: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET last_login_at = $2, last_login_ip = $3 WHERE id = $1")
            .bind(id)
            .bind(at)
            .bind(ip)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx("users", &e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TeamStore for PostgresStore {
    async fn insert_team(&self, team: &Team) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO teams (id, name, description, parent_id, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(team.id)
        .bind(&team.name)
        .bind(&team.description)
        .bind(team.parent_id)
        .bind(team.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("teams", &e))?;
        Ok(())
    }

    async fn team(&self, id: Uuid) -> Result<Option<Team>, StoreError> {
        sqlx::query_as("SELECT * FROM teams WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("teams"))
    }

    async fn add_team_member(&self, team_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO team_members (team_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(team_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("team_members", &e))?;
        Ok(())
    }

    async fn remove_team_member(&self, team_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM team_members WHERE team_id = $1 AND user_id = $2")
            .bind(team_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(delete_err("team_members"))?;
        Ok(())
    }

    async fn teams_of_user(&self, user_id: Uuid) -> Result<Vec<Team>, StoreError> {
        sqlx::query_as(
            "SELECT t.* FROM teams t \
             JOIN team_members m ON m.team_id = t.id \
             WHERE m.user_id = $1 ORDER BY t.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err("teams"))
    }

    async fn assign_team_role(&self, team_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO team_roles (team_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(team_id)
        .bind(role_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("team_roles", &e))?;
        Ok(())
    }

    async fn team_role_ids(&self, team_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT role_id FROM team_roles WHERE team_id = $1")
                .bind(team_id)
                .fetch_all(&self.pool)
                .await
                .map_err(read_err("team_roles"))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait::async_trait]
impl RoleStore for PostgresStore {
    async fn insert_role(&self, role: &Role) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO roles (id, name, is_system, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(role.id)
        .bind(&role.name)
        .bind(role.is_system)
        .bind(role.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("roles", &e))?;
        Ok(())
    }

    async fn role(&self, id: Uuid) -> Result<Option<Role>, StoreError> {
        sqlx::query_as("SELECT * FROM roles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("roles"))
    }

    async fn role_by_name(&self, name: &str) -> Result<Option<Role>, StoreError> {
        sqlx::query_as("SELECT * FROM roles WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("roles"))
    }

    async fn delete_role(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(delete_err("roles"))?;
        Ok(())
    }

    async fn assign_user_role(&self, user_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(role_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("user_roles", &e))?;
        Ok(())
    }

    async fn user_role_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT role_id FROM user_roles WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
                .map_err(read_err("user_roles"))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn replace_role_permissions(
        &self,
        role_id: Uuid,
        permission_ids: &[String],
    ) -> Result<(), StoreError> {
        let wrap = |e: sqlx::Error| StoreError::Write {
            what: "role_permissions".to_owned(),
            reason: e.to_string(),
        };

        // Single transaction: evaluators see the old set or the new set.
        let mut tx = self.pool.begin().await.map_err(wrap)?;
        sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;
        for permission_id in permission_ids {
            sqlx::query(
                "INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2)",
            )
            .bind(role_id)
            .bind(permission_id)
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;
        }
        tx.commit().await.map_err(wrap)
    }

    async fn role_permission_ids(&self, role_id: Uuid) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT permission_id FROM role_permissions WHERE role_id = $1 ORDER BY permission_id",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err("role_permissions"))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn permissions_of_roles(
        &self,
        role_ids: &[Uuid],
    ) -> Result<HashSet<String>, StoreError> {
        if role_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT permission_id FROM role_permissions WHERE role_id = ANY($1)",
        )
        .bind(role_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err("role_permissions"))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait::async_trait]
impl GrantStore for PostgresStore {
    async fn insert_grant(&self, grant: &ResourceGrant) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO resource_grants \
             (id, subject_kind, subject_id, permission_id, resource_type, resource_id, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(grant.id)
        .bind(&grant.subject_kind)
        .bind(grant.subject_id)
        .bind(&grant.permission_id)
        .bind(&grant.resource_type)
        .bind(grant.resource_id)
        .bind(grant.expires_at)
        .bind(grant.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("resource_grants", &e))?;
        Ok(())
    }

    async fn delete_grant(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM resource_grants WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(delete_err("resource_grants"))?;
        Ok(())
    }

    async fn grants_for_subjects(
        &self,
        subjects: &[Subject],
    ) -> Result<Vec<ResourceGrant>, StoreError> {
        if subjects.is_empty() {
            return Ok(Vec::new());
        }
        let (kinds, ids) = Self::subject_params(subjects);
        sqlx::query_as(
            "SELECT g.* FROM resource_grants g \
             JOIN unnest($1::text[], $2::uuid[]) AS s(kind, id) \
             ON g.subject_kind = s.kind AND g.subject_id = s.id",
        )
        .bind(&kinds)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err("resource_grants"))
    }

    async fn delete_expired_grants(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM resource_grants WHERE expires_at IS NOT NULL AND expires_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(delete_err("resource_grants"))?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl SessionStore for PostgresStore {
    async fn insert_session(&self, session: &AuthSession) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auth_sessions \
             (id, user_id, refresh_token, ip, user_agent, device, created_at, last_used_at, expires_at, revoked_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.refresh_token)
        .bind(&session.ip)
        .bind(&session.user_agent)
        .bind(&session.device)
        .bind(session.created_at)
        .bind(session.last_used_at)
        .bind(session.expires_at)
        .bind(session.revoked_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("auth_sessions", &e))?;
        Ok(())
    }

    async fn auth_session(&self, id: Uuid) -> Result<Option<AuthSession>, StoreError> {
        sqlx::query_as("SELECT * FROM auth_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("auth_sessions"))
    }

    async fn session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<AuthSession>, StoreError> {
        sqlx::query_as("SELECT * FROM auth_sessions WHERE refresh_token = $1")
            .bind(refresh_token)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("auth_sessions"))
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        old_token: &str,
        new_token: &str,
        last_used_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // Conditioned on the old token: of two racing refreshes, exactly one
        // matches a row.
        let result = sqlx::query(
            "UPDATE auth_sessions \
             SET refresh_token = $3, last_used_at = $4, expires_at = $5 \
             WHERE id = $1 AND refresh_token = $2 AND revoked_at IS NULL",
        )
        .bind(id)
        .bind(old_token)
        .bind(new_token)
        .bind(last_used_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("auth_sessions", &e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_session(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<AuthSession>, StoreError> {
        sqlx::query_as(
            "UPDATE auth_sessions SET revoked_at = COALESCE(revoked_at, $2) \
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("auth_sessions", &e))
    }

    async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<AuthSession>, StoreError> {
        sqlx::query_as(
            "UPDATE auth_sessions SET revoked_at = $2 \
             WHERE user_id = $1 AND revoked_at IS NULL RETURNING *",
        )
        .bind(user_id)
        .bind(at)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("auth_sessions", &e))
    }

    async fn sessions_for_user(&self, user_id: Uuid) -> Result<Vec<AuthSession>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM auth_sessions WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err("auth_sessions"))
    }

    async fn delete_dead_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuthSession>, StoreError> {
        sqlx::query_as(
            "DELETE FROM auth_sessions \
             WHERE expires_at < $1 OR revoked_at IS NOT NULL RETURNING *",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(delete_err("auth_sessions"))
    }
}

#[async_trait::async_trait]
impl VaultStore for PostgresStore {
    async fn insert_identity(&self, identity: &VaultIdentity) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO vault_identities \
             (id, owner_id, name, secret_envelope, algorithm, created_at, rotated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(identity.id)
        .bind(identity.owner_id)
        .bind(&identity.name)
        .bind(&identity.secret_envelope)
        .bind(&identity.algorithm)
        .bind(identity.created_at)
        .bind(identity.rotated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("vault_identities", &e))?;
        Ok(())
    }

    async fn identity(&self, id: Uuid) -> Result<Option<VaultIdentity>, StoreError> {
        sqlx::query_as("SELECT * FROM vault_identities WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("vault_identities"))
    }

    async fn update_identity_envelope(
        &self,
        id: Uuid,
        envelope: &str,
        rotated_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE vault_identities \
             SET secret_envelope = $2, rotated_at = COALESCE($3, rotated_at) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(envelope)
        .bind(rotated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("vault_identities", &e))?;
        Ok(())
    }

    async fn delete_identity(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM vault_identities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(delete_err("vault_identities"))?;
        Ok(())
    }

    async fn list_identities(&self) -> Result<Vec<VaultIdentity>, StoreError> {
        sqlx::query_as("SELECT * FROM vault_identities ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("vault_identities"))
    }

    async fn identities_owned_by(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<VaultIdentity>, StoreError> {
        sqlx::query_as("SELECT * FROM vault_identities WHERE owner_id = $1 ORDER BY name")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("vault_identities"))
    }

    async fn insert_share(&self, share: &VaultShare) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO vault_shares \
             (id, identity_id, subject_kind, subject_id, granted_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(share.id)
        .bind(share.identity_id)
        .bind(&share.subject_kind)
        .bind(share.subject_id)
        .bind(share.granted_at)
        .bind(share.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("vault_shares", &e))?;
        Ok(())
    }

    async fn delete_share(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM vault_shares WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(delete_err("vault_shares"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn shares_for_identity(
        &self,
        identity_id: Uuid,
    ) -> Result<Vec<VaultShare>, StoreError> {
        sqlx::query_as("SELECT * FROM vault_shares WHERE identity_id = $1")
            .bind(identity_id)
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("vault_shares"))
    }

    async fn shares_for_subjects(
        &self,
        subjects: &[Subject],
    ) -> Result<Vec<VaultShare>, StoreError> {
        if subjects.is_empty() {
            return Ok(Vec::new());
        }
        let (kinds, ids) = Self::subject_params(subjects);
        sqlx::query_as(
            "SELECT v.* FROM vault_shares v \
             JOIN unnest($1::text[], $2::uuid[]) AS s(kind, id) \
             ON v.subject_kind = s.kind AND v.subject_id = s.id",
        )
        .bind(&kinds)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err("vault_shares"))
    }

    async fn delete_expired_shares(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM vault_shares WHERE expires_at IS NOT NULL AND expires_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(delete_err("vault_shares"))?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl ConnectionStore for PostgresStore {
    async fn insert_connection(&self, connection: &Connection) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO connections \
             (id, name, protocol_id, host, port, transport, default_identity_id, team_id, settings, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(connection.id)
        .bind(&connection.name)
        .bind(&connection.protocol_id)
        .bind(&connection.host)
        .bind(connection.port)
        .bind(&connection.transport)
        .bind(connection.default_identity_id)
        .bind(connection.team_id)
        .bind(&connection.settings)
        .bind(connection.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("connections", &e))?;
        Ok(())
    }

    async fn connection(&self, id: Uuid) -> Result<Option<Connection>, StoreError> {
        sqlx::query_as("SELECT * FROM connections WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("connections"))
    }

    async fn list_connections(&self) -> Result<Vec<Connection>, StoreError> {
        sqlx::query_as("SELECT * FROM connections ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("connections"))
    }
}

#[async_trait::async_trait]
impl SettingsStore for PostgresStore {
    async fn setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT value FROM system_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(read_err("system_settings"))?;
        Ok(row.map(|(v,)| v))
    }

    async fn put_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO system_settings (key, value, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("system_settings", &e))?;
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM system_settings WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(delete_err("system_settings"))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuditStore for PostgresStore {
    async fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_events \
             (id, occurred_at, actor_id, action, resource_type, resource_id, detail, remote_addr) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(event.id)
        .bind(event.occurred_at)
        .bind(event.actor_id)
        .bind(&event.action)
        .bind(&event.resource_type)
        .bind(event.resource_id)
        .bind(&event.detail)
        .bind(&event.remote_addr)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("audit_events", &e))?;
        Ok(())
    }

    async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEvent>, StoreError> {
        sqlx::query_as("SELECT * FROM audit_events ORDER BY occurred_at DESC LIMIT $1")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(read_err("audit_events"))
    }

    async fn trim_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM audit_events WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(delete_err("audit_events"))?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl RecordingStore for PostgresStore {
    async fn insert_recording(&self, recording: &SessionRecording) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO session_recordings \
             (id, session_id, started_at, ended_at, storage_uri, size_bytes, retention_until) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(recording.id)
        .bind(recording.session_id)
        .bind(recording.started_at)
        .bind(recording.ended_at)
        .bind(&recording.storage_uri)
        .bind(recording.size_bytes)
        .bind(recording.retention_until)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("session_recordings", &e))?;
        Ok(())
    }

    async fn recording(&self, id: Uuid) -> Result<Option<SessionRecording>, StoreError> {
        sqlx::query_as("SELECT * FROM session_recordings WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err("session_recordings"))
    }

    async fn finalize_recording(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
        size_bytes: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE session_recordings SET ended_at = $2, size_bytes = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(ended_at)
        .bind(size_bytes)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx("session_recordings", &e))?;
        Ok(())
    }

    async fn recordings_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<SessionRecording>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM session_recordings WHERE session_id = $1 ORDER BY started_at",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err("session_recordings"))
    }

    async fn delete_expired_recordings(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRecording>, StoreError> {
        sqlx::query_as(
            "DELETE FROM session_recordings WHERE retention_until < $1 RETURNING *",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(delete_err("session_recordings"))
    }
}
