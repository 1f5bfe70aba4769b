//! In-memory entity store.
//!
//! Backs unit tests and single-node development. All state lives behind one
//! `RwLock`; the write paths are short and the store is not a hot path —
//! request-rate data goes through [`crate::MemoryKv`] instead.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
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

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    teams: HashMap<Uuid, Team>,
    team_members: HashMap<Uuid, HashSet<Uuid>>,
    team_roles: HashMap<Uuid, HashSet<Uuid>>,
    roles: HashMap<Uuid, Role>,
    user_roles: HashMap<Uuid, HashSet<Uuid>>,
    role_permissions: HashMap<Uuid, HashSet<String>>,
    grants: HashMap<Uuid, ResourceGrant>,
    sessions: HashMap<Uuid, AuthSession>,
    identities: HashMap<Uuid, VaultIdentity>,
    shares: HashMap<Uuid, VaultShare>,
    connections: HashMap<Uuid, Connection>,
    settings: HashMap<String, serde_json::Value>,
    audit: Vec<AuditEvent>,
    recordings: HashMap<Uuid, SessionRecording>,
}

/// An in-memory implementation of every entity store trait.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl UserStore for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.users.values().any(|u| u.username == user.username) {
            return Err(StoreError::Conflict {
                what: format!("users.username={}", user.username),
            });
        }
        if inner.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict {
                what: format!("users.email={}", user.email),
            });
        }
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn user_by_email(&self, email_lower: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.email == email_lower)
            .cloned())
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let inner = self.inner.read().await;
        let mut users: Vec<User> = inner.users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn bind_provider(
        &self,
        id: Uuid,
        provider: &str,
        subject: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(user) = inner.users.get_mut(&id) {
            user.auth_provider = provider.to_owned();
            user.auth_subject = Some(subject.to_owned());
            if let Some(first) = first_name {
                user.first_name = Some(first.to_owned());
            }
            if let Some(last) = last_name {
                user.last_name = Some(last.to_owned());
            }
        }
        Ok(())
    }

    async fn record_login(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        ip: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(user) = inner.users.get_mut(&id) {
            user.last_login_at = Some(at);
            user.last_login_ip = ip.map(str::to_owned);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TeamStore for MemoryStore {
    async fn insert_team(&self, team: &Team) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.teams.values().any(|t| t.name == team.name) {
            return Err(StoreError::Conflict {
                what: format!("teams.name={}", team.name),
            });
        }
        inner.teams.insert(team.id, team.clone());
        Ok(())
    }

    async fn team(&self, id: Uuid) -> Result<Option<Team>, StoreError> {
        Ok(self.inner.read().await.teams.get(&id).cloned())
    }

    async fn add_team_member(&self, team_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.team_members.entry(team_id).or_default().insert(user_id);
        Ok(())
    }

    async fn remove_team_member(&self, team_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.team_members.get_mut(&team_id) {
            members.remove(&user_id);
        }
        Ok(())
    }

    async fn teams_of_user(&self, user_id: Uuid) -> Result<Vec<Team>, StoreError> {
        let inner = self.inner.read().await;
        let mut teams: Vec<Team> = inner
            .team_members
            .iter()
            .filter(|(_, members)| members.contains(&user_id))
            .filter_map(|(team_id, _)| inner.teams.get(team_id).cloned())
            .collect();
        teams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(teams)
    }

    async fn assign_team_role(&self, team_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.team_roles.entry(team_id).or_default().insert(role_id);
        Ok(())
    }

    async fn team_role_ids(&self, team_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .team_roles
            .get(&team_id)
            .map(|roles| roles.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl RoleStore for MemoryStore {
    async fn insert_role(&self, role: &Role) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.roles.values().any(|r| r.name == role.name) {
            return Err(StoreError::Conflict {
                what: format!("roles.name={}", role.name),
            });
        }
        inner.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn role(&self, id: Uuid) -> Result<Option<Role>, StoreError> {
        Ok(self.inner.read().await.roles.get(&id).cloned())
    }

    async fn role_by_name(&self, name: &str) -> Result<Option<Role>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.roles.values().find(|r| r.name == name).cloned())
    }

    async fn delete_role(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.roles.remove(&id);
        inner.role_permissions.remove(&id);
        for roles in inner.user_roles.values_mut() {
            roles.remove(&id);
        }
        for roles in inner.team_roles.values_mut() {
            roles.remove(&id);
        }
        Ok(())
    }

    async fn assign_user_role(&self, user_id: Uuid, role_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.user_roles.entry(user_id).or_default().insert(role_id);
        Ok(())
    }

    async fn user_role_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .user_roles
            .get(&user_id)
            .map(|roles| roles.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn replace_role_permissions(
        &self,
        role_id: Uuid,
        permission_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .role_permissions
            .insert(role_id, permission_ids.iter().cloned().collect());
        Ok(())
    }

    async fn role_permission_ids(&self, role_id: Uuid) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .role_permissions
            .get(&role_id)
            .map(|perms| perms.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn permissions_of_roles(
        &self,
        role_ids: &[Uuid],
    ) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut out = HashSet::new();
        for role_id in role_ids {
            if let Some(perms) = inner.role_permissions.get(role_id) {
                out.extend(perms.iter().cloned());
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl GrantStore for MemoryStore {
    async fn insert_grant(&self, grant: &ResourceGrant) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.grants.insert(grant.id, grant.clone());
        Ok(())
    }

    async fn delete_grant(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.grants.remove(&id);
        Ok(())
    }

    async fn grants_for_subjects(
        &self,
        subjects: &[Subject],
    ) -> Result<Vec<ResourceGrant>, StoreError> {
        let inner = self.inner.read().await;
        let wanted: HashSet<Subject> = subjects.iter().copied().collect();
        Ok(inner
            .grants
            .values()
            .filter(|g| g.subject().is_some_and(|s| wanted.contains(&s)))
            .cloned()
            .collect())
    }

    async fn delete_expired_grants(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.grants.len();
        inner.grants.retain(|_, g| g.is_live(now));
        Ok((before - inner.grants.len()) as u64)
    }
}

#[async_trait::async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &AuthSession) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .sessions
            .values()
            .any(|s| s.refresh_token == session.refresh_token)
        {
            return Err(StoreError::Conflict {
                what: "sessions.refresh_token".to_owned(),
            });
        }
        inner.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn auth_session(&self, id: Uuid) -> Result<Option<AuthSession>, StoreError> {
        Ok(self.inner.read().await.sessions.get(&id).cloned())
    }

    async fn session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<AuthSession>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .find(|s| s.refresh_token == refresh_token)
            .cloned())
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        old_token: &str,
        new_token: &str,
        last_used_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(&id) {
            Some(session)
                if session.refresh_token == old_token && session.revoked_at.is_none() =>
            {
                session.refresh_token = new_token.to_owned();
                session.last_used_at = last_used_at;
                session.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_session(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<AuthSession>, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(&id) {
            Some(session) => {
                if session.revoked_at.is_none() {
                    session.revoked_at = Some(at);
                }
                Ok(Some(session.clone()))
            }
            None => Ok(None),
        }
    }

    async fn revoke_user_sessions(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<AuthSession>, StoreError> {
        let mut inner = self.inner.write().await;
        let mut revoked = Vec::new();
        for session in inner.sessions.values_mut() {
            if session.user_id == user_id && session.revoked_at.is_none() {
                session.revoked_at = Some(at);
                revoked.push(session.clone());
            }
        }
        Ok(revoked)
    }

    async fn sessions_for_user(&self, user_id: Uuid) -> Result<Vec<AuthSession>, StoreError> {
        let inner = self.inner.read().await;
        let mut sessions: Vec<AuthSession> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn delete_dead_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuthSession>, StoreError> {
        let mut inner = self.inner.write().await;
        let dead: Vec<Uuid> = inner
            .sessions
            .values()
            .filter(|s| s.expires_at < now || s.revoked_at.is_some())
            .map(|s| s.id)
            .collect();
        let mut removed = Vec::with_capacity(dead.len());
        for id in dead {
            if let Some(session) = inner.sessions.remove(&id) {
                removed.push(session);
            }
        }
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl VaultStore for MemoryStore {
    async fn insert_identity(&self, identity: &VaultIdentity) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .identities
            .values()
            .any(|i| i.owner_id == identity.owner_id && i.name == identity.name)
        {
            return Err(StoreError::Conflict {
                what: format!("vault_identities.name={}", identity.name),
            });
        }
        inner.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    async fn identity(&self, id: Uuid) -> Result<Option<VaultIdentity>, StoreError> {
        Ok(self.inner.read().await.identities.get(&id).cloned())
    }

    async fn update_identity_envelope(
        &self,
        id: Uuid,
        envelope: &str,
        rotated_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(identity) = inner.identities.get_mut(&id) {
            identity.secret_envelope = envelope.to_owned();
            if rotated_at.is_some() {
                identity.rotated_at = rotated_at;
            }
        }
        Ok(())
    }

    async fn delete_identity(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.identities.remove(&id);
        inner.shares.retain(|_, s| s.identity_id != id);
        Ok(())
    }

    async fn list_identities(&self) -> Result<Vec<VaultIdentity>, StoreError> {
        Ok(self.inner.read().await.identities.values().cloned().collect())
    }

    async fn identities_owned_by(&self, user_id: Uuid) -> Result<Vec<VaultIdentity>, StoreError> {
        let inner = self.inner.read().await;
        let mut identities: Vec<VaultIdentity> = inner
            .identities
            .values()
            .filter(|i| i.owner_id == user_id)
            .cloned()
            .collect();
        identities.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(identities)
    }

    async fn insert_share(&self, share: &VaultShare) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.shares.insert(share.id, share.clone());
        Ok(())
    }

    async fn delete_share(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.shares.remove(&id).is_some())
    }

    async fn shares_for_identity(
        &self,
        identity_id: Uuid,
    ) -> Result<Vec<VaultShare>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .shares
            .values()
            .filter(|s| s.identity_id == identity_id)
            .cloned()
            .collect())
    }

    async fn shares_for_subjects(
        &self,
        subjects: &[Subject],
    ) -> Result<Vec<VaultShare>, StoreError> {
        let inner = self.inner.read().await;
        let wanted: HashSet<Subject> = subjects.iter().copied().collect();
        Ok(inner
            .shares
            .values()
            .filter(|s| s.subject().is_some_and(|subj| wanted.contains(&subj)))
            .cloned()
            .collect())
    }

    async fn delete_expired_shares(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.shares.len();
        inner.shares.retain(|_, s| s.is_live(now));
        Ok((before - inner.shares.len()) as u64)
    }
}

#[async_trait::async_trait]
impl ConnectionStore for MemoryStore {
    async fn insert_connection(&self, connection: &Connection) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.connections.insert(connection.id, connection.clone());
        Ok(())
    }

    async fn connection(&self, id: Uuid) -> Result<Option<Connection>, StoreError> {
        Ok(self.inner.read().await.connections.get(&id).cloned())
    }

    async fn list_connections(&self) -> Result<Vec<Connection>, StoreError> {
        let inner = self.inner.read().await;
        let mut connections: Vec<Connection> = inner.connections.values().cloned().collect();
        connections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(connections)
    }
}

#[async_trait::async_trait]
impl SettingsStore for MemoryStore {
    async fn setting(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.inner.read().await.settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.settings.insert(key.to_owned(), value.clone());
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.settings.remove(key);
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuditStore for MemoryStore {
    async fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.audit.push(event.clone());
        Ok(())
    }

    async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .audit
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn trim_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.audit.len();
        inner.audit.retain(|e| e.occurred_at >= cutoff);
        Ok((before - inner.audit.len()) as u64)
    }
}

#[async_trait::async_trait]
impl RecordingStore for MemoryStore {
    async fn insert_recording(&self, recording: &SessionRecording) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.recordings.insert(recording.id, recording.clone());
        Ok(())
    }

    async fn recording(&self, id: Uuid) -> Result<Option<SessionRecording>, StoreError> {
        Ok(self.inner.read().await.recordings.get(&id).cloned())
    }

    async fn finalize_recording(
        &self,
        id: Uuid,
        ended_at: DateTime<Utc>,
        size_bytes: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(recording) = inner.recordings.get_mut(&id) {
            recording.ended_at = Some(ended_at);
            recording.size_bytes = size_bytes;
        }
        Ok(())
    }

    async fn recordings_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<SessionRecording>, StoreError> {
        let inner = self.inner.read().await;
        let mut recordings: Vec<SessionRecording> = inner
            .recordings
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        recordings.sort_by_key(|r| r.started_at);
        Ok(recordings)
    }

    async fn delete_expired_recordings(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionRecording>, StoreError> {
        let mut inner = self.inner.write().await;
        let expired: Vec<Uuid> = inner
            .recordings
            .values()
            .filter(|r| r.retention_until < now)
            .map(|r| r.id)
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(recording) = inner.recordings.remove(&id) {
                removed.push(recording);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_user(username: &str, email: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: username.to_owned(),
            email: email.to_owned(),
            password_hash: "x".to_owned(),
            first_name: None,
            last_name: None,
            is_active: true,
            is_root: false,
            auth_provider: "local".to_owned(),
            auth_subject: None,
            last_login_at: None,
            last_login_ip: None,
            created_at: Utc::now(),
        }
    }

    fn sample_session(user_id: Uuid, token: &str, ttl_secs: i64) -> AuthSession {
        let now = Utc::now();
        AuthSession {
            id: Uuid::new_v4(),
            user_id,
            refresh_token: token.to_owned(),
            ip: None,
            user_agent: None,
            device: None,
            created_at: now,
            last_used_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
            revoked_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let store = MemoryStore::new();
        store
            .insert_user(&sample_user("alice", "alice@example.com"))
            .await
            .unwrap();
        let result = store
            .insert_user(&sample_user("alice", "other@example.com"))
            .await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let store = MemoryStore::new();
        store
            .insert_user(&sample_user("alice", "alice@example.com"))
            .await
            .unwrap();
        let result = store
            .insert_user(&sample_user("bob", "alice@example.com"))
            .await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn rotate_refresh_token_races_once() {
        let store = MemoryStore::new();
        let user = sample_user("alice", "alice@example.com");
        store.insert_user(&user).await.unwrap();
        let session = sample_session(user.id, "tok-old", 3600);
        store.insert_session(&session).await.unwrap();

        let now = Utc::now();
        let later = now + chrono::Duration::hours(1);
        let first = store
            .rotate_refresh_token(session.id, "tok-old", "tok-new", now, later)
            .await
            .unwrap();
        let second = store
            .rotate_refresh_token(session.id, "tok-old", "tok-other", now, later)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        let stored = store.auth_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token, "tok-new");
    }

    #[tokio::test]
    async fn delete_dead_sessions_returns_expired_and_revoked() {
        let store = MemoryStore::new();
        let user = sample_user("alice", "alice@example.com");
        store.insert_user(&user).await.unwrap();

        let live = sample_session(user.id, "live", 3600);
        let expired = sample_session(user.id, "expired", -60);
        let mut revoked = sample_session(user.id, "revoked", 3600);
        revoked.revoked_at = Some(Utc::now());

        store.insert_session(&live).await.unwrap();
        store.insert_session(&expired).await.unwrap();
        store.insert_session(&revoked).await.unwrap();

        let removed = store.delete_dead_sessions(Utc::now()).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.auth_session(live.id).await.unwrap().is_some());
        assert!(store.auth_session(expired.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn permissions_of_roles_unions() {
        let store = MemoryStore::new();
        let r1 = Uuid::new_v4();
        let r2 = Uuid::new_v4();
        store
            .replace_role_permissions(r1, &["a.view".to_owned(), "a.edit".to_owned()])
            .await
            .unwrap();
        store
            .replace_role_permissions(r2, &["a.view".to_owned(), "b.view".to_owned()])
            .await
            .unwrap();

        let perms = store.permissions_of_roles(&[r1, r2]).await.unwrap();
        assert_eq!(perms.len(), 3);
        assert!(perms.contains("b.view"));
    }

    #[tokio::test]
    async fn grants_filter_by_subject() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let team_id = Uuid::new_v4();
        let resource = Uuid::new_v4();
        let grant = ResourceGrant {
            id: Uuid::new_v4(),
            subject_kind: "team".to_owned(),
            subject_id: team_id,
            permission_id: "connection.launch".to_owned(),
            resource_type: "connection".to_owned(),
            resource_id: resource,
            expires_at: None,
            created_at: Utc::now(),
        };
        store.insert_grant(&grant).await.unwrap();

        let for_user = store
            .grants_for_subjects(&[Subject::User(user_id)])
            .await
            .unwrap();
        assert!(for_user.is_empty());

        let for_team = store
            .grants_for_subjects(&[Subject::User(user_id), Subject::Team(team_id)])
            .await
            .unwrap();
        assert_eq!(for_team.len(), 1);
    }
}
