//! Credential vault.
//!
//! Each identity stores one secret (password, key material, structured
//! blob) encrypted under the active vault key. The plaintext leaves this
//! module only toward an authorised caller — the identity's owner or a
//! subject holding a live share — and every read writes an audit row.
//!
//! Key rotation is two-phase and an explicit admin action: decrypt every
//! envelope under the old key, re-encrypt under the new key, persist, then
//! swap the active key. After the swap the old key has been dropped and
//! zeroized; the two keys are never both live.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use gatehouse_storage::Store;
use gatehouse_storage::models::{Subject, User, VaultIdentity, VaultShare};

use crate::audit::AuditRecorder;
use crate::crypto::{self, SecretKey};
use crate::error::VaultError;
use crate::maintenance::Sweeper;

/// Algorithm tag stored on every envelope this vault writes.
const ALGORITHM: &str = "aes-256-gcm";

/// Encrypted credential storage with identity sharing.
pub struct VaultService {
    store: Arc<dyn Store>,
    key: RwLock<SecretKey>,
    audit: Arc<AuditRecorder>,
}

impl VaultService {
    pub fn new(store: Arc<dyn Store>, key: SecretKey, audit: Arc<AuditRecorder>) -> Self {
        Self {
            store,
            key: RwLock::new(key),
            audit,
        }
    }

    /// Create an identity owned by `owner`, encrypting the secret under the
    /// active key.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NameTaken`] if the owner already uses the name.
    /// - [`VaultError::Crypto`] / [`VaultError::Store`] on failures.
    pub async fn create(
        &self,
        owner: &User,
        name: &str,
        secret: &[u8],
    ) -> Result<VaultIdentity, VaultError> {
        let envelope = {
            let key = self.key.read().await;
            crypto::encrypt(&key, secret)?
        };

        let identity = VaultIdentity {
            id: Uuid::new_v4(),
            owner_id: owner.id,
            name: name.to_owned(),
            secret_envelope: envelope,
            algorithm: ALGORITHM.to_owned(),
            created_at: Utc::now(),
            rotated_at: None,
        };

        self.store
            .insert_identity(&identity)
            .await
            .map_err(|err| match err {
                gatehouse_storage::StoreError::Conflict { .. } => VaultError::NameTaken {
                    name: name.to_owned(),
                },
                other => VaultError::Store(other),
            })?;

        info!(identity = %identity.id, owner = %owner.id, "vault identity created");
        Ok(identity)
    }

    /// Decrypt and return the secret to an authorised caller.
    ///
    /// Authorisation is ownership or a current, non-expired share; there is
    /// no root bypass for secret material. Every successful read is
    /// audited.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if the identity does not exist.
    /// - [`VaultError::Forbidden`] without ownership or a live share.
    /// - [`VaultError::Crypto`] if the envelope fails authentication.
    pub async fn read(&self, caller: &User, id: Uuid) -> Result<Vec<u8>, VaultError> {
        let identity = self
            .store
            .identity(id)
            .await?
            .ok_or(VaultError::NotFound)?;

        if !self.can_read(caller, &identity).await? {
            return Err(VaultError::Forbidden);
        }

        let plaintext = {
            let key = self.key.read().await;
            crypto::decrypt(&key, &identity.secret_envelope)?
        };

        self.audit
            .record(
                "vault.read",
                Some(caller.id),
                Some(("vault_identity", id)),
                serde_json::json!({ "name": identity.name }),
                None,
            )
            .await;

        Ok(plaintext)
    }

    /// Re-encrypt an identity with a new secret. Owner only.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] / [`VaultError::Forbidden`] as in
    ///   [`read`](Self::read).
    pub async fn update(
        &self,
        caller: &User,
        id: Uuid,
        secret: &[u8],
    ) -> Result<(), VaultError> {
        let identity = self
            .store
            .identity(id)
            .await?
            .ok_or(VaultError::NotFound)?;
        if identity.owner_id != caller.id {
            return Err(VaultError::Forbidden);
        }

        let envelope = {
            let key = self.key.read().await;
            crypto::encrypt(&key, secret)?
        };
        self.store
            .update_identity_envelope(id, &envelope, None)
            .await?;

        info!(identity = %id, "vault identity updated");
        Ok(())
    }

    /// Delete an identity and its shares. Owner only.
    ///
    /// # Errors
    ///
    /// As [`update`](Self::update).
    pub async fn delete(&self, caller: &User, id: Uuid) -> Result<(), VaultError> {
        let identity = self
            .store
            .identity(id)
            .await?
            .ok_or(VaultError::NotFound)?;
        if identity.owner_id != caller.id {
            return Err(VaultError::Forbidden);
        }
        self.store.delete_identity(id).await?;
        info!(identity = %id, "vault identity deleted");
        Ok(())
    }

    /// Share read access with a user or team. Owner only.
    ///
    /// # Errors
    ///
    /// As [`update`](Self::update).
    pub async fn share(
        &self,
        caller: &User,
        id: Uuid,
        subject: Subject,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<VaultShare, VaultError> {
        let identity = self
            .store
            .identity(id)
            .await?
            .ok_or(VaultError::NotFound)?;
        if identity.owner_id != caller.id {
            return Err(VaultError::Forbidden);
        }

        let share = VaultShare {
            id: Uuid::new_v4(),
            identity_id: id,
            subject_kind: subject.kind().to_owned(),
            subject_id: subject.id(),
            granted_at: Utc::now(),
            expires_at,
        };
        self.store.insert_share(&share).await?;

        self.audit
            .record(
                "vault.shared",
                Some(caller.id),
                Some(("vault_identity", id)),
                serde_json::json!({ "subject": subject }),
                None,
            )
            .await;

        Ok(share)
    }

    /// Revoke a share. Owner only.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if the identity or share is unknown.
    /// - [`VaultError::Forbidden`] for a non-owner.
    pub async fn revoke_share(
        &self,
        caller: &User,
        identity_id: Uuid,
        share_id: Uuid,
    ) -> Result<(), VaultError> {
        let identity = self
            .store
            .identity(identity_id)
            .await?
            .ok_or(VaultError::NotFound)?;
        if identity.owner_id != caller.id {
            return Err(VaultError::Forbidden);
        }

        let shares = self.store.shares_for_identity(identity_id).await?;
        if !shares.iter().any(|s| s.id == share_id) {
            return Err(VaultError::NotFound);
        }
        self.store.delete_share(share_id).await?;
        Ok(())
    }

    /// Identity metadata visible to a user: everything they own plus
    /// everything shared with them or their teams. Never includes secrets.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Store`] if the store fails.
    pub async fn list_accessible_by(
        &self,
        user: &User,
    ) -> Result<Vec<VaultIdentity>, VaultError> {
        let mut identities = self.store.identities_owned_by(user.id).await?;

        let subjects = self.subjects_of(user).await?;
        let now = Utc::now();
        for share in self.store.shares_for_subjects(&subjects).await? {
            if !share.is_live(now) {
                continue;
            }
            if identities.iter().any(|i| i.id == share.identity_id) {
                continue;
            }
            if let Some(identity) = self.store.identity(share.identity_id).await? {
                identities.push(identity);
            }
        }

        identities.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(identities)
    }

    /// Two-phase key rotation. Holds the key write-lock for the duration so
    /// no reader observes a half-rotated vault.
    ///
    /// # Errors
    ///
    /// Returns the first decryption or store error; in that case the old
    /// key remains active and no envelope has been swapped to a key it
    /// cannot be read with.
    pub async fn rotate_key(&self, new_key: SecretKey) -> Result<u64, VaultError> {
        let mut active = self.key.write().await;

        // Phase one: decrypt everything with the old key, re-encrypt with
        // the new one, in memory.
        let identities = self.store.list_identities().await?;
        let mut reencrypted: Vec<(Uuid, String)> = Vec::with_capacity(identities.len());
        for identity in &identities {
            let plaintext = crypto::decrypt(&active, &identity.secret_envelope)?;
            let envelope = crypto::encrypt(&new_key, &plaintext)?;
            reencrypted.push((identity.id, envelope));
        }

        // Phase two: persist, then swap. The old key drops (and zeroizes)
        // on assignment.
        let rotated_at = Utc::now();
        for (id, envelope) in &reencrypted {
            self.store
                .update_identity_envelope(*id, envelope, Some(rotated_at))
                .await?;
        }
        *active = new_key;

        info!(identities = reencrypted.len(), "vault key rotated");
        Ok(reencrypted.len() as u64)
    }

    /// Drop expired shares. Called by the maintenance loop.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Store`] if the sweep fails.
    pub async fn sweep_expired_shares(&self) -> Result<u64, VaultError> {
        Ok(self.store.delete_expired_shares(Utc::now()).await?)
    }

    async fn can_read(&self, caller: &User, identity: &VaultIdentity) -> Result<bool, VaultError> {
        if identity.owner_id == caller.id {
            return Ok(true);
        }
        let subjects = self.subjects_of(caller).await?;
        let now = Utc::now();
        let shares = self.store.shares_for_subjects(&subjects).await?;
        Ok(shares
            .iter()
            .any(|s| s.identity_id == identity.id && s.is_live(now)))
    }

    async fn subjects_of(&self, user: &User) -> Result<Vec<Subject>, VaultError> {
        let mut subjects = vec![Subject::User(user.id)];
        for team in self.store.teams_of_user(user.id).await? {
            subjects.push(Subject::Team(team.id));
        }
        Ok(subjects)
    }
}

impl std::fmt::Debug for VaultService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultService").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Sweeper for VaultService {
    fn name(&self) -> &'static str {
        "vault-shares"
    }

    async fn sweep(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.sweep_expired_shares().await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gatehouse_storage::MemoryStore;
    use gatehouse_storage::models::Team;
    use gatehouse_storage::{AuditStore, TeamStore, UserStore, VaultStore};

    struct Fixture {
        vault: VaultService,
        store: Arc<MemoryStore>,
        owner: User,
        other: User,
    }

    fn make_user(name: &str) -> User {
        User {
            id: Uuid::new_v4(),
            username: name.to_owned(),
            email: format!("{name}@example.com"),
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

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let owner = make_user("owner");
        let other = make_user("other");
        store.insert_user(&owner).await.unwrap();
        store.insert_user(&other).await.unwrap();
        let audit = Arc::new(AuditRecorder::new(
            Arc::clone(&store) as Arc<dyn Store>,
            90,
        ));
        let vault = VaultService::new(
            Arc::clone(&store) as Arc<dyn Store>,
            SecretKey::generate(),
            audit,
        );
        Fixture {
            vault,
            store,
            owner,
            other,
        }
    }

    #[tokio::test]
    async fn owner_reads_own_secret() {
        let fx = fixture().await;
        let identity = fx
            .vault
            .create(&fx.owner, "db-password", b"hunter2")
            .await
            .unwrap();
        let secret = fx.vault.read(&fx.owner, identity.id).await.unwrap();
        assert_eq!(secret, b"hunter2");
    }

    #[tokio::test]
    async fn read_is_audited() {
        let fx = fixture().await;
        let identity = fx
            .vault
            .create(&fx.owner, "db-password", b"hunter2")
            .await
            .unwrap();
        fx.vault.read(&fx.owner, identity.id).await.unwrap();

        let events = fx.store.recent_audit(10).await.unwrap();
        assert!(events.iter().any(|e| e.action == "vault.read"));
    }

    #[tokio::test]
    async fn stranger_is_forbidden() {
        let fx = fixture().await;
        let identity = fx
            .vault
            .create(&fx.owner, "db-password", b"hunter2")
            .await
            .unwrap();
        let err = fx.vault.read(&fx.other, identity.id).await.unwrap_err();
        assert!(matches!(err, VaultError::Forbidden));
    }

    #[tokio::test]
    async fn share_grants_and_revoke_removes_access() {
        let fx = fixture().await;
        let identity = fx
            .vault
            .create(&fx.owner, "db-password", b"hunter2")
            .await
            .unwrap();

        let share = fx
            .vault
            .share(&fx.owner, identity.id, Subject::User(fx.other.id), None)
            .await
            .unwrap();
        assert_eq!(
            fx.vault.read(&fx.other, identity.id).await.unwrap(),
            b"hunter2"
        );

        fx.vault
            .revoke_share(&fx.owner, identity.id, share.id)
            .await
            .unwrap();
        assert!(matches!(
            fx.vault.read(&fx.other, identity.id).await,
            Err(VaultError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn expired_share_does_not_grant() {
        let fx = fixture().await;
        let identity = fx
            .vault
            .create(&fx.owner, "db-password", b"hunter2")
            .await
            .unwrap();
        fx.vault
            .share(
                &fx.owner,
                identity.id,
                Subject::User(fx.other.id),
                Some(Utc::now() - Duration::minutes(1)),
            )
            .await
            .unwrap();

        assert!(matches!(
            fx.vault.read(&fx.other, identity.id).await,
            Err(VaultError::Forbidden)
        ));

        let swept = fx.vault.sweep_expired_shares().await.unwrap();
        assert_eq!(swept, 1);
    }

    #[tokio::test]
    async fn team_share_reaches_members() {
        let fx = fixture().await;
        let team = Team {
            id: Uuid::new_v4(),
            name: "dba".to_owned(),
            description: None,
            parent_id: None,
            created_at: Utc::now(),
        };
        fx.store.insert_team(&team).await.unwrap();
        fx.store.add_team_member(team.id, fx.other.id).await.unwrap();

        let identity = fx
            .vault
            .create(&fx.owner, "db-password", b"hunter2")
            .await
            .unwrap();
        fx.vault
            .share(&fx.owner, identity.id, Subject::Team(team.id), None)
            .await
            .unwrap();

        assert_eq!(
            fx.vault.read(&fx.other, identity.id).await.unwrap(),
            b"hunter2"
        );
        let listed = fx.vault.list_accessible_by(&fx.other).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn non_owner_cannot_share_update_or_delete() {
        let fx = fixture().await;
        let identity = fx
            .vault
            .create(&fx.owner, "db-password", b"hunter2")
            .await
            .unwrap();

        assert!(matches!(
            fx.vault
                .share(&fx.other, identity.id, Subject::User(fx.other.id), None)
                .await,
            Err(VaultError::Forbidden)
        ));
        assert!(matches!(
            fx.vault.update(&fx.other, identity.id, b"stolen").await,
            Err(VaultError::Forbidden)
        ));
        assert!(matches!(
            fx.vault.delete(&fx.other, identity.id).await,
            Err(VaultError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn duplicate_name_for_same_owner_is_taken() {
        let fx = fixture().await;
        fx.vault
            .create(&fx.owner, "db-password", b"a")
            .await
            .unwrap();
        let err = fx
            .vault
            .create(&fx.owner, "db-password", b"b")
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NameTaken { .. }));
    }

    #[tokio::test]
    async fn key_rotation_preserves_secrets() {
        let fx = fixture().await;
        let first = fx.vault.create(&fx.owner, "one", b"alpha").await.unwrap();
        let second = fx.vault.create(&fx.owner, "two", b"beta").await.unwrap();

        let rotated = fx.vault.rotate_key(SecretKey::generate()).await.unwrap();
        assert_eq!(rotated, 2);

        assert_eq!(fx.vault.read(&fx.owner, first.id).await.unwrap(), b"alpha");
        assert_eq!(fx.vault.read(&fx.owner, second.id).await.unwrap(), b"beta");

        let stored = fx.store.identity(first.id).await.unwrap().unwrap();
        assert!(stored.rotated_at.is_some());
    }
}
