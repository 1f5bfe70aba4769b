//! Runtime permission evaluation.
//!
//! Combines three sources: role grants held directly by the user, role
//! grants inherited through team membership (set union across all teams),
//! and resource-scoped grants. Root users bypass every check. Any store
//! error falls closed — the caller sees a denial, the error goes to the
//! log.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use gatehouse_storage::Store;
use gatehouse_storage::models::{ResourceGrant, Subject, User};

use crate::error::PermissionError;
use crate::permission::Registry;

/// What a subject can do: the expanded permission set plus live scoped
/// grants. Rendered by UIs as a capability matrix.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveCapabilities {
    pub permissions: Vec<String>,
    pub resource_grants: Vec<ResourceGrant>,
}

/// Evaluates permissions against the registry and the durable store.
pub struct PermissionChecker {
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
}

impl PermissionChecker {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn Store>) -> Self {
        Self { registry, store }
    }

    /// The registry this checker evaluates against.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Check a global permission. Fails closed: unknown permissions and
    /// store errors both deny.
    pub async fn check(&self, user: &User, permission: &str) -> bool {
        if user.is_root {
            return true;
        }
        match self.check_roles(user, permission).await {
            Ok(held) => held,
            Err(err) => {
                warn!(user = %user.id, permission, error = %err, "permission check failed, denying");
                false
            }
        }
    }

    /// Check a permission on a named resource: a global hold or a live
    /// matching scoped grant suffices. A scoped grant never widens to other
    /// resources. Fails closed.
    pub async fn check_resource(
        &self,
        user: &User,
        permission: &str,
        resource_type: &str,
        resource_id: Uuid,
    ) -> bool {
        if user.is_root {
            return true;
        }
        let result = async {
            if self.check_roles(user, permission).await? {
                return Ok::<bool, PermissionError>(true);
            }
            let subjects = self.subjects_of(user).await?;
            let now = Utc::now();
            let grants = self.store.grants_for_subjects(&subjects).await?;
            Ok(grants.iter().any(|g| {
                g.permission_id == permission
                    && g.resource_type == resource_type
                    && g.resource_id == resource_id
                    && g.is_live(now)
            }))
        }
        .await;

        match result {
            Ok(held) => held,
            Err(err) => {
                warn!(user = %user.id, permission, error = %err, "resource check failed, denying");
                false
            }
        }
    }

    /// Compute the effective capabilities of a user or team.
    ///
    /// For users this is the union over direct roles and every team's roles
    /// (per-grant expiry, no union of expirations), plus scoped grants held
    /// by the user or any of their teams.
    ///
    /// # Errors
    ///
    /// Returns [`PermissionError::Store`] if the store fails.
    pub async fn effective(
        &self,
        subject: Subject,
    ) -> Result<EffectiveCapabilities, PermissionError> {
        let (role_ids, subjects) = match subject {
            Subject::User(user_id) => {
                let mut role_ids = self.store.user_role_ids(user_id).await?;
                let teams = self.store.teams_of_user(user_id).await?;
                let mut subjects = vec![Subject::User(user_id)];
                for team in &teams {
                    role_ids.extend(self.store.team_role_ids(team.id).await?);
                    subjects.push(Subject::Team(team.id));
                }
                (role_ids, subjects)
            }
            Subject::Team(team_id) => {
                (self.store.team_role_ids(team_id).await?, vec![Subject::Team(team_id)])
            }
        };

        let permission_set = self.store.permissions_of_roles(&role_ids).await?;
        let mut permissions: Vec<String> = permission_set
            .into_iter()
            .filter(|p| self.registry.contains(p))
            .collect();
        permissions.sort();

        let now = Utc::now();
        let mut resource_grants = self.store.grants_for_subjects(&subjects).await?;
        resource_grants.retain(|g| g.is_live(now));
        resource_grants.sort_by(|a, b| a.permission_id.cmp(&b.permission_id));

        Ok(EffectiveCapabilities {
            permissions,
            resource_grants,
        })
    }

    /// Assign a permission set to a role, persisting the dependency
    /// closure so evaluation needs no transitive walk.
    ///
    /// # Errors
    ///
    /// - [`PermissionError::UnknownPermission`] for IDs not in the registry.
    /// - [`PermissionError::Store`] if persisting fails.
    pub async fn assign_role_permissions(
        &self,
        role_id: Uuid,
        permission_ids: &[String],
    ) -> Result<Vec<String>, PermissionError> {
        let closure = self
            .registry
            .closure(permission_ids.iter().map(String::as_str))?;
        self.store
            .replace_role_permissions(role_id, &closure)
            .await?;
        Ok(closure)
    }

    /// Delete a role. System roles are refused.
    ///
    /// # Errors
    ///
    /// - [`PermissionError::SystemRole`] for system roles.
    /// - [`PermissionError::Store`] if the store fails.
    pub async fn delete_role(&self, role_id: Uuid) -> Result<(), PermissionError> {
        if let Some(role) = self.store.role(role_id).await? {
            if role.is_system {
                return Err(PermissionError::SystemRole { name: role.name });
            }
            self.store.delete_role(role_id).await?;
        }
        Ok(())
    }

    async fn check_roles(&self, user: &User, permission: &str) -> Result<bool, PermissionError> {
        if !self.registry.contains(permission) {
            return Ok(false);
        }

        let mut role_ids = self.store.user_role_ids(user.id).await?;
        for team in self.store.teams_of_user(user.id).await? {
            role_ids.extend(self.store.team_role_ids(team.id).await?);
        }
        if role_ids.is_empty() {
            return Ok(false);
        }

        let permissions: HashSet<String> = self.store.permissions_of_roles(&role_ids).await?;
        Ok(permissions.contains(permission))
    }

    /// The user plus every team they belong to, for grant lookups.
    async fn subjects_of(&self, user: &User) -> Result<Vec<Subject>, PermissionError> {
        let mut subjects = vec![Subject::User(user.id)];
        for team in self.store.teams_of_user(user.id).await? {
            subjects.push(Subject::Team(team.id));
        }
        Ok(subjects)
    }
}

impl std::fmt::Debug for PermissionChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionChecker")
            .field("permissions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use gatehouse_storage::MemoryStore;
    use gatehouse_storage::models::{Role, Team};
    use gatehouse_storage::{GrantStore, RoleStore, TeamStore, UserStore};

    use crate::permission::builtin_registry;

    fn checker_with_store() -> (PermissionChecker, Arc<MemoryStore>) {
        let registry = Arc::new(builtin_registry().unwrap());
        let store = Arc::new(MemoryStore::new());
        (
            PermissionChecker::new(registry, Arc::clone(&store) as Arc<dyn Store>),
            store,
        )
    }

    fn make_user(is_root: bool) -> User {
        User {
            id: Uuid::new_v4(),
            username: format!("u-{}", Uuid::new_v4().simple()),
            email: format!("{}@example.com", Uuid::new_v4().simple()),
            password_hash: "x".to_owned(),
            first_name: None,
            last_name: None,
            is_active: true,
            is_root,
            auth_provider: "local".to_owned(),
            auth_subject: None,
            last_login_at: None,
            last_login_ip: None,
            created_at: Utc::now(),
        }
    }

    fn make_role(name: &str) -> Role {
        Role {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            is_system: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn root_bypasses_all_checks() {
        let (checker, _) = checker_with_store();
        let root = make_user(true);
        for def_id in ["user.manage", "vault.share", "connection.launch"] {
            assert!(checker.check(&root, def_id).await);
        }
        assert!(
            checker
                .check_resource(&root, "ssh.connect", "connection", Uuid::new_v4())
                .await
        );
    }

    #[tokio::test]
    async fn deny_by_default_for_every_permission() {
        let (checker, store) = checker_with_store();
        let user = make_user(false);
        store.insert_user(&user).await.unwrap();

        let ids: Vec<String> = checker.registry().iter().map(|d| d.id.clone()).collect();
        for id in ids {
            assert!(!checker.check(&user, &id).await, "expected deny for {id}");
        }
    }

    #[tokio::test]
    async fn unknown_permission_denies_even_for_role_holders() {
        let (checker, store) = checker_with_store();
        let user = make_user(false);
        store.insert_user(&user).await.unwrap();
        assert!(!checker.check(&user, "not.registered").await);
    }

    #[tokio::test]
    async fn assignment_persists_dependency_closure() {
        let (checker, store) = checker_with_store();
        let role = make_role("operators");
        store.insert_role(&role).await.unwrap();

        checker
            .assign_role_permissions(role.id, &["ssh.connect".to_owned()])
            .await
            .unwrap();

        let persisted = store.role_permission_ids(role.id).await.unwrap();
        for required in ["ssh.connect", "connection.launch", "connection.view"] {
            assert!(
                persisted.contains(&required.to_owned()),
                "closure missing {required}"
            );
        }
    }

    #[tokio::test]
    async fn direct_role_grants_global_permission() {
        let (checker, store) = checker_with_store();
        let user = make_user(false);
        store.insert_user(&user).await.unwrap();
        let role = make_role("viewers");
        store.insert_role(&role).await.unwrap();
        checker
            .assign_role_permissions(role.id, &["connection.view".to_owned()])
            .await
            .unwrap();
        store.assign_user_role(user.id, role.id).await.unwrap();

        assert!(checker.check(&user, "connection.view").await);
        assert!(!checker.check(&user, "connection.manage").await);
    }

    #[tokio::test]
    async fn team_roles_are_unioned_with_user_roles() {
        let (checker, store) = checker_with_store();
        let user = make_user(false);
        store.insert_user(&user).await.unwrap();

        let team = Team {
            id: Uuid::new_v4(),
            name: "ops".to_owned(),
            description: None,
            parent_id: None,
            created_at: Utc::now(),
        };
        store.insert_team(&team).await.unwrap();
        store.add_team_member(team.id, user.id).await.unwrap();

        let team_role = make_role("team-role");
        store.insert_role(&team_role).await.unwrap();
        checker
            .assign_role_permissions(team_role.id, &["vault.view".to_owned()])
            .await
            .unwrap();
        store.assign_team_role(team.id, team_role.id).await.unwrap();

        let user_role = make_role("user-role");
        store.insert_role(&user_role).await.unwrap();
        checker
            .assign_role_permissions(user_role.id, &["audit.view".to_owned()])
            .await
            .unwrap();
        store.assign_user_role(user.id, user_role.id).await.unwrap();

        assert!(checker.check(&user, "vault.view").await);
        assert!(checker.check(&user, "audit.view").await);
    }

    #[tokio::test]
    async fn scoped_grant_holds_only_on_its_resource() {
        let (checker, store) = checker_with_store();
        let user = make_user(false);
        store.insert_user(&user).await.unwrap();
        let granted = Uuid::new_v4();
        let other = Uuid::new_v4();

        store
            .insert_grant(&ResourceGrant {
                id: Uuid::new_v4(),
                subject_kind: "user".to_owned(),
                subject_id: user.id,
                permission_id: "connection.launch".to_owned(),
                resource_type: "connection".to_owned(),
                resource_id: granted,
                expires_at: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(
            checker
                .check_resource(&user, "connection.launch", "connection", granted)
                .await
        );
        assert!(
            !checker
                .check_resource(&user, "connection.launch", "connection", other)
                .await
        );
        // The scoped grant does not widen into a global hold.
        assert!(!checker.check(&user, "connection.launch").await);
    }

    #[tokio::test]
    async fn expired_grant_does_not_hold() {
        let (checker, store) = checker_with_store();
        let user = make_user(false);
        store.insert_user(&user).await.unwrap();
        let resource = Uuid::new_v4();

        store
            .insert_grant(&ResourceGrant {
                id: Uuid::new_v4(),
                subject_kind: "user".to_owned(),
                subject_id: user.id,
                permission_id: "connection.launch".to_owned(),
                resource_type: "connection".to_owned(),
                resource_id: resource,
                expires_at: Some(Utc::now() - Duration::minutes(1)),
                created_at: Utc::now() - Duration::hours(1),
            })
            .await
            .unwrap();

        assert!(
            !checker
                .check_resource(&user, "connection.launch", "connection", resource)
                .await
        );
    }

    #[tokio::test]
    async fn effective_reports_permissions_and_live_grants() {
        let (checker, store) = checker_with_store();
        let user = make_user(false);
        store.insert_user(&user).await.unwrap();
        let role = make_role("effective-role");
        store.insert_role(&role).await.unwrap();
        checker
            .assign_role_permissions(role.id, &["connection.launch".to_owned()])
            .await
            .unwrap();
        store.assign_user_role(user.id, role.id).await.unwrap();

        store
            .insert_grant(&ResourceGrant {
                id: Uuid::new_v4(),
                subject_kind: "user".to_owned(),
                subject_id: user.id,
                permission_id: "ssh.connect".to_owned(),
                resource_type: "connection".to_owned(),
                resource_id: Uuid::new_v4(),
                expires_at: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let effective = checker.effective(Subject::User(user.id)).await.unwrap();
        assert!(effective.permissions.contains(&"connection.view".to_owned()));
        assert!(effective.permissions.contains(&"connection.launch".to_owned()));
        assert_eq!(effective.resource_grants.len(), 1);
    }

    #[tokio::test]
    async fn system_role_cannot_be_deleted() {
        let (checker, store) = checker_with_store();
        let role = Role {
            id: Uuid::new_v4(),
            name: "administrator".to_owned(),
            is_system: true,
            created_at: Utc::now(),
        };
        store.insert_role(&role).await.unwrap();

        let err = checker.delete_role(role.id).await.unwrap_err();
        assert!(matches!(err, PermissionError::SystemRole { .. }));
        assert!(store.role(role.id).await.unwrap().is_some());
    }
}
