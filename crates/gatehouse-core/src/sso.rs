//! SSO identity resolution.
//!
//! Maps an already-verified external identity (OIDC, SAML, LDAP — the wire
//! protocols live in provider adapters, not here) onto a local user:
//! linking by lower-cased email, refusing provider rebinds, and optionally
//! auto-provisioning a fresh account with a derived username.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use gatehouse_storage::Store;
use gatehouse_storage::models::User;

use crate::crypto;
use crate::error::SsoError;
use crate::session::{SessionMetadata, SessionService, TokenPair};

/// How many collision-numbered usernames to try before giving up.
const USERNAME_ATTEMPTS: u32 = 50;

/// A verified external identity as delivered by a provider adapter.
#[derive(Debug, Clone, Deserialize)]
pub struct Identity {
    pub provider: String,
    pub subject: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub raw_claims: serde_json::Value,
}

/// Resolves external identities to local users and issues sessions.
pub struct SsoResolver {
    store: Arc<dyn Store>,
    sessions: Arc<SessionService>,
    auto_provision: bool,
}

impl SsoResolver {
    pub fn new(store: Arc<dyn Store>, sessions: Arc<SessionService>, auto_provision: bool) -> Self {
        Self {
            store,
            sessions,
            auto_provision,
        }
    }

    /// Resolve an identity to a local user, linking or provisioning as
    /// configured.
    ///
    /// # Errors
    ///
    /// - [`SsoError::EmailRequired`] when the identity has no email.
    /// - [`SsoError::ProviderMismatch`] when the account is bound to a
    ///   different non-local provider.
    /// - [`SsoError::ProvisioningDisabled`] when no user matches and
    ///   auto-provisioning is off.
    /// - [`SsoError::UsernameExhausted`] when no free username was found.
    pub async fn resolve(&self, identity: &Identity) -> Result<User, SsoError> {
        let email = identity
            .email
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or(SsoError::EmailRequired)?
            .to_lowercase();

        if let Some(user) = self.store.user_by_email(&email).await? {
            if user.auth_provider != "local" && user.auth_provider != identity.provider {
                return Err(SsoError::ProviderMismatch {
                    existing: user.auth_provider,
                });
            }
            self.store
                .bind_provider(
                    user.id,
                    &identity.provider,
                    &identity.subject,
                    identity.first_name.as_deref(),
                    identity.last_name.as_deref(),
                )
                .await?;
            let user = self
                .store
                .user(user.id)
                .await?
                .ok_or(SsoError::Store(gatehouse_storage::StoreError::Read {
                    what: "users".to_owned(),
                    reason: "linked user vanished".to_owned(),
                }))?;
            return Ok(user);
        }

        if !self.auto_provision {
            return Err(SsoError::ProvisioningDisabled);
        }
        self.provision(identity, &email).await
    }

    /// Resolve and issue a token pair, enriching session claims with the
    /// SSO context.
    ///
    /// # Errors
    ///
    /// See [`resolve`](Self::resolve); session issuance adds
    /// [`SsoError::Auth`].
    pub async fn login(
        &self,
        identity: &Identity,
        metadata: SessionMetadata,
    ) -> Result<(TokenPair, User), SsoError> {
        let user = self.resolve(identity).await?;
        self.store
            .record_login(user.id, Utc::now(), metadata.ip.as_deref())
            .await?;

        let mut claims = HashMap::new();
        claims.insert(
            "sso_provider".to_owned(),
            serde_json::Value::String(identity.provider.clone()),
        );
        claims.insert(
            "sso_subject".to_owned(),
            serde_json::Value::String(identity.subject.clone()),
        );
        if let Some(email) = &identity.email {
            claims.insert(
                "sso_email".to_owned(),
                serde_json::Value::String(email.to_lowercase()),
            );
        }
        if !identity.groups.is_empty() {
            claims.insert(
                "sso_groups".to_owned(),
                serde_json::json!(identity.groups),
            );
        }

        let pair = self.sessions.create(&user, metadata, claims).await.map_err(SsoError::Auth)?;
        Ok((pair, user))
    }

    async fn provision(&self, identity: &Identity, email: &str) -> Result<User, SsoError> {
        let base = self.username_base(identity, email);

        let mut username = None;
        for attempt in 0..USERNAME_ATTEMPTS {
            let candidate = if attempt == 0 {
                base.clone()
            } else {
                format!("{base}-{}", attempt + 1)
            };
            if self.store.user_by_username(&candidate).await?.is_none() {
                username = Some(candidate);
                break;
            }
        }
        let username = username.ok_or_else(|| SsoError::UsernameExhausted { base: base.clone() })?;

        // Placeholder password: random, hashed, never disclosed. The
        // account authenticates through its provider.
        let placeholder = crypto::hash_password(&crypto::generate_token(32))
            .map_err(|e| SsoError::Auth(e.into()))?;

        let user = User {
            id: Uuid::new_v4(),
            username,
            email: email.to_owned(),
            password_hash: placeholder,
            first_name: identity.first_name.clone(),
            last_name: identity.last_name.clone(),
            is_active: true,
            is_root: false,
            auth_provider: identity.provider.clone(),
            auth_subject: Some(identity.subject.clone()),
            last_login_at: None,
            last_login_ip: None,
            created_at: Utc::now(),
        };
        self.store.insert_user(&user).await?;

        info!(user = %user.username, provider = %identity.provider, "sso user provisioned");
        Ok(user)
    }

    /// Username base: a `preferred_username` claim when present, else the
    /// email local part, slugged.
    fn username_base(&self, identity: &Identity, email: &str) -> String {
        let preferred = identity
            .raw_claims
            .get("preferred_username")
            .and_then(|v| v.as_str());
        let raw = preferred.unwrap_or_else(|| email.split('@').next().unwrap_or(email));
        let slug = slugify(raw);
        if slug.is_empty() {
            "user".to_owned()
        } else {
            slug
        }
    }
}

impl std::fmt::Debug for SsoResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsoResolver")
            .field("auto_provision", &self.auto_provision)
            .finish_non_exhaustive()
    }
}

/// Lower-case, keep alphanumerics, collapse everything else into single
/// dashes, trim dashes at both ends.
fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
