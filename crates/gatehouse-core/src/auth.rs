//! Password login.
//!
//! Verifies credentials against the Argon2id hash on the user row and hands
//! off to the session service. Unknown users and wrong passwords produce
//! the same error; deactivated accounts report a lockout.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use gatehouse_storage::Store;
use gatehouse_storage::models::User;

use crate::crypto;
use crate::error::AuthError;
use crate::session::{SessionMetadata, SessionService, TokenPair};

/// Logs users in and out.
pub struct AuthService {
    store: Arc<dyn Store>,
    sessions: Arc<SessionService>,
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>, sessions: Arc<SessionService>) -> Self {
        Self { store, sessions }
    }

    /// Authenticate with username (or email) and password, issuing a token
    /// pair on success.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] for unknown user or bad password.
    /// - [`AuthError::LockedOut`] for a deactivated account.
    /// - [`AuthError::Store`] / [`AuthError::Crypto`] on infrastructure
    ///   failures.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        metadata: SessionMetadata,
    ) -> Result<(TokenPair, User), AuthError> {
        let user = if username.contains('@') {
            self.store.user_by_email(&username.to_lowercase()).await?
        } else {
            self.store.user_by_username(username).await?
        };
        let user = user.ok_or(AuthError::InvalidCredentials)?;

        if !crypto::verify_password(password, &user.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_active {
            return Err(AuthError::LockedOut);
        }

        self.store
            .record_login(user.id, Utc::now(), metadata.ip.as_deref())
            .await?;

        let pair = self
            .sessions
            .create(&user, metadata, HashMap::new())
            .await?;
        info!(user = %user.username, "login");
        Ok((pair, user))
    }

    /// Log a session out. Idempotent at the HTTP layer; an unknown session
    /// reports `NotFound`.
    ///
    /// # Errors
    ///
    /// Propagates [`SessionService::revoke`] errors.
    pub async fn logout(&self, session_id: uuid::Uuid) -> Result<(), AuthError> {
        self.sessions.revoke(session_id).await
    }
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService").finish_non_exhaustive()
    }
}
