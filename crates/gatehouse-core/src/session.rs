//! Auth-session service.
//!
//! Owns the `auth_sessions` table plus the session cache. Sessions are
//! validated cache-through: the cache is consulted first and always holds a
//! faithful copy of the DB row (cache writes follow DB writes, cache
//! deletes precede DB deletes on revocation). Cache failures degrade to
//! DB-only paths and never fail an operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use gatehouse_storage::models::{AuthSession, User};
use gatehouse_storage::Store;

use crate::cache::Cache;
use crate::error::AuthError;
use crate::maintenance::Sweeper;
use crate::token::{self, AccessClaims, TokenSigner};

/// Default refresh-token (and so session) lifetime.
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const REFRESH_KEY_PREFIX: &str = "session:refresh:";
const ID_KEY_PREFIX: &str = "session:id:";

/// Client metadata recorded on the session row.
#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device: Option<String>,
}

/// A freshly issued token pair plus the backing session row.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
    pub session: AuthSession,
}

/// Counts reported by [`SessionService::cleanup_expired`]. Previously
/// active rows are tracked separately from already-revoked rows so the
/// active-sessions gauge stays honest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub expired_active: u64,
    pub already_revoked: u64,
}

/// Creates, refreshes, revokes, and sweeps auth sessions.
pub struct SessionService {
    store: Arc<dyn Store>,
    cache: Cache,
    signer: TokenSigner,
    refresh_ttl: Duration,
    active_gauge: AtomicI64,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Cache,
        signer: TokenSigner,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            signer,
            refresh_ttl,
            active_gauge: AtomicI64::new(0),
        }
    }

    fn refresh_key(token: &str) -> String {
        format!("{REFRESH_KEY_PREFIX}{token}")
    }

    fn id_key(id: Uuid) -> String {
        format!("{ID_KEY_PREFIX}{id}")
    }

    fn refresh_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.refresh_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(7))
    }

    /// Current value of the active-sessions gauge.
    #[must_use]
    pub fn active_sessions(&self) -> i64 {
        self.active_gauge.load(Ordering::Relaxed)
    }

    /// Create a session for a user: writes the DB row, then the cache
    /// entries, and signs a fresh token pair.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Store`] if the row cannot be written or
    /// [`AuthError::Token`] if signing fails.
    pub async fn create(
        &self,
        user: &User,
        metadata: SessionMetadata,
        extra_claims: HashMap<String, serde_json::Value>,
    ) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let session = AuthSession {
            id: Uuid::new_v4(),
            user_id: user.id,
            refresh_token: token::generate_refresh_token(),
            ip: metadata.ip,
            user_agent: metadata.user_agent,
            device: metadata.device,
            created_at: now,
            last_used_at: now,
            expires_at: now + self.refresh_ttl_chrono(),
            revoked_at: None,
        };

        self.store.insert_session(&session).await?;
        self.cache_session(&session).await;
        self.active_gauge.fetch_add(1, Ordering::Relaxed);

        let access = self.signer.sign(user.id, session.id, extra_claims)?;
        info!(user = %user.id, session = %session.id, "auth session created");

        Ok(TokenPair {
            access,
            refresh: session.refresh_token.clone(),
            session,
        })
    }

    /// Exchange a refresh token for a new token pair, rotating the refresh
    /// token. Two concurrent refreshes of the same token are serialised by
    /// a conditioned update — the loser observes [`AuthError::NotFound`].
    ///
    /// # Errors
    ///
    /// - [`AuthError::NotFound`] for an unknown (or already rotated) token.
    /// - [`AuthError::Expired`] / [`AuthError::Revoked`] for dead sessions.
    /// - [`AuthError::Store`] if the store fails.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let key = Self::refresh_key(refresh_token);

        // Cache first, durable store second.
        let session = match self.cache.get_json::<AuthSession>(&key).await {
            Some(session) => session,
            None => self
                .store
                .session_by_refresh_token(refresh_token)
                .await?
                .ok_or(AuthError::NotFound)?,
        };

        let now = Utc::now();
        if session.revoked_at.is_some() {
            return Err(AuthError::Revoked);
        }
        if session.expires_at <= now {
            return Err(AuthError::Expired);
        }

        let new_token = token::generate_refresh_token();
        let new_expiry = now + self.refresh_ttl_chrono();
        let rotated = self
            .store
            .rotate_refresh_token(session.id, refresh_token, &new_token, now, new_expiry)
            .await?;
        if !rotated {
            // A concurrent refresh won, or the row disappeared underneath us.
            return Err(AuthError::NotFound);
        }

        let mut session = session;
        session.refresh_token = new_token.clone();
        session.last_used_at = now;
        session.expires_at = new_expiry;

        // DB row updated; now invalidate the old cache entry and write the new one.
        self.cache.delete(&[key.as_str()]).await;
        self.cache_session(&session).await;

        let access = self.signer.sign(session.user_id, session.id, HashMap::new())?;

        Ok(TokenPair {
            access,
            refresh: new_token,
            session,
        })
    }

    /// Validate an access token: stateless signature/expiry check plus the
    /// revocation bit from the session cache (falling back to the DB).
    ///
    /// # Errors
    ///
    /// - [`AuthError::Expired`] / [`AuthError::Token`] from the JWT check.
    /// - [`AuthError::Revoked`] / [`AuthError::NotFound`] from the session.
    pub async fn validate_access(&self, access_token: &str) -> Result<AccessClaims, AuthError> {
        let claims = self.signer.verify(access_token)?;

        let session = match self
            .cache
            .get_json::<AuthSession>(&Self::id_key(claims.sid))
            .await
        {
            Some(session) => session,
            None => self
                .store
                .auth_session(claims.sid)
                .await?
                .ok_or(AuthError::NotFound)?,
        };

        if session.revoked_at.is_some() {
            return Err(AuthError::Revoked);
        }
        if session.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }

        Ok(claims)
    }

    /// Revoke one session. Cache entries are deleted before the DB write so
    /// no reader resurrects the credential from the cache.
    ///
    /// # Errors
    ///
    /// - [`AuthError::NotFound`] if the session does not exist.
    /// - [`AuthError::Store`] if the store fails.
    pub async fn revoke(&self, session_id: Uuid) -> Result<(), AuthError> {
        let session = self
            .store
            .auth_session(session_id)
            .await?
            .ok_or(AuthError::NotFound)?;

        self.evict(&session).await;
        // Decrement once per row: cleanup skips rows that already carry a
        // revoked_at stamp.
        let first_revocation = session.revoked_at.is_none();
        self.store.revoke_session(session_id, Utc::now()).await?;
        if first_revocation {
            self.active_gauge.fetch_sub(1, Ordering::Relaxed);
        }
        info!(session = %session_id, "auth session revoked");
        Ok(())
    }

    /// Revoke every active session of a user.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Store`] if the store fails.
    pub async fn revoke_user(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let sessions = self.store.sessions_for_user(user_id).await?;
        let now = Utc::now();
        for session in &sessions {
            if session.is_active(now) {
                self.evict(session).await;
            }
        }
        let revoked = self.store.revoke_user_sessions(user_id, now).await?;
        #[allow(clippy::cast_possible_wrap)]
        self.active_gauge
            .fetch_sub(revoked.len() as i64, Ordering::Relaxed);
        info!(user = %user_id, count = revoked.len(), "user sessions revoked");
        Ok(revoked.len() as u64)
    }

    /// All sessions belonging to a user, newest last.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Store`] if the store fails.
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<AuthSession>, AuthError> {
        Ok(self.store.sessions_for_user(user_id).await?)
    }

    /// Fetch one session row.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotFound`] if it does not exist.
    pub async fn get(&self, session_id: Uuid) -> Result<AuthSession, AuthError> {
        self.store
            .auth_session(session_id)
            .await?
            .ok_or(AuthError::NotFound)
    }

    /// Sweep expired and revoked rows, evicting their cache entries and
    /// decrementing the gauge for rows that were still counted as active.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Store`] if the sweep query fails.
    pub async fn cleanup_expired(&self) -> Result<CleanupStats, AuthError> {
        let now = Utc::now();
        let removed = self.store.delete_dead_sessions(now).await?;

        let mut stats = CleanupStats::default();
        for session in &removed {
            self.evict(session).await;
            if session.revoked_at.is_some() {
                // Gauge already decremented when the session was revoked.
                stats.already_revoked += 1;
            } else {
                stats.expired_active += 1;
            }
        }
        #[allow(clippy::cast_possible_wrap)]
        self.active_gauge
            .fetch_sub(stats.expired_active as i64, Ordering::Relaxed);

        if stats.expired_active + stats.already_revoked > 0 {
            info!(
                expired = stats.expired_active,
                revoked = stats.already_revoked,
                "swept dead auth sessions"
            );
        }
        Ok(stats)
    }

    async fn cache_session(&self, session: &AuthSession) {
        let ttl = (session.expires_at - Utc::now()).to_std().ok();
        self.cache
            .put_json(&Self::refresh_key(&session.refresh_token), session, ttl)
            .await;
        self.cache
            .put_json(&Self::id_key(session.id), session, ttl)
            .await;
    }

    async fn evict(&self, session: &AuthSession) {
        let refresh_key = Self::refresh_key(&session.refresh_token);
        let id_key = Self::id_key(session.id);
        self.cache
            .delete(&[refresh_key.as_str(), id_key.as_str()])
            .await;
    }
}

impl std::fmt::Debug for SessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService")
            .field("active", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Sweeper for SessionService {
    fn name(&self) -> &'static str {
        "auth-sessions"
    }

    async fn sweep(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        let stats = self.cleanup_expired().await?;
        Ok(stats.expired_active + stats.already_revoked)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use gatehouse_storage::{KvStore, MemoryKv, MemoryStore, SessionStore, UserStore};

    use crate::token::DEFAULT_ACCESS_TTL;

    struct Fixture {
        service: SessionService,
        store: Arc<MemoryStore>,
        kv: Arc<MemoryKv>,
        user: User,
    }

    async fn fixture() -> Fixture {
        fixture_with_ttl(DEFAULT_REFRESH_TTL).await
    }

    async fn fixture_with_ttl(refresh_ttl: Duration) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new());
        let user = User {
            id: Uuid::new_v4(),
            username: "admin".to_owned(),
            email: "admin@example.com".to_owned(),
            password_hash: "x".to_owned(),
            first_name: None,
            last_name: None,
            is_active: true,
            is_root: true,
            auth_provider: "local".to_owned(),
            auth_subject: None,
            last_login_at: None,
            last_login_ip: None,
            created_at: Utc::now(),
        };
        store.insert_user(&user).await.unwrap();
        let service = SessionService::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Cache::new(Arc::clone(&kv) as Arc<dyn KvStore>),
            TokenSigner::new(&[3u8; 32], DEFAULT_ACCESS_TTL),
            refresh_ttl,
        );
        Fixture {
            service,
            store,
            kv,
            user,
        }
    }

    #[tokio::test]
    async fn create_issues_tokens_and_caches_row() {
        let fx = fixture().await;
        let pair = fx
            .service
            .create(&fx.user, SessionMetadata::default(), HashMap::new())
            .await
            .unwrap();

        assert_eq!(pair.refresh.len(), 48);
        assert_eq!(fx.service.active_sessions(), 1);

        let cached = fx
            .kv
            .get(&SessionService::refresh_key(&pair.refresh))
            .await
            .unwrap();
        assert!(cached.is_some());

        let claims = fx.service.validate_access(&pair.access).await.unwrap();
        assert_eq!(claims.sub, fx.user.id);
        assert_eq!(claims.sid, pair.session.id);
    }

    #[tokio::test]
    async fn refresh_rotates_and_old_token_dies() {
        let fx = fixture().await;
        let pair = fx
            .service
            .create(&fx.user, SessionMetadata::default(), HashMap::new())
            .await
            .unwrap();

        let rotated = fx.service.refresh(&pair.refresh).await.unwrap();
        assert_ne!(rotated.refresh, pair.refresh);
        assert_eq!(rotated.session.id, pair.session.id);

        // The old token is gone in both the cache and the durable store.
        let replay = fx.service.refresh(&pair.refresh).await;
        assert!(matches!(replay, Err(AuthError::NotFound)));
    }

    #[tokio::test]
    async fn refresh_works_without_cache_entry() {
        let fx = fixture().await;
        let pair = fx
            .service
            .create(&fx.user, SessionMetadata::default(), HashMap::new())
            .await
            .unwrap();

        // Simulate a cold cache.
        let key = SessionService::refresh_key(&pair.refresh);
        fx.kv.delete(&[key.as_str()]).await.unwrap();

        let rotated = fx.service.refresh(&pair.refresh).await.unwrap();
        assert_ne!(rotated.refresh, pair.refresh);
    }

    #[tokio::test]
    async fn revoked_session_refuses_refresh_and_access() {
        let fx = fixture().await;
        let pair = fx
            .service
            .create(&fx.user, SessionMetadata::default(), HashMap::new())
            .await
            .unwrap();

        fx.service.revoke(pair.session.id).await.unwrap();
        assert_eq!(fx.service.active_sessions(), 0);

        let refresh = fx.service.refresh(&pair.refresh).await;
        assert!(matches!(
            refresh,
            Err(AuthError::Revoked | AuthError::NotFound)
        ));

        let access = fx.service.validate_access(&pair.access).await;
        assert!(matches!(access, Err(AuthError::Revoked)));
    }

    #[tokio::test]
    async fn revoke_unknown_session_is_not_found() {
        let fx = fixture().await;
        assert!(matches!(
            fx.service.revoke(Uuid::new_v4()).await,
            Err(AuthError::NotFound)
        ));
    }

    #[tokio::test]
    async fn revoke_user_kills_all_sessions() {
        let fx = fixture().await;
        for _ in 0..3 {
            fx.service
                .create(&fx.user, SessionMetadata::default(), HashMap::new())
                .await
                .unwrap();
        }
        assert_eq!(fx.service.active_sessions(), 3);

        let revoked = fx.service.revoke_user(fx.user.id).await.unwrap();
        assert_eq!(revoked, 3);
        assert_eq!(fx.service.active_sessions(), 0);
    }

    #[tokio::test]
    async fn expired_session_reports_expired_then_cleanup_drops_cache() {
        let fx = fixture_with_ttl(Duration::from_millis(10)).await;
        let pair = fx
            .service
            .create(&fx.user, SessionMetadata::default(), HashMap::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(matches!(
            fx.service.refresh(&pair.refresh).await,
            Err(AuthError::Expired)
        ));

        let stats = fx.service.cleanup_expired().await.unwrap();
        assert_eq!(stats.expired_active, 1);
        assert_eq!(stats.already_revoked, 0);
        assert_eq!(fx.service.active_sessions(), 0);

        // No refresh-token key survives in the hot store.
        let cached = fx
            .kv
            .get(&SessionService::refresh_key(&pair.refresh))
            .await
            .unwrap();
        assert!(cached.is_none());
        assert!(
            fx.store
                .auth_session(pair.session.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn cleanup_counts_revoked_separately() {
        let fx = fixture().await;
        let pair = fx
            .service
            .create(&fx.user, SessionMetadata::default(), HashMap::new())
            .await
            .unwrap();
        fx.service.revoke(pair.session.id).await.unwrap();

        let stats = fx.service.cleanup_expired().await.unwrap();
        assert_eq!(stats.already_revoked, 1);
        assert_eq!(stats.expired_active, 0);
        // Gauge was already decremented at revoke time.
        assert_eq!(fx.service.active_sessions(), 0);
    }

    #[tokio::test]
    async fn concurrent_refreshes_let_exactly_one_win() {
        let fx = fixture().await;
        let pair = fx
            .service
            .create(&fx.user, SessionMetadata::default(), HashMap::new())
            .await
            .unwrap();

        let service = Arc::new(fx.service);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let service = Arc::clone(&service);
            let token = pair.refresh.clone();
            handles.push(tokio::spawn(
                async move { service.refresh(&token).await },
            ));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
