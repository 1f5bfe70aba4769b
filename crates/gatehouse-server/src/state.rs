//! Shared application state.
//!
//! One [`AppState`] is built at startup and shared across all handlers via
//! `Arc`. It holds the durable store, the core services, the driver
//! registry and the session broker.

use std::sync::Arc;

use gatehouse_broker::{DriverRegistry, SessionBroker};
use gatehouse_core::audit::AuditRecorder;
use gatehouse_core::auth::AuthService;
use gatehouse_core::permission::PermissionChecker;
use gatehouse_core::ratelimit::{LimitRule, RateLimiter};
use gatehouse_core::session::SessionService;
use gatehouse_core::settings::SettingsService;
use gatehouse_core::sso::SsoResolver;
use gatehouse_core::vault::VaultService;
use gatehouse_storage::Store;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub sessions: Arc<SessionService>,
    pub auth: Arc<AuthService>,
    pub sso: Arc<SsoResolver>,
    pub checker: Arc<PermissionChecker>,
    pub vault: Arc<VaultService>,
    pub settings: Arc<SettingsService>,
    pub audit: Arc<AuditRecorder>,
    pub drivers: Arc<DriverRegistry>,
    pub broker: Arc<SessionBroker>,
    pub limiter: Arc<RateLimiter>,
    /// Login attempts per source IP.
    pub login_rule: LimitRule,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
