//! Gatehouse server entry point.
//!
//! Boot order: configuration, logging, durable store, KV backends,
//! permission registry (deterministic builder), core services, root-user
//! bootstrap, driver registry + catalog sync, session broker, maintenance
//! loop, HTTP listener. Shutdown reverses it: stop accepting, let the
//! broker end live sessions within the grace window, flush maintenance,
//! drop the stores.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use gatehouse_broker::tcp::TcpBridgeDriver;
use gatehouse_broker::{DriverRegistry, RecordingSweeper, SessionBroker};
use gatehouse_core::audit::AuditRecorder;
use gatehouse_core::auth::AuthService;
use gatehouse_core::cache::Cache;
use gatehouse_core::crypto;
use gatehouse_core::maintenance::{MaintenanceLoop, Sweeper};
use gatehouse_core::permission::{PermissionChecker, builtin_registry};
use gatehouse_core::ratelimit::{LimitRule, RateLimiter};
use gatehouse_core::session::SessionService;
use gatehouse_core::settings::{SettingsService, keys};
use gatehouse_core::sso::SsoResolver;
use gatehouse_core::token::TokenSigner;
use gatehouse_core::vault::VaultService;
use gatehouse_storage::models::User;
use gatehouse_storage::{KvStore, MemoryKv, MemoryStore, PostgresKv, PostgresStore, Store};

use gatehouse_server::config::{CacheBackend, ServerConfig};
use gatehouse_server::routes;
use gatehouse_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("configuration error")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!("gatehouse starting");

    let (state, maintenance) = build_state(&config).await?;

    // Maintenance loop with its own shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance_handle = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { maintenance.run(rx).await })
    };

    let app = routes::router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "gatehouse listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    // Listener is closed; end live sessions within the grace window.
    info!("shutting down live sessions");
    state.broker.shutdown(config.shutdown_grace).await;

    // Final maintenance pass, then let the loop exit.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(30), maintenance_handle).await;

    info!("gatehouse stopped");
    Ok(())
}

async fn build_state(config: &ServerConfig) -> anyhow::Result<(Arc<AppState>, MaintenanceLoop)> {
    // Durable store: PostgreSQL, or the in-memory store for development.
    let (store, durable_kv): (Arc<dyn Store>, Option<PostgresKv>) = match &config.database_url {
        Some(url) => {
            let postgres = PostgresStore::connect(url)
                .await
                .context("failed to connect to PostgreSQL")?;
            let kv = PostgresKv::new(postgres.pool().clone());
            info!("using PostgreSQL storage");
            (Arc::new(postgres), Some(kv))
        }
        None => {
            warn!("DATABASE_URL not set — using in-memory storage, data will not persist");
            (Arc::new(MemoryStore::new()), None)
        }
    };

    // Hot-path KV: in-process shards by default; the durable table when
    // configured. The limiter keeps the durable backend as fallback so a
    // hot-store failure degrades instead of failing requests.
    let memory_kv = Arc::new(MemoryKv::new());
    let (cache_kv, limiter): (Arc<dyn KvStore>, RateLimiter) = match config.cache_backend {
        CacheBackend::Memory => {
            let fallback = durable_kv
                .clone()
                .map(|kv| Arc::new(kv) as Arc<dyn KvStore>);
            (
                Arc::clone(&memory_kv) as Arc<dyn KvStore>,
                RateLimiter::new(Arc::clone(&memory_kv) as Arc<dyn KvStore>, fallback),
            )
        }
        CacheBackend::Database => match durable_kv.clone() {
            Some(kv) => {
                let durable = Arc::new(kv) as Arc<dyn KvStore>;
                (Arc::clone(&durable), RateLimiter::new(durable, None))
            }
            None => {
                warn!("durable cache requested without DATABASE_URL — using memory");
                (
                    Arc::clone(&memory_kv) as Arc<dyn KvStore>,
                    RateLimiter::new(Arc::clone(&memory_kv) as Arc<dyn KvStore>, None),
                )
            }
        },
    };

    // Permission registry: built once, immutable, threaded through.
    let registry = Arc::new(builtin_registry().context("permission registry")?);
    let checker = Arc::new(PermissionChecker::new(registry, Arc::clone(&store)));

    let settings = Arc::new(SettingsService::new(Arc::clone(&store)));
    let audit = Arc::new(AuditRecorder::new(
        Arc::clone(&store),
        config.audit_retention_days,
    ));

    let signer = TokenSigner::new(&config.jwt_secret, config.access_ttl);
    let sessions = Arc::new(SessionService::new(
        Arc::clone(&store),
        Cache::new(Arc::clone(&cache_kv)),
        signer,
        config.refresh_ttl,
    ));
    let auth = Arc::new(AuthService::new(
        Arc::clone(&store),
        Arc::clone(&sessions),
    ));
    let sso = Arc::new(SsoResolver::new(
        Arc::clone(&store),
        Arc::clone(&sessions),
        config.sso_auto_provision,
    ));

    let vault = Arc::new(VaultService::new(
        Arc::clone(&store),
        config.vault_key.clone(),
        Arc::clone(&audit),
    ));
    if config.vault_key_to_settings {
        // Explicit multi-node opt-in: mirror the operator-provisioned key.
        settings
            .put(
                keys::VAULT_KEY,
                &URL_SAFE_NO_PAD.encode(config.vault_key.as_bytes()),
            )
            .await
            .context("failed to mirror vault key into settings")?;
        info!("vault key mirrored into system settings");
    }

    ensure_root_user(&store, config).await?;

    // Driver registry: built-ins, config gating, catalog sync.
    let drivers = Arc::new(DriverRegistry::new());
    drivers
        .register(Arc::new(TcpBridgeDriver::new()))
        .context("driver registration")?;
    drivers.configure(&config.protocols_enabled);
    drivers
        .sync_catalog(&settings)
        .await
        .context("catalog sync")?;

    let broker = Arc::new(SessionBroker::new(
        Arc::clone(&store),
        Arc::clone(&drivers),
        Arc::clone(&checker),
        Arc::clone(&vault),
        Arc::clone(&settings),
        Arc::clone(&audit),
        config.recording_root.clone(),
    ));

    // Maintenance: each owning component registers its sweep hook.
    let mut maintenance = MaintenanceLoop::new(config.maintenance_interval);
    maintenance.register(Arc::clone(&sessions) as Arc<dyn Sweeper>);
    maintenance.register(Arc::clone(&audit) as Arc<dyn Sweeper>);
    maintenance.register(Arc::clone(&vault) as Arc<dyn Sweeper>);
    maintenance.register(Arc::new(RecordingSweeper::new(Arc::clone(&store))));
    maintenance.register(Arc::new(MemoryKvSweeper(Arc::clone(&memory_kv))));
    if let Some(kv) = durable_kv {
        maintenance.register(Arc::new(PostgresKvSweeper(kv)));
    }

    let state = Arc::new(AppState {
        store,
        sessions,
        auth,
        sso,
        checker,
        vault,
        settings,
        audit,
        drivers,
        broker,
        limiter: Arc::new(limiter),
        login_rule: LimitRule::new(config.login_rate_limit, config.login_rate_window),
    });

    Ok((state, maintenance))
}

/// Create the initial root user when configured and absent. After this,
/// exactly one root account exists on a fresh install.
async fn ensure_root_user(store: &Arc<dyn Store>, config: &ServerConfig) -> anyhow::Result<()> {
    let Some((username, password)) = &config.root_user else {
        return Ok(());
    };
    if store
        .user_by_username(username)
        .await
        .context("root bootstrap lookup")?
        .is_some()
    {
        return Ok(());
    }

    let user = User {
        id: Uuid::new_v4(),
        username: username.clone(),
        email: format!("{username}@localhost").to_lowercase(),
        password_hash: crypto::hash_password(password).context("root password hash")?,
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
    store.insert_user(&user).await.context("root bootstrap")?;
    info!(username = %username, "root user created");
    Ok(())
}

struct MemoryKvSweeper(Arc<MemoryKv>);

#[async_trait::async_trait]
impl Sweeper for MemoryKvSweeper {
    fn name(&self) -> &'static str {
        "hot-cache"
    }

    async fn sweep(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.0.purge_expired().await)
    }
}

struct PostgresKvSweeper(PostgresKv);

#[async_trait::async_trait]
impl Sweeper for PostgresKvSweeper {
    fn name(&self) -> &'static str {
        "durable-cache"
    }

    async fn sweep(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.0.purge_expired().await?)
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
