//! Server configuration.
//!
//! Everything loads from `GATEHOUSE_*` environment variables with sensible
//! defaults, except the two required secrets: the JWT signing secret (at
//! least 32 decoded bytes) and the vault encryption key (exactly 32
//! decoded bytes). Missing or malformed secrets abort boot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use gatehouse_core::crypto::{self, SecretKey};

/// Boot-time configuration errors. Fatal by design.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is required")]
    Missing { name: &'static str },

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Which backend serves the session cache and rate-limit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    /// In-process sharded store (hot path, default).
    Memory,
    /// Durable `cache_entries` table only.
    Database,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// PostgreSQL URL. `None` runs the in-memory store (development only).
    pub database_url: Option<String>,
    pub cache_backend: CacheBackend,
    /// Decoded JWT signing secret, ≥ 32 bytes.
    pub jwt_secret: Vec<u8>,
    /// Decoded 32-byte vault key.
    pub vault_key: SecretKey,
    /// Mirror the vault key into system settings (explicit multi-node
    /// opt-in; never implicit).
    pub vault_key_to_settings: bool,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub log_level: String,
    pub sso_auto_provision: bool,
    /// Root of the recording store on the filesystem.
    pub recording_root: PathBuf,
    pub maintenance_interval: Duration,
    /// Login attempts allowed per source IP per window.
    pub login_rate_limit: u64,
    pub login_rate_window: Duration,
    /// Module → enabled. Modules absent from the map stay enabled.
    pub protocols_enabled: HashMap<String, bool>,
    pub audit_retention_days: i64,
    /// Bootstrap root credentials, applied only when no such user exists.
    pub root_user: Option<(String, String)>,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Load configuration from the environment.
    ///
    /// Environment variables:
    /// - `GATEHOUSE_BIND_ADDR` — listener address (default `127.0.0.1:8443`)
    /// - `DATABASE_URL` — PostgreSQL connection string (in-memory store
    ///   when unset)
    /// - `GATEHOUSE_CACHE` — `memory` (default) or `database`
    /// - `GATEHOUSE_JWT_SECRET` — required, ≥ 32 bytes after decoding
    /// - `GATEHOUSE_VAULT_KEY` — required, exactly 32 bytes after decoding
    /// - `GATEHOUSE_VAULT_KEY_TO_SETTINGS` — `true` to mirror the key into
    ///   system settings
    /// - `GATEHOUSE_ACCESS_TTL_SECS` / `GATEHOUSE_REFRESH_TTL_SECS`
    /// - `GATEHOUSE_LOG_LEVEL` — tracing filter (default `info`)
    /// - `GATEHOUSE_SSO_AUTO_PROVISION` — default `true`
    /// - `GATEHOUSE_RECORDING_ROOT` — default `./recordings`
    /// - `GATEHOUSE_MAINTENANCE_INTERVAL_SECS` — default `300`
    /// - `GATEHOUSE_LOGIN_RATE_LIMIT` / `GATEHOUSE_LOGIN_RATE_WINDOW_SECS`
    /// - `GATEHOUSE_PROTOCOLS_DISABLED` — comma-separated module list
    /// - `GATEHOUSE_AUDIT_RETENTION_DAYS` — default `90`
    /// - `GATEHOUSE_ROOT_USER` / `GATEHOUSE_ROOT_PASSWORD` — initial root
    /// - `GATEHOUSE_SHUTDOWN_GRACE_SECS` — default `15`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required secret is missing or fails
    /// its size requirement.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = match std::env::var("GATEHOUSE_BIND_ADDR") {
            Ok(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
                name: "GATEHOUSE_BIND_ADDR",
                reason: format!("{e}"),
            })?,
            Err(_) => SocketAddr::from(([127, 0, 0, 1], 8443)),
        };

        let database_url = std::env::var("DATABASE_URL").ok();

        let cache_backend = match std::env::var("GATEHOUSE_CACHE")
            .unwrap_or_else(|_| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "database" | "durable" => CacheBackend::Database,
            _ => CacheBackend::Memory,
        };

        let jwt_secret_raw = std::env::var("GATEHOUSE_JWT_SECRET").map_err(|_| {
            ConfigError::Missing {
                name: "GATEHOUSE_JWT_SECRET",
            }
        })?;
        let jwt_secret =
            crypto::decode_key(&jwt_secret_raw).map_err(|e| ConfigError::Invalid {
                name: "GATEHOUSE_JWT_SECRET",
                reason: e.to_string(),
            })?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid {
                name: "GATEHOUSE_JWT_SECRET",
                reason: format!("must decode to at least 32 bytes, got {}", jwt_secret.len()),
            });
        }

        let vault_key_raw = std::env::var("GATEHOUSE_VAULT_KEY").map_err(|_| {
            ConfigError::Missing {
                name: "GATEHOUSE_VAULT_KEY",
            }
        })?;
        let vault_key =
            crypto::decode_secret_key(&vault_key_raw).map_err(|e| ConfigError::Invalid {
                name: "GATEHOUSE_VAULT_KEY",
                reason: e.to_string(),
            })?;

        let protocols_enabled = std::env::var("GATEHOUSE_PROTOCOLS_DISABLED")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(|m| (m.to_owned(), false))
                    .collect()
            })
            .unwrap_or_default();

        let root_user = match (
            std::env::var("GATEHOUSE_ROOT_USER"),
            std::env::var("GATEHOUSE_ROOT_PASSWORD"),
        ) {
            (Ok(user), Ok(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user, password))
            }
            _ => None,
        };

        Ok(Self {
            bind_addr,
            database_url,
            cache_backend,
            jwt_secret,
            vault_key,
            vault_key_to_settings: env_bool("GATEHOUSE_VAULT_KEY_TO_SETTINGS", false),
            access_ttl: env_secs("GATEHOUSE_ACCESS_TTL_SECS", 15 * 60),
            refresh_ttl: env_secs("GATEHOUSE_REFRESH_TTL_SECS", 7 * 24 * 60 * 60),
            log_level: std::env::var("GATEHOUSE_LOG_LEVEL")
                .unwrap_or_else(|_| "info".to_owned()),
            sso_auto_provision: env_bool("GATEHOUSE_SSO_AUTO_PROVISION", true),
            recording_root: std::env::var("GATEHOUSE_RECORDING_ROOT")
                .map_or_else(|_| PathBuf::from("./recordings"), PathBuf::from),
            maintenance_interval: env_secs("GATEHOUSE_MAINTENANCE_INTERVAL_SECS", 300),
            login_rate_limit: std::env::var("GATEHOUSE_LOGIN_RATE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            login_rate_window: env_secs("GATEHOUSE_LOGIN_RATE_WINDOW_SECS", 60),
            protocols_enabled,
            audit_retention_days: std::env::var("GATEHOUSE_AUDIT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90),
            root_user,
            shutdown_grace: env_secs("GATEHOUSE_SHUTDOWN_GRACE_SECS", 15),
        })
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}
