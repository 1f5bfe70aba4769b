//! Durable KV backend over PostgreSQL.
//!
//! Rows live in the `cache_entries` table. `increment_with_ttl` runs in a
//! transaction with `SELECT … FOR UPDATE` so concurrent increments on the
//! same key are serialised by a row lock instead of racing on
//! read-modify-write.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;

use crate::{KvStore, StoreError};

/// Durable KV store used when no hot backend is configured (and as the
/// fallback target when the hot path degrades).
#[derive(Clone)]
pub struct PostgresKv {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresKv").finish_non_exhaustive()
    }
}

impl PostgresKv {
    /// Wrap an existing pool. The `cache_entries` table is created by
    /// [`crate::PostgresStore::migrate`].
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete every expired row. Called by the maintenance loop.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Delete`] if the query fails.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Delete {
                what: "cache_entries (expired)".to_owned(),
                reason: e.to_string(),
            })?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl KvStore for PostgresKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT value FROM cache_entries \
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Read {
            what: key.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(row.map(|(v,)| v))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.and_then(|d| {
            chrono::Duration::from_std(d)
                .ok()
                .map(|d| Utc::now() + d)
        });

        sqlx::query(
            "INSERT INTO cache_entries (key, value, counter, expires_at) \
             VALUES ($1, $2, 0, $3) \
             ON CONFLICT (key) DO UPDATE \
             SET value = EXCLUDED.value, counter = 0, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Write {
            what: key.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let owned: Vec<String> = keys.iter().map(|k| (*k).to_owned()).collect();
        sqlx::query("DELETE FROM cache_entries WHERE key = ANY($1)")
            .bind(&owned)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Delete {
                what: format!("{} cache keys", keys.len()),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn increment_with_ttl(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<(u64, Duration), StoreError> {
        let wrap = |e: sqlx::Error| StoreError::Write {
            what: key.to_owned(),
            reason: e.to_string(),
        };

        let window_chrono = chrono::Duration::from_std(window).map_err(|e| StoreError::Write {
            what: key.to_owned(),
            reason: format!("window out of range: {e}"),
        })?;
        let new_expiry = Utc::now() + window_chrono;

        let mut tx = self.pool.begin().await.map_err(wrap)?;

        // Row lock serialises concurrent increments on this key.
        let existing: Option<(i64, Option<chrono::DateTime<Utc>>)> = sqlx::query_as(
            "SELECT counter, expires_at FROM cache_entries WHERE key = $1 FOR UPDATE",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(wrap)?;

        let count = match existing {
            Some((counter, expires_at))
                if expires_at.is_none_or(|at| at > Utc::now()) =>
            {
                let next = counter.saturating_add(1);
                sqlx::query(
                    "UPDATE cache_entries SET counter = $2, expires_at = $3 WHERE key = $1",
                )
                .bind(key)
                .bind(next)
                .bind(new_expiry)
                .execute(&mut *tx)
                .await
                .map_err(wrap)?;
                next
            }
            _ => {
                sqlx::query(
                    "INSERT INTO cache_entries (key, value, counter, expires_at) \
                     VALUES ($1, ''::bytea, 1, $2) \
                     ON CONFLICT (key) DO UPDATE \
                     SET counter = 1, expires_at = EXCLUDED.expires_at",
                )
                .bind(key)
                .bind(new_expiry)
                .execute(&mut *tx)
                .await
                .map_err(wrap)?;
                1
            }
        };

        tx.commit().await.map_err(wrap)?;

        #[allow(clippy::cast_sign_loss)]
        Ok((count as u64, window))
    }
}
