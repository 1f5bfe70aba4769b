//! Key/value contract for caches and rate-limit counters.

use std::time::Duration;

use crate::StoreError;

/// A uniform key/value store with TTL support and an atomic
/// counter-with-sliding-window primitive.
///
/// Keys are UTF-8 strings namespaced with `:` (e.g. `session:refresh:<tok>`,
/// `ratelimit:login:ip:203.0.113.7`). Values are opaque bytes.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`)
/// and must honour expiry on read: a value whose TTL has passed is treated
/// as absent.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Fetch a value. Returns `Ok(None)` for missing or expired keys.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Read`] if the backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Upsert a value with an optional TTL. `None` means no expiry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the backend fails.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete keys. Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Delete`] if the backend fails.
    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError>;

    /// Atomic counter with a sliding window.
    ///
    /// If the key is absent or its expiry has passed, the count becomes 1
    /// with expiry `now + window`. Otherwise the count is incremented and
    /// the expiry is reset to `now + window`. Returns the resulting count
    /// and the remaining TTL (always `window` immediately after this call).
    ///
    /// Concurrent increments of the same key are serialised by the backend.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the backend fails.
    async fn increment_with_ttl(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<(u64, Duration), StoreError>;
}
