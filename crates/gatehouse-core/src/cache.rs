//! Cache-through helper.
//!
//! Encodes the cache invariant once so every caller inherits it: DB writes
//! precede cache writes, cache deletes precede DB deletes, and a cache
//! failure never fails the operation — it is logged and the caller carries
//! on against the durable store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use gatehouse_storage::KvStore;

/// A degrading JSON cache over a [`KvStore`].
///
/// All operations are best-effort: errors are swallowed after a `warn` log
/// (emitted once per cache instance, then suppressed to avoid log storms
/// while the hot store is down).
#[derive(Clone)]
pub struct Cache {
    kv: Arc<dyn KvStore>,
    degraded_logged: Arc<AtomicBool>,
}

impl Cache {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            degraded_logged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fetch and decode a cached value. Misses, decode failures and backend
    /// errors all read as `None`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.kv.get(key).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(err) => {
                self.log_degraded("get", key, &err.to_string());
                None
            }
        }
    }

    /// Encode and store a value. Call only after the DB write has succeeded.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let Ok(bytes) = serde_json::to_vec(value) else {
            return;
        };
        if let Err(err) = self.kv.set(key, &bytes, ttl).await {
            self.log_degraded("put", key, &err.to_string());
        }
    }

    /// Delete cache entries. Call before the corresponding DB delete.
    pub async fn delete(&self, keys: &[&str]) {
        if let Err(err) = self.kv.delete(keys).await {
            self.log_degraded("delete", keys.first().unwrap_or(&""), &err.to_string());
        }
    }

    fn log_degraded(&self, op: &str, key: &str, reason: &str) {
        if !self.degraded_logged.swap(true, Ordering::Relaxed) {
            warn!(op, key, reason, "cache degraded, continuing against durable store");
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}
