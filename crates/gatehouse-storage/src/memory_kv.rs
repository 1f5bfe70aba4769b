//! In-process hot KV store.
//!
//! Entries are spread over a fixed number of shards, each behind its own
//! mutex, so counter traffic on different keys does not contend. Expiry is
//! lazy: reads treat a stale entry as absent and the sweep in
//! [`MemoryKv::purge_expired`] reclaims memory.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::{KvStore, StoreError};

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    counter: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A sharded in-memory KV store with TTL'd atomic counters.
///
/// This is the hot path for the rate limiter and session cache on a single
/// node. Data does not survive a restart — the durable Postgres KV is the
/// fallback backend.
#[derive(Debug, Clone)]
pub struct MemoryKv {
    shards: Arc<[Mutex<HashMap<String, Entry>>; SHARD_COUNT]>,
}

impl MemoryKv {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: Arc::new(std::array::from_fn(|_| Mutex::new(HashMap::new()))),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % SHARD_COUNT;
        &self.shards[idx]
    }

    /// Drop every expired entry. Called by the maintenance loop.
    pub async fn purge_expired(&self) -> u64 {
        let now = Instant::now();
        let mut purged = 0;
        for shard in self.shards.iter() {
            let mut map = shard.lock().await;
            let before = map.len();
            map.retain(|_, e| !e.is_expired(now));
            purged += (before - map.len()) as u64;
        }
        purged
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.shard(key).lock().await;
        let now = Instant::now();
        Ok(map
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut map = self.shard(key).lock().await;
        map.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                counter: 0,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        for key in keys {
            let mut map = self.shard(key).lock().await;
            map.remove(*key);
        }
        Ok(())
    }

    async fn increment_with_ttl(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<(u64, Duration), StoreError> {
        let mut map = self.shard(key).lock().await;
        let now = Instant::now();

        let count = match map.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.counter += 1;
                entry.expires_at = Some(now + window);
                entry.counter
            }
            _ => {
                map.insert(
                    key.to_owned(),
                    Entry {
                        value: Vec::new(),
                        counter: 1,
                        expires_at: Some(now + window),
                    },
                );
                1
            }
        };

        Ok((count, window))
    }
}
