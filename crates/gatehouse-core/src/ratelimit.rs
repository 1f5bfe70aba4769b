//! Sliding-window rate limiter.
//!
//! Keys are `<scope>:<subject>` (e.g. `login:ip:203.0.113.7`). Each hit
//! runs the KV store's atomic counter-with-window; exceeding the threshold
//! denies with `retry_after` equal to the window remainder. The limiter
//! prefers the hot KV backend and falls back to the durable one; if both
//! fail the request is allowed — a broken counter store must not take the
//! gateway down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::warn;

use gatehouse_storage::KvStore;

/// A denial verdict carrying the remaining window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    pub retry_after: Duration,
}

/// One named limit: at most `limit` hits per `window`.
#[derive(Debug, Clone, Copy)]
pub struct LimitRule {
    pub limit: u64,
    pub window: Duration,
}

impl LimitRule {
    #[must_use]
    pub const fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Sliding-window counters over a KV store, with durable fallback.
pub struct RateLimiter {
    primary: Arc<dyn KvStore>,
    fallback: Option<Arc<dyn KvStore>>,
    degraded_logged: AtomicBool,
}

impl RateLimiter {
    #[must_use]
    pub fn new(primary: Arc<dyn KvStore>, fallback: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            primary,
            fallback,
            degraded_logged: AtomicBool::new(false),
        }
    }

    /// Count a hit against `scope:subject`. Returns the denial when the
    /// count exceeds the rule's limit.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimited`] when over the limit. Store failures never
    /// surface; they degrade to allowing the request.
    pub async fn hit(
        &self,
        scope: &str,
        subject: &str,
        rule: LimitRule,
    ) -> Result<(), RateLimited> {
        let key = format!("ratelimit:{scope}:{subject}");

        let outcome = match self.primary.increment_with_ttl(&key, rule.window).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                if !self.degraded_logged.swap(true, Ordering::Relaxed) {
                    warn!(scope, error = %err, "hot rate-limit store failed, using fallback");
                }
                match &self.fallback {
                    Some(durable) => durable.increment_with_ttl(&key, rule.window).await.ok(),
                    None => None,
                }
            }
        };

        match outcome {
            Some((count, remaining)) if count > rule.limit => Err(RateLimited {
                retry_after: remaining,
            }),
            Some(_) => Ok(()),
            // Both backends down: allow rather than lock everyone out.
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("has_fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}
