//! Audit recorder.
//!
//! Writes one row per security-relevant event (logins, vault reads, session
//! open/close, permission changes). Writes are best-effort: a failing audit
//! sink is logged loudly but never turns a user-visible success into a
//! failure. Rows contain identifiers only — no secret material, no foreign
//! principals' details.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::warn;
use uuid::Uuid;

use gatehouse_storage::Store;
use gatehouse_storage::models::AuditEvent;

use crate::maintenance::Sweeper;

/// Default audit retention.
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// Appends audit rows and trims them past retention.
pub struct AuditRecorder {
    store: Arc<dyn Store>,
    retention_days: i64,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn Store>, retention_days: i64) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    /// Record an event. Failures are logged, not propagated.
    pub async fn record(
        &self,
        action: &str,
        actor_id: Option<Uuid>,
        resource: Option<(&str, Uuid)>,
        detail: serde_json::Value,
        remote_addr: Option<&str>,
    ) {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            actor_id,
            action: action.to_owned(),
            resource_type: resource.map(|(t, _)| t.to_owned()),
            resource_id: resource.map(|(_, id)| id),
            detail,
            remote_addr: remote_addr.map(str::to_owned),
        };
        if let Err(err) = self.store.append_audit(&event).await {
            warn!(action, error = %err, "audit write failed");
        }
    }

    /// The newest `limit` events.
    ///
    /// # Errors
    ///
    /// Returns the store error if the read fails.
    pub async fn recent(
        &self,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, gatehouse_storage::StoreError> {
        self.store.recent_audit(limit).await
    }

    /// Trim rows older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns the store error if the delete fails.
    pub async fn trim(&self) -> Result<u64, gatehouse_storage::StoreError> {
        let cutoff = Utc::now() - Duration::days(self.retention_days);
        self.store.trim_audit_before(cutoff).await
    }
}

impl std::fmt::Debug for AuditRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditRecorder")
            .field("retention_days", &self.retention_days)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Sweeper for AuditRecorder {
    fn name(&self) -> &'static str {
        "audit-retention"
    }

    async fn sweep(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.trim().await?)
    }
}
