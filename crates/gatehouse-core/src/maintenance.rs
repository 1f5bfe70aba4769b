//! Periodic maintenance loop.
//!
//! A single loop runs at a fixed interval and calls every registered
//! [`Sweeper`] in sequence. Each sweep is bounded by its own timeout; one
//! failing sweeper never cancels the others. On shutdown the loop runs one
//! final pass to flush.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default interval between maintenance passes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Upper bound for a single sweeper invocation.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(60);

/// A periodic expiry hook registered by an owning component.
#[async_trait::async_trait]
pub trait Sweeper: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Run one sweep, returning how many records were reclaimed.
    ///
    /// # Errors
    ///
    /// Implementations surface their own store errors; the loop logs and
    /// moves on.
    async fn sweep(&self) -> Result<u64, Box<dyn std::error::Error + Send + Sync>>;
}

/// Runs registered sweepers on a fixed cadence.
pub struct MaintenanceLoop {
    interval: Duration,
    sweepers: Vec<Arc<dyn Sweeper>>,
}

impl MaintenanceLoop {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            sweepers: Vec::new(),
        }
    }

    /// Register a sweep hook. Order of registration is the order of
    /// execution in every pass.
    pub fn register(&mut self, sweeper: Arc<dyn Sweeper>) {
        self.sweepers.push(sweeper);
    }

    /// Run one pass over all sweepers.
    pub async fn run_once(&self) {
        for sweeper in &self.sweepers {
            match tokio::time::timeout(SWEEP_TIMEOUT, sweeper.sweep()).await {
                Ok(Ok(reclaimed)) => {
                    if reclaimed > 0 {
                        info!(sweeper = sweeper.name(), reclaimed, "sweep complete");
                    } else {
                        debug!(sweeper = sweeper.name(), "sweep complete, nothing to do");
                    }
                }
                Ok(Err(err)) => {
                    warn!(sweeper = sweeper.name(), error = %err, "sweep failed");
                }
                Err(_) => {
                    warn!(sweeper = sweeper.name(), "sweep timed out");
                }
            }
        }
    }

    /// Loop until the shutdown signal flips, then flush with a final pass.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so boot isn't dominated
        // by a sweep.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("maintenance loop flushing before shutdown");
        self.run_once().await;
    }
}

impl std::fmt::Debug for MaintenanceLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceLoop")
            .field("interval", &self.interval)
            .field("sweepers", &self.sweepers.len())
            .finish()
    }
}
