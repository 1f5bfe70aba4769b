//! Driver registry and protocol catalog.
//!
//! Populated once at boot from the built-in driver list plus whatever
//! collaborator drivers the embedding process registers. Enablement is the
//! conjunction of `driver.available()` and the config flag for the
//! driver's module. The map is read-mostly after boot, so a plain mutex
//! is enough.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use gatehouse_core::settings::{SettingsService, keys};
use gatehouse_storage::StoreError;

use crate::driver::{Capabilities, Descriptor, Driver};
use crate::error::BrokerError;

/// One row of the protocol catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub descriptor: Descriptor,
    pub capabilities: Capabilities,
    pub enabled: bool,
}

/// Registry of protocol drivers.
pub struct DriverRegistry {
    drivers: Mutex<HashMap<String, Arc<dyn Driver>>>,
    /// Modules explicitly disabled by configuration.
    disabled_modules: Mutex<HashSet<String>>,
}

impl DriverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            drivers: Mutex::new(HashMap::new()),
            disabled_modules: Mutex::new(HashSet::new()),
        }
    }

    /// Register a driver under its descriptor ID.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DuplicateDriver`] if the ID is taken.
    pub fn register(&self, driver: Arc<dyn Driver>) -> Result<(), BrokerError> {
        let id = driver.descriptor().id;
        let mut drivers = lock_unpoisoned(&self.drivers);
        if drivers.contains_key(&id) {
            return Err(BrokerError::DuplicateDriver { driver: id });
        }
        info!(driver = %id, "protocol driver registered");
        drivers.insert(id, driver);
        Ok(())
    }

    /// Apply the config-side enablement map. Modules absent from the map
    /// stay enabled.
    pub fn configure(&self, enabled: &HashMap<String, bool>) {
        let mut disabled = lock_unpoisoned(&self.disabled_modules);
        disabled.clear();
        for (module, on) in enabled {
            if !on {
                disabled.insert(module.clone());
            }
        }
    }

    /// Look up a driver regardless of enablement.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn Driver>> {
        lock_unpoisoned(&self.drivers).get(id).cloned()
    }

    /// Look up a driver, honouring availability and config enablement.
    #[must_use]
    pub fn get_enabled(&self, id: &str) -> Option<Arc<dyn Driver>> {
        let driver = self.get(id)?;
        if self.is_enabled(&*driver) {
            Some(driver)
        } else {
            None
        }
    }

    /// The full catalog, sorted by `sort_order` then ID.
    #[must_use]
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        let drivers: Vec<Arc<dyn Driver>> =
            lock_unpoisoned(&self.drivers).values().cloned().collect();
        let mut entries: Vec<CatalogEntry> = drivers
            .iter()
            .map(|driver| CatalogEntry {
                descriptor: driver.descriptor(),
                capabilities: driver.capabilities(),
                enabled: self.is_enabled(&**driver),
            })
            .collect();
        entries.sort_by(|a, b| {
            a.descriptor
                .sort_order
                .cmp(&b.descriptor.sort_order)
                .then_with(|| a.descriptor.id.cmp(&b.descriptor.id))
        });
        entries
    }

    /// Persist the current catalog into durable settings so UIs render
    /// the protocol list without calling into drivers.
    ///
    /// # Errors
    ///
    /// Returns the store error if the settings write fails.
    pub async fn sync_catalog(&self, settings: &SettingsService) -> Result<(), StoreError> {
        let catalog = self.catalog();
        settings.put(keys::ENABLED_DRIVERS, &catalog).await?;
        info!(
            drivers = catalog.len(),
            enabled = catalog.iter().filter(|e| e.enabled).count(),
            "protocol catalog synced"
        );
        Ok(())
    }

    fn is_enabled(&self, driver: &dyn Driver) -> bool {
        driver.available()
            && !lock_unpoisoned(&self.disabled_modules).contains(&driver.descriptor().module)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &lock_unpoisoned(&self.drivers).len())
            .finish_non_exhaustive()
    }
}

/// Mutex poisoning cannot happen here (no panicking code holds the lock),
/// but the lint wall forbids `unwrap`.
fn lock_unpoisoned<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
