// SPDX-License-Identifier: Apache-2.0

//! Driver Registry
//!
//! Maps the `driver` field of a connection profile to the driver that opens
//! connections for it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::drivers::postgres::PostgresDriver;
use crate::engine::drivers::sqlite::SqliteDriver;
use crate::engine::traits::DataEngine;

/// Registry that holds all available backend drivers
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn DataEngine>>,
}

impl DriverRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in network and file drivers
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PostgresDriver::new()));
        registry.register(Arc::new(SqliteDriver::new()));
        registry
    }

    /// Registers a driver under its `driver_id()`, replacing any previous one
    pub fn register(&mut self, driver: Arc<dyn DataEngine>) {
        let id = driver.driver_id().to_string();
        self.drivers.insert(id, driver);
    }

    /// Gets a driver by its ID
    pub fn get(&self, driver_id: &str) -> Option<Arc<dyn DataEngine>> {
        self.drivers.get(driver_id).cloned()
    }

    /// Lists all registered driver IDs, sorted
    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.drivers.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::drivers::memory::MemoryDriver;

    #[test]
    fn builtin_drivers_are_registered() {
        let registry = DriverRegistry::with_builtin_drivers();
        assert_eq!(registry.list(), vec!["postgres", "sqlite"]);
        assert!(registry.get("mysql").is_none());
    }

    #[test]
    fn register_replaces_same_id() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(MemoryDriver::new()));
        registry.register(Arc::new(MemoryDriver::new()));
        assert_eq!(registry.list(), vec!["memory"]);
        assert_eq!(registry.get("memory").unwrap().driver_name(), "In-memory");
    }
}
