// SPDX-License-Identifier: Apache-2.0

//! Configuration collaborator
//!
//! Connection profiles, the table mapping and the join rules, plus the
//! administrative operations that are the only way to change them. Query
//! execution reads a [`FederationConfig`] and never mutates it.

pub mod store;

pub use store::ConfigStore;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::federation::rules::JoinRule;

fn default_driver() -> String {
    "postgres".to_string()
}

/// Where one backend lives. Credentials are kept by the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    pub database: String,
}

impl ConnectionProfile {
    pub fn new(
        driver: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
    ) -> Self {
        Self {
            driver: driver.into(),
            host: host.into(),
            port,
            database: database.into(),
        }
    }
}

/// Everything the federation engine needs besides credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Backend name → connection profile
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionProfile>,
    /// Table identifier → backend name
    #[serde(default)]
    pub table_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub join_rules: Vec<JoinRule>,
}

impl FederationConfig {
    /// Adds or replaces a connection profile
    pub fn add_connection(&mut self, name: impl Into<String>, profile: ConnectionProfile) -> EngineResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EngineError::configuration("Connection name cannot be empty"));
        }
        self.connections.insert(name, profile);
        Ok(())
    }

    /// Removes a connection profile. Refused while tables are mapped to it.
    pub fn remove_connection(&mut self, name: &str) -> EngineResult<ConnectionProfile> {
        let mapped: Vec<&str> = self
            .table_mapping
            .iter()
            .filter(|(_, backend)| backend.as_str() == name)
            .map(|(table, _)| table.as_str())
            .collect();
        if !mapped.is_empty() {
            return Err(EngineError::configuration(format!(
                "Connection '{name}' still has mapped tables: {}",
                mapped.join(", ")
            )));
        }
        self.connections.remove(name).ok_or_else(|| {
            EngineError::configuration(format!("Unknown connection '{name}'"))
        })
    }

    /// Maps `table` to `backend`, returning the backend it was mapped to before
    pub fn map_table(&mut self, table: impl Into<String>, backend: &str) -> EngineResult<Option<String>> {
        let table = table.into();
        if table.trim().is_empty() {
            return Err(EngineError::configuration("Table identifier cannot be empty"));
        }
        if !self.connections.contains_key(backend) {
            return Err(EngineError::configuration(format!(
                "Unknown connection '{backend}'"
            )));
        }
        Ok(self.table_mapping.insert(table, backend.to_string()))
    }

    pub fn unmap_table(&mut self, table: &str) -> EngineResult<String> {
        self.table_mapping.remove(table).ok_or_else(|| {
            EngineError::configuration(format!("Table '{table}' is not mapped"))
        })
    }

    pub fn add_join_rule(&mut self, rule: JoinRule) -> EngineResult<()> {
        rule.validate()?;
        self.join_rules.push(rule);
        Ok(())
    }

    pub fn update_join_rule(&mut self, index: usize, rule: JoinRule) -> EngineResult<()> {
        rule.validate()?;
        let slot = self
            .join_rules
            .get_mut(index)
            .ok_or_else(|| EngineError::configuration(format!("No join rule at index {index}")))?;
        *slot = rule;
        Ok(())
    }

    pub fn remove_join_rule(&mut self, index: usize) -> EngineResult<JoinRule> {
        if index >= self.join_rules.len() {
            return Err(EngineError::configuration(format!(
                "No join rule at index {index}"
            )));
        }
        Ok(self.join_rules.remove(index))
    }
}
