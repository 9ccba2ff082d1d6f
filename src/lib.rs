// SPDX-License-Identifier: Apache-2.0

// vfdw - query tables living in independent relational backends as one database
// Core library

pub mod config;
pub mod engine;
pub mod export;
pub mod federation;
pub mod observability;
pub mod vault;

use std::sync::Arc;

pub use config::{ConfigStore, ConnectionProfile, FederationConfig};
pub use engine::{DriverRegistry, EngineError, EngineResult, QueryError};
pub use federation::{FederatedResult, FederationEngine, FederationPlan, JoinRule, JoinType};
pub use vault::{CredentialProvider, Credentials, KeyringProvider, MemoryCredentialProvider};

/// Engine over the built-in drivers, reading credentials from the OS keyring
pub fn build_engine(config: FederationConfig) -> FederationEngine {
    FederationEngine::new(
        config,
        Arc::new(DriverRegistry::with_builtin_drivers()),
        Arc::new(KeyringProvider::new()),
    )
}
