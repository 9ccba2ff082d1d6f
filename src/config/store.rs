// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::engine::error::{EngineError, EngineResult};

use super::FederationConfig;

const APP_DIR: &str = "vfdw";
const CONFIG_FILE: &str = "config.json";

/// JSON persistence of a [`FederationConfig`]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/vfdw/config.json`
    pub fn default_path() -> EngineResult<PathBuf> {
        dirs::data_dir()
            .map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
            .ok_or_else(|| EngineError::configuration("No data directory on this platform"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the configuration, creating an empty one when the file is missing
    pub fn load(&self) -> EngineResult<FederationConfig> {
        if !self.path.exists() {
            let config = FederationConfig::default();
            self.save(&config)?;
            return Ok(config);
        }
        let content = fs::read_to_string(&self.path).map_err(|e| {
            EngineError::io(format!("Failed to read {}: {e}", self.path.display()))
        })?;
        let config = serde_json::from_str(&content).map_err(|e| {
            EngineError::configuration(format!("Invalid config {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), "configuration loaded");
        Ok(config)
    }

    /// Writes the configuration through a temp file and a rename
    pub fn save(&self, config: &FederationConfig) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::io(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        let content = serde_json::to_string_pretty(config)
            .map_err(|e| EngineError::configuration(format!("Failed to serialize config: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .map_err(|e| EngineError::io(format!("Failed to write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            EngineError::io(format!("Failed to replace {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), "configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionProfile;
    use crate::federation::rules::{JoinRule, JoinType};

    #[test]
    fn load_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("nested").join("config.json"));
        let config = store.load().unwrap();
        assert_eq!(config, FederationConfig::default());
        assert!(store.path().exists());
    }

    #[test]
    fn save_then_load_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));

        let mut config = FederationConfig::default();
        config
            .add_connection("crm", ConnectionProfile::new("sqlite", "", 0, "/tmp/crm.db"))
            .unwrap();
        config.map_table("public.users", "crm").unwrap();
        config
            .add_join_rule(
                JoinRule::new(["public.users", "public.orders"], "user_id")
                    .with_join_type(JoinType::Left)
                    .with_key_column("public.users", "id"),
            )
            .unwrap();
        store.save(&config).unwrap();

        assert_eq!(store.load().unwrap(), config);
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn invalid_json_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ConfigStore::new(path).load(),
            Err(EngineError::Configuration { .. })
        ));
    }
}
