// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use keyring::Entry;
use parking_lot::Mutex;

use crate::engine::error::{EngineError, EngineResult};

use super::Credentials;

/// Keyring service under which backend logins are stored
pub const DEFAULT_SERVICE: &str = "vfdw";

/// Trait for credential storage backend
pub trait CredentialProvider: Send + Sync {
    /// Login of `backend`, `None` when nothing is stored
    fn get_credentials(&self, backend: &str) -> EngineResult<Option<Credentials>>;
    fn save_credentials(&self, backend: &str, credentials: &Credentials) -> EngineResult<()>;
    fn delete_credentials(&self, backend: &str) -> EngineResult<()>;
}

/// Production implementation using OS Keyring.
///
/// Each backend owns two entries, `<backend>_user` and `<backend>_pass`.
pub struct KeyringProvider {
    service: String,
}

impl KeyringProvider {
    pub fn new() -> Self {
        Self::with_service(DEFAULT_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, account: &str) -> EngineResult<Entry> {
        Entry::new(&self.service, account)
            .map_err(|e| EngineError::credentials(format!("Keyring error: {e}")))
    }

    fn read(&self, account: &str) -> EngineResult<Option<String>> {
        match self.entry(account)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(EngineError::credentials(format!(
                "Failed to read '{account}': {e}"
            ))),
        }
    }

    fn write(&self, account: &str, value: &str) -> EngineResult<()> {
        self.entry(account)?.set_password(value).map_err(|e| {
            EngineError::credentials(format!("Failed to store '{account}': {e}"))
        })
    }

    fn remove(&self, account: &str) -> EngineResult<()> {
        match self.entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(EngineError::credentials(format!(
                "Failed to delete '{account}': {e}"
            ))),
        }
    }
}

impl Default for KeyringProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn user_account(backend: &str) -> String {
    format!("{backend}_user")
}

fn password_account(backend: &str) -> String {
    format!("{backend}_pass")
}

impl CredentialProvider for KeyringProvider {
    fn get_credentials(&self, backend: &str) -> EngineResult<Option<Credentials>> {
        let Some(user) = self.read(&user_account(backend))? else {
            return Ok(None);
        };
        let password = self.read(&password_account(backend))?.unwrap_or_default();
        Ok(Some(Credentials::new(user, password)))
    }

    fn save_credentials(&self, backend: &str, credentials: &Credentials) -> EngineResult<()> {
        self.write(&user_account(backend), &credentials.user)?;
        self.write(&password_account(backend), credentials.password.expose())
    }

    fn delete_credentials(&self, backend: &str) -> EngineResult<()> {
        self.remove(&user_account(backend))?;
        self.remove(&password_account(backend))
    }
}

/// Process-local implementation for tests and dry runs
#[derive(Default)]
pub struct MemoryCredentialProvider {
    storage: Mutex<HashMap<String, Credentials>>,
}

impl MemoryCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialProvider for MemoryCredentialProvider {
    fn get_credentials(&self, backend: &str) -> EngineResult<Option<Credentials>> {
        Ok(self.storage.lock().get(backend).cloned())
    }

    fn save_credentials(&self, backend: &str, credentials: &Credentials) -> EngineResult<()> {
        self.storage
            .lock()
            .insert(backend.to_string(), credentials.clone());
        Ok(())
    }

    fn delete_credentials(&self, backend: &str) -> EngineResult<()> {
        self.storage.lock().remove(backend);
        Ok(())
    }
}
