// SPDX-FileCopyrightText: 2026 Git Archiver Contributors
// SPDX-License-Identifier: MPL-2.0

//! Opaque get/set/erase of a forge auth token via the host platform secret
//! store (C11). No plaintext fallback ever touches disk: when the
//! platform store is unavailable, tokens live only in process memory for
//! the session.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

const ACCOUNT: &str = "forge-token";

#[derive(Debug, Error)]
pub enum Error {
    #[error("secret store backend error: {0}")]
    Backend(String),
}

pub trait SecretStore: Send + Sync {
    fn get_token(&self, service_name: &str) -> Result<Option<String>, Error>;
    fn set_token(&self, service_name: &str, token: &str) -> Result<(), Error>;
    fn erase_token(&self, service_name: &str) -> Result<(), Error>;
}

/// Production secret store: tries the OS-native keyring first, and
/// silently drops to an in-process map when the platform store itself is
/// unreachable (no keyring daemon, headless CI, sandboxed build). A
/// missing *entry* (vs. a missing *store*) is never treated as a fallback
/// trigger — that's just "no token configured".
pub struct Keeper {
    memory_fallback: Mutex<HashMap<String, String>>,
}

impl Default for Keeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Keeper {
    pub fn new() -> Self {
        Self {
            memory_fallback: Mutex::new(HashMap::new()),
        }
    }

    fn entry(service_name: &str) -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(service_name, ACCOUNT)
    }

    fn platform_unavailable(err: &keyring::Error) -> bool {
        matches!(err, keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_))
    }
}

impl SecretStore for Keeper {
    fn get_token(&self, service_name: &str) -> Result<Option<String>, Error> {
        let entry = match Self::entry(service_name) {
            Ok(entry) => entry,
            Err(err) if Self::platform_unavailable(&err) => {
                return Ok(self.memory_fallback.lock().expect("secret keeper mutex poisoned").get(service_name).cloned());
            }
            Err(err) => return Err(Error::Backend(err.to_string())),
        };

        match entry.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) if Self::platform_unavailable(&err) => {
                Ok(self.memory_fallback.lock().expect("secret keeper mutex poisoned").get(service_name).cloned())
            }
            Err(err) => Err(Error::Backend(err.to_string())),
        }
    }

    fn set_token(&self, service_name: &str, token: &str) -> Result<(), Error> {
        let entry = match Self::entry(service_name) {
            Ok(entry) => entry,
            Err(err) if Self::platform_unavailable(&err) => {
                self.memory_fallback
                    .lock()
                    .expect("secret keeper mutex poisoned")
                    .insert(service_name.to_owned(), token.to_owned());
                return Ok(());
            }
            Err(err) => return Err(Error::Backend(err.to_string())),
        };

        match entry.set_password(token) {
            Ok(()) => {
                self.memory_fallback.lock().expect("secret keeper mutex poisoned").remove(service_name);
                Ok(())
            }
            Err(err) if Self::platform_unavailable(&err) => {
                self.memory_fallback
                    .lock()
                    .expect("secret keeper mutex poisoned")
                    .insert(service_name.to_owned(), token.to_owned());
                Ok(())
            }
            Err(err) => Err(Error::Backend(err.to_string())),
        }
    }

    fn erase_token(&self, service_name: &str) -> Result<(), Error> {
        self.memory_fallback.lock().expect("secret keeper mutex poisoned").remove(service_name);

        let entry = match Self::entry(service_name) {
            Ok(entry) => entry,
            Err(err) if Self::platform_unavailable(&err) => return Ok(()),
            Err(err) => return Err(Error::Backend(err.to_string())),
        };

        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) if Self::platform_unavailable(&err) => Ok(()),
            Err(err) => Err(Error::Backend(err.to_string())),
        }
    }
}

/// In-memory stub for tests: never touches the OS secret store.
#[derive(Default)]
pub struct InMemoryStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl SecretStore for InMemoryStore {
    fn get_token(&self, service_name: &str) -> Result<Option<String>, Error> {
        Ok(self.tokens.lock().expect("in-memory secret store mutex poisoned").get(service_name).cloned())
    }

    fn set_token(&self, service_name: &str, token: &str) -> Result<(), Error> {
        self.tokens
            .lock()
            .expect("in-memory secret store mutex poisoned")
            .insert(service_name.to_owned(), token.to_owned());
        Ok(())
    }

    fn erase_token(&self, service_name: &str) -> Result<(), Error> {
        self.tokens.lock().expect("in-memory secret store mutex poisoned").remove(service_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_roundtrips_and_erases() {
        let store = InMemoryStore::default();
        assert_eq!(store.get_token("github").unwrap(), None);

        store.set_token("github", "ghp_abc123").unwrap();
        assert_eq!(store.get_token("github").unwrap(), Some("ghp_abc123".to_owned()));

        store.erase_token("github").unwrap();
        assert_eq!(store.get_token("github").unwrap(), None);
    }
}
