//! LiveUpdate Keystore Module
//! Secure key-value storage for verification keys

use keyring::Entry;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

const SERVICE_NAME: &str = "liveupdate";

/// Key under which the bundle signing public key is stored
pub const PUBLIC_KEY_ENTRY: &str = "bundle_public_key";

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Keyring error: {0}")]
    KeyringError(String),
    #[error("Key not found: {0}")]
    NotFound(String),
}

/// Opaque get/set/delete capability backed by platform secure storage
pub trait SecureStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<String, KeystoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), KeystoreError>;
    fn delete(&self, key: &str) -> Result<(), KeystoreError>;
}

/// OS keyring (Keychain, Credential Manager, Secret Service)
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    pub fn with_service(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, KeystoreError> {
        Entry::new(&self.service, key).map_err(|e| KeystoreError::KeyringError(e.to_string()))
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureStorage for KeyringStorage {
    fn get(&self, key: &str) -> Result<String, KeystoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(value),
            Err(keyring::Error::NoEntry) => Err(KeystoreError::NotFound(key.to_string())),
            Err(e) => Err(KeystoreError::KeyringError(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KeystoreError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| KeystoreError::KeyringError(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), KeystoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeystoreError::KeyringError(e.to_string())),
        }
    }
}

/// In-process storage for hosts without a keyring, and for tests
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, KeystoreError> {
        self.entries
            .lock()
            .map_err(|_| KeystoreError::KeyringError("memory storage lock poisoned".to_string()))
    }
}

impl SecureStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<String, KeystoreError> {
        self.lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| KeystoreError::NotFound(key.to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KeystoreError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KeystoreError> {
        self.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        assert!(matches!(storage.get(PUBLIC_KEY_ENTRY), Err(KeystoreError::NotFound(_))));

        storage.set(PUBLIC_KEY_ENTRY, "abcd").unwrap();
        assert_eq!(storage.get(PUBLIC_KEY_ENTRY).unwrap(), "abcd");

        storage.delete(PUBLIC_KEY_ENTRY).unwrap();
        assert!(storage.get(PUBLIC_KEY_ENTRY).is_err());
    }

    #[test]
    fn test_memory_storage_delete_missing_is_ok() {
        let storage = MemoryStorage::new();
        assert!(storage.delete("nothing").is_ok());
    }
}
