//! Master key material in the OS keychain.

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

#[cfg(not(test))]
use keyring::Entry;

use tern_core::models::DeviceId;
use tern_core::store::SecureKeyStorage;
use tern_core::{Error, Result};

#[cfg(not(test))]
const KEYRING_SERVICE_NAME: &str = "tern";

/// One keychain entry per device, so several data dirs can share a machine
#[derive(Debug, Clone)]
pub struct KeychainStorage {
    username: String,
}

impl KeychainStorage {
    pub fn for_device(device: &DeviceId) -> Self {
        Self {
            username: format!("master_key:{device}"),
        }
    }

    #[cfg(test)]
    fn test_store() -> &'static Mutex<HashMap<String, Vec<u8>>> {
        static STORE: OnceLock<Mutex<HashMap<String, Vec<u8>>>> = OnceLock::new();
        STORE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    #[cfg(not(test))]
    fn entry(&self) -> Result<Entry> {
        Entry::new(KEYRING_SERVICE_NAME, &self.username).map_err(secure_storage_error)
    }
}

impl SecureKeyStorage for KeychainStorage {
    #[cfg(not(test))]
    fn read_master_key_material(&self) -> Result<Option<Vec<u8>>> {
        match self.entry()?.get_secret() {
            Ok(material) => Ok(Some(material)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(secure_storage_error(error)),
        }
    }

    #[cfg(test)]
    fn read_master_key_material(&self) -> Result<Option<Vec<u8>>> {
        let guard = Self::test_store()
            .lock()
            .map_err(|error| Error::Crypto(error.to_string()))?;
        Ok(guard.get(&self.username).cloned())
    }

    #[cfg(not(test))]
    fn write_master_key_material(&self, material: &[u8]) -> Result<()> {
        self.entry()?
            .set_secret(material)
            .map_err(secure_storage_error)
    }

    #[cfg(test)]
    fn write_master_key_material(&self, material: &[u8]) -> Result<()> {
        let mut guard = Self::test_store()
            .lock()
            .map_err(|error| Error::Crypto(error.to_string()))?;
        guard.insert(self.username.clone(), material.to_vec());
        Ok(())
    }
}

#[cfg(not(test))]
fn secure_storage_error(error: keyring::Error) -> Error {
    Error::Crypto(format!("secure storage: {error}"))
}
