//! Master keys, per-record data keys and the device key ring.
//!
//! The key ring is explicit state handed to `seal`/`open`; nothing in this
//! crate keeps a process-wide "current key".

use aes_gcm::aead::{KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroize;

use super::kdf::{derive_master_key, KdfParams, MIN_ITERATIONS};
use crate::error::{Error, Result};
use crate::store::SecureKeyStorage;
use crate::util::{base64_array, hex_encode};

/// Size of every symmetric key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

const KEY_MATERIAL_FORMAT: u32 = 1;

/// Short public fingerprint of a master key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    fn of(bytes: &[u8; KEY_SIZE]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(hex_encode(&digest[..8]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device-held key that wraps every record's data key
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
    id: KeyId,
}

impl MasterKey {
    /// Create a master key from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let id = KeyId::of(&bytes);
        Self { bytes, id }
    }

    /// Generate a new random master key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self::from_bytes(key.into())
    }

    /// Fingerprint stamped on envelopes wrapped by this key
    pub const fn id(&self) -> &KeyId {
        &self.id
    }

    pub(crate) const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .field("id", &self.id)
            .finish()
    }
}

/// Per-record key used to seal one payload
pub(crate) struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub(crate) fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self { bytes: key.into() }
    }

    pub(crate) const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub(crate) const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Current master key plus, while a rotation is in progress, the one it replaces
#[derive(Debug, Clone)]
pub struct KeyRing {
    current: MasterKey,
    previous: Option<MasterKey>,
}

impl KeyRing {
    pub const fn new(current: MasterKey) -> Self {
        Self {
            current,
            previous: None,
        }
    }

    /// A ring that seals with `current` and can still open envelopes wrapped by `previous`
    pub const fn with_previous(current: MasterKey, previous: MasterKey) -> Self {
        Self {
            current,
            previous: Some(previous),
        }
    }

    pub const fn current(&self) -> &MasterKey {
        &self.current
    }

    pub const fn previous(&self) -> Option<&MasterKey> {
        self.previous.as_ref()
    }

    /// Whether an interrupted rotation still has to be finished
    pub const fn is_rotating(&self) -> bool {
        self.previous.is_some()
    }

    /// Pick the key an envelope claims to be wrapped with, defaulting to the current key
    pub fn key_for(&self, key_id: &KeyId) -> &MasterKey {
        match &self.previous {
            Some(previous) if previous.id() == key_id => previous,
            _ => &self.current,
        }
    }

    /// Load the ring from secure storage, if one was ever stored
    pub fn load(storage: &dyn SecureKeyStorage) -> Result<Option<Self>> {
        let Some(bytes) = storage.read_master_key_material()? else {
            return Ok(None);
        };
        let material: StoredKeyRing = serde_json::from_slice(&bytes)?;
        material.into_ring().map(Some)
    }

    /// Load the stored ring, or derive one from `secret` and store it.
    ///
    /// When material already exists the secret must derive the stored key.
    pub fn unlock_or_initialize(
        storage: &dyn SecureKeyStorage,
        secret: &[u8],
        iterations: u32,
    ) -> Result<Self> {
        if let Some(bytes) = storage.read_master_key_material()? {
            let material: StoredKeyRing = serde_json::from_slice(&bytes)?;
            let derived = derive_master_key(secret, &material.current.kdf)?;
            let ring = material.into_ring()?;
            if derived.id() != ring.current.id() {
                return Err(Error::Decryption(
                    "secret does not match the stored master key".to_string(),
                ));
            }
            return Ok(ring);
        }

        let params = KdfParams::with_iterations(iterations);
        let current = derive_master_key(secret, &params)?;
        let ring = Self::new(current);
        ring.store(storage, &params, None)?;
        tracing::info!(key_id = %ring.current.id(), "Initialized master key material");
        Ok(ring)
    }

    /// Derive a replacement key and persist it next to the current one.
    ///
    /// The returned ring seals with the new key and can still open envelopes
    /// wrapped by the old key until [`KeyRing::finish_rotation`] runs.
    pub fn begin_rotation(
        &self,
        storage: &dyn SecureKeyStorage,
        new_secret: &[u8],
        iterations: u32,
    ) -> Result<Self> {
        let params = KdfParams::with_iterations(iterations);
        let next = derive_master_key(new_secret, &params)?;
        let ring = Self {
            current: next,
            previous: Some(self.current.clone()),
        };
        let previous_params = stored_params(storage)?.current.kdf.clone();
        ring.store(storage, &params, Some(previous_params))?;
        Ok(ring)
    }

    /// Drop the previous key once every envelope is wrapped by the current one
    pub fn finish_rotation(&self, storage: &dyn SecureKeyStorage) -> Result<Self> {
        let params = stored_params(storage)?.current.kdf.clone();
        let ring = Self::new(self.current.clone());
        ring.store(storage, &params, None)?;
        Ok(ring)
    }

    fn store(
        &self,
        storage: &dyn SecureKeyStorage,
        params: &KdfParams,
        previous_params: Option<KdfParams>,
    ) -> Result<()> {
        let material = StoredKeyRing {
            format_version: KEY_MATERIAL_FORMAT,
            current: StoredKey {
                kdf: params.clone(),
                key: *self.current.as_bytes(),
            },
            previous: self
                .previous
                .as_ref()
                .zip(previous_params)
                .map(|(key, kdf)| StoredKey {
                    kdf,
                    key: *key.as_bytes(),
                }),
        };
        let mut bytes = serde_json::to_vec(&material)?;
        let result = storage.write_master_key_material(&bytes);
        bytes.zeroize();
        result
    }
}

fn stored_params(storage: &dyn SecureKeyStorage) -> Result<StoredKeyRing> {
    let bytes = storage
        .read_master_key_material()?
        .ok_or_else(|| Error::Crypto("no master key material stored".to_string()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    kdf: KdfParams,
    #[serde(with = "base64_array")]
    key: [u8; KEY_SIZE],
}

impl Drop for StoredKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[derive(Serialize, Deserialize)]
struct StoredKeyRing {
    format_version: u32,
    current: StoredKey,
    previous: Option<StoredKey>,
}

impl StoredKeyRing {
    fn into_ring(self) -> Result<KeyRing> {
        if self.format_version != KEY_MATERIAL_FORMAT {
            return Err(Error::Crypto(format!(
                "unsupported key material format {} (expected {KEY_MATERIAL_FORMAT})",
                self.format_version
            )));
        }
        if self.current.kdf.iterations < MIN_ITERATIONS {
            return Err(Error::Crypto(
                "stored key material uses too few KDF iterations".to_string(),
            ));
        }
        Ok(KeyRing {
            current: MasterKey::from_bytes(self.current.key),
            previous: self
                .previous
                .as_ref()
                .map(|stored| MasterKey::from_bytes(stored.key)),
        })
    }
}
