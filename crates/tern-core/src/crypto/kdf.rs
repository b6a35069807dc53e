//! PBKDF2-HMAC-SHA256 derivation of the master key from the user secret.
//!
//! - Output length: 32 bytes (256 bits)
//! - Salt length: 16 bytes, random per key, stored next to the key material
//! - Iterations: at least 100,000 (default 310,000)

use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::keys::MasterKey;
use crate::error::{Error, Result};
use crate::util::base64_array;

/// Lowest iteration count accepted when deriving or loading key material
pub const MIN_ITERATIONS: u32 = 100_000;

/// Iteration count used for new key material
pub const DEFAULT_ITERATIONS: u32 = 310_000;

/// Parameters for master key derivation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Salt for key derivation (16 bytes)
    #[serde(with = "base64_array")]
    pub salt: [u8; 16],

    /// PBKDF2 iteration count
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            salt: rand::random(),
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl KdfParams {
    /// Create new parameters with a fresh random salt
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh salt with a custom iteration count
    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            iterations,
            ..Self::default()
        }
    }

    /// Verify that parameters are within acceptable ranges
    pub fn validate(&self) -> Result<()> {
        if self.iterations < MIN_ITERATIONS {
            return Err(Error::Crypto(format!(
                "Iteration count too low: {} (minimum: {MIN_ITERATIONS})",
                self.iterations
            )));
        }
        if self.salt.iter().all(|byte| *byte == 0) {
            return Err(Error::Crypto("Salt must not be all zeros".to_string()));
        }
        Ok(())
    }
}

/// Derive a master key from the user's secret
pub fn derive_master_key(secret: &[u8], params: &KdfParams) -> Result<MasterKey> {
    params.validate()?;
    if secret.is_empty() {
        return Err(Error::Crypto("Secret must not be empty".to_string()));
    }

    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, &params.salt, params.iterations, &mut key);
    let master = MasterKey::from_bytes(key);
    zeroize::Zeroize::zeroize(&mut key);
    Ok(master)
}
