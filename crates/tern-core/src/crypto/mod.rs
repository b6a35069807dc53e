//! Encryption envelope for record payloads.
//!
//! Only the payload is sealed. Kind, parent, labels, timestamps and version
//! stay in the clear so the remote can order and filter records.

mod envelope;
mod kdf;
mod keys;

pub use envelope::{
    open, open_record, rewrap, rotate_each, rotate_master_key, seal, seal_record, Envelope,
    RotationReport,
};
pub use kdf::{derive_master_key, KdfParams, DEFAULT_ITERATIONS, MIN_ITERATIONS};
pub use keys::{KeyId, KeyRing, MasterKey, KEY_SIZE};
