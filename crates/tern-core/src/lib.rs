//! tern-core - Core library for tern
//!
//! Offline-first, end-to-end encrypted record sync: the record model, the
//! envelope crypto, the persistent sync queue, the conflict resolver, the
//! sync engine and the stores it talks to. Used by the `tern` CLI.

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod remote;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod util;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{Mutation, Record, RecordId, RecordKind};
pub use sync::{SyncEngine, SyncEngineBuilder, SyncState};
