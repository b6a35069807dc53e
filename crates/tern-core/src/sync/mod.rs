//! Sync engine.
//!
//! [`SyncEngine`] owns the sync queue and mediates every local write. A pass
//! drains the queue to the remote store, pulls remote changes past the
//! watermark, reconciles them through the conflict resolver, pushes whatever
//! the resolver re-issued and then advances the watermark. Passes are
//! scheduled by the [`SyncState`] machine: debounced after local edits,
//! retried with jittered backoff after transient failures.

mod backoff;
mod engine;
mod machine;


pub use backoff::Backoff;
pub use engine::{
    FaultReport, KeyRotation, NewRecord, SyncEngine, SyncEngineBuilder, SyncReport, SyncStatus,
};
pub use machine::{SyncEvent, SyncState};
