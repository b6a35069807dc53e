//! Collaborator traits the sync engine talks through.
//!
//! The local store holds plaintext records, the remote store only ever sees
//! sealed payloads, and secure key storage holds the master key material.

mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Record, RecordId, RecordKind, SyncConflict};

pub use memory::{MemoryKeyStorage, MemoryLocalStore, MemoryRemoteStore};

/// Listing filter for [`LocalStore::list`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub kind: Option<RecordKind>,
    pub parent: Option<RecordId>,
    pub label: Option<RecordId>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

impl RecordFilter {
    /// Whether `record` passes the filter (ignores `limit`)
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        if !self.include_deleted && record.is_deleted() {
            return false;
        }
        if self.kind.is_some_and(|kind| kind != record.kind) {
            return false;
        }
        if self.parent.is_some() && self.parent != record.parent_ref {
            return false;
        }
        if let Some(label) = &self.label {
            if !record.labels.contains(label) {
                return false;
            }
        }
        true
    }
}

/// Device-local persistence of plaintext records and sync bookkeeping
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, id: &RecordId) -> Result<Option<Record>>;

    /// Insert or replace a record. Saving a lower version than the stored one
    /// is a consistency fault.
    async fn save(&self, record: &Record) -> Result<()>;

    /// Note that `version` of `id` is known to the remote
    async fn mark_synced(&self, id: &RecordId, version: u64) -> Result<()>;

    /// Records whose current version has not reached the remote yet
    async fn list_unsynced(&self) -> Result<Vec<Record>>;

    /// Records updated strictly after `since` (Unix ms)
    async fn list_changed_since(&self, since: i64) -> Result<Vec<Record>>;

    /// Records matching `filter`, most recently updated first
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<Record>>;

    async fn get_watermark(&self) -> Result<Option<i64>>;

    async fn set_watermark(&self, watermark: i64) -> Result<()>;

    /// Append to the conflict journal, returning the new entry id
    async fn record_conflict(&self, conflict: &SyncConflict) -> Result<i64>;

    /// Most recent conflict journal entries first
    async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>>;
}

/// One page of remote changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePage {
    pub records: Vec<Record>,
    /// Remote change clock after this page; pass it back on the next fetch
    pub watermark: Option<i64>,
}

/// Remote document store shared by all of an owner's devices
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upload a record. The stored copy is replaced only by a strictly higher
    /// version; anything else is accepted and ignored.
    ///
    /// A copy that would revive a stored tombstone (see [`Record::revives`])
    /// is refused with [`Error::RemoteTombstoned`].
    ///
    /// [`Error::RemoteTombstoned`]: crate::error::Error::RemoteTombstoned
    async fn put(&self, record: &Record) -> Result<()>;

    /// Replace the payload of the stored copy with a re-wrapped one.
    ///
    /// Applies only when the stored copy has exactly `record.version` and does
    /// not count as a change for [`RemoteStore::fetch_changed_since`]. Returns
    /// whether the copy was replaced.
    async fn rewrap(&self, record: &Record) -> Result<bool>;

    /// Records changed strictly after `watermark` on the remote's own clock.
    ///
    /// Records missing from the page are unchanged, never deleted.
    async fn fetch_changed_since(&self, watermark: Option<i64>) -> Result<ChangePage>;
}

/// Platform secure storage for the serialized master key material
pub trait SecureKeyStorage: Send + Sync {
    fn read_master_key_material(&self) -> Result<Option<Vec<u8>>>;

    fn write_master_key_material(&self, material: &[u8]) -> Result<()>;
}
