//! In-memory store implementations for tests and simulations

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{ChangePage, LocalStore, RecordFilter, RemoteStore, SecureKeyStorage};
use crate::error::{Error, Result};
use crate::models::{Record, RecordId, SyncConflict};
use crate::util::lock;

#[derive(Default)]
struct LocalState {
    records: HashMap<RecordId, StoredRecord>,
    watermark: Option<i64>,
    conflicts: Vec<SyncConflict>,
}

struct StoredRecord {
    record: Record,
    synced_version: u64,
}

/// Local store kept entirely in memory
#[derive(Default)]
pub struct MemoryLocalStore {
    state: Mutex<LocalState>,
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        Ok(lock(&self.state)
            .records
            .get(id)
            .map(|stored| stored.record.clone()))
    }

    async fn save(&self, record: &Record) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(stored) = state.records.get(&record.id) {
            if stored.record.version > record.version {
                return Err(Error::consistency(
                    record.id,
                    format!(
                        "refusing to replace version {} with {}",
                        stored.record.version, record.version
                    ),
                ));
            }
        }
        state
            .records
            .entry(record.id)
            .and_modify(|stored| stored.record = record.clone())
            .or_insert_with(|| StoredRecord {
                record: record.clone(),
                synced_version: 0,
            });
        Ok(())
    }

    async fn mark_synced(&self, id: &RecordId, version: u64) -> Result<()> {
        let mut state = lock(&self.state);
        let stored = state
            .records
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        stored.synced_version = stored.synced_version.max(version);
        Ok(())
    }

    async fn list_unsynced(&self) -> Result<Vec<Record>> {
        let state = lock(&self.state);
        let mut records: Vec<Record> = state
            .records
            .values()
            .filter(|stored| stored.synced_version < stored.record.version)
            .map(|stored| stored.record.clone())
            .collect();
        records.sort_by_key(|record| (record.updated_at, record.id));
        Ok(records)
    }

    async fn list_changed_since(&self, since: i64) -> Result<Vec<Record>> {
        let state = lock(&self.state);
        let mut records: Vec<Record> = state
            .records
            .values()
            .filter(|stored| stored.record.updated_at > since)
            .map(|stored| stored.record.clone())
            .collect();
        records.sort_by_key(|record| (record.updated_at, record.id));
        Ok(records)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        let state = lock(&self.state);
        let mut records: Vec<Record> = state
            .records
            .values()
            .map(|stored| &stored.record)
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn get_watermark(&self) -> Result<Option<i64>> {
        Ok(lock(&self.state).watermark)
    }

    async fn set_watermark(&self, watermark: i64) -> Result<()> {
        lock(&self.state).watermark = Some(watermark);
        Ok(())
    }

    async fn record_conflict(&self, conflict: &SyncConflict) -> Result<i64> {
        let mut state = lock(&self.state);
        let id = i64::try_from(state.conflicts.len()).unwrap_or(i64::MAX - 1) + 1;
        state.conflicts.push(SyncConflict {
            id,
            ..conflict.clone()
        });
        Ok(id)
    }

    async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let state = lock(&self.state);
        Ok(state.conflicts.iter().rev().take(limit).cloned().collect())
    }
}

#[derive(Default)]
struct RemoteState {
    records: BTreeMap<RecordId, (Record, i64)>,
    clock: i64,
}

/// Remote store shared between simulated devices.
///
/// Clones share the same backing state. Reachability can be toggled to
/// simulate outages, which surface as [`Error::RemoteTransient`].
#[derive(Clone)]
pub struct MemoryRemoteStore {
    state: Arc<Mutex<RemoteState>>,
    reachable: Arc<AtomicBool>,
    puts: Arc<AtomicUsize>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            reachable: Arc::new(AtomicBool::new(true)),
            puts: Arc::default(),
        }
    }
}

impl MemoryRemoteStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing or regaining the network
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of accepted `put` calls so far
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Current remote copy of a record
    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<Record> {
        lock(&self.state)
            .records
            .get(id)
            .map(|(record, _)| record.clone())
    }

    /// Every record the remote holds, ordered by id
    #[must_use]
    pub fn records(&self) -> Vec<Record> {
        lock(&self.state)
            .records
            .values()
            .map(|(record, _)| record.clone())
            .collect()
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::RemoteTransient("remote unreachable".to_string()))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn put(&self, record: &Record) -> Result<()> {
        self.ensure_reachable()?;
        let mut state = lock(&self.state);
        if let Some((existing, _)) = state.records.get(&record.id) {
            if existing.version >= record.version {
                tracing::debug!(
                    record_id = %record.id,
                    stored = existing.version,
                    incoming = record.version,
                    "Remote kept existing version"
                );
                return Ok(());
            }
            if record.revives(existing) {
                tracing::debug!(
                    record_id = %record.id,
                    stored = existing.version,
                    incoming = record.version,
                    "Remote refused to revive a tombstone"
                );
                return Err(Error::RemoteTombstoned(record.id.to_string()));
            }
        }
        state.clock += 1;
        let clock = state.clock;
        state.records.insert(record.id, (record.clone(), clock));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rewrap(&self, record: &Record) -> Result<bool> {
        self.ensure_reachable()?;
        let mut state = lock(&self.state);
        match state.records.get_mut(&record.id) {
            Some((existing, _)) if existing.version == record.version => {
                existing.payload = record.payload.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fetch_changed_since(&self, watermark: Option<i64>) -> Result<ChangePage> {
        self.ensure_reachable()?;
        let state = lock(&self.state);
        let since = watermark.unwrap_or(0);
        let mut changed: Vec<(i64, Record)> = state
            .records
            .values()
            .filter(|(_, changed_at)| *changed_at > since)
            .map(|(record, changed_at)| (*changed_at, record.clone()))
            .collect();
        changed.sort_by_key(|(changed_at, _)| *changed_at);

        Ok(ChangePage {
            records: changed.into_iter().map(|(_, record)| record).collect(),
            watermark: Some(state.clock.max(since)),
        })
    }
}

/// Key storage held in process memory
#[derive(Default)]
pub struct MemoryKeyStorage {
    material: Mutex<Option<Vec<u8>>>,
}

impl SecureKeyStorage for MemoryKeyStorage {
    fn read_master_key_material(&self) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.material).clone())
    }

    fn write_master_key_material(&self, material: &[u8]) -> Result<()> {
        *lock(&self.material) = Some(material.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Content, DeviceId, OwnerId, Payload, RecordKind};
    use pretty_assertions::assert_eq;

    fn note(title: &str) -> Record {
        Record::create(
            RecordKind::Note,
            OwnerId::new("acct").unwrap(),
            Content::new(title, "", 1),
            None,
            [],
            DeviceId::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn local_save_refuses_version_regression() {
        let store = MemoryLocalStore::new();
        let v1 = note("a");
        let v2 = v1
            .apply_local_edit(crate::models::Mutation::SetTitle("b".into()), DeviceId::new())
            .unwrap();
        store.save(&v2).await.unwrap();
        let error = store.save(&v1).await.unwrap_err();
        assert!(matches!(error, Error::ConsistencyFault { .. }));
        assert_eq!(store.get(&v1.id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn unsynced_tracks_mark_synced() {
        let store = MemoryLocalStore::new();
        let record = note("a");
        store.save(&record).await.unwrap();
        assert_eq!(store.list_unsynced().await.unwrap().len(), 1);

        store.mark_synced(&record.id, 1).await.unwrap();
        assert!(store.list_unsynced().await.unwrap().is_empty());
        assert!(store.mark_synced(&RecordId::new(), 1).await.is_err());
    }

    #[tokio::test]
    async fn conflicts_list_newest_first() {
        let store = MemoryLocalStore::new();
        for version in 1..=3 {
            let conflict = SyncConflict {
                id: 0,
                record_id: "r".into(),
                local_version: version,
                incoming_version: version,
                local_updated_at: 0,
                incoming_updated_at: 0,
                resolved_at: 0,
                strategy: crate::models::ConflictStrategy::Merge,
                detail: None,
            };
            store.record_conflict(&conflict).await.unwrap();
        }
        let listed = store.list_conflicts(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].local_version, 3);
        assert_eq!(listed[0].id, 3);
    }

    #[tokio::test]
    async fn remote_pages_by_change_clock() {
        let remote = MemoryRemoteStore::new();
        let a = note("a");
        let b = note("b");
        remote.put(&a).await.unwrap();

        let first = remote.fetch_changed_since(None).await.unwrap();
        assert_eq!(first.records.len(), 1);

        remote.put(&b).await.unwrap();
        let second = remote.fetch_changed_since(first.watermark).await.unwrap();
        assert_eq!(second.records, vec![b]);

        let empty = remote.fetch_changed_since(second.watermark).await.unwrap();
        assert!(empty.records.is_empty());
        assert_eq!(empty.watermark, second.watermark);
    }

    #[tokio::test]
    async fn remote_keeps_higher_version() {
        let remote = MemoryRemoteStore::new();
        let v1 = note("a");
        let mut v2 = v1.clone();
        v2.version = 2;
        remote.put(&v2).await.unwrap();
        remote.put(&v1).await.unwrap();
        assert_eq!(remote.get(&v1.id).unwrap().version, 2);
        assert_eq!(remote.put_count(), 1);
    }

    #[tokio::test]
    async fn remote_keeps_first_copy_at_equal_version() {
        let remote = MemoryRemoteStore::new();
        let first = note("a");
        let mut second = first.clone();
        second.origin_device = DeviceId::new();
        remote.put(&first).await.unwrap();
        remote.put(&second).await.unwrap();
        assert_eq!(remote.get(&first.id).unwrap().origin_device, first.origin_device);
    }

    #[tokio::test]
    async fn remote_refuses_to_revive_a_tombstone() {
        let remote = MemoryRemoteStore::new();
        let live = note("a");
        let deleted = live.tombstone(DeviceId::new(), false).unwrap();
        remote.put(&deleted).await.unwrap();

        let mut edited = live.clone();
        edited.version = 3;
        let error = remote.put(&edited).await.unwrap_err();
        assert!(matches!(error, Error::RemoteTombstoned(_)));
        assert!(remote.get(&live.id).unwrap().is_deleted());

        let restored = deleted
            .apply_local_edit(crate::models::Mutation::Restore, DeviceId::new())
            .unwrap();
        remote.put(&restored).await.unwrap();
        assert!(!remote.get(&live.id).unwrap().is_deleted());
    }

    #[tokio::test]
    async fn rewrap_replaces_payload_only_at_the_stored_version() {
        let remote = MemoryRemoteStore::new();
        let v1 = note("a");
        remote.put(&v1).await.unwrap();
        let watermark = remote.fetch_changed_since(None).await.unwrap().watermark;

        let rewrapped = Record {
            payload: Payload::plain(Content::new("a", "rewrapped", 1)),
            ..v1.clone()
        };
        assert!(remote.rewrap(&rewrapped).await.unwrap());
        assert_eq!(remote.get(&v1.id).unwrap(), rewrapped);
        let page = remote.fetch_changed_since(watermark).await.unwrap();
        assert!(page.records.is_empty());

        let mut stale = rewrapped.clone();
        stale.version = 2;
        assert!(!remote.rewrap(&stale).await.unwrap());
        assert!(!remote.rewrap(&note("missing")).await.unwrap());
        assert_eq!(remote.get(&v1.id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn unreachable_remote_is_transient() {
        let remote = MemoryRemoteStore::new();
        remote.set_reachable(false);
        let error = remote.put(&note("a")).await.unwrap_err();
        assert!(error.is_retryable());
    }
}
