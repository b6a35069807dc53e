//! Durable storage for the sync queue

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::QueueEntry;
use crate::error::Result;
use crate::util::lock;

/// Where the queue writes its entries after every change
pub trait QueueJournal: Send + Sync {
    /// Entries as last persisted, oldest first
    fn load(&self) -> Result<Vec<QueueEntry>>;

    /// Replace the persisted entries. Must be atomic: after a crash the
    /// journal holds either the old or the new list, never a mix.
    fn persist(&self, entries: &[QueueEntry]) -> Result<()>;
}

/// JSON array on disk, replaced with write-to-temp, fsync, rename
#[derive(Debug, Clone)]
pub struct FileJournal {
    path: PathBuf,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QueueJournal for FileJournal {
    fn load(&self) -> Result<Vec<QueueEntry>> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, entries: &[QueueEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(entries)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        tracing::trace!(path = %self.path.display(), entries = entries.len(), "Persisted sync queue");
        Ok(())
    }
}

/// In-memory journal; clones share the same entries so a queue can be "reopened"
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    entries: Arc<Mutex<Vec<QueueEntry>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueJournal for MemoryJournal {
    fn load(&self) -> Result<Vec<QueueEntry>> {
        Ok(lock(&self.entries).clone())
    }

    fn persist(&self, entries: &[QueueEntry]) -> Result<()> {
        *lock(&self.entries) = entries.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Content, DeviceId, OwnerId, Record, RecordKind};
    use crate::queue::OpType;
    use pretty_assertions::assert_eq;

    fn entry(seq: u64) -> QueueEntry {
        let snapshot = Record::create(
            RecordKind::Note,
            OwnerId::new("acct").unwrap(),
            Content::new("t", "b", 1),
            None,
            [],
            DeviceId::new(),
        )
        .unwrap();
        QueueEntry {
            seq,
            op: OpType::Create,
            record_id: snapshot.id,
            snapshot,
            enqueued_at: 5,
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = FileJournal::new(tmp.path().join("queue.json"));
        assert!(journal.load().unwrap().is_empty());
    }

    #[test]
    fn file_journal_roundtrips_and_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = FileJournal::new(tmp.path().join("state").join("queue.json"));
        let entries = vec![entry(1), entry(2)];
        journal.persist(&entries).unwrap();

        assert_eq!(journal.load().unwrap(), entries);
        assert!(!journal.path().with_extension("tmp").exists());

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(journal.path()).unwrap()).unwrap();
        assert_eq!(raw[0]["op"], "create");
        assert_eq!(raw[1]["seq"], 2);
    }

    #[test]
    fn corrupt_journal_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("queue.json");
        fs::write(&path, b"[{not json").unwrap();
        assert!(FileJournal::new(path).load().is_err());
    }
}
