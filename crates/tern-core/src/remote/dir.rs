//! Remote store backed by a shared directory.
//!
//! Each record is one JSON document under `records/`, stamped with the value
//! of a monotonically increasing change clock kept in `clock`. Several devices
//! can point at the same directory (a synced folder, a network share) to sync
//! without a server.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{Record, RecordId};
use crate::store::{ChangePage, RemoteStore};

const RECORDS_DIR: &str = "records";
const CLOCK_FILE: &str = "clock";

#[derive(Debug, Clone)]
pub struct DirRemoteStore {
    root: PathBuf,
    // Serializes writers within this process; the clock file is read-modify-write.
    write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredDocument {
    changed_at: i64,
    record: Record,
}

impl DirRemoteStore {
    /// Use `root` as the shared directory, creating it if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(RECORDS_DIR)).map_err(|e| {
            Error::RemoteTransient(format!("cannot open remote dir {}: {e}", root.display()))
        })?;
        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the stored copy of a record, if any
    pub async fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        let path = document_path(&self.root, id);
        blocking(move || Ok(read_document(&path)?.map(|doc| doc.record))).await
    }
}

#[async_trait]
impl RemoteStore for DirRemoteStore {
    async fn put(&self, record: &Record) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let root = self.root.clone();
        let record = record.clone();

        blocking(move || {
            let path = document_path(&root, &record.id);
            if let Some(existing) = read_document(&path)? {
                if record.version <= existing.record.version {
                    tracing::debug!(
                        record_id = %record.id,
                        stored = existing.record.version,
                        incoming = record.version,
                        "Ignoring remote put that does not advance the version"
                    );
                    return Ok(());
                }
                if record.revives(&existing.record) {
                    tracing::debug!(
                        record_id = %record.id,
                        stored = existing.record.version,
                        incoming = record.version,
                        "Refusing remote put that revives a tombstone"
                    );
                    return Err(Error::RemoteTombstoned(record.id.to_string()));
                }
            }

            let changed_at = read_clock(&root)? + 1;
            write_atomic(&path, &serde_json::to_vec_pretty(&StoredDocument { changed_at, record })?)?;
            write_atomic(&root.join(CLOCK_FILE), changed_at.to_string().as_bytes())?;
            Ok(())
        })
        .await
    }

    async fn rewrap(&self, record: &Record) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let root = self.root.clone();
        let record = record.clone();

        blocking(move || {
            let path = document_path(&root, &record.id);
            let Some(mut document) = read_document(&path)? else {
                return Ok(false);
            };
            if document.record.version != record.version {
                return Ok(false);
            }
            // Same change stamp: a re-wrap is not a change to fetch
            document.record.payload = record.payload;
            write_atomic(&path, &serde_json::to_vec_pretty(&document)?)?;
            Ok(true)
        })
        .await
    }

    async fn fetch_changed_since(&self, watermark: Option<i64>) -> Result<ChangePage> {
        let root = self.root.clone();
        blocking(move || {
            let since = watermark.unwrap_or(i64::MIN);
            let mut changed = Vec::new();
            for entry in fs::read_dir(root.join(RECORDS_DIR)).map_err(unavailable)? {
                let path = entry.map_err(unavailable)?.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                if let Some(doc) = read_document(&path)? {
                    if doc.changed_at > since {
                        changed.push(doc);
                    }
                }
            }
            changed.sort_by_key(|doc| doc.changed_at);

            let clock = read_clock(&root)?;
            let page_max = changed.last().map_or(clock, |doc| doc.changed_at.max(clock));
            Ok(ChangePage {
                records: changed.into_iter().map(|doc| doc.record).collect(),
                watermark: Some(watermark.map_or(page_max, |since| since.max(page_max))),
            })
        })
        .await
    }
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| Error::RemoteTransient(format!("remote dir task failed: {e}")))?
}

fn document_path(root: &Path, id: &RecordId) -> PathBuf {
    root.join(RECORDS_DIR).join(format!("{id}.json"))
}

fn unavailable(error: std::io::Error) -> Error {
    Error::RemoteTransient(error.to_string())
}

fn read_document(path: &Path) -> Result<Option<StoredDocument>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            Error::RemoteRejected(format!("corrupt remote document {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(unavailable(e)),
    }
}

fn read_clock(root: &Path) -> Result<i64> {
    match fs::read_to_string(root.join(CLOCK_FILE)) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::RemoteRejected(format!("corrupt remote clock: {e}"))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(unavailable(e)),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(unavailable)?;
        file.write_all(bytes).map_err(unavailable)?;
        file.sync_all().map_err(unavailable)?;
    }
    fs::rename(&tmp, path).map_err(unavailable)
}
