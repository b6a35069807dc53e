//! libSQL implementation of the local record store

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use async_trait::async_trait;
use libsql::params::{IntoParams, Params};
use libsql::{params, Connection, Row, Value};
use std::path::Path;
use tokio::sync::Mutex;

use super::meta_repository::{MetaRepository, DEVICE_ID_KEY, WATERMARK_KEY};
use super::Database;
use crate::error::{Error, Result};
use crate::models::{DeviceId, Record, RecordId, SyncConflict};
use crate::store::{LocalStore, RecordFilter};

const RECORD_COLUMNS: &str = "record_json";

/// Local store backed by a libSQL database file
pub struct LibSqlLocalStore {
    db: Mutex<Database>,
}

impl LibSqlLocalStore {
    /// Open (and migrate) the database at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path).await?))
    }

    /// Open an in-memory store (primarily for tests)
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory().await?))
    }

    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    /// Identity of this device, generated and persisted on first use
    pub async fn device_id(&self) -> Result<DeviceId> {
        let db = self.db.lock().await;
        let meta = MetaRepository::new(db.connection());
        if let Some(value) = meta.get(DEVICE_ID_KEY).await? {
            return value
                .parse()
                .map_err(|e| Error::Database(format!("invalid stored device id '{value}': {e}")));
        }

        let device = DeviceId::new();
        meta.set(DEVICE_ID_KEY, &device.as_str()).await?;
        tracing::info!(device_id = %device, "Generated device id");
        Ok(device)
    }

    async fn query_records(
        conn: &Connection,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<Vec<Record>> {
        let mut rows = conn.query(sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(parse_record(&row)?);
        }
        Ok(records)
    }
}

fn parse_record(row: &Row) -> Result<Record> {
    let json: String = row.get(0)?;
    Ok(serde_json::from_str(&json)?)
}

fn parse_conflict(row: &Row) -> Result<SyncConflict> {
    let strategy: String = row.get(7)?;
    Ok(SyncConflict {
        id: row.get(0)?,
        record_id: row.get(1)?,
        local_version: from_sql_version(row.get(2)?)?,
        incoming_version: from_sql_version(row.get(3)?)?,
        local_updated_at: row.get(4)?,
        incoming_updated_at: row.get(5)?,
        resolved_at: row.get(6)?,
        strategy: strategy.parse()?,
        detail: match row.get_value(8)? {
            Value::Text(detail) => Some(detail),
            _ => None,
        },
    })
}

fn to_sql_version(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| Error::Database(format!("version {version} out of range")))
}

fn from_sql_version(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Database(format!("negative version {value}")))
}

fn optional_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

fn optional_int(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

#[async_trait]
impl LocalStore for LibSqlLocalStore {
    async fn get(&self, id: &RecordId) -> Result<Option<Record>> {
        let db = self.db.lock().await;
        let records = Self::query_records(
            db.connection(),
            &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?"),
            [id.as_str()],
        )
        .await?;
        Ok(records.into_iter().next())
    }

    async fn save(&self, record: &Record) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let mut rows = conn
            .query("SELECT version FROM records WHERE id = ?", [record.id.as_str()])
            .await?;
        if let Some(row) = rows.next().await? {
            let stored = from_sql_version(row.get(0)?)?;
            if stored > record.version {
                return Err(Error::consistency(
                    record.id,
                    format!(
                        "refusing to replace version {stored} with {}",
                        record.version
                    ),
                ));
            }
        }

        conn.execute(
            "INSERT INTO records (
                id, owner_id, kind, parent_ref, updated_at, deleted_at, version, record_json
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                kind = excluded.kind,
                parent_ref = excluded.parent_ref,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at,
                version = excluded.version,
                record_json = excluded.record_json",
            params![
                record.id.as_str(),
                record.owner_id.as_str(),
                record.kind.as_str(),
                optional_text(record.parent_ref.map(|parent| parent.as_str())),
                record.updated_at,
                optional_int(record.deleted_at),
                to_sql_version(record.version)?,
                serde_json::to_string(record)?,
            ],
        )
        .await?;
        Ok(())
    }

    async fn mark_synced(&self, id: &RecordId, version: u64) -> Result<()> {
        let db = self.db.lock().await;
        let rows = db
            .connection()
            .execute(
                "UPDATE records SET synced_version = MAX(synced_version, ?) WHERE id = ?",
                params![to_sql_version(version)?, id.as_str()],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_unsynced(&self) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        Self::query_records(
            db.connection(),
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE synced_version < version
                 ORDER BY updated_at ASC, id ASC"
            ),
            (),
        )
        .await
    }

    async fn list_changed_since(&self, since: i64) -> Result<Vec<Record>> {
        let db = self.db.lock().await;
        Self::query_records(
            db.connection(),
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE updated_at > ?
                 ORDER BY updated_at ASC, id ASC"
            ),
            [since],
        )
        .await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<Record>> {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE 1 = 1");
        let mut values = Vec::new();
        if !filter.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if let Some(kind) = filter.kind {
            sql.push_str(" AND kind = ?");
            values.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(parent) = filter.parent {
            sql.push_str(" AND parent_ref = ?");
            values.push(Value::Text(parent.as_str()));
        }
        sql.push_str(" ORDER BY updated_at DESC, id DESC");

        let db = self.db.lock().await;
        let mut records =
            Self::query_records(db.connection(), &sql, Params::Positional(values)).await?;
        // Labels live inside the JSON document
        records.retain(|record| filter.matches(record));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn get_watermark(&self) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        let meta = MetaRepository::new(db.connection());
        meta.get(WATERMARK_KEY)
            .await?
            .map(|value| {
                value
                    .parse()
                    .map_err(|_| Error::Database(format!("invalid stored watermark '{value}'")))
            })
            .transpose()
    }

    async fn set_watermark(&self, watermark: i64) -> Result<()> {
        let db = self.db.lock().await;
        MetaRepository::new(db.connection())
            .set(WATERMARK_KEY, &watermark.to_string())
            .await
    }

    async fn record_conflict(&self, conflict: &SyncConflict) -> Result<i64> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute(
            "INSERT INTO sync_conflicts (
                record_id, local_version, incoming_version, local_updated_at,
                incoming_updated_at, resolved_at, strategy, detail
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                conflict.record_id.as_str(),
                to_sql_version(conflict.local_version)?,
                to_sql_version(conflict.incoming_version)?,
                conflict.local_updated_at,
                conflict.incoming_updated_at,
                conflict.resolved_at,
                conflict.strategy.as_str(),
                optional_text(conflict.detail.clone()),
            ],
        )
        .await?;
        Ok(conn.last_insert_rowid())
    }

    async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT id, record_id, local_version, incoming_version, local_updated_at,
                        incoming_updated_at, resolved_at, strategy, detail
                 FROM sync_conflicts
                 ORDER BY resolved_at DESC, id DESC
                 LIMIT ?",
                [limit as i64],
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(parse_conflict(&row)?);
        }
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConflictStrategy, Content, Mutation, OwnerId, RecordKind};
    use pretty_assertions::assert_eq;

    fn note(title: &str, device: DeviceId) -> Record {
        Record::create(
            RecordKind::Note,
            OwnerId::new("acct").unwrap(),
            Content::new(title, "body", 1_000),
            None,
            [],
            device,
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_save_and_get_roundtrip() {
        let store = LibSqlLocalStore::open_in_memory().await.unwrap();
        let record = note("Hello", DeviceId::new());
        store.save(&record).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get(&RecordId::new()).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_save_rejects_lower_version() {
        let store = LibSqlLocalStore::open_in_memory().await.unwrap();
        let device = DeviceId::new();
        let v1 = note("a", device);
        let v2 = v1
            .apply_local_edit(Mutation::SetTitle("b".into()), device)
            .unwrap();
        store.save(&v2).await.unwrap();

        let error = store.save(&v1).await.unwrap_err();
        assert!(matches!(error, Error::ConsistencyFault { .. }));
        assert_eq!(store.get(&v1.id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unsynced_until_marked() {
        let store = LibSqlLocalStore::open_in_memory().await.unwrap();
        let device = DeviceId::new();
        let record = note("a", device);
        store.save(&record).await.unwrap();
        assert_eq!(store.list_unsynced().await.unwrap().len(), 1);

        store.mark_synced(&record.id, 1).await.unwrap();
        assert!(store.list_unsynced().await.unwrap().is_empty());

        let edited = record
            .apply_local_edit(Mutation::SetBody("new".into()), device)
            .unwrap();
        store.save(&edited).await.unwrap();
        assert_eq!(store.list_unsynced().await.unwrap(), vec![edited]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_filters_kind_deleted_and_label() {
        let store = LibSqlLocalStore::open_in_memory().await.unwrap();
        let device = DeviceId::new();
        let tag = RecordId::new();

        let mut labelled = note("labelled", device);
        labelled.labels.insert(tag);
        let deleted = note("gone", device).tombstone(device, false).unwrap();
        let folder = Record::create(
            RecordKind::Folder,
            OwnerId::new("acct").unwrap(),
            Content::new("Inbox", "", 1_000),
            None,
            [],
            device,
        )
        .unwrap();
        for record in [&labelled, &deleted, &folder] {
            store.save(record).await.unwrap();
        }

        let notes = store
            .list(&RecordFilter {
                kind: Some(RecordKind::Note),
                ..RecordFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(notes, vec![labelled.clone()]);

        let everything = store
            .list(&RecordFilter {
                include_deleted: true,
                ..RecordFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(everything.len(), 3);

        let by_label = store
            .list(&RecordFilter {
                label: Some(tag),
                ..RecordFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(by_label, vec![labelled]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watermark_and_device_id_persist() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tern.db");

        let device = {
            let store = LibSqlLocalStore::open(&path).await.unwrap();
            assert_eq!(store.get_watermark().await.unwrap(), None);
            store.set_watermark(42).await.unwrap();
            store.device_id().await.unwrap()
        };

        let store = LibSqlLocalStore::open(&path).await.unwrap();
        assert_eq!(store.get_watermark().await.unwrap(), Some(42));
        assert_eq!(store.device_id().await.unwrap(), device);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflict_journal() {
        let store = LibSqlLocalStore::open_in_memory().await.unwrap();
        let conflict = SyncConflict {
            id: 0,
            record_id: "rec".into(),
            local_version: 3,
            incoming_version: 3,
            local_updated_at: 10,
            incoming_updated_at: 12,
            resolved_at: 20,
            strategy: ConflictStrategy::Merge,
            detail: Some("merged into v4".into()),
        };
        let id = store.record_conflict(&conflict).await.unwrap();
        assert!(id > 0);

        let listed = store.list_conflicts(10).await.unwrap();
        assert_eq!(listed, vec![SyncConflict { id, ..conflict }]);
    }
}
