//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, &V1).await?;
    }
    if version < 2 {
        apply(conn, 2, &V2).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Version 1: records and sync metadata
const V1: [&str; 8] = [
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    // The full record is kept as JSON; the other columns exist for filtering
    "CREATE TABLE IF NOT EXISTS records (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        parent_ref TEXT,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER,
        version INTEGER NOT NULL,
        synced_version INTEGER NOT NULL DEFAULT 0,
        record_json TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind)",
    "CREATE INDEX IF NOT EXISTS idx_records_parent ON records(parent_ref)",
    "CREATE INDEX IF NOT EXISTS idx_records_unsynced ON records(synced_version, version)",
    "CREATE TABLE IF NOT EXISTS sync_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "INSERT INTO schema_version (version) VALUES (1)",
];

/// Version 2: conflict journal and version regression guard
const V2: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS sync_conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_id TEXT NOT NULL,
        local_version INTEGER NOT NULL,
        incoming_version INTEGER NOT NULL,
        local_updated_at INTEGER NOT NULL,
        incoming_updated_at INTEGER NOT NULL,
        resolved_at INTEGER NOT NULL,
        strategy TEXT NOT NULL,
        detail TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record_id ON sync_conflicts(record_id)",
    "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC)",
    "CREATE TRIGGER IF NOT EXISTS records_version_guard BEFORE UPDATE ON records
     FOR EACH ROW
     WHEN NEW.version < OLD.version
     BEGIN
         INSERT INTO sync_conflicts (
             record_id,
             local_version,
             incoming_version,
             local_updated_at,
             incoming_updated_at,
             resolved_at,
             strategy,
             detail
         ) VALUES (
             OLD.id,
             OLD.version,
             NEW.version,
             OLD.updated_at,
             NEW.updated_at,
             CAST(strftime('%s','now') AS INTEGER) * 1000,
             'fault',
             'version regression blocked'
         );
         SELECT RAISE(IGNORE);
     END",
    "INSERT INTO schema_version (version) VALUES (2)",
];

/// Apply one migration inside a transaction
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version} (target {CURRENT_VERSION})");
    Ok(())
}
