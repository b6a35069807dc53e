//! Sync metadata repository (watermark, device identity)

use crate::error::Result;
use libsql::Connection;

pub const WATERMARK_KEY: &str = "watermark";
pub const DEVICE_ID_KEY: &str = "device_id";

/// Key/value access to the `sync_meta` table
pub struct MetaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> MetaRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_meta WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
                [key, value],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_key_is_none() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = MetaRepository::new(db.connection());
        assert_eq!(repo.get(WATERMARK_KEY).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_overwrites() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = MetaRepository::new(db.connection());
        repo.set(WATERMARK_KEY, "4").await.unwrap();
        repo.set(WATERMARK_KEY, "9").await.unwrap();
        assert_eq!(repo.get(WATERMARK_KEY).await.unwrap().as_deref(), Some("9"));
    }
}
