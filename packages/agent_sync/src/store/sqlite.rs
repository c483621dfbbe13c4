use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use super::KeyValueStore;
use crate::error::SyncError;

const SCHEMA_VERSION: i64 = 1;

/// SQLite-backed store: one `kv_store` table keyed by string.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url`, e.g.
    /// `sqlite:///home/me/.agent-sync/agent-sync.db?mode=rwc`.
    pub async fn open(url: &str) -> Result<Self, SyncError> {
        info!("Opening state store: {}", url);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .min_connections(1)
            .connect(url)
            .await
            .map_err(|e| SyncError::Store(format!("failed to open {url}: {e}")))?;

        run_migrations(&pool).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Isolated in-memory database with migrations applied.
    pub async fn in_memory() -> Result<Self, SyncError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), SyncError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch())
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(SyncError::Store(format!(
            "state store schema version {current_version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    if current_version == SCHEMA_VERSION {
        return Ok(());
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT (unixepoch())
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR REPLACE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), SyncError> {
        sqlx::query(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?, ?, unixepoch())",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_missing_key() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.get("session:nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put("session:last", "a").await.unwrap();
        store.put("session:last", "b").await.unwrap();
        assert_eq!(
            store.get("session:last").await.unwrap().as_deref(),
            Some("b")
        );
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put("queue:c1", "{}").await.unwrap();
        store.delete("queue:c1").await.unwrap();
        store.delete("queue:c1").await.unwrap();
        assert!(store.get("queue:c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", tmp.path().join("state.db").display());

        {
            let store = SqliteStore::open(&url).await.unwrap();
            store.put("session:last", "conv-9").await.unwrap();
            store.pool.close().await;
        }

        let store = SqliteStore::open(&url).await.unwrap();
        assert_eq!(
            store.get("session:last").await.unwrap().as_deref(),
            Some("conv-9")
        );
    }
}
