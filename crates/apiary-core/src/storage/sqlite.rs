//! SQLite-backed storage implementation.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use super::{Storage, StorageError, StorageRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    key        TEXT PRIMARY KEY,
    value      BLOB NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

/// SQLite-backed storage provider.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a storage provider from an existing pool, initializing the
    /// schema if needed.
    pub async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Create and initialize storage from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects with sensible defaults and initializes the schema
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Backend {
                operation: "create_dir".to_string(),
                details: format!("failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| StorageError::Backend {
                operation: "connect".to_string(),
                details: format!("failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::new(pool).await
    }

    /// Create an in-memory database, private to the returned handle.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StorageError::Backend {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;

        Self::new(pool).await
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO objects (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"
            SELECT value FROM objects WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT EXISTS(SELECT 1 FROM objects WHERE key = ?)
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0 != 0)
    }

    async fn all(&self) -> Result<Vec<StorageRecord>, StorageError> {
        let records = sqlx::query_as::<_, StorageRecord>(
            r#"
            SELECT key, value, created_at FROM objects ORDER BY key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
