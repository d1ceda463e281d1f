//! Storage interfaces and backends for durable schedule records.
//!
//! This module defines the storage abstraction the core writes schedule
//! records through, plus the backend implementations.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStorage;
pub use self::sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One durable blob from the storage layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StorageRecord {
    /// The record key.
    pub key: String,
    /// The opaque blob.
    pub value: Vec<u8>,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

/// Errors raised by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend failed to execute an operation.
    #[error("storage error during '{operation}': {details}")]
    Backend {
        /// The operation that failed.
        operation: String,
        /// Backend-level details.
        details: String,
    },
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Backend {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

/// Durable key/value interface used by the core.
///
/// All operations are idempotent; `put` overwrites. The core only performs
/// conditional writes (`exists` then `put`), so backends need no stronger
/// guarantee than per-key serializability.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write a blob under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Read the blob under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// True when a blob exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Every record in the store, ordered by key.
    async fn all(&self) -> Result<Vec<StorageRecord>, StorageError>;
}
