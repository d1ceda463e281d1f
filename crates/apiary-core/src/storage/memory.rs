//! In-memory storage backend, used by tests and as the default.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Storage, StorageError, StorageRecord};

/// Storage backend holding everything in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.objects.lock().expect("storage lock poisoned").len()
    }

    /// True when no records are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut objects = self.objects.lock().expect("storage lock poisoned");
        objects.insert(key.to_string(), (value.to_vec(), Utc::now()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let objects = self.objects.lock().expect("storage lock poisoned");
        Ok(objects.get(key).map(|(value, _)| value.clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let objects = self.objects.lock().expect("storage lock poisoned");
        Ok(objects.contains_key(key))
    }

    async fn all(&self) -> Result<Vec<StorageRecord>, StorageError> {
        let objects = self.objects.lock().expect("storage lock poisoned");
        Ok(objects
            .iter()
            .map(|(key, (value, created_at))| StorageRecord {
                key: key.clone(),
                value: value.clone(),
                created_at: *created_at,
            })
            .collect())
    }
}
