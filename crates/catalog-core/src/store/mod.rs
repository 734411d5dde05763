//! Persistent key-value storage consumed by the cache and the mutation queue.
//!
//! Keys are `/`-separated paths; values are serialized JSON blobs. The SQLite
//! implementation lives in [`crate::db`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::Result;

/// Durable on-device storage of serialized blobs.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read one entry.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace one entry.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove one entry. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Insert or replace several entries as one unit.
    async fn put_many(&self, entries: &[(String, String)]) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value).await?;
        }
        Ok(())
    }

    /// Remove several entries as one unit.
    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}

/// Process-local store for tests and ephemeral (signed-out) sessions.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn put_many(&self, entries: &[(String, String)]) -> Result<()> {
        let mut guard = self.entries.write().await;
        for (key, value) in entries {
            guard.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut guard = self.entries.write().await;
        for key in keys {
            guard.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_prefix_is_ordered_and_bounded() {
        let store = MemoryKeyValueStore::new();
        store.put("mutations/a/002", "two").await.unwrap();
        store.put("mutations/a/001", "one").await.unwrap();
        store.put("mutations/b/001", "other").await.unwrap();
        store.put("catalog/a", "x").await.unwrap();

        let entries = store.scan_prefix("mutations/a/").await.unwrap();
        let values: Vec<_> = entries.into_iter().map(|(_, value)| value).collect();
        assert_eq!(values, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = MemoryKeyValueStore::new();
        store.put("k", "v").await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(store.is_empty().await);
    }
}
