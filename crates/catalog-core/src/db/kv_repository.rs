//! `SQLite` implementation of `KeyValueStore`
//!
//! `rusqlite` is blocking, so every statement runs on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::error::{Error, Result};
use crate::store::KeyValueStore;

const UPSERT_SQL: &str = "INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

/// Thread-safe key-value store backed by one `SQLite` file.
#[derive(Clone)]
pub struct SqliteKeyValueStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl SqliteKeyValueStore {
    /// Open (or create) the store at the given filesystem path.
    pub fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path)?;
        tracing::debug!("Opened catalog store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Location of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let db = db.lock().unwrap_or_else(PoisonError::into_inner);
            f(&db)
        })
        .await
        .map_err(|error| Error::Storage(format!("storage task failed: {error}")))?
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_db(move |db| {
            let value = db
                .connection()
                .query_row(
                    "SELECT value FROM kv_entries WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_db(move |db| {
            db.connection()
                .execute(UPSERT_SQL, params![key, value, now_millis()])?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_db(move |db| {
            let rows = db
                .connection()
                .execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
            Ok(rows > 0)
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let prefix = prefix.to_string();
        self.with_db(move |db| {
            let mut stmt = db.connection().prepare(
                "SELECT key, value FROM kv_entries
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key ASC",
            )?;
            let entries = stmt
                .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn put_many(&self, entries: &[(String, String)]) -> Result<()> {
        let entries = entries.to_vec();
        self.with_db(move |db| {
            let tx = db.connection().unchecked_transaction()?;
            let updated_at = now_millis();
            for (key, value) in &entries {
                tx.execute(UPSERT_SQL, params![key, value, updated_at])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let keys = keys.to_vec();
        self.with_db(move |db| {
            let tx = db.connection().unchecked_transaction()?;
            for key in &keys {
                tx.execute("DELETE FROM kv_entries WHERE key = ?1", params![key])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn put_get_delete_roundtrip() {
        let store = SqliteKeyValueStore::open_in_memory().unwrap();

        store.put("catalog/anonymous/household/record", "{}").await.unwrap();
        assert_eq!(
            store
                .get("catalog/anonymous/household/record")
                .await
                .unwrap()
                .as_deref(),
            Some("{}")
        );

        store.put("catalog/anonymous/household/record", "[]").await.unwrap();
        assert_eq!(
            store
                .get("catalog/anonymous/household/record")
                .await
                .unwrap()
                .as_deref(),
            Some("[]")
        );

        assert!(store.delete("catalog/anonymous/household/record").await.unwrap());
        assert!(store
            .get("catalog/anonymous/household/record")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scan_prefix_orders_by_key_and_ignores_siblings() {
        let store = SqliteKeyValueStore::open_in_memory().unwrap();
        store.put("mutations/u/00000000000000000002", "b").await.unwrap();
        store.put("mutations/u/00000000000000000001", "a").await.unwrap();
        store.put("mutations/u2/00000000000000000001", "x").await.unwrap();

        let entries = store.scan_prefix("mutations/u/").await.unwrap();
        let values: Vec<_> = entries.iter().map(|(_, value)| value.as_str()).collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_operations_are_applied_together() {
        let store = SqliteKeyValueStore::open_in_memory().unwrap();
        store
            .put_many(&[
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ])
            .await
            .unwrap();
        assert_eq!(store.scan_prefix("").await.unwrap().len(), 2);

        store
            .delete_many(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(store.scan_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn works_on_a_current_thread_runtime() {
        let store = SqliteKeyValueStore::open_in_memory().unwrap();
        let writers: Vec<_> = (0..8)
            .map(|index| {
                let store = store.clone();
                tokio::spawn(async move { store.put(&format!("k/{index}"), "v").await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        assert_eq!(store.scan_prefix("k/").await.unwrap().len(), 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_store_persists_across_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("catalog.db");

        {
            let store = SqliteKeyValueStore::open_path(&path).unwrap();
            store.put("k", "v").await.unwrap();
            assert_eq!(store.path(), Some(path.as_path()));
        }

        let reopened = SqliteKeyValueStore::open_path(&path).unwrap();
        assert_eq!(reopened.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
