//! Cache record store: the persisted catalog snapshot and its watermark.
//!
//! Every operation is scoped by [`CacheScope`] so switching accounts on one
//! device never mixes catalogs. Read-modify-write operations are serialized
//! by one async lock, making this store the single writer of cache records.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::models::{CacheRecord, CacheScope, CatalogSnapshot, ImageTarget, UserKey};
use crate::store::KeyValueStore;
use crate::Result;

const CATALOG_PREFIX: &str = "catalog";

/// Diagnostics view of one cache record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub cached_at: DateTime<Utc>,
    pub sync_watermark: DateTime<Utc>,
    pub age_secs: i64,
    pub categories: usize,
    pub subcategories: usize,
    pub expired: bool,
}

enum Loaded {
    Missing,
    Corrupt,
    Expired(CacheRecord),
    Valid(CacheRecord),
}

#[derive(Clone)]
pub struct CacheRecordStore {
    kv: Arc<dyn KeyValueStore>,
    validity: chrono::Duration,
    write_lock: Arc<Mutex<()>>,
}

impl CacheRecordStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, validity: chrono::Duration) -> Self {
        Self {
            kv,
            validity,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub const fn validity(&self) -> chrono::Duration {
        self.validity
    }

    /// Read the cached record.
    ///
    /// Undecodable and expired records are discarded and reported as absent.
    pub async fn read(&self, scope: &CacheScope) -> Result<Option<CacheRecord>> {
        match self.load(scope).await? {
            Loaded::Valid(record) => Ok(Some(record)),
            Loaded::Missing => Ok(None),
            Loaded::Corrupt | Loaded::Expired(_) => {
                // A writer may have committed since the unlocked load.
                let _guard = self.write_lock.lock().await;
                match self.load(scope).await? {
                    Loaded::Valid(record) => Ok(Some(record)),
                    Loaded::Missing => Ok(None),
                    Loaded::Corrupt | Loaded::Expired(_) => {
                        self.discard(scope).await?;
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Replace the record atomically, stamping `cached_at` with the current time.
    pub async fn write(
        &self,
        scope: &CacheScope,
        snapshot: CatalogSnapshot,
        watermark: DateTime<Utc>,
    ) -> Result<CacheRecord> {
        let _guard = self.write_lock.lock().await;
        let previous = match self.load(scope).await? {
            Loaded::Valid(record) | Loaded::Expired(record) => Some(record.cached_at),
            Loaded::Missing | Loaded::Corrupt => None,
        };
        let record = stamp(snapshot, watermark, previous);
        self.persist(scope, &record).await?;
        tracing::debug!(
            scope = %scope,
            categories = record.snapshot.category_count(),
            "Cache record written"
        );
        Ok(record)
    }

    /// Serialized read-modify-write.
    ///
    /// `f` receives the current valid record (if any) and returns the snapshot
    /// and watermark to store, or `None` to leave the record untouched.
    pub async fn update<F>(&self, scope: &CacheScope, f: F) -> Result<Option<CacheRecord>>
    where
        F: FnOnce(Option<&CacheRecord>) -> Result<Option<(CatalogSnapshot, DateTime<Utc>)>>
            + Send,
    {
        let _guard = self.write_lock.lock().await;
        let current = match self.load(scope).await? {
            Loaded::Valid(record) => Some(record),
            Loaded::Missing => None,
            Loaded::Corrupt | Loaded::Expired(_) => {
                self.discard(scope).await?;
                None
            }
        };

        let Some((snapshot, watermark)) = f(current.as_ref())? else {
            return Ok(None);
        };
        let record = stamp(
            snapshot,
            watermark,
            current.as_ref().map(|record| record.cached_at),
        );
        self.persist(scope, &record).await?;
        Ok(Some(record))
    }

    /// True iff a record exists and is within the validity window.
    pub async fn is_valid(&self, scope: &CacheScope) -> Result<bool> {
        Ok(matches!(self.load(scope).await?, Loaded::Valid(_)))
    }

    /// Remove the record and its watermark.
    pub async fn clear(&self, scope: &CacheScope) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.discard(scope).await
    }

    /// Remove every cached catalog of one user (sign-out).
    pub async fn clear_user(&self, user: &UserKey) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let prefix = format!("{CATALOG_PREFIX}/{}/", user.as_str());
        let keys: Vec<String> = self
            .kv
            .scan_prefix(&prefix)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        self.kv.delete_many(&keys).await?;
        Ok(keys.len())
    }

    /// Read the raw watermark without deserializing the snapshot.
    pub async fn read_watermark(&self, scope: &CacheScope) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.kv.get(&watermark_key(scope)).await? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(watermark) => Ok(Some(watermark.with_timezone(&Utc))),
            Err(error) => {
                tracing::warn!(scope = %scope, "Ignoring unreadable watermark {raw:?}: {error}");
                Ok(None)
            }
        }
    }

    /// Advance the watermark of a valid record, keeping snapshot and `cached_at`.
    pub async fn touch_watermark(
        &self,
        scope: &CacheScope,
        watermark: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Loaded::Valid(mut record) = self.load(scope).await? else {
            return Ok(false);
        };
        record.sync_watermark = watermark;
        self.persist(scope, &record).await?;
        Ok(true)
    }

    /// Replace one entity's image reference, leaving everything else as is.
    pub async fn patch_image(
        &self,
        scope: &CacheScope,
        target: ImageTarget,
        url: String,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Loaded::Valid(mut record) = self.load(scope).await? else {
            return Ok(false);
        };
        if !record.snapshot.set_image_url(target, url) {
            return Ok(false);
        }
        self.persist(scope, &record).await?;
        Ok(true)
    }

    pub async fn status(&self, scope: &CacheScope) -> Result<Option<CacheStatus>> {
        let now = Utc::now();
        let record = match self.load(scope).await? {
            Loaded::Valid(record) | Loaded::Expired(record) => record,
            Loaded::Missing | Loaded::Corrupt => return Ok(None),
        };
        Ok(Some(CacheStatus {
            cached_at: record.cached_at,
            sync_watermark: record.sync_watermark,
            age_secs: record.age_at(now).num_seconds(),
            categories: record.snapshot.category_count(),
            subcategories: record.snapshot.subcategory_count(),
            expired: record.is_expired_at(now, self.validity),
        }))
    }

    async fn load(&self, scope: &CacheScope) -> Result<Loaded> {
        let Some(raw) = self.kv.get(&record_key(scope)).await? else {
            return Ok(Loaded::Missing);
        };

        let record: CacheRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(scope = %scope, "Discarding undecodable cache record: {error}");
                return Ok(Loaded::Corrupt);
            }
        };

        if record.is_expired_at(Utc::now(), self.validity) {
            tracing::info!(
                scope = %scope,
                cached_at = %record.cached_at,
                "Cache record expired"
            );
            return Ok(Loaded::Expired(record));
        }

        Ok(Loaded::Valid(record))
    }

    async fn persist(&self, scope: &CacheScope, record: &CacheRecord) -> Result<()> {
        let serialized = serde_json::to_string(record)?;
        self.kv
            .put_many(&[
                (record_key(scope), serialized),
                (watermark_key(scope), record.sync_watermark.to_rfc3339()),
            ])
            .await
    }

    async fn discard(&self, scope: &CacheScope) -> Result<()> {
        self.kv
            .delete_many(&[record_key(scope), watermark_key(scope)])
            .await
    }
}

fn stamp(
    snapshot: CatalogSnapshot,
    watermark: DateTime<Utc>,
    previous_cached_at: Option<DateTime<Utc>>,
) -> CacheRecord {
    let now = Utc::now();
    let cached_at = previous_cached_at.map_or(now, |previous| previous.max(now));
    CacheRecord {
        snapshot,
        cached_at,
        sync_watermark: watermark,
    }
}

fn scope_prefix(scope: &CacheScope) -> String {
    format!(
        "{CATALOG_PREFIX}/{}/{}",
        scope.user.as_str(),
        scope.segment.as_str()
    )
}

fn record_key(scope: &CacheScope) -> String {
    format!("{}/record", scope_prefix(scope))
}

fn watermark_key(scope: &CacheScope) -> String {
    format!("{}/watermark", scope_prefix(scope))
}
