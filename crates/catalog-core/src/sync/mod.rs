//! Sync orchestrator.
//!
//! Decides per refresh trigger whether to serve the cache, fetch the full
//! catalog, or fetch and merge a diff. It is the only component that commits
//! merge results, and it runs at most one fetch per [`CacheScope`] at a time:
//! concurrent refreshes join the outstanding flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::{CacheRecordStore, CacheStatus};
use crate::config::CatalogConfig;
use crate::error::{Error, Result};
use crate::events::CatalogEvent;
use crate::merge::{merge, normalize, validate, validate_snapshot};
use crate::models::{CacheRecord, CacheScope, UserIdentity, UserKey};
use crate::network::{Connectivity, ReachabilityMonitor};
use crate::remote::{CatalogRemote, DiffRequest};
use crate::state::SyncState;

const EVENT_CAPACITY: usize = 64;

/// What asked for a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshTrigger {
    InitialMount,
    PullToRefresh,
    ScreenFocus,
    Reconnected,
}

impl RefreshTrigger {
    /// Explicit user or connectivity triggers always contact the server.
    pub const fn forces_network(self) -> bool {
        matches!(self, Self::PullToRefresh | Self::Reconnected)
    }
}

/// Where the returned snapshot came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSource {
    /// Served straight from the cache; a background refresh may be running
    Cache,
    /// Cold start: complete catalog downloaded
    FullFetch,
    /// Diff merged into the cache
    Merged,
    /// Server reported no changes; watermark advanced
    NoChanges,
    /// Scope was checked within the focus refresh interval
    RecentlyChecked,
    /// Monitor reported offline; cache served unchanged
    Offline,
    /// Fetch failed; cache served unchanged
    FetchFailed(String),
}

impl SnapshotSource {
    /// Whether the server confirmed this snapshot during the call.
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, Self::FullFetch | Self::Merged | Self::NoChanges)
    }
}

/// Result of one refresh
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub record: CacheRecord,
    pub source: SnapshotSource,
}

/// Cache-first read result handed to the UI
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogView {
    pub scope: CacheScope,
    pub record: CacheRecord,
    pub source: SnapshotSource,
    /// A background refresh was started for this scope
    pub refreshing: bool,
}

/// Timing knobs taken from [`CatalogConfig`]
#[derive(Debug, Clone, Copy)]
struct SyncSettings {
    watermark_skew: chrono::Duration,
    fetch_timeout: Duration,
    focus_refresh_interval: Duration,
}

type Flight = Shared<BoxFuture<'static, Result<SyncOutcome>>>;

struct Inner {
    store: CacheRecordStore,
    remote: Arc<dyn CatalogRemote>,
    monitor: ReachabilityMonitor,
    identity: Option<UserIdentity>,
    settings: SyncSettings,
    in_flight: Mutex<HashMap<CacheScope, Flight>>,
    last_checked: Mutex<HashMap<CacheScope, Instant>>,
    events: broadcast::Sender<CatalogEvent>,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        store: CacheRecordStore,
        remote: Arc<dyn CatalogRemote>,
        monitor: ReachabilityMonitor,
        config: &CatalogConfig,
        identity: Option<UserIdentity>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                monitor,
                identity,
                settings: SyncSettings {
                    watermark_skew: config.watermark_skew(),
                    fetch_timeout: config.fetch_timeout(),
                    focus_refresh_interval: config.focus_refresh_interval(),
                },
                in_flight: Mutex::new(HashMap::new()),
                last_checked: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn store(&self) -> &CacheRecordStore {
        &self.inner.store
    }

    pub fn monitor(&self) -> &ReachabilityMonitor {
        &self.inner.monitor
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<CatalogEvent> {
        self.inner.events.clone()
    }

    /// Receive catalog notifications. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.inner.events.subscribe()
    }

    /// Refresh one scope, joining an outstanding flight for it if any.
    pub async fn refresh(&self, scope: &CacheScope, trigger: RefreshTrigger) -> Result<SyncOutcome> {
        let flight = {
            let mut in_flight = self.inner.in_flight.lock().await;
            if let Some(flight) = in_flight.get(scope) {
                tracing::debug!(scope = %scope, ?trigger, "Joining in-flight refresh");
                flight.clone()
            } else {
                let this = self.clone();
                let key = scope.clone();
                let flight = async move {
                    let result = this.run(&key, trigger).await;
                    this.inner.in_flight.lock().await.remove(&key);
                    result
                }
                .boxed()
                .shared();
                in_flight.insert(scope.clone(), flight.clone());
                flight
            }
        };

        flight.await
    }

    /// Cache-first read.
    ///
    /// A valid cache is returned right away and refreshed in the background;
    /// without one the call waits for the cold fetch.
    pub async fn load(&self, scope: &CacheScope, trigger: RefreshTrigger) -> Result<CatalogView> {
        if let Some(record) = self.inner.store.read(scope).await? {
            let refreshing = trigger.forces_network() || !self.recently_checked(scope).await;
            if refreshing {
                self.spawn_refresh(scope.clone(), trigger);
            }
            return Ok(CatalogView {
                scope: scope.clone(),
                record,
                source: SnapshotSource::Cache,
                refreshing,
            });
        }

        let outcome = self.refresh(scope, trigger).await?;
        Ok(CatalogView {
            scope: scope.clone(),
            record: outcome.record,
            source: outcome.source,
            refreshing: false,
        })
    }

    /// Drop the cached record so the next refresh starts cold.
    pub async fn invalidate(&self, scope: &CacheScope) -> Result<()> {
        self.inner.store.clear(scope).await?;
        self.inner.last_checked.lock().await.remove(scope);
        tracing::info!(scope = %scope, "Catalog cache invalidated");
        Ok(())
    }

    pub async fn status(&self, scope: &CacheScope) -> Result<Option<CacheStatus>> {
        self.inner.store.status(scope).await
    }

    /// Refresh `scopes` every time the monitor reports a reconnect.
    ///
    /// The task keeps only a weak handle and exits at the first reconnect
    /// after the last orchestrator clone has been dropped.
    pub fn spawn_reconnect_refresh(&self, scopes: Vec<CacheScope>) -> JoinHandle<()> {
        let mut subscription = self.inner.monitor.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while subscription.reconnected().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    tracing::debug!("Orchestrator dropped, stopping reconnect refresh");
                    break;
                };
                let this = Self { inner };
                for scope in &scopes {
                    if let Err(error) = this.refresh(scope, RefreshTrigger::Reconnected).await {
                        tracing::warn!(scope = %scope, "Reconnect refresh failed: {error}");
                    }
                }
            }
        })
    }

    fn spawn_refresh(&self, scope: CacheScope, trigger: RefreshTrigger) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(error) = this.refresh(&scope, trigger).await {
                tracing::warn!(scope = %scope, "Background refresh failed: {error}");
            }
        });
    }

    async fn run(&self, scope: &CacheScope, trigger: RefreshTrigger) -> Result<SyncOutcome> {
        match self.inner.store.read(scope).await? {
            Some(record) => self.warm_refresh(scope, trigger, record).await,
            None => self.cold_start(scope).await,
        }
    }

    async fn cold_start(&self, scope: &CacheScope) -> Result<SyncOutcome> {
        if self.inner.monitor.current() == Connectivity::Offline {
            tracing::info!(scope = %scope, "Cold start while offline");
            self.emit_state(scope, SyncState::Error);
            return Err(Error::NoCacheAvailable(scope.to_string()));
        }

        self.emit_state(scope, SyncState::Syncing);
        let started = Utc::now();
        let fetched = self
            .with_timeout(self.inner.remote.fetch_full(scope.segment))
            .await
            .and_then(|full| {
                validate_snapshot(&full.snapshot)?;
                Ok(full)
            });

        let full = match fetched {
            Ok(full) => full,
            Err(error) if error.is_remote_failure() => {
                tracing::warn!(scope = %scope, "Full catalog fetch failed: {error}");
                self.emit_state(scope, SyncState::Error);
                return Err(Error::NoCacheAvailable(format!("{scope}: {error}")));
            }
            Err(error) => return Err(error),
        };

        if let Some(meta) = full.meta {
            if meta.total_categories != full.snapshot.category_count() {
                tracing::warn!(
                    scope = %scope,
                    reported = meta.total_categories,
                    received = full.snapshot.category_count(),
                    "Full catalog meta count mismatch"
                );
            }
        }

        let snapshot = normalize(full.snapshot);
        let record = self.inner.store.write(scope, snapshot, started).await?;
        self.mark_checked(scope).await;
        self.emit_committed(scope, &record);
        tracing::info!(
            scope = %scope,
            categories = record.snapshot.category_count(),
            "Catalog downloaded"
        );

        Ok(SyncOutcome {
            record,
            source: SnapshotSource::FullFetch,
        })
    }

    async fn warm_refresh(
        &self,
        scope: &CacheScope,
        trigger: RefreshTrigger,
        record: CacheRecord,
    ) -> Result<SyncOutcome> {
        if !trigger.forces_network() && self.recently_checked(scope).await {
            tracing::debug!(scope = %scope, ?trigger, "Catalog checked recently, serving cache");
            return Ok(SyncOutcome {
                record,
                source: SnapshotSource::RecentlyChecked,
            });
        }

        if self.inner.monitor.current() == Connectivity::Offline {
            tracing::debug!(scope = %scope, "Offline, serving cache");
            self.emit_state(scope, SyncState::Offline);
            return Ok(SyncOutcome {
                record,
                source: SnapshotSource::Offline,
            });
        }

        self.emit_state(scope, SyncState::Syncing);
        let request = DiffRequest {
            since: record.sync_watermark - self.inner.settings.watermark_skew,
            user: self.diff_identity(scope),
        };
        let fetched = self
            .with_timeout(self.inner.remote.fetch_diff(scope.segment, &request))
            .await
            .and_then(|response| {
                if response.has_updates {
                    validate(&response.diff)?;
                }
                Ok(response)
            });

        let response = match fetched {
            Ok(response) => response,
            Err(error) if error.is_remote_failure() => {
                tracing::warn!(scope = %scope, "Diff fetch failed, keeping cache: {error}");
                self.emit_state(scope, SyncState::Stale);
                return Ok(SyncOutcome {
                    record,
                    source: SnapshotSource::FetchFailed(error.to_string()),
                });
            }
            Err(error) => return Err(error),
        };

        if !response.has_updates || response.diff.is_empty() {
            let new_watermark = response.new_watermark;
            if !self.inner.store.touch_watermark(scope, new_watermark).await? {
                tracing::debug!(scope = %scope, "Cache record vanished before watermark update");
            }
            self.mark_checked(scope).await;
            self.emit_state(scope, SyncState::Synced);
            return Ok(SyncOutcome {
                record: CacheRecord {
                    sync_watermark: new_watermark,
                    ..record
                },
                source: SnapshotSource::NoChanges,
            });
        }

        let diff = response.diff;
        let new_watermark = response.new_watermark;
        let committed = self
            .inner
            .store
            .update(scope, |current| {
                Ok(current.map(|current| (merge(&current.snapshot, &diff), new_watermark)))
            })
            .await?;

        let Some(record) = committed else {
            tracing::info!(scope = %scope, "Cache cleared during diff fetch, starting cold");
            return self.cold_start(scope).await;
        };

        self.mark_checked(scope).await;
        self.emit_committed(scope, &record);
        tracing::info!(
            scope = %scope,
            upserted = diff.upserted_categories.len() + diff.upserted_subcategories.len(),
            deleted = diff.deleted_categories.len() + diff.deleted_subcategories.len(),
            "Catalog diff merged"
        );

        Ok(SyncOutcome {
            record,
            source: SnapshotSource::Merged,
        })
    }

    /// The identity is only sent for the scope it owns.
    fn diff_identity(&self, scope: &CacheScope) -> Option<UserIdentity> {
        self.inner
            .identity
            .as_ref()
            .filter(|identity| UserKey::for_identity(Some(identity)) == scope.user)
            .cloned()
    }

    async fn with_timeout<T>(&self, request: impl Future<Output = Result<T>> + Send) -> Result<T> {
        let timeout = self.inner.settings.fetch_timeout;
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| {
                Error::TransientNetwork(format!("request timed out after {}s", timeout.as_secs()))
            })?
    }

    async fn recently_checked(&self, scope: &CacheScope) -> bool {
        self.inner
            .last_checked
            .lock()
            .await
            .get(scope)
            .is_some_and(|checked| checked.elapsed() < self.inner.settings.focus_refresh_interval)
    }

    async fn mark_checked(&self, scope: &CacheScope) {
        self.inner
            .last_checked
            .lock()
            .await
            .insert(scope.clone(), Instant::now());
    }

    fn emit_state(&self, scope: &CacheScope, state: SyncState) {
        let _ = self.inner.events.send(CatalogEvent::StateChanged {
            scope: scope.clone(),
            state,
        });
    }

    fn emit_committed(&self, scope: &CacheScope, record: &CacheRecord) {
        let _ = self.inner.events.send(CatalogEvent::SnapshotUpdated {
            scope: scope.clone(),
            categories: record.snapshot.category_count(),
            subcategories: record.snapshot.subcategory_count(),
        });
        self.emit_state(scope, SyncState::Synced);
    }
}
