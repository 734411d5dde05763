//! Per-user catalog engine shared by app clients.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::cache::CacheRecordStore;
use crate::config::CatalogConfig;
use crate::db::SqliteKeyValueStore;
use crate::images::ImageFreshnessChecker;
use crate::models::{CacheScope, MarketSegment, UserIdentity, UserKey};
use crate::network::ReachabilityMonitor;
use crate::queue::MutationQueue;
use crate::remote::{CatalogRemote, HttpCatalogRemote};
use crate::store::{KeyValueStore, MemoryKeyValueStore};
use crate::sync::{CatalogView, RefreshTrigger, SyncOrchestrator, SyncOutcome};
use crate::{Error, Result};

/// What [`CatalogEngine::sign_out`] removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignOutReport {
    pub cache_entries_removed: usize,
    pub mutations_discarded: usize,
}

/// Reconnect listeners started by [`CatalogEngine::start_background`].
///
/// Dropping this value stops them.
#[derive(Debug)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    fn abort_all(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }

    pub fn stop(self) {
        self.abort_all();
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Thread-safe facade wiring one user's cache, sync, images and write queue.
#[derive(Clone)]
pub struct CatalogEngine {
    config: CatalogConfig,
    user: UserKey,
    monitor: ReachabilityMonitor,
    orchestrator: SyncOrchestrator,
    images: ImageFreshnessChecker,
    queue: MutationQueue,
}

impl CatalogEngine {
    /// Wire an engine from explicit collaborators.
    pub fn new(
        config: CatalogConfig,
        kv: Arc<dyn KeyValueStore>,
        remote: Arc<dyn CatalogRemote>,
        monitor: ReachabilityMonitor,
        identity: Option<UserIdentity>,
    ) -> Self {
        let user = UserKey::for_identity(identity.as_ref());
        let store = CacheRecordStore::new(kv.clone(), config.cache_validity());
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            remote.clone(),
            monitor.clone(),
            &config,
            identity,
        );
        let images = ImageFreshnessChecker::new(
            store,
            remote,
            orchestrator.event_sender(),
            config.image_lookahead(),
        );
        let queue = MutationQueue::new(
            kv,
            user.clone(),
            monitor.clone(),
            config.default_max_retries,
        );

        tracing::debug!(user = %user, "Catalog engine ready");
        Self {
            config,
            user,
            monitor,
            orchestrator,
            images,
            queue,
        }
    }

    /// Open an engine persisting to the SQLite file at `db_path` and talking
    /// to the configured catalog API.
    pub fn open_path(
        db_path: impl Into<PathBuf>,
        config: CatalogConfig,
        monitor: ReachabilityMonitor,
        identity: Option<UserIdentity>,
    ) -> Result<Self> {
        let config = config.validate()?;
        let base_url = config.api_base_url.clone().ok_or_else(|| {
            Error::InvalidInput("api_base_url is required to reach the catalog API".to_string())
        })?;
        let remote = HttpCatalogRemote::new(&base_url, config.fetch_timeout())?;
        let kv = SqliteKeyValueStore::open_path(db_path)?;
        Ok(Self::new(
            config,
            Arc::new(kv),
            Arc::new(remote),
            monitor,
            identity,
        ))
    }

    /// Open an engine whose cache and queue live only in memory.
    pub fn open_in_memory(
        config: CatalogConfig,
        remote: Arc<dyn CatalogRemote>,
        monitor: ReachabilityMonitor,
        identity: Option<UserIdentity>,
    ) -> Self {
        Self::new(
            config,
            Arc::new(MemoryKeyValueStore::new()),
            remote,
            monitor,
            identity,
        )
    }

    pub const fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub const fn user(&self) -> &UserKey {
        &self.user
    }

    pub const fn monitor(&self) -> &ReachabilityMonitor {
        &self.monitor
    }

    pub const fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub const fn images(&self) -> &ImageFreshnessChecker {
        &self.images
    }

    pub const fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn scope(&self, segment: MarketSegment) -> CacheScope {
        CacheScope::new(self.user.clone(), segment)
    }

    /// Cache-first catalog read for one segment.
    pub async fn load(&self, segment: MarketSegment, trigger: RefreshTrigger) -> Result<CatalogView> {
        self.orchestrator.load(&self.scope(segment), trigger).await
    }

    pub async fn refresh(
        &self,
        segment: MarketSegment,
        trigger: RefreshTrigger,
    ) -> Result<SyncOutcome> {
        self.orchestrator.refresh(&self.scope(segment), trigger).await
    }

    /// Refresh `segments` and drain the queue on every reconnect.
    pub fn start_background(&self, segments: &[MarketSegment]) -> BackgroundTasks {
        let scopes = segments.iter().map(|segment| self.scope(*segment)).collect();
        BackgroundTasks {
            handles: vec![
                self.orchestrator.spawn_reconnect_refresh(scopes),
                self.queue.spawn_reconnect_drain(),
            ],
        }
    }

    /// Remove everything stored for this user: cached catalogs and
    /// queued writes.
    pub async fn sign_out(&self) -> Result<SignOutReport> {
        let cache_entries_removed = self.orchestrator.store().clear_user(&self.user).await?;
        let mutations_discarded = self.queue.clear().await?;
        tracing::info!(
            user = %self.user,
            cache_entries_removed,
            mutations_discarded,
            "Signed out, local catalog data removed"
        );
        Ok(SignOutReport {
            cache_entries_removed,
            mutations_discarded,
        })
    }
}
