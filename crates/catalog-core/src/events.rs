//! Notifications published by the sync engine.

use crate::models::{CacheScope, ImageTarget, MutationId};
use crate::state::SyncState;

/// Catalog change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    /// Sync state of a scope changed
    StateChanged { scope: CacheScope, state: SyncState },
    /// A new snapshot was committed to the cache
    SnapshotUpdated {
        scope: CacheScope,
        categories: usize,
        subcategories: usize,
    },
    /// One entity's image reference was replaced
    ImageRefreshed { scope: CacheScope, target: ImageTarget },
}

impl CatalogEvent {
    pub const fn scope(&self) -> &CacheScope {
        match self {
            Self::StateChanged { scope, .. }
            | Self::SnapshotUpdated { scope, .. }
            | Self::ImageRefreshed { scope, .. } => scope,
        }
    }
}

/// Offline mutation queue notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEvent {
    Enqueued { id: MutationId, kind: String },
    Completed { id: MutationId, kind: String },
    /// Failed attempt; the entry stays queued
    Retrying {
        id: MutationId,
        kind: String,
        attempts: u32,
        reason: String,
    },
    /// Retry budget used up; the entry was removed
    Exhausted(crate::Error),
}
