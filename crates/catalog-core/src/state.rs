//! Shared sync state types.

use serde::{Deserialize, Serialize};

/// Per-scope sync state reported to subscribers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No network; cached data is being served
    Offline,
    /// A fetch is in flight
    Syncing,
    /// Last fetch succeeded
    Synced,
    /// Last fetch failed; cached data is being served
    Stale,
    /// Last fetch failed and there is no cache to fall back to
    Error,
}

impl SyncState {
    pub const fn is_settled(self) -> bool {
        !matches!(self, Self::Syncing)
    }
}
