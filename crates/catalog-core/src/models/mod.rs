//! Data models for the catalog sync engine

mod catalog;
mod diff;
mod mutation;
mod scope;
mod snapshot;

pub use catalog::{
    Availability, Category, CategoryId, ImageTarget, MarketSegment, Subcategory, SubcategoryId,
};
pub use diff::CatalogDiff;
pub use mutation::{MutationId, QueuedMutation};
pub use scope::{CacheScope, UserIdentity, UserKey};
pub use snapshot::{CacheRecord, CatalogSnapshot};
