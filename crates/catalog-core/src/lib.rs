//! catalog-core - Offline-first catalog cache and incremental sync engine
//!
//! This crate keeps a large, frequently changing product catalog available
//! on a device that may be offline for long periods. It contains the cache
//! record store, the diff merge engine, the sync orchestrator, signed image
//! URL handling and the offline mutation queue used by mobile clients.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod images;
pub mod merge;
pub mod models;
pub mod network;
pub mod queue;
pub mod remote;
pub mod services;
pub mod state;
pub mod store;
pub mod sync;
mod util;

#[cfg(test)]
mod test_support;

pub use config::CatalogConfig;
pub use error::{Error, Result};
pub use services::CatalogEngine;
