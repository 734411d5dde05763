//! Client-facing services

mod engine;

pub use engine::{BackgroundTasks, CatalogEngine, SignOutReport};
