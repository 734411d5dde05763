//! Fixtures and fakes shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::models::{
    Availability, CatalogDiff, CatalogSnapshot, Category, CategoryId, ImageTarget, MarketSegment,
    Subcategory, SubcategoryId,
};
use crate::remote::{CatalogRemote, DiffRequest, DiffResponse, FullCatalog, SignedUrl};
use crate::store::KeyValueStore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

pub fn category(id: CategoryId, name: &str) -> Category {
    Category {
        id,
        name: name.to_string(),
        image_url: None,
        availability: Availability::default(),
        updated_at: ts(1_000),
        subcategories: Vec::new(),
        subcategory_count: 0,
    }
}

pub fn subcategory(id: SubcategoryId, category_id: CategoryId, name: &str) -> Subcategory {
    Subcategory {
        id,
        name: name.to_string(),
        image_url: None,
        unit_price: 10.0,
        price_unit: "kg".to_string(),
        category_id,
        availability: Availability::default(),
        updated_at: ts(1_000),
    }
}

pub trait CategoryFixture {
    fn with_image(self, url: &str) -> Self;
    fn with_subs(self, subs: Vec<Subcategory>) -> Self;
    fn at(self, secs: i64) -> Self;
}

impl CategoryFixture for Category {
    fn with_image(mut self, url: &str) -> Self {
        self.image_url = Some(url.to_string());
        self
    }

    fn with_subs(mut self, subs: Vec<Subcategory>) -> Self {
        self.subcategories = subs;
        self.recount();
        self
    }

    fn at(mut self, secs: i64) -> Self {
        self.updated_at = ts(secs);
        self
    }
}

pub trait SubcategoryFixture {
    fn with_image(self, url: &str) -> Self;
    fn priced(self, price: f64) -> Self;
    fn at(self, secs: i64) -> Self;
}

impl SubcategoryFixture for Subcategory {
    fn with_image(mut self, url: &str) -> Self {
        self.image_url = Some(url.to_string());
        self
    }

    fn priced(mut self, price: f64) -> Self {
        self.unit_price = price;
        self
    }

    fn at(mut self, secs: i64) -> Self {
        self.updated_at = ts(secs);
        self
    }
}

/// `[Metal, Paper]` with one subcategory each, sorted and counted.
pub fn paper_and_metal() -> CatalogSnapshot {
    CatalogSnapshot::new(vec![
        category(2, "Metal")
            .with_image("https://cdn.example.com/metal.png")
            .with_subs(vec![subcategory(20, 2, "Aluminium cans")]),
        category(1, "Paper")
            .with_image("https://cdn.example.com/paper.png")
            .with_subs(vec![subcategory(10, 1, "Cardboard")
                .with_image("https://cdn.example.com/cardboard.png")]),
    ])
}

pub fn no_changes(watermark: DateTime<Utc>) -> DiffResponse {
    DiffResponse {
        diff: CatalogDiff::default(),
        has_updates: false,
        new_watermark: watermark,
    }
}

pub fn changes(diff: CatalogDiff, watermark: DateTime<Utc>) -> DiffResponse {
    DiffResponse {
        diff,
        has_updates: true,
        new_watermark: watermark,
    }
}

/// Scriptable in-process [`CatalogRemote`].
///
/// Calls block on `gate` while it has no permits, which lets tests hold a
/// flight open.
pub struct FakeRemote {
    full: Mutex<Result<FullCatalog>>,
    diff: Mutex<Result<DiffResponse>>,
    image: Mutex<Result<SignedUrl>>,
    last_diff_request: Mutex<Option<DiffRequest>>,
    gate: Option<Arc<Semaphore>>,
    full_calls: AtomicUsize,
    diff_calls: AtomicUsize,
    image_calls: AtomicUsize,
}

impl FakeRemote {
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self {
            full: Mutex::new(Ok(FullCatalog {
                snapshot,
                meta: None,
            })),
            diff: Mutex::new(Ok(no_changes(ts(2_000)))),
            image: Mutex::new(Err(Error::Api("no image scripted".to_string()))),
            last_diff_request: Mutex::new(None),
            gate: None,
            full_calls: AtomicUsize::new(0),
            diff_calls: AtomicUsize::new(0),
            image_calls: AtomicUsize::new(0),
        }
    }

    pub fn gated(snapshot: CatalogSnapshot) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let mut remote = Self::new(snapshot);
        remote.gate = Some(gate.clone());
        (remote, gate)
    }

    pub fn set_full(&self, response: Result<FullCatalog>) {
        *self.full.lock().unwrap() = response;
    }

    pub fn set_diff(&self, response: Result<DiffResponse>) {
        *self.diff.lock().unwrap() = response;
    }

    pub fn set_image(&self, response: Result<SignedUrl>) {
        *self.image.lock().unwrap() = response;
    }

    pub fn last_diff_request(&self) -> Option<DiffRequest> {
        self.last_diff_request.lock().unwrap().clone()
    }

    pub fn full_calls(&self) -> usize {
        self.full_calls.load(Ordering::SeqCst)
    }

    pub fn diff_calls(&self) -> usize {
        self.diff_calls.load(Ordering::SeqCst)
    }

    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
    }
}

#[async_trait]
impl CatalogRemote for FakeRemote {
    async fn fetch_full(&self, _segment: MarketSegment) -> Result<FullCatalog> {
        self.full_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        self.full.lock().unwrap().clone()
    }

    async fn fetch_diff(
        &self,
        _segment: MarketSegment,
        request: &DiffRequest,
    ) -> Result<DiffResponse> {
        self.diff_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_diff_request.lock().unwrap() = Some(request.clone());
        self.pass_gate().await;
        self.diff.lock().unwrap().clone()
    }

    async fn refresh_image_url(&self, _target: ImageTarget) -> Result<SignedUrl> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        self.image.lock().unwrap().clone()
    }
}

/// Store whose every operation fails like a locked database.
pub struct FailingStore;

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(Error::Storage("database is locked".to_string()))
    }

    async fn put(&self, _key: &str, _value: &str) -> Result<()> {
        Err(Error::Storage("database is locked".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Err(Error::Storage("database is locked".to_string()))
    }

    async fn scan_prefix(&self, _prefix: &str) -> Result<Vec<(String, String)>> {
        Err(Error::Storage("database is locked".to_string()))
    }
}
