//! Image URL freshness.
//!
//! Catalog images are served through time-limited signed URLs. This module
//! reads the expiry encoded in such a URL, classifies it against a lookahead
//! window, and refreshes individual images without touching the rest of the
//! cached snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use url::Url;

use crate::cache::CacheRecordStore;
use crate::error::Result;
use crate::events::CatalogEvent;
use crate::merge::strip_sync_token;
use crate::models::{CacheScope, ImageTarget};
use crate::remote::{CatalogRemote, SignedUrl};

const EXPLICIT_EXPIRY_KEYS: [&str; 4] = ["Expires", "expires", "se", "exp"];
const SIGNED_PAIRS: [(&str, &str); 2] = [
    ("X-Amz-Date", "X-Amz-Expires"),
    ("X-Goog-Date", "X-Goog-Expires"),
];
const COMPACT_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Values above this are treated as milliseconds since the epoch.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Freshness of one signed URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "until", rename_all = "snake_case")]
pub enum UrlFreshness {
    Valid(DateTime<Utc>),
    /// Expires within the lookahead window
    ExpiringSoon(DateTime<Utc>),
    Expired,
    /// No recognizable expiry; treated as long-lived
    Unparseable,
}

impl UrlFreshness {
    pub const fn needs_refresh(self) -> bool {
        matches!(self, Self::ExpiringSoon(_) | Self::Expired)
    }
}

/// Read the expiry encoded in a signed URL's query string.
pub fn parse_expiry(url: &str) -> Option<DateTime<Utc>> {
    let url = Url::parse(strip_sync_token(url)).ok()?;
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

    for key in EXPLICIT_EXPIRY_KEYS {
        if let Some(expiry) = query_value(&pairs, key).and_then(parse_timestamp) {
            return Some(expiry);
        }
    }

    SIGNED_PAIRS.iter().find_map(|(date_key, expires_key)| {
        let issued = parse_timestamp(query_value(&pairs, date_key)?)?;
        let seconds: i64 = query_value(&pairs, expires_key)?.trim().parse().ok()?;
        issued.checked_add_signed(chrono::Duration::try_seconds(seconds)?)
    })
}

/// Exact key match first, then ASCII case-insensitive.
fn query_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(name, _)| name == key)
        .or_else(|| pairs.iter().find(|(name, _)| name.eq_ignore_ascii_case(key)))
        .map(|(_, value)| value.as_str())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<i64>() {
        return if value > MILLIS_THRESHOLD {
            DateTime::from_timestamp_millis(value)
        } else {
            DateTime::from_timestamp(value, 0)
        };
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, COMPACT_DATE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Classify a URL against `now` and a lookahead window.
pub fn classify(url: &str, now: DateTime<Utc>, lookahead: chrono::Duration) -> UrlFreshness {
    classify_expiry(parse_expiry(url), now, lookahead)
}

fn classify_expiry(
    expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lookahead: chrono::Duration,
) -> UrlFreshness {
    match expiry {
        None => UrlFreshness::Unparseable,
        Some(until) if until <= now => UrlFreshness::Expired,
        Some(until) if until - now <= lookahead => UrlFreshness::ExpiringSoon(until),
        Some(until) => UrlFreshness::Valid(until),
    }
}

/// One classified image of a cached snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    pub target: ImageTarget,
    pub url: String,
    pub freshness: UrlFreshness,
}

/// Result of one point refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRefresh {
    Refreshed(String),
    /// Another refresh for the same entity is running
    AlreadyInFlight,
    /// The entity is not part of the cached snapshot
    NotCached,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleRefreshReport {
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

type FlightKey = (CacheScope, ImageTarget);

struct CheckerInner {
    store: CacheRecordStore,
    remote: Arc<dyn CatalogRemote>,
    events: broadcast::Sender<CatalogEvent>,
    lookahead: chrono::Duration,
    in_flight: Mutex<HashSet<FlightKey>>,
    /// Server-reported expiry of refreshed URLs whose query carries none
    issued: Mutex<HashMap<FlightKey, IssuedUrl>>,
}

struct IssuedUrl {
    url: String,
    expires_at: DateTime<Utc>,
}

/// Removes its key from the in-flight set when the refresh ends, even if the
/// refreshing future is dropped.
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<FlightKey>>,
    key: FlightKey,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Deduplicated point refreshes of signed image URLs.
#[derive(Clone)]
pub struct ImageFreshnessChecker {
    inner: Arc<CheckerInner>,
}

impl ImageFreshnessChecker {
    pub fn new(
        store: CacheRecordStore,
        remote: Arc<dyn CatalogRemote>,
        events: broadcast::Sender<CatalogEvent>,
        lookahead: chrono::Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CheckerInner {
                store,
                remote,
                events,
                lookahead,
                in_flight: Mutex::new(HashSet::new()),
                issued: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn classify(&self, url: &str) -> UrlFreshness {
        classify(url, Utc::now(), self.inner.lookahead)
    }

    /// Classify every image of the cached snapshot.
    pub async fn scan(&self, scope: &CacheScope) -> Result<Vec<ImageStatus>> {
        let Some(record) = self.inner.store.read(scope).await? else {
            return Ok(Vec::new());
        };
        let now = Utc::now();
        let issued = self
            .inner
            .issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(record
            .snapshot
            .images()
            .into_iter()
            .map(|(target, url)| {
                let expiry = parse_expiry(url).or_else(|| {
                    issued
                        .get(&(scope.clone(), target))
                        .filter(|known| strip_sync_token(&known.url) == strip_sync_token(url))
                        .map(|known| known.expires_at)
                });
                ImageStatus {
                    target,
                    url: url.to_string(),
                    freshness: classify_expiry(expiry, now, self.inner.lookahead),
                }
            })
            .collect())
    }

    /// Point-refresh every image that is expired or about to expire.
    pub async fn refresh_stale(&self, scope: &CacheScope) -> Result<StaleRefreshReport> {
        let stale: Vec<ImageTarget> = self
            .scan(scope)
            .await?
            .into_iter()
            .filter(|status| status.freshness.needs_refresh())
            .map(|status| status.target)
            .collect();

        let results = futures::future::join_all(
            stale
                .iter()
                .map(|target| self.refresh_entity(scope, *target)),
        )
        .await;

        let mut report = StaleRefreshReport::default();
        for (target, result) in stale.iter().zip(results) {
            match result {
                Ok(ImageRefresh::Refreshed(_)) => report.refreshed += 1,
                Ok(ImageRefresh::AlreadyInFlight | ImageRefresh::NotCached) => report.skipped += 1,
                Err(error) if error.is_remote_failure() => {
                    tracing::warn!(scope = %scope, %target, "Image refresh failed: {error}");
                    report.failed += 1;
                }
                Err(error) => return Err(error),
            }
        }

        if !stale.is_empty() {
            tracing::debug!(scope = %scope, ?report, "Stale image refresh finished");
        }
        Ok(report)
    }

    /// Fetch a new signed URL for one entity and patch only that image.
    pub async fn refresh_entity(
        &self,
        scope: &CacheScope,
        target: ImageTarget,
    ) -> Result<ImageRefresh> {
        let key = (scope.clone(), target);
        let inserted = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        if !inserted {
            tracing::debug!(scope = %scope, %target, "Image refresh already in flight");
            return Ok(ImageRefresh::AlreadyInFlight);
        }
        let _guard = FlightGuard {
            in_flight: &self.inner.in_flight,
            key: key.clone(),
        };

        let signed = self.inner.remote.refresh_image_url(target).await?;
        let patched = self
            .inner
            .store
            .patch_image(scope, target, signed.url.clone())
            .await?;
        if !patched {
            return Ok(ImageRefresh::NotCached);
        }
        self.remember_expiry(key, &signed);

        let _ = self.inner.events.send(CatalogEvent::ImageRefreshed {
            scope: scope.clone(),
            target,
        });
        Ok(ImageRefresh::Refreshed(signed.url))
    }

    /// Keep the server-reported lifetime for URLs that do not encode one.
    fn remember_expiry(&self, key: FlightKey, signed: &SignedUrl) {
        let expires_at = signed
            .expires_in
            .filter(|_| parse_expiry(&signed.url).is_none())
            .and_then(|lifetime| chrono::Duration::from_std(lifetime).ok())
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));
        let mut issued = self
            .inner
            .issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match expires_at {
            Some(expires_at) => {
                issued.insert(
                    key,
                    IssuedUrl {
                        url: signed.url.clone(),
                        expires_at,
                    },
                );
            }
            None => {
                issued.remove(&key);
            }
        }
    }

    /// Reactive path for an image that failed to load.
    pub async fn report_load_failure(
        &self,
        scope: &CacheScope,
        target: ImageTarget,
    ) -> Result<ImageRefresh> {
        tracing::info!(scope = %scope, %target, "Image failed to load, refreshing URL");
        self.refresh_entity(scope, target).await
    }

    /// Run [`Self::refresh_stale`] every `interval` until the handle is aborted.
    pub fn spawn_watch(&self, scope: CacheScope, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = this.refresh_stale(&scope).await {
                    tracing::warn!(scope = %scope, "Periodic image refresh failed: {error}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{CatalogSnapshot, MarketSegment};
    use crate::store::MemoryKeyValueStore;
    use crate::test_support::*;
    use pretty_assertions::assert_eq;

    fn lookahead() -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn expiring_at(path: &str, at: DateTime<Utc>) -> String {
        format!("https://cdn.example.com/{path}?Expires={}", at.timestamp())
    }

    #[test]
    fn explicit_expiry_is_classified_against_lookahead() {
        let now = ts(1_700_000_000);
        assert_eq!(
            classify(&expiring_at("a.png", ts(1_700_003_600)), now, lookahead()),
            UrlFreshness::Valid(ts(1_700_003_600))
        );
        assert_eq!(
            classify(&expiring_at("a.png", ts(1_700_000_120)), now, lookahead()),
            UrlFreshness::ExpiringSoon(ts(1_700_000_120))
        );
        assert_eq!(
            classify(&expiring_at("a.png", ts(1_699_999_000)), now, lookahead()),
            UrlFreshness::Expired
        );
        assert_eq!(
            classify("https://cdn.example.com/a.png", now, lookahead()),
            UrlFreshness::Unparseable
        );
        assert_eq!(classify("not a url", now, lookahead()), UrlFreshness::Unparseable);
    }

    #[test]
    fn issue_time_plus_duration_pairs() {
        let amz = "https://bucket.s3.amazonaws.com/a.png?X-Amz-Algorithm=AWS4-HMAC-SHA256\
                   &X-Amz-Date=20240501T120000Z&X-Amz-Expires=3600&X-Amz-Signature=abc";
        assert_eq!(
            parse_expiry(amz),
            Some(DateTime::parse_from_rfc3339("2024-05-01T13:00:00Z").unwrap().with_timezone(&Utc))
        );

        let goog = "https://storage.googleapis.com/b/a.png?X-Goog-Date=20240501T120000Z&X-Goog-Expires=600";
        assert_eq!(
            parse_expiry(goog),
            Some(DateTime::parse_from_rfc3339("2024-05-01T12:10:00Z").unwrap().with_timezone(&Utc))
        );
    }

    #[test]
    fn sas_and_jwt_style_keys() {
        let sas = "https://acct.blob.core.windows.net/c/a.png?sv=2022&se=2024-05-01T00:00:00Z&sig=x";
        assert_eq!(
            parse_expiry(sas),
            Some(DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z").unwrap().with_timezone(&Utc))
        );
        assert_eq!(
            parse_expiry("https://img.example.com/a.png?exp=1700000000000"),
            Some(ts(1_700_000_000))
        );
    }

    #[test]
    fn sync_token_does_not_affect_parsing() {
        let url = format!("{}#sync=123", expiring_at("a.png", ts(1_700_000_000)));
        assert_eq!(parse_expiry(&url), Some(ts(1_700_000_000)));
    }

    async fn checker_with(
        remote: FakeRemote,
        snapshot: CatalogSnapshot,
    ) -> (ImageFreshnessChecker, Arc<FakeRemote>, CacheRecordStore) {
        let remote = Arc::new(remote);
        let store = CacheRecordStore::new(
            Arc::new(MemoryKeyValueStore::new()),
            chrono::Duration::days(365),
        );
        store.write(&scope(), snapshot, ts(1_000)).await.unwrap();
        let (events, _) = broadcast::channel(16);
        let checker = ImageFreshnessChecker::new(store.clone(), remote.clone(), events, lookahead());
        (checker, remote, store)
    }

    fn scope() -> CacheScope {
        CacheScope::anonymous(MarketSegment::Business)
    }

    fn mixed_snapshot() -> CatalogSnapshot {
        let now = Utc::now();
        CatalogSnapshot::new(vec![
            category(1, "Paper")
                .with_image(&expiring_at("paper.png", now + chrono::Duration::hours(2)))
                .with_subs(vec![subcategory(10, 1, "Cardboard")
                    .with_image(&expiring_at("cardboard.png", now - chrono::Duration::minutes(1)))]),
            category(2, "Metal").with_image(&expiring_at("metal.png", now + chrono::Duration::minutes(2))),
        ])
    }

    fn fresh_url() -> String {
        expiring_at("fresh.png", Utc::now() + chrono::Duration::hours(1))
    }

    #[tokio::test]
    async fn refresh_entity_patches_only_that_image() {
        let remote = FakeRemote::new(CatalogSnapshot::default());
        remote.set_image(Ok(SignedUrl {
            url: fresh_url(),
            expires_in: Some(Duration::from_secs(3600)),
        }));
        let (checker, _, store) = checker_with(remote, mixed_snapshot()).await;
        let mut events = checker.inner.events.subscribe();
        let before = store.read(&scope()).await.unwrap().unwrap();

        let result = checker
            .refresh_entity(&scope(), ImageTarget::Subcategory(10))
            .await
            .unwrap();

        let ImageRefresh::Refreshed(url) = result else {
            panic!("expected refresh, got {result:?}");
        };
        let after = store.read(&scope()).await.unwrap().unwrap();
        let mut expected = before.snapshot.clone();
        expected.set_image_url(ImageTarget::Subcategory(10), url);
        assert_eq!(after.snapshot, expected);
        assert_eq!(after.sync_watermark, before.sync_watermark);
        assert_eq!(
            events.try_recv().unwrap(),
            CatalogEvent::ImageRefreshed {
                scope: scope(),
                target: ImageTarget::Subcategory(10)
            }
        );
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_entity_fetch_once() {
        let (remote, gate) = FakeRemote::gated(CatalogSnapshot::default());
        remote.set_image(Ok(SignedUrl {
            url: fresh_url(),
            expires_in: None,
        }));
        let (checker, remote, _) = checker_with(remote, mixed_snapshot()).await;

        let opener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.add_permits(10);
        });
        let scope = scope();
        let (first, second) = tokio::join!(
            checker.refresh_entity(&scope, ImageTarget::Category(2)),
            checker.report_load_failure(&scope, ImageTarget::Category(2)),
        );
        opener.await.unwrap();

        assert!(matches!(first.unwrap(), ImageRefresh::Refreshed(_)));
        assert_eq!(second.unwrap(), ImageRefresh::AlreadyInFlight);
        assert_eq!(remote.image_calls(), 1);

        // The flight is over, so a new request goes through again.
        checker
            .refresh_entity(&scope, ImageTarget::Category(2))
            .await
            .unwrap();
        assert_eq!(remote.image_calls(), 2);
    }

    #[tokio::test]
    async fn server_lifetime_applies_to_urls_without_expiry() {
        let remote = FakeRemote::new(CatalogSnapshot::default());
        remote.set_image(Ok(SignedUrl {
            url: "https://cdn.example.com/metal.png?sig=abc".to_string(),
            expires_in: Some(Duration::from_secs(60)),
        }));
        let (checker, _, _) = checker_with(remote, mixed_snapshot()).await;

        checker
            .refresh_entity(&scope(), ImageTarget::Category(2))
            .await
            .unwrap();

        let statuses = checker.scan(&scope()).await.unwrap();
        let metal = statuses
            .iter()
            .find(|status| status.target == ImageTarget::Category(2))
            .unwrap();
        assert!(matches!(metal.freshness, UrlFreshness::ExpiringSoon(_)));
        assert!(metal.freshness.needs_refresh());
        assert_eq!(
            classify(&metal.url, Utc::now(), lookahead()),
            UrlFreshness::Unparseable
        );
    }

    #[tokio::test]
    async fn server_lifetime_is_ignored_once_url_changes() {
        let remote = FakeRemote::new(CatalogSnapshot::default());
        remote.set_image(Ok(SignedUrl {
            url: "https://cdn.example.com/metal.png?sig=abc".to_string(),
            expires_in: Some(Duration::from_secs(60)),
        }));
        let (checker, _, store) = checker_with(remote, mixed_snapshot()).await;
        checker
            .refresh_entity(&scope(), ImageTarget::Category(2))
            .await
            .unwrap();

        store
            .patch_image(
                &scope(),
                ImageTarget::Category(2),
                "https://cdn.example.com/metal.png?sig=def".to_string(),
            )
            .await
            .unwrap();

        let statuses = checker.scan(&scope()).await.unwrap();
        let metal = statuses
            .iter()
            .find(|status| status.target == ImageTarget::Category(2))
            .unwrap();
        assert_eq!(metal.freshness, UrlFreshness::Unparseable);
    }

    #[tokio::test]
    async fn refresh_stale_only_touches_expiring_images() {
        let remote = FakeRemote::new(CatalogSnapshot::default());
        remote.set_image(Ok(SignedUrl {
            url: fresh_url(),
            expires_in: None,
        }));
        let (checker, remote, _) = checker_with(remote, mixed_snapshot()).await;

        let report = checker.refresh_stale(&scope()).await.unwrap();

        assert_eq!(report.refreshed, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(remote.image_calls(), 2);
        let statuses = checker.scan(&scope()).await.unwrap();
        assert!(statuses.iter().all(|status| !status.freshness.needs_refresh()));
    }

    #[tokio::test]
    async fn remote_failures_are_counted_not_raised() {
        let remote = FakeRemote::new(CatalogSnapshot::default());
        remote.set_image(Err(Error::TransientNetwork("offline".into())));
        let (checker, _, _) = checker_with(remote, mixed_snapshot()).await;

        let report = checker.refresh_stale(&scope()).await.unwrap();
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn unknown_entity_is_not_cached() {
        let remote = FakeRemote::new(CatalogSnapshot::default());
        remote.set_image(Ok(SignedUrl {
            url: fresh_url(),
            expires_in: None,
        }));
        let (checker, _, _) = checker_with(remote, mixed_snapshot()).await;

        assert_eq!(
            checker
                .refresh_entity(&scope(), ImageTarget::Category(404))
                .await
                .unwrap(),
            ImageRefresh::NotCached
        );
    }
}
