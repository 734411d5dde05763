//! Runtime configuration for the catalog sync engine.
//!
//! Provides a `CatalogConfig` struct with defaults suitable for mobile
//! clients, loadable from a JSON payload and overridable from `CATALOG_*`
//! environment variables.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

const ENV_API_BASE_URL: &str = "CATALOG_API_BASE_URL";
const ENV_CACHE_VALIDITY_DAYS: &str = "CATALOG_CACHE_VALIDITY_DAYS";
const ENV_WATERMARK_SKEW_SECS: &str = "CATALOG_WATERMARK_SKEW_SECS";
const ENV_IMAGE_LOOKAHEAD_SECS: &str = "CATALOG_IMAGE_LOOKAHEAD_SECS";
const ENV_FETCH_TIMEOUT_SECS: &str = "CATALOG_FETCH_TIMEOUT_SECS";
const ENV_FOCUS_REFRESH_INTERVAL_SECS: &str = "CATALOG_FOCUS_REFRESH_INTERVAL_SECS";
const ENV_DEFAULT_MAX_RETRIES: &str = "CATALOG_DEFAULT_MAX_RETRIES";

const DEFAULT_CACHE_VALIDITY_DAYS: u32 = 365;
const DEFAULT_WATERMARK_SKEW_SECS: u64 = 5;
const DEFAULT_IMAGE_LOOKAHEAD_SECS: u64 = 300;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;
const DEFAULT_FOCUS_REFRESH_INTERVAL_SECS: u64 = 300;
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Largest second count `chrono::Duration` accepts.
const MAX_DELTA_SECS: i64 = i64::MAX / 1_000;

/// Tunables for cache validity, diff requests, image refresh and the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct CatalogConfig {
    /// Base URL of the catalog API (e.g. `https://api.example.com`).
    pub api_base_url: Option<String>,
    /// How long a cache record stays usable after it was written.
    pub cache_validity_days: u32,
    /// Subtracted from the watermark when requesting a diff.
    pub watermark_skew_secs: u64,
    /// Signed URLs expiring within this window are refreshed proactively.
    pub image_lookahead_secs: u64,
    /// Upper bound for a single remote fetch.
    pub fetch_timeout_secs: u64,
    /// Focus/mount triggers skip the network when checked more recently.
    pub focus_refresh_interval_secs: u64,
    /// Retry budget for mutations enqueued without an explicit one.
    pub default_max_retries: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            cache_validity_days: DEFAULT_CACHE_VALIDITY_DAYS,
            watermark_skew_secs: DEFAULT_WATERMARK_SKEW_SECS,
            image_lookahead_secs: DEFAULT_IMAGE_LOOKAHEAD_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            focus_refresh_interval_secs: DEFAULT_FOCUS_REFRESH_INTERVAL_SECS,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl CatalogConfig {
    /// Load configuration from environment variables on top of defaults.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from a key lookup (environment, bundled settings, ...).
    ///
    /// Unset or blank keys keep the current value; unparseable values are errors.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = normalize_text_option(lookup(ENV_API_BASE_URL)) {
            self.api_base_url = Some(url);
        }
        if let Some(value) = parse_override(&lookup, ENV_CACHE_VALIDITY_DAYS)? {
            self.cache_validity_days = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_WATERMARK_SKEW_SECS)? {
            self.watermark_skew_secs = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_IMAGE_LOOKAHEAD_SECS)? {
            self.image_lookahead_secs = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_FETCH_TIMEOUT_SECS)? {
            self.fetch_timeout_secs = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_FOCUS_REFRESH_INTERVAL_SECS)? {
            self.focus_refresh_interval_secs = value;
        }
        if let Some(value) = parse_override(&lookup, ENV_DEFAULT_MAX_RETRIES)? {
            self.default_max_retries = value;
        }
        self.validate()
    }

    /// Check value ranges and normalize the API base URL.
    pub fn validate(mut self) -> Result<Self> {
        if self.cache_validity_days == 0 {
            return Err(Error::InvalidInput(
                "cache_validity_days must be greater than zero".to_string(),
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "fetch_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(url) = normalize_text_option(self.api_base_url.take()) {
            if !is_http_url(&url) {
                return Err(Error::InvalidInput(
                    "api_base_url must include http:// or https://".to_string(),
                ));
            }
            self.api_base_url = Some(url.trim_end_matches('/').to_string());
        }
        Ok(self)
    }

    pub fn cache_validity(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cache_validity_days))
    }

    pub fn watermark_skew(&self) -> chrono::Duration {
        seconds(self.watermark_skew_secs)
    }

    pub fn image_lookahead(&self) -> chrono::Duration {
        seconds(self.image_lookahead_secs)
    }

    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub const fn focus_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.focus_refresh_interval_secs)
    }
}

fn seconds(value: u64) -> chrono::Duration {
    let value = i64::try_from(value).unwrap_or(MAX_DELTA_SECS);
    chrono::Duration::seconds(value.min(MAX_DELTA_SECS))
}

/// Parse a configuration payload from raw JSON.
///
/// Missing fields fall back to defaults; unknown fields are rejected.
pub fn parse_catalog_config(payload: &str) -> Result<CatalogConfig> {
    let config: CatalogConfig = serde_json::from_str(payload)
        .map_err(|error| Error::InvalidInput(format!("invalid catalog config JSON: {error}")))?;
    config.validate()
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = normalize_text_option(lookup(key)) else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|_| Error::InvalidInput(format!("{key} has an invalid value: {raw}")))
}
