//! Remote catalog source.
//!
//! The sync engine only sees the [`CatalogRemote`] trait; [`HttpCatalogRemote`]
//! talks to the catalog API over HTTPS.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::models::{
    CatalogDiff, CatalogSnapshot, Category, CategoryId, ImageTarget, MarketSegment, Subcategory,
    UserIdentity,
};
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// Aggregate counts reported alongside a full fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogMeta {
    pub total_categories: usize,
    pub total_subcategories: usize,
}

/// Result of a full catalog fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FullCatalog {
    pub snapshot: CatalogSnapshot,
    pub meta: Option<CatalogMeta>,
}

/// Parameters of an incremental diff request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRequest {
    /// Watermark minus the safety skew
    pub since: DateTime<Utc>,
    /// Identity forwarded for server-side personalization
    pub user: Option<UserIdentity>,
}

/// Result of an incremental diff fetch
#[derive(Debug, Clone, PartialEq)]
pub struct DiffResponse {
    pub diff: CatalogDiff,
    pub has_updates: bool,
    pub new_watermark: DateTime<Utc>,
}

/// A freshly signed image URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    pub expires_in: Option<Duration>,
}

/// Endpoints the sync engine consumes.
#[async_trait]
pub trait CatalogRemote: Send + Sync {
    /// Fetch the complete catalog for one segment.
    async fn fetch_full(&self, segment: MarketSegment) -> Result<FullCatalog>;

    /// Fetch changes since a watermark.
    async fn fetch_diff(&self, segment: MarketSegment, request: &DiffRequest)
        -> Result<DiffResponse>;

    /// Sign a new URL for one entity's image.
    async fn refresh_image_url(&self, target: ImageTarget) -> Result<SignedUrl>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FullCatalogPayload {
    #[serde(default)]
    categories: Vec<Category>,
    #[serde(default)]
    meta: Option<CatalogMeta>,
    #[serde(default)]
    stats: Option<serde_json::Value>,
}

impl From<FullCatalogPayload> for FullCatalog {
    fn from(payload: FullCatalogPayload) -> Self {
        Self {
            snapshot: CatalogSnapshot {
                categories: payload.categories,
                stats: payload.stats,
            },
            meta: payload.meta,
        }
    }
}

/// Deletion marker: either a bare id or `{ "id": 3, "deleted": true }`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Tombstone {
    Id(i64),
    Marked {
        id: i64,
        #[serde(default = "default_deleted")]
        deleted: bool,
    },
}

const fn default_deleted() -> bool {
    true
}

impl Tombstone {
    const fn deleted_id(&self) -> Option<i64> {
        match *self {
            Self::Id(id) | Self::Marked { id, deleted: true } => Some(id),
            Self::Marked { deleted: false, .. } => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeletedPayload {
    #[serde(default)]
    categories: Vec<Tombstone>,
    #[serde(default)]
    subcategories: Vec<Tombstone>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiffPayload {
    #[serde(default)]
    upserted_categories: Vec<Category>,
    #[serde(default)]
    upserted_subcategories: Vec<Subcategory>,
    #[serde(default)]
    deleted: DeletedPayload,
    #[serde(default)]
    has_updates: Option<bool>,
    #[serde(default)]
    new_watermark: Option<DateTime<Utc>>,
}

impl TryFrom<DiffPayload> for DiffResponse {
    type Error = Error;

    fn try_from(payload: DiffPayload) -> Result<Self> {
        let new_watermark = payload.new_watermark.ok_or_else(|| {
            Error::MalformedResponse("diff response did not include newWatermark".to_string())
        })?;

        let diff = CatalogDiff {
            upserted_categories: payload.upserted_categories,
            upserted_subcategories: payload.upserted_subcategories,
            deleted_categories: payload
                .deleted
                .categories
                .iter()
                .filter_map(Tombstone::deleted_id)
                .collect(),
            deleted_subcategories: payload
                .deleted
                .subcategories
                .iter()
                .filter_map(Tombstone::deleted_id)
                .collect(),
        };
        let has_updates = payload.has_updates.unwrap_or_else(|| !diff.is_empty());

        Ok(Self {
            diff,
            has_updates,
            new_watermark,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageUrlRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    category_id: Option<CategoryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subcategory_id: Option<i64>,
}

impl From<ImageTarget> for ImageUrlRequest {
    fn from(target: ImageTarget) -> Self {
        match target {
            ImageTarget::Category(id) => Self {
                category_id: Some(id),
                subcategory_id: None,
            },
            ImageTarget::Subcategory(id) => Self {
                category_id: None,
                subcategory_id: Some(id),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageUrlResponse {
    image_url: Option<String>,
    #[serde(default)]
    expires_in_seconds: Option<u64>,
}

impl TryFrom<ImageUrlResponse> for SignedUrl {
    type Error = Error;

    fn try_from(value: ImageUrlResponse) -> Result<Self> {
        let url = normalize_text_option(value.image_url)
            .filter(|url| is_http_url(url))
            .ok_or_else(|| {
                Error::MalformedResponse("response did not include a valid imageUrl".to_string())
            })?;
        Ok(Self {
            url,
            expires_in: value.expires_in_seconds.map(Duration::from_secs),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// HTTPS client for the catalog API.
#[derive(Debug, Clone)]
pub struct HttpCatalogRemote {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpCatalogRemote {
    /// Builds a client for an explicit API base URL.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| Error::InvalidInput(format!("Failed to construct HTTP client: {error}")))?;
        Ok(Self { base_url, client })
    }

    /// Returns the base URL this client was configured with.
    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{path}", self.base_url()))
            .map_err(|error| Error::InvalidInput(format!("Invalid endpoint {path}: {error}")))
    }

    async fn send_json<T>(&self, request: reqwest::RequestBuilder) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|error| {
            Error::MalformedResponse(format!(
                "{error} in {}",
                compact_text(&body)
            ))
        })
    }
}

#[async_trait]
impl CatalogRemote for HttpCatalogRemote {
    async fn fetch_full(&self, segment: MarketSegment) -> Result<FullCatalog> {
        let mut url = self.endpoint("/v1/catalog")?;
        url.query_pairs_mut().append_pair("segment", segment.as_str());

        tracing::debug!(%segment, "Fetching full catalog");
        let payload: FullCatalogPayload = self.send_json(self.client.get(url)).await?;
        Ok(payload.into())
    }

    async fn fetch_diff(
        &self,
        segment: MarketSegment,
        request: &DiffRequest,
    ) -> Result<DiffResponse> {
        let mut url = self.endpoint("/v1/catalog/changes")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("segment", segment.as_str())
                .append_pair("since", &request.since.to_rfc3339());
            if let Some(user) = &request.user {
                query.append_pair("userId", &user.id);
                if let Some(role) = &user.role {
                    query.append_pair("userRole", role);
                }
            }
        }

        tracing::debug!(%segment, since = %request.since, "Fetching catalog diff");
        let payload: DiffPayload = self.send_json(self.client.get(url)).await?;
        payload.try_into()
    }

    async fn refresh_image_url(&self, target: ImageTarget) -> Result<SignedUrl> {
        let url = self.endpoint("/v1/catalog/image-url")?;
        let body = ImageUrlRequest::from(target);

        tracing::debug!(%target, "Requesting signed image URL");
        let payload: ImageUrlResponse = self.send_json(self.client.post(url).json(&body)).await?;
        payload.try_into()
    }
}

fn map_transport_error(error: reqwest::Error) -> Error {
    if error.is_decode() {
        Error::MalformedResponse(error.to_string())
    } else {
        Error::TransientNetwork(error.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &str) -> Error {
    let message = parse_api_error(status, body);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Error::TransientNetwork(message)
    } else {
        Error::Api(message)
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{trimmed} ({})", status.as_u16())
    }
}

fn normalize_base_url(raw: &str) -> Result<Url> {
    let trimmed = normalize_text_option(Some(raw.to_string()))
        .ok_or_else(|| Error::InvalidInput("API base URL must not be empty".to_string()))?;
    if !is_http_url(&trimmed) {
        return Err(Error::InvalidInput(
            "API base URL must include http:// or https://".to_string(),
        ));
    }
    Url::parse(trimmed.trim_end_matches('/'))
        .map_err(|error| Error::InvalidInput(format!("Invalid API base URL: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url("").is_err());
        assert!(normalize_base_url("api.example.com").is_err());
        let client =
            HttpCatalogRemote::new("https://api.example.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "https://api.example.com");
    }

    #[test]
    fn diff_payload_accepts_both_tombstone_shapes() {
        let payload: DiffPayload = serde_json::from_str(
            r#"{
                "upsertedCategories": [],
                "upsertedSubcategories": [],
                "deleted": {
                    "categories": [2, { "id": 3, "deleted": true }, { "id": 4, "deleted": false }],
                    "subcategories": [{ "id": 10 }]
                },
                "hasUpdates": true,
                "newWatermark": "2024-05-01T00:00:00Z"
            }"#,
        )
        .unwrap();

        let response = DiffResponse::try_from(payload).unwrap();
        assert_eq!(response.diff.deleted_categories, vec![2, 3]);
        assert_eq!(response.diff.deleted_subcategories, vec![10]);
        assert!(response.has_updates);
    }

    #[test]
    fn diff_payload_without_watermark_is_malformed() {
        let payload: DiffPayload = serde_json::from_str(r#"{ "hasUpdates": false }"#).unwrap();
        assert!(matches!(
            DiffResponse::try_from(payload),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn has_updates_defaults_to_diff_contents() {
        let payload: DiffPayload =
            serde_json::from_str(r#"{ "newWatermark": "2024-05-01T00:00:00Z" }"#).unwrap();
        assert!(!DiffResponse::try_from(payload).unwrap().has_updates);
    }

    #[test]
    fn image_request_carries_exactly_one_id() {
        let body = serde_json::to_value(ImageUrlRequest::from(ImageTarget::Subcategory(9))).unwrap();
        assert_eq!(body, serde_json::json!({ "subcategoryId": 9 }));
    }

    #[test]
    fn image_response_requires_http_url() {
        let missing = ImageUrlResponse {
            image_url: Some("  ".to_string()),
            expires_in_seconds: None,
        };
        assert!(SignedUrl::try_from(missing).is_err());

        let signed = SignedUrl::try_from(ImageUrlResponse {
            image_url: Some("https://cdn.example.com/a.png?Expires=1".to_string()),
            expires_in_seconds: Some(600),
        })
        .unwrap();
        assert_eq!(signed.expires_in, Some(Duration::from_secs(600)));
    }

    #[test]
    fn status_mapping_separates_transient_from_api_errors() {
        assert!(matches!(
            map_status_error(StatusCode::SERVICE_UNAVAILABLE, ""),
            Error::TransientNetwork(_)
        ));
        assert!(matches!(
            map_status_error(StatusCode::TOO_MANY_REQUESTS, ""),
            Error::TransientNetwork(_)
        ));
        assert_eq!(
            map_status_error(StatusCode::UNAUTHORIZED, r#"{"message":"expired session"}"#),
            Error::Api("expired session (401)".to_string())
        );
    }
}
