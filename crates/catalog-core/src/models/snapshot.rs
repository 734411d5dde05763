//! Catalog snapshot and cache record models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::catalog::{Category, CategoryId, ImageTarget, Subcategory, SubcategoryId};

/// The complete catalog at a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    pub categories: Vec<Category>,
    /// Optional usage statistics delivered with the last full fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

impl CatalogSnapshot {
    #[must_use]
    pub const fn new(categories: Vec<Category>) -> Self {
        Self {
            categories,
            stats: None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    #[must_use]
    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    #[must_use]
    pub fn subcategory_count(&self) -> usize {
        self.categories
            .iter()
            .map(|category| category.subcategories.len())
            .sum()
    }

    #[must_use]
    pub fn category(&self, id: CategoryId) -> Option<&Category> {
        self.categories.iter().find(|category| category.id == id)
    }

    /// Find a subcategory wherever it lives.
    #[must_use]
    pub fn subcategory(&self, id: SubcategoryId) -> Option<&Subcategory> {
        self.categories
            .iter()
            .find_map(|category| category.subcategory(id))
    }

    /// Current image reference of one entity.
    #[must_use]
    pub fn image_url(&self, target: ImageTarget) -> Option<&str> {
        match target {
            ImageTarget::Category(id) => self.category(id)?.image_url.as_deref(),
            ImageTarget::Subcategory(id) => self.subcategory(id)?.image_url.as_deref(),
        }
    }

    /// Every image reference in presentation order.
    #[must_use]
    pub fn images(&self) -> Vec<(ImageTarget, &str)> {
        let mut images = Vec::new();
        for category in &self.categories {
            if let Some(url) = category.image_url.as_deref() {
                images.push((ImageTarget::Category(category.id), url));
            }
            for sub in &category.subcategories {
                if let Some(url) = sub.image_url.as_deref() {
                    images.push((ImageTarget::Subcategory(sub.id), url));
                }
            }
        }
        images
    }

    /// Replace one entity's image reference. Returns `false` when the entity
    /// is not part of the snapshot.
    pub fn set_image_url(&mut self, target: ImageTarget, url: String) -> bool {
        match target {
            ImageTarget::Category(id) => self
                .categories
                .iter_mut()
                .find(|category| category.id == id)
                .map(|category| category.image_url = Some(url))
                .is_some(),
            ImageTarget::Subcategory(id) => self
                .categories
                .iter_mut()
                .flat_map(|category| category.subcategories.iter_mut())
                .find(|sub| sub.id == id)
                .map(|sub| sub.image_url = Some(url))
                .is_some(),
        }
    }
}

/// Persisted snapshot plus its timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub snapshot: CatalogSnapshot,
    /// When this device last wrote the record
    pub cached_at: DateTime<Utc>,
    /// Last server-acknowledged update time
    pub sync_watermark: DateTime<Utc>,
}

impl CacheRecord {
    #[must_use]
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.cached_at
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>, validity: chrono::Duration) -> bool {
        self.age_at(now) > validity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn images_and_patching() {
        let mut snapshot = CatalogSnapshot::new(vec![category(1, "Paper")
            .with_image("https://cdn.example.com/paper.png")
            .with_subs(vec![subcategory(10, 1, "Cardboard")
                .with_image("https://cdn.example.com/cardboard.png")])]);

        assert_eq!(snapshot.images().len(), 2);
        assert!(snapshot.set_image_url(
            ImageTarget::Subcategory(10),
            "https://cdn.example.com/new.png".to_string()
        ));
        assert_eq!(
            snapshot.image_url(ImageTarget::Subcategory(10)),
            Some("https://cdn.example.com/new.png")
        );
        assert!(!snapshot.set_image_url(ImageTarget::Category(99), String::new()));
    }

    #[test]
    fn record_expiry_uses_cached_at() {
        let cached_at = Utc::now() - chrono::Duration::days(366);
        let record = CacheRecord {
            snapshot: CatalogSnapshot::default(),
            cached_at,
            sync_watermark: cached_at,
        };
        assert!(record.is_expired_at(Utc::now(), chrono::Duration::days(365)));
        assert!(!record.is_expired_at(cached_at, chrono::Duration::days(365)));
    }
}
