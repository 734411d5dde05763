//! Incremental diff model

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::catalog::{Category, CategoryId, Subcategory, SubcategoryId};

/// Server-computed upserts and deletions since a watermark
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogDiff {
    #[serde(default)]
    pub upserted_categories: Vec<Category>,
    #[serde(default)]
    pub upserted_subcategories: Vec<Subcategory>,
    #[serde(default)]
    pub deleted_categories: Vec<CategoryId>,
    #[serde(default)]
    pub deleted_subcategories: Vec<SubcategoryId>,
}

impl CatalogDiff {
    /// True when the diff carries neither upserts nor deletions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserted_categories.is_empty()
            && self.upserted_subcategories.is_empty()
            && self.deleted_categories.is_empty()
            && self.deleted_subcategories.is_empty()
    }

    #[must_use]
    pub fn deleted_category_set(&self) -> HashSet<CategoryId> {
        self.deleted_categories.iter().copied().collect()
    }

    #[must_use]
    pub fn deleted_subcategory_set(&self) -> HashSet<SubcategoryId> {
        self.deleted_subcategories.iter().copied().collect()
    }

    #[must_use]
    pub fn upsert_category(mut self, category: Category) -> Self {
        self.upserted_categories.push(category);
        self
    }

    #[must_use]
    pub fn upsert_subcategory(mut self, subcategory: Subcategory) -> Self {
        self.upserted_subcategories.push(subcategory);
        self
    }

    #[must_use]
    pub fn delete_category(mut self, id: CategoryId) -> Self {
        self.deleted_categories.push(id);
        self
    }

    #[must_use]
    pub fn delete_subcategory(mut self, id: SubcategoryId) -> Self {
        self.deleted_subcategories.push(id);
        self
    }
}
