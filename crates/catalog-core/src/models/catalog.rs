//! Category and subcategory models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Server-assigned category identifier
pub type CategoryId = i64;

/// Server-assigned subcategory identifier
pub type SubcategoryId = i64;

/// Market segment a catalog is browsed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketSegment {
    /// Private households
    Household,
    /// Business customers
    Business,
}

impl MarketSegment {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Household => "household",
            Self::Business => "business",
        }
    }
}

impl fmt::Display for MarketSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketSegment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "household" => Ok(Self::Household),
            "business" => Ok(Self::Business),
            other => Err(Error::InvalidInput(format!("unknown market segment: {other}"))),
        }
    }
}

/// Per-segment availability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub household: bool,
    pub business: bool,
}

impl Availability {
    #[must_use]
    pub const fn allows(self, segment: MarketSegment) -> bool {
        match segment {
            MarketSegment::Household => self.household,
            MarketSegment::Business => self.business,
        }
    }
}

impl Default for Availability {
    fn default() -> Self {
        Self {
            household: true,
            business: true,
        }
    }
}

/// A subcategory with its default unit price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subcategory {
    pub id: SubcategoryId,
    pub name: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub unit_price: f64,
    pub price_unit: String,
    /// Owning category (back-reference)
    pub category_id: CategoryId,
    #[serde(default)]
    pub availability: Availability,
    pub updated_at: DateTime<Utc>,
}

/// A category embedding its current subcategories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub availability: Availability,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub subcategories: Vec<Subcategory>,
    /// Derived; always equals `subcategories.len()` inside a snapshot
    #[serde(default)]
    pub subcategory_count: usize,
}

impl Category {
    /// Recompute the derived subcategory count.
    pub fn recount(&mut self) {
        self.subcategory_count = self.subcategories.len();
    }

    #[must_use]
    pub fn subcategory(&self, id: SubcategoryId) -> Option<&Subcategory> {
        self.subcategories.iter().find(|sub| sub.id == id)
    }

    #[must_use]
    pub const fn is_available_in(&self, segment: MarketSegment) -> bool {
        self.availability.allows(segment)
    }
}

/// Entity whose image can be refreshed individually
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageTarget {
    Category(CategoryId),
    Subcategory(SubcategoryId),
}

impl fmt::Display for ImageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Category(id) => write!(f, "category:{id}"),
            Self::Subcategory(id) => write!(f, "subcategory:{id}"),
        }
    }
}
