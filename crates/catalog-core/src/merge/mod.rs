//! Diff merge engine.
//!
//! Pure functions that reconcile a cached [`CatalogSnapshot`] with an
//! incremental [`CatalogDiff`]. Nothing in here touches storage; the sync
//! orchestrator commits the result.
//!
//! Merge order:
//! 1. copy the cached categories into an id-indexed working set
//! 2. drop deleted categories
//! 3. apply category upserts (ids deleted in the same diff are skipped)
//! 4. drop deleted subcategories wherever they live
//! 5. apply subcategory upserts, routed by their owning category
//! 6. recompute subcategory counts
//! 7. sort categories by display name
//!
//! Applying the same diff twice yields the same snapshot as applying it once.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::models::{CatalogDiff, CatalogSnapshot, Category, CategoryId, Subcategory, SubcategoryId};

const SYNC_TOKEN_MARKER: &str = "#sync=";

/// Merge `diff` into `snapshot`, returning the new snapshot.
///
/// Callers are expected to [`validate`] the diff first.
pub fn merge(snapshot: &CatalogSnapshot, diff: &CatalogDiff) -> CatalogSnapshot {
    if diff.is_empty() {
        return snapshot.clone();
    }

    let deleted_categories = diff.deleted_category_set();
    let deleted_subcategories = diff.deleted_subcategory_set();

    let mut working: HashMap<CategoryId, Category> = snapshot
        .categories
        .iter()
        .map(|category| (category.id, category.clone()))
        .collect();

    working.retain(|id, _| !deleted_categories.contains(id));

    for upsert in &diff.upserted_categories {
        if deleted_categories.contains(&upsert.id) {
            continue;
        }
        apply_category_upsert(&mut working, upsert);
    }

    for category in working.values_mut() {
        category
            .subcategories
            .retain(|sub| !deleted_subcategories.contains(&sub.id));
    }

    for upsert in &diff.upserted_subcategories {
        if deleted_subcategories.contains(&upsert.id) {
            continue;
        }
        apply_subcategory_upsert(&mut working, upsert);
    }

    let mut categories: Vec<Category> = working.into_values().collect();
    for category in &mut categories {
        category.recount();
    }
    sort_categories(&mut categories);

    CatalogSnapshot {
        categories,
        stats: snapshot.stats.clone(),
    }
}

fn apply_category_upsert(working: &mut HashMap<CategoryId, Category>, upsert: &Category) {
    let embedded_ids: HashSet<SubcategoryId> =
        upsert.subcategories.iter().map(|sub| sub.id).collect();

    let mut previous_subs: HashMap<SubcategoryId, Subcategory> = HashMap::new();
    if !embedded_ids.is_empty() {
        for category in working.values_mut() {
            let (moved, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut category.subcategories)
                .into_iter()
                .partition(|sub| embedded_ids.contains(&sub.id));
            category.subcategories = kept;
            previous_subs.extend(moved.into_iter().map(|sub| (sub.id, sub)));
        }
    }

    let embedded = adopt_embedded(upsert, &previous_subs);

    match working.get_mut(&upsert.id) {
        Some(existing) => {
            existing.image_url = merge_image_url(
                existing.image_url.as_deref(),
                existing.updated_at,
                upsert.image_url.as_deref(),
                upsert.updated_at,
            );
            existing.name.clone_from(&upsert.name);
            existing.availability = upsert.availability;
            existing.updated_at = upsert.updated_at;
            if !embedded.is_empty() {
                existing.subcategories = embedded;
            }
        }
        None => {
            let mut inserted = upsert.clone();
            inserted.subcategories = embedded;
            working.insert(inserted.id, inserted);
        }
    }
}

/// Embedded subcategories with fixed back-references, deduplicated by id
/// (last entry wins) and with image tokens carried over from their
/// previous copies.
fn adopt_embedded(
    upsert: &Category,
    previous_subs: &HashMap<SubcategoryId, Subcategory>,
) -> Vec<Subcategory> {
    let mut adopted: Vec<Subcategory> = Vec::with_capacity(upsert.subcategories.len());
    for sub in &upsert.subcategories {
        let mut sub = sub.clone();
        sub.category_id = upsert.id;
        if let Some(previous) = previous_subs.get(&sub.id) {
            sub.image_url = merge_image_url(
                previous.image_url.as_deref(),
                previous.updated_at,
                sub.image_url.as_deref(),
                sub.updated_at,
            );
        }
        match adopted.iter_mut().find(|existing| existing.id == sub.id) {
            Some(slot) => *slot = sub,
            None => adopted.push(sub),
        }
    }
    adopted
}

fn apply_subcategory_upsert(working: &mut HashMap<CategoryId, Category>, upsert: &Subcategory) {
    let owner_id = upsert.category_id;

    if !working.contains_key(&owner_id) {
        for category in working.values_mut() {
            category.subcategories.retain(|sub| sub.id != upsert.id);
        }
        return;
    }

    let previous = working
        .values()
        .find_map(|category| category.subcategory(upsert.id))
        .cloned();

    let mut incoming = upsert.clone();
    if let Some(previous) = &previous {
        incoming.image_url = merge_image_url(
            previous.image_url.as_deref(),
            previous.updated_at,
            upsert.image_url.as_deref(),
            upsert.updated_at,
        );
    }

    for category in working.values_mut() {
        if category.id != owner_id {
            category.subcategories.retain(|sub| sub.id != upsert.id);
        }
    }

    if let Some(owner) = working.get_mut(&owner_id) {
        match owner
            .subcategories
            .iter_mut()
            .find(|sub| sub.id == upsert.id)
        {
            Some(slot) => *slot = incoming,
            None => owner.subcategories.push(incoming),
        }
    }
}

/// Resolve the image reference of an upserted entity.
///
/// A newer modification stamps a fresh sync token so stale cached bytes are
/// not reused. Otherwise an unchanged URL keeps the cached (tokened) form.
fn merge_image_url(
    cached: Option<&str>,
    cached_updated_at: DateTime<Utc>,
    incoming: Option<&str>,
    incoming_updated_at: DateTime<Utc>,
) -> Option<String> {
    let incoming = incoming?;

    if incoming_updated_at > cached_updated_at {
        return Some(with_sync_token(incoming, incoming_updated_at));
    }

    match cached {
        Some(cached) if strip_sync_token(cached) == strip_sync_token(incoming) => {
            Some(cached.to_string())
        }
        _ => Some(incoming.to_string()),
    }
}

/// Remove a `#sync=` token, if present.
pub fn strip_sync_token(url: &str) -> &str {
    url.find(SYNC_TOKEN_MARKER).map_or(url, |index| &url[..index])
}

/// Tag `url` with a sync token for `at`, replacing any previous token.
pub fn with_sync_token(url: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}{SYNC_TOKEN_MARKER}{}",
        strip_sync_token(url),
        at.timestamp_millis()
    )
}

fn sort_categories(categories: &mut [Category]) {
    categories.sort_by(|left, right| {
        left.name
            .to_lowercase()
            .cmp(&right.name.to_lowercase())
            .then(left.id.cmp(&right.id))
    });
}

/// Reject a diff that must not be merged.
pub fn validate(diff: &CatalogDiff) -> Result<()> {
    for category in &diff.upserted_categories {
        validate_category(category)?;
    }
    for sub in &diff.upserted_subcategories {
        validate_subcategory(sub)?;
    }
    if let Some(id) = diff
        .deleted_categories
        .iter()
        .chain(&diff.deleted_subcategories)
        .find(|id| **id <= 0)
    {
        return Err(Error::MalformedResponse(format!(
            "deletion references non-positive id {id}"
        )));
    }
    Ok(())
}

/// Reject a full snapshot that must not be cached.
pub fn validate_snapshot(snapshot: &CatalogSnapshot) -> Result<()> {
    snapshot.categories.iter().try_for_each(validate_category)
}

fn validate_category(category: &Category) -> Result<()> {
    if category.id <= 0 {
        return Err(Error::MalformedResponse(format!(
            "category has non-positive id {}",
            category.id
        )));
    }
    if category.name.trim().is_empty() {
        return Err(Error::MalformedResponse(format!(
            "category {} has an empty name",
            category.id
        )));
    }
    category
        .subcategories
        .iter()
        .try_for_each(validate_subcategory)
}

fn validate_subcategory(sub: &Subcategory) -> Result<()> {
    if sub.id <= 0 || sub.category_id <= 0 {
        return Err(Error::MalformedResponse(format!(
            "subcategory {} references non-positive ids",
            sub.id
        )));
    }
    if sub.name.trim().is_empty() {
        return Err(Error::MalformedResponse(format!(
            "subcategory {} has an empty name",
            sub.id
        )));
    }
    if !sub.unit_price.is_finite() || sub.unit_price < 0.0 {
        return Err(Error::MalformedResponse(format!(
            "subcategory {} has invalid unit price {}",
            sub.id, sub.unit_price
        )));
    }
    Ok(())
}

/// Apply snapshot invariants to a full-fetch payload.
///
/// Back-references follow the containing category, the first occurrence of
/// a duplicated id wins, counts are recomputed and categories are sorted.
pub fn normalize(snapshot: CatalogSnapshot) -> CatalogSnapshot {
    let mut seen_categories = HashSet::new();
    let mut seen_subcategories = HashSet::new();

    let mut categories: Vec<Category> = snapshot
        .categories
        .into_iter()
        .filter(|category| seen_categories.insert(category.id))
        .map(|mut category| {
            let owner = category.id;
            category.subcategories.retain(|sub| seen_subcategories.insert(sub.id));
            for sub in &mut category.subcategories {
                sub.category_id = owner;
            }
            category.recount();
            category
        })
        .collect();
    sort_categories(&mut categories);

    CatalogSnapshot {
        categories,
        stats: snapshot.stats,
    }
}
