//! Per-user storage scopes

use std::fmt;

use serde::{Deserialize, Serialize};

use super::catalog::MarketSegment;
use crate::util::{normalize_text_option, sanitize_key_segment};

const ANONYMOUS_BUCKET: &str = "anonymous";

/// Authenticated identity as seen by the sync engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub role: Option<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = normalize_text_option(Some(role.into()));
        self
    }
}

/// Storage bucket derived from the signed-in user, or the anonymous bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserKey(String);

impl UserKey {
    #[must_use]
    pub fn anonymous() -> Self {
        Self(ANONYMOUS_BUCKET.to_string())
    }

    /// Derive the key for an identity; blank ids fall back to anonymous.
    #[must_use]
    pub fn for_identity(identity: Option<&UserIdentity>) -> Self {
        identity
            .and_then(|identity| normalize_text_option(Some(identity.id.clone())))
            .map_or_else(Self::anonymous, |id| {
                Self(format!("user-{}", sanitize_key_segment(&id)))
            })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS_BUCKET
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unit of caching and single-flight: one user browsing one segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheScope {
    pub user: UserKey,
    pub segment: MarketSegment,
}

impl CacheScope {
    #[must_use]
    pub const fn new(user: UserKey, segment: MarketSegment) -> Self {
        Self { user, segment }
    }

    #[must_use]
    pub fn anonymous(segment: MarketSegment) -> Self {
        Self::new(UserKey::anonymous(), segment)
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_identity_maps_to_anonymous() {
        assert!(UserKey::for_identity(None).is_anonymous());
        assert!(UserKey::for_identity(Some(&UserIdentity::new("   "))).is_anonymous());
    }

    #[test]
    fn identity_key_is_sanitized() {
        let key = UserKey::for_identity(Some(&UserIdentity::new(" ab/../c ")));
        assert_eq!(key.as_str(), "user-ab_2F_2E_2E_2Fc");
    }

    #[test]
    fn similar_ids_do_not_share_a_bucket() {
        let dotted = UserKey::for_identity(Some(&UserIdentity::new("john.doe")));
        let underscored = UserKey::for_identity(Some(&UserIdentity::new("john_doe")));
        assert_ne!(dotted, underscored);
        assert_eq!(dotted.as_str(), "user-john_2Edoe");
        assert_eq!(underscored.as_str(), "user-john_5Fdoe");
    }

    #[test]
    fn different_users_get_different_scopes() {
        let alice = CacheScope::new(
            UserKey::for_identity(Some(&UserIdentity::new("alice"))),
            MarketSegment::Household,
        );
        let bob = CacheScope::new(
            UserKey::for_identity(Some(&UserIdentity::new("bob"))),
            MarketSegment::Household,
        );
        assert_ne!(alice, bob);
        assert_eq!(alice.to_string(), "user-alice/household");
    }

    #[test]
    fn blank_role_is_dropped() {
        assert_eq!(UserIdentity::new("a").with_role("  ").role, None);
        assert_eq!(
            UserIdentity::new("a").with_role("agent").role.as_deref(),
            Some("agent")
        );
    }
}
