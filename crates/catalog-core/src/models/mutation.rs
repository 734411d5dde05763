//! Queued mutation model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A unique identifier for a queued mutation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(Uuid);

impl MutationId {
    /// Create a new unique mutation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MutationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A write deferred until it can be replayed against the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    /// Unique identifier
    pub id: MutationId,
    /// Processor lookup key (e.g. `update_price`)
    pub kind: String,
    /// Write arguments, opaque to the queue
    pub payload: serde_json::Value,
    /// Failed replay attempts so far
    pub attempt_count: u32,
    /// Retries allowed after the first failed attempt
    pub max_retries: u32,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Per-user creation order
    pub sequence: u64,
    /// Message of the most recent failure
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedMutation {
    /// Create a pending mutation
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        payload: serde_json::Value,
        max_retries: u32,
        sequence: u64,
    ) -> Self {
        Self {
            id: MutationId::new(),
            kind: kind.into(),
            payload,
            attempt_count: 0,
            max_retries,
            created_at: Utc::now(),
            sequence,
            last_error: None,
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(reason.into());
    }

    /// Whether the retry budget is used up.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempt_count > self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_id_parse() {
        let id = MutationId::new();
        let parsed: MutationId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn exhausted_after_budget_plus_one_failures() {
        let mut mutation = QueuedMutation::new("update_price", serde_json::json!({}), 2, 1);
        mutation.record_failure("timeout");
        mutation.record_failure("timeout");
        assert!(!mutation.is_exhausted());
        mutation.record_failure("timeout");
        assert!(mutation.is_exhausted());
        assert_eq!(mutation.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let mutation = QueuedMutation::new("update_price", serde_json::json!({"price": 50}), 3, 7);
        let value = serde_json::to_value(&mutation).unwrap();
        assert_eq!(value["attemptCount"], 0);
        assert_eq!(value["maxRetries"], 3);
        assert_eq!(value["sequence"], 7);
    }
}
