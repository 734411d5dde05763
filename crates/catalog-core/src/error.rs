//! Error types for catalog-core

use thiserror::Error;

use crate::models::MutationId;

/// Result type alias using catalog-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in catalog-core operations
///
/// Payloads are plain strings so a single failed fetch can be handed to every
/// caller joined on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Fetch failed because of connectivity or a timeout
    #[error("Network unavailable: {0}")]
    TransientNetwork(String),

    /// Server payload failed validation
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Persistent store read/write failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A queued mutation hit its retry ceiling
    #[error("Mutation {id} ({kind}) failed after {attempts} attempts: {reason}")]
    MutationExhausted {
        id: MutationId,
        kind: String,
        attempts: u32,
        reason: String,
    },

    /// Cold start without network: there is nothing to show
    #[error("No cached catalog available for {0}")]
    NoCacheAvailable(String),

    /// Remote API rejected the request
    #[error("Catalog API error: {0}")]
    Api(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether retrying the same operation later can succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::NoCacheAvailable(_))
    }

    /// Whether this failure came from the network layer and may be absorbed
    /// by falling back to cached data.
    pub const fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::MalformedResponse(_) | Self::Api(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(error: rusqlite::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}
