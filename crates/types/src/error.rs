//! Unified error type for the rendergate workspace.

use serde_json::Value;
use thiserror::Error;

/// Enumerates all error kinds that can occur across rendergate crates.
///
/// Provider failures keep their raw shape (status, body, nested JSON) so the
/// failure classifier can inspect them. Nothing here is safe to show to an
/// end user as-is; see [`crate::UserFacingError`].
#[derive(Debug, Error)]
pub enum GenError {
    /// The upstream provider returned a non-success status.
    #[error("upstream error: status={status}, body={body}")]
    Upstream { status: u16, body: String },

    /// A structured provider error object (`{"code": .., "message": ..}`),
    /// e.g. the `error` member of a long-running operation.
    #[error("api error: {message}")]
    Api { error: Value, message: String },

    /// An error that only carries text, such as one relayed by an SDK or a
    /// gateway that flattened the original response into a message.
    #[error("{0}")]
    Message(String),

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(String),

    /// No credential key could be leased from the pool.
    #[error("no API key available in the pool")]
    PoolExhausted,

    /// The provider answered 2xx but the payload had nothing usable in it.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Base64 or media decoding failure.
    #[error("decode error: {0}")]
    Decode(String),

    /// Persistent storage (`SQLite`) error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration loading or validation error.
    #[error("configuration error: {0}")]
    Config(String),
}

// ── Feature-gated From impls ──────────────────────────────────────────────────

#[cfg(feature = "rquest")]
impl From<rquest::Error> for GenError {
    fn from(e: rquest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for GenError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl GenError {
    /// Returns the HTTP status carried directly by the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, GenError>;
