//! Failure taxonomy shared by the classifier, the orchestrator and callers.

use crate::GenError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The closed set of failure classes the retry orchestrator acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rate or usage limit hit for the key that was used (429-equivalent).
    QuotaExceeded,
    /// The key's account cannot be billed for this request (400 + billing wording).
    BillingRejected,
    /// The provider is out of capacity (503/500-equivalent).
    ServiceOverloaded,
    /// No key could be leased from the pool.
    PoolExhausted,
    /// No status could be extracted; network or unknown failure.
    Transient,
    /// A real status that matches nothing above; a caller or input error.
    Other,
}

impl FailureKind {
    /// Returns `true` if the orchestrator recovers from this kind locally.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded | Self::ServiceOverloaded | Self::PoolExhausted | Self::Transient
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuotaExceeded => write!(f, "quota_exceeded"),
            Self::BillingRejected => write!(f, "billing_rejected"),
            Self::ServiceOverloaded => write!(f, "service_overloaded"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Transient => write!(f, "transient"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// The classified view of one failed attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub kind: FailureKind,
    /// Status extracted structurally or inferred from the message text.
    pub raw_status: Option<u16>,
    /// The most specific message found (nested `error.message` when present).
    pub raw_message: String,
}

impl FailureRecord {
    #[must_use]
    pub fn new(kind: FailureKind, raw_status: Option<u16>, raw_message: impl Into<String>) -> Self {
        Self {
            kind,
            raw_status,
            raw_message: raw_message.into(),
        }
    }
}

/// A terminal, already-sanitized error handed back to callers.
///
/// `Display` only ever shows [`UserFacingError::message`]. The raw provider
/// error stays reachable through [`std::error::Error::source`] and
/// [`UserFacingError::into_raw`] so callers can decide on escalation without
/// rendering it.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct UserFacingError {
    pub kind: FailureKind,
    pub message: String,
    /// Attempts made before giving up (pool waits included).
    pub attempts: u32,
    #[source]
    pub raw: Option<GenError>,
}

impl UserFacingError {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts,
            raw: None,
        }
    }

    /// Attaches the raw error that caused this terminal failure.
    #[must_use]
    pub fn with_raw(mut self, raw: GenError) -> Self {
        self.raw = Some(raw);
        self
    }

    /// `true` when the failure is a billing rejection, i.e. a fallback trigger.
    #[must_use]
    pub fn is_billing(&self) -> bool {
        self.kind == FailureKind::BillingRejected
    }

    /// Consumes the error and returns the raw provider error, if recorded.
    #[must_use]
    pub fn into_raw(self) -> Option<GenError> {
        self.raw
    }
}
