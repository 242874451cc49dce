//! Async traits shared across all rendergate crates.
//!
//! Every cross-crate abstraction is defined here so that higher layers depend
//! only on `rendergate-types`, not on each other.

use crate::{ApiKey, ImageRequest, JobRef, TextRequest, VideoRequest};
use async_trait::async_trait;

pub use crate::error::Result;

/// A shared, multi-tenant store of provider credentials.
///
/// Implementations must tolerate heavy concurrent use from many processes.
/// Selection and locking are the store's business; callers treat every lease
/// as non-exclusive and possibly stale.
#[async_trait]
pub trait KeyPool: Send + Sync {
    /// Lease a key that is not currently cooling down.
    ///
    /// Returns `Ok(None)` when every key is exhausted.
    async fn lease(&self) -> Result<Option<ApiKey>>;

    /// Put a key into cooldown. Idempotent.
    async fn mark_exhausted(&self, key: &ApiKey) -> Result<()>;
}

/// Receives the key that serviced a long-running job, for pool debugging.
#[async_trait]
pub trait JobReporter: Send + Sync {
    async fn report_key_for_job(&self, job: &JobRef, key: &ApiKey) -> Result<()>;
}

/// Issues exactly one provider call per invocation with the given key.
///
/// Implementations build the provider request and normalize the response.
/// They never retry and never interpret failures; raw errors are returned
/// for the orchestrator to classify.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Standard image edit/generate. Returns `data:` URIs.
    async fn generate_image(&self, key: &ApiKey, request: &ImageRequest) -> Result<Vec<String>>;

    /// High-resolution image generate. Returns `data:` URIs.
    async fn generate_hd_image(&self, key: &ApiKey, request: &ImageRequest)
    -> Result<Vec<String>>;

    /// Video generate. Returns the URI of the produced video.
    async fn generate_video(&self, key: &ApiKey, request: &VideoRequest) -> Result<String>;

    /// Text generate.
    async fn generate_text(&self, key: &ApiKey, request: &TextRequest) -> Result<String>;
}
