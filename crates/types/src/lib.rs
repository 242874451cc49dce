//! Core types and traits for the rendergate workspace.
//!
//! This crate defines the shared abstractions used across all layers of the
//! resilient generation client: the error taxonomy, credential keys, request
//! and result shapes, and the async capability traits for the key pool, the
//! job status sink and the generation provider.

pub mod error;
pub mod failure;
pub mod key;
pub mod request;
pub mod traits;

pub use error::GenError;
pub use failure::{FailureKind, FailureRecord, UserFacingError};
pub use key::{ApiKey, JobRef};
pub use request::{
    AspectRatio, ImageRequest, InlineImage, ResolutionTier, TextRequest, VideoRequest,
};
pub use traits::{GenerationProvider, JobReporter, KeyPool};
