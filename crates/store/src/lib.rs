//! Key pool and job-report backends.
//!
//! Provides an in-memory pool for tests and single-process use, and a
//! SQLite-backed pool that many processes can share.

pub mod memory;
pub mod sqlite;

pub use memory::{InMemoryJobReporter, InMemoryKeyPool};
pub use sqlite::SqliteKeyPool;

use serde::Serialize;

/// Display-safe view of one pooled key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    /// Last four characters of the key, see [`rendergate_types::ApiKey::fingerprint`].
    pub fingerprint: String,
    pub label: Option<String>,
    /// Whether the key is currently cooling down.
    pub exhausted: bool,
    pub lease_count: u64,
}
