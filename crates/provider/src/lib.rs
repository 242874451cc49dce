//! Resilient generation over a shared key pool.
//!
//! [`classify`] turns raw provider failures into a [`FailureKind`](rendergate_types::FailureKind),
//! [`policy`] holds the backoff table, [`retry`] runs operations against
//! leased keys, and [`GeminiProvider`] performs the actual calls.
//! [`GenerationClient`] ties them together; [`build_client`] assembles one
//! from a configuration snapshot and [`build_live_client`] from a reloadable
//! one.

pub mod classify;
pub mod client;
pub mod gemini;
pub mod http_util;
pub mod policy;
pub mod retry;

pub use classify::{RawError, classify, classify_raw, classify_value, sanitize};
pub use client::GenerationClient;
pub use gemini::GeminiProvider;
pub use http_util::ProviderHttp;
pub use policy::{BackoffRule, Counters, RetryPolicy};
pub use retry::RetryOrchestrator;

use rendergate_config::{Config, SharedConfig};
use rendergate_types::{ApiKey, JobReporter, KeyPool};
use rquest::Client;
use std::sync::Arc;

/// Assembles a [`GenerationClient`] backed by the Gemini provider.
///
/// The retry table comes from `config.retry`; the fallback key, if any, from
/// `config.pool.fallback_key`.
pub fn build_client(
    config: &Config,
    pool: Arc<dyn KeyPool>,
    reporter: Option<Arc<dyn JobReporter>>,
    http: Client,
) -> GenerationClient {
    let orchestrator = RetryOrchestrator::new(pool, RetryPolicy::from(&config.retry));
    assemble(orchestrator, config, reporter, http)
}

/// Like [`build_client`], but the retry table follows reloads of `shared`.
///
/// Provider settings and the fallback key are taken from the configuration
/// current at call time.
pub fn build_live_client(
    shared: SharedConfig,
    pool: Arc<dyn KeyPool>,
    reporter: Option<Arc<dyn JobReporter>>,
    http: Client,
) -> GenerationClient {
    let config = shared.load_full();
    let orchestrator = RetryOrchestrator::live(pool, shared);
    assemble(orchestrator, &config, reporter, http)
}

fn assemble(
    mut orchestrator: RetryOrchestrator,
    config: &Config,
    reporter: Option<Arc<dyn JobReporter>>,
    http: Client,
) -> GenerationClient {
    if let Some(reporter) = reporter {
        orchestrator = orchestrator.with_reporter(reporter);
    }
    let provider = Arc::new(GeminiProvider::new(http, config.provider.clone()));
    let client = GenerationClient::new(orchestrator, provider);
    match &config.pool.fallback_key {
        Some(key) if !key.trim().is_empty() => client.with_fallback_key(ApiKey::new(key.trim())),
        _ => client,
    }
}
