//! Configuration loading and hot-reloading for rendergate.
//!
//! Uses figment for YAML-based configuration with sensible defaults and
//! `RENDERGATE_` environment overrides, and notify + arc-swap for live file
//! watching.

pub mod schema;
pub mod watcher;

pub use schema::{
    ApiKeyEntry, BackoffRuleConfig, Config, Growth, LogConfig, LogFormat, PoolConfig,
    ProviderSettings, RetryConfig,
};
pub use watcher::{ConfigWatcher, SharedConfig};
