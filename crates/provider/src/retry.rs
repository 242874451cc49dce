//! Retry orchestrator — runs an operation against leased pool keys until it
//! succeeds, fails for a reason retrying cannot fix, or runs out of attempts.
//!
//! Each invocation is a sequential state machine owning its own
//! [`AttemptState`]; nothing is shared between concurrent invocations except
//! the [`KeyPool`]. Every lease is treated as possibly stale: a key that
//! already failed with a quota error during this invocation is re-marked and
//! skipped without calling the provider.
//!
//! The policy table is read once at the start of each invocation, so an
//! orchestrator built with [`RetryOrchestrator::live`] follows config reloads.

use crate::classify::{classify, sanitize};
use crate::policy::{Counters, RetryPolicy};
use rendergate_config::SharedConfig;
use rendergate_types::{
    ApiKey, FailureKind, FailureRecord, GenError, JobRef, JobReporter, KeyPool, UserFacingError,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Per-invocation bookkeeping. Dropped when `execute` returns.
struct AttemptState {
    attempts_made: u32,
    consecutive_quota: u32,
    tried: HashSet<ApiKey>,
    last: Option<(FailureRecord, GenError)>,
    started: Instant,
}

impl AttemptState {
    fn new() -> Self {
        Self {
            attempts_made: 0,
            consecutive_quota: 0,
            tried: HashSet::new(),
            last: None,
            started: Instant::now(),
        }
    }

    fn counters(&self) -> Counters {
        Counters {
            attempts: self.attempts_made,
            consecutive_quota: self.consecutive_quota,
        }
    }
}

/// Where an invocation gets its policy table from.
#[derive(Clone)]
enum PolicySource {
    Fixed(Arc<RetryPolicy>),
    Live(SharedConfig),
}

/// Leases keys, runs operations and applies the [`RetryPolicy`] table.
#[derive(Clone)]
pub struct RetryOrchestrator {
    pool: Arc<dyn KeyPool>,
    reporter: Option<Arc<dyn JobReporter>>,
    policy: PolicySource,
}

impl RetryOrchestrator {
    /// Creates an orchestrator drawing from `pool` with a fixed policy.
    pub fn new(pool: Arc<dyn KeyPool>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            reporter: None,
            policy: PolicySource::Fixed(Arc::new(policy)),
        }
    }

    /// Creates an orchestrator that rebuilds its policy from `config.retry`
    /// at the start of every invocation.
    pub fn live(pool: Arc<dyn KeyPool>, config: SharedConfig) -> Self {
        Self {
            pool,
            reporter: None,
            policy: PolicySource::Live(config),
        }
    }

    /// Sets the sink notified of the key servicing each job attempt.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn JobReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// The policy the next invocation will run with.
    #[must_use]
    pub fn policy(&self) -> Arc<RetryPolicy> {
        match &self.policy {
            PolicySource::Fixed(policy) => Arc::clone(policy),
            PolicySource::Live(config) => Arc::new(RetryPolicy::from(&config.load().retry)),
        }
    }

    /// Runs `operation` with a freshly leased key per attempt.
    ///
    /// Returns the first success. `BillingRejected` and `Other` failures are
    /// returned after a single attempt; every other failure class backs off
    /// per the policy table until `max_attempts` is reached.
    ///
    /// # Errors
    ///
    /// Returns a [`UserFacingError`] with a sanitized message; the raw error
    /// of the last failure is attached as its source.
    pub async fn execute<T, F, Fut>(
        &self,
        job: Option<&JobRef>,
        mut operation: F,
    ) -> Result<T, UserFacingError>
    where
        F: FnMut(ApiKey) -> Fut,
        Fut: Future<Output = Result<T, GenError>>,
    {
        let policy = self.policy();
        let mut state = AttemptState::new();

        while state.attempts_made < policy.max_attempts {
            let Some(key) = self.lease().await else {
                let record = classify(&GenError::PoolExhausted);
                tracing::warn!(
                    attempt = state.attempts_made + 1,
                    "no API key available, waiting for the pool"
                );
                state.last = Some((record, GenError::PoolExhausted));
                Self::pause(&policy, &mut state, FailureKind::PoolExhausted).await?;
                continue;
            };

            if state.tried.contains(&key) {
                tracing::debug!(key = %key, "pool returned a key that already failed, skipping");
                self.mark_exhausted(&key).await;
                state.attempts_made += 1;
                continue;
            }

            if let Some(job) = job {
                self.report(job, &key).await;
            }

            let err = match operation(key.clone()).await {
                Ok(value) => {
                    if state.attempts_made > 0 {
                        tracing::info!(
                            key = %key,
                            attempts = state.attempts_made + 1,
                            "request succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let record = classify(&err);
            if !record.kind.is_retryable() {
                tracing::warn!(
                    key = %key,
                    kind = %record.kind,
                    status = ?record.raw_status,
                    "unretryable failure"
                );
                let attempts = state.attempts_made + 1;
                return Err(Self::terminal(&record, err, attempts));
            }
            if record.kind == FailureKind::QuotaExceeded {
                state.consecutive_quota += 1;
                self.mark_exhausted(&key).await;
                state.tried.insert(key.clone());
            }

            tracing::warn!(
                key = %key,
                kind = %record.kind,
                status = ?record.raw_status,
                attempt = state.attempts_made + 1,
                max_attempts = policy.max_attempts,
                "retryable failure"
            );
            let kind = record.kind;
            state.last = Some((record, err));
            Self::pause(&policy, &mut state, kind).await?;
        }

        Err(Self::exhausted(&mut state))
    }

    /// Leases a key; a pool error counts as an empty pool.
    async fn lease(&self) -> Option<ApiKey> {
        match self.pool.lease().await {
            Ok(Some(key)) => {
                tracing::debug!(key = %key, "leased key");
                Some(key)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "key lease failed");
                None
            }
        }
    }

    async fn mark_exhausted(&self, key: &ApiKey) {
        if let Err(e) = self.pool.mark_exhausted(key).await {
            tracing::warn!(key = %key, error = %e, "failed to mark key exhausted");
        }
    }

    pub(crate) async fn report(&self, job: &JobRef, key: &ApiKey) {
        let Some(reporter) = &self.reporter else {
            return;
        };
        match reporter.report_key_for_job(job, key).await {
            Ok(()) => tracing::debug!(job = %job, key = %key, "reported job key"),
            Err(e) => tracing::warn!(job = %job, key = %key, error = %e, "job key report failed"),
        }
    }

    /// Applies the rule for `kind`, sleeps, and counts the attempt.
    ///
    /// Fails early when the sleep would overrun the configured deadline.
    async fn pause(
        policy: &RetryPolicy,
        state: &mut AttemptState,
        kind: FailureKind,
    ) -> Result<(), UserFacingError> {
        let Some(rule) = policy.rule(kind) else {
            return Ok(());
        };
        if rule.resets_quota {
            state.consecutive_quota = 0;
        }
        let delay = rule.sample(state.counters());
        state.attempts_made += 1;

        if would_overrun(policy, state, delay) {
            tracing::warn!(
                attempts = state.attempts_made,
                delay_ms = duration_ms(delay),
                "retry deadline reached"
            );
            return Err(Self::exhausted(state));
        }
        if state.attempts_made < policy.max_attempts {
            tracing::debug!(kind = %kind, delay_ms = duration_ms(delay), "backing off");
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn terminal(record: &FailureRecord, raw: GenError, attempts: u32) -> UserFacingError {
        UserFacingError::new(record.kind, sanitize(record), attempts).with_raw(raw)
    }

    fn exhausted(state: &mut AttemptState) -> UserFacingError {
        let attempts = state.attempts_made;
        match state.last.take() {
            Some((record, raw)) => Self::terminal(&record, raw, attempts),
            None => {
                let record = classify(&GenError::PoolExhausted);
                Self::terminal(&record, GenError::PoolExhausted, attempts)
            }
        }
    }
}

fn would_overrun(policy: &RetryPolicy, state: &AttemptState, delay: Duration) -> bool {
    policy
        .deadline
        .is_some_and(|deadline| state.started.elapsed() + delay > deadline)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
