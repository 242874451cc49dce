//! Retry policy table — one backoff rule per retried failure kind.
//!
//! Delays are data, not branches: each rule says which counter it grows with,
//! how fast, where it stops, and whether it resets the quota streak.

use rand::Rng as _;
use rendergate_config::{BackoffRuleConfig, Growth, RetryConfig};
use rendergate_types::FailureKind;
use std::time::Duration;

/// Counters an orchestrator invocation carries between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    /// Attempts made so far, pool waits included.
    pub attempts: u32,
    /// Quota failures since the last overload/transient reset.
    pub consecutive_quota: u32,
}

/// How long to wait after one failure class.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffRule {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub jitter: Duration,
    pub growth: Growth,
    pub resets_quota: bool,
}

impl BackoffRule {
    /// A constant delay.
    #[must_use]
    pub fn flat(delay: Duration, resets_quota: bool) -> Self {
        Self {
            base: delay,
            factor: 1.0,
            cap: delay,
            jitter: Duration::ZERO,
            growth: Growth::Flat,
            resets_quota,
        }
    }

    /// Computes the delay for `counters` with a jitter sample in `[0, 1]`.
    ///
    /// `min(base * factor^n + jitter * sample, cap)` where `n` is the counter
    /// selected by [`BackoffRule::growth`].
    #[must_use]
    pub fn delay(&self, counters: Counters, jitter_sample: f64) -> Duration {
        let exponent = match self.growth {
            Growth::Consecutive => counters.consecutive_quota,
            Growth::Attempts => counters.attempts,
            Growth::Flat => 0,
        };
        let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
        let grown = self.base.as_secs_f64() * self.factor.powi(exponent);
        let jitter = self.jitter.as_secs_f64() * jitter_sample.clamp(0.0, 1.0);
        let secs = (grown + jitter).min(self.cap.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.cap)
    }

    /// [`BackoffRule::delay`] with a fresh random jitter sample.
    #[must_use]
    pub fn sample(&self, counters: Counters) -> Duration {
        let sample = if self.jitter.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen_range(0.0..=1.0)
        };
        self.delay(counters, sample)
    }
}

impl From<&BackoffRuleConfig> for BackoffRule {
    fn from(c: &BackoffRuleConfig) -> Self {
        Self {
            base: Duration::from_millis(c.base_ms),
            factor: c.factor,
            cap: Duration::from_millis(c.cap_ms),
            jitter: Duration::from_millis(c.jitter_ms),
            growth: c.growth,
            resets_quota: c.resets_quota,
        }
    }
}

/// The full policy table plus the attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wall-clock bound checked before every retry sleep.
    pub deadline: Option<Duration>,
    pub quota: BackoffRule,
    pub overload: BackoffRule,
    pub transient: BackoffRule,
    pub pool_exhausted: BackoffRule,
}

impl RetryPolicy {
    /// The rule for a retried kind; `None` for kinds that are never retried.
    #[must_use]
    pub fn rule(&self, kind: FailureKind) -> Option<&BackoffRule> {
        match kind {
            FailureKind::QuotaExceeded => Some(&self.quota),
            FailureKind::ServiceOverloaded => Some(&self.overload),
            FailureKind::Transient => Some(&self.transient),
            FailureKind::PoolExhausted => Some(&self.pool_exhausted),
            FailureKind::BillingRejected | FailureKind::Other => None,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Same table with every jitter removed. Useful where delays must be exact.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        for rule in [
            &mut self.quota,
            &mut self.overload,
            &mut self.transient,
            &mut self.pool_exhausted,
        ] {
            rule.jitter = Duration::ZERO;
        }
        self
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts,
            deadline: c.deadline_secs.map(Duration::from_secs),
            quota: BackoffRule::from(&c.quota),
            overload: BackoffRule::from(&c.overload),
            transient: BackoffRule::from(&c.transient),
            pool_exhausted: BackoffRule::from(&c.pool_exhausted),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn quota(n: u32) -> Counters {
        Counters {
            attempts: 0,
            consecutive_quota: n,
        }
    }

    fn attempts(n: u32) -> Counters {
        Counters {
            attempts: n,
            consecutive_quota: 0,
        }
    }

    #[test]
    fn test_default_table_values() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 15);
        assert_eq!(p.deadline, None);
        assert_eq!(p.quota.base, ms(2_000));
        assert_eq!(p.quota.cap, ms(20_000));
        assert_eq!(p.quota.jitter, ms(1_000));
        assert_eq!(p.overload.cap, ms(15_000));
        assert_eq!(p.transient, BackoffRule::flat(ms(1_000), true));
        assert_eq!(p.pool_exhausted, BackoffRule::flat(ms(3_000), false));
    }

    #[test]
    fn test_quota_delay_grows_with_consecutive_failures() {
        let rule = RetryPolicy::default().quota;
        assert_eq!(rule.delay(quota(1), 0.0), ms(3_000));
        assert_eq!(rule.delay(quota(2), 0.0), ms(4_500));
        assert_eq!(rule.delay(quota(3), 0.0), ms(6_750));
        // attempts do not move the quota rule
        assert_eq!(
            rule.delay(
                Counters {
                    attempts: 9,
                    consecutive_quota: 1
                },
                0.0
            ),
            ms(3_000)
        );
    }

    #[test]
    fn test_quota_delay_monotonic_and_capped() {
        let rule = RetryPolicy::default().quota;
        let mut prev = Duration::ZERO;
        for n in 1..40 {
            let d = rule.delay(quota(n), 1.0);
            assert!(d >= prev, "delay shrank at n={n}");
            assert!(d <= ms(20_000));
            prev = d;
        }
        assert_eq!(prev, ms(20_000));
    }

    #[test]
    fn test_quota_jitter_bounded() {
        let rule = RetryPolicy::default().quota;
        for _ in 0..100 {
            let d = rule.sample(quota(1));
            assert!(d >= ms(3_000) && d <= ms(4_000), "{d:?}");
        }
    }

    #[test]
    fn test_overload_delay_grows_with_attempts_and_caps() {
        let rule = RetryPolicy::default().overload;
        assert_eq!(rule.delay(attempts(0), 0.5), ms(2_000));
        assert_eq!(rule.delay(attempts(1), 0.5), ms(3_000));
        let mut prev = Duration::ZERO;
        for n in 0..30 {
            let d = rule.sample(attempts(n));
            assert!(d >= prev);
            prev = d;
        }
        assert_eq!(prev, ms(15_000));
    }

    #[test]
    fn test_flat_rules_ignore_counters() {
        let p = RetryPolicy::default();
        let busy = Counters {
            attempts: 7,
            consecutive_quota: 5,
        };
        assert_eq!(p.transient.sample(busy), ms(1_000));
        assert_eq!(p.pool_exhausted.sample(busy), ms(3_000));
    }

    #[test]
    fn test_huge_exponent_saturates_at_cap() {
        let rule = RetryPolicy::default().quota;
        assert_eq!(rule.delay(quota(u32::MAX), 0.0), ms(20_000));
    }

    #[test]
    fn test_rule_lookup() {
        let p = RetryPolicy::default();
        assert!(p.rule(FailureKind::BillingRejected).is_none());
        assert!(p.rule(FailureKind::Other).is_none());
        assert_eq!(p.rule(FailureKind::QuotaExceeded), Some(&p.quota));
        assert_eq!(p.rule(FailureKind::PoolExhausted), Some(&p.pool_exhausted));
    }

    #[test]
    fn test_reset_flags() {
        let p = RetryPolicy::default();
        assert!(p.overload.resets_quota);
        assert!(p.transient.resets_quota);
        assert!(!p.pool_exhausted.resets_quota);
        assert!(!p.quota.resets_quota);
    }

    #[test]
    fn test_from_config_overrides() {
        let mut c = RetryConfig::default();
        c.max_attempts = 3;
        c.deadline_secs = Some(30);
        c.quota.base_ms = 100;
        let p = RetryPolicy::from(&c);
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.deadline, Some(Duration::from_secs(30)));
        assert_eq!(p.quota.base, ms(100));
    }

    #[test]
    fn test_without_jitter() {
        let p = RetryPolicy::default().without_jitter();
        assert_eq!(p.quota.jitter, Duration::ZERO);
        assert_eq!(p.quota.sample(quota(1)), ms(3_000));
    }
}
