//! Backoff calculation for the branch worker's push retry loop.
//!
//! `BackoffConfig::branch_worker_default()` matches the pipeline's specified
//! policy: base delay 1s, factor 2, cap 30s, jitter ±25%. Other constructors
//! exist for components with different retry needs (e.g. a future rule
//! reconciler backoff), but the branch worker's cadence is load-bearing and
//! covered by the defaults here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Multiplier applied to the delay on each subsequent attempt.
    pub factor: f64,
    /// Upper bound on the computed delay, before jitter.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter fraction (0.25 means the delay is randomized within ±25%).
    pub jitter: f64,
    /// Maximum number of attempts before the caller gives up.
    pub max_attempts: u32,
}

impl BackoffConfig {
    /// Branch Worker push retry policy: base 1s, factor 2, cap 30s, jitter
    /// ±25%.
    pub fn branch_worker_default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
            max_attempts: 8,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::branch_worker_default()
    }
}

/// Compute the delay before retry attempt `attempt` (1-indexed), without
/// jitter. Exposed separately from [`calculate_delay`] so tests can assert
/// the deterministic curve before jitter is layered on.
pub fn base_delay_for_attempt(config: &BackoffConfig, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(32);
    let multiplier = config.factor.powi(pow as i32);
    let millis = (config.base_delay.as_millis() as f64 * multiplier).min(u64::MAX as f64);
    Duration::from_millis(millis as u64).min(config.max_delay)
}

/// Compute the jittered delay before retry attempt `attempt` (1-indexed).
pub fn calculate_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let capped = base_delay_for_attempt(config, attempt);
    if config.jitter <= 0.0 {
        return capped;
    }
    apply_jitter(capped, config.jitter)
}

/// Randomize `delay` within `delay * (1 - jitter)..=delay * (1 + jitter)`.
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let jitter_range = 2.0 * jitter;
    let mut rng = rand::rng();
    let random_value: f64 = rng.random();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).max(0.0).round() as u64;
    Duration::from_millis(millis)
}

/// Classification of a failure, used to decide whether a retry loop should
/// continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the computed backoff delay.
    Retry,
    /// Stop retrying; the caller should surface the failure as fatal.
    Fatal,
    /// Retry budget exhausted; the caller should surface the failure as fatal.
    BudgetExhausted,
}

/// Decide whether attempt `attempt` (the one that just failed) should be
/// retried, given whether the failure was itself classified as retryable.
pub fn decide(config: &BackoffConfig, attempt: u32, retryable: bool) -> RetryDecision {
    if !retryable {
        return RetryDecision::Fatal;
    }
    if attempt >= config.max_attempts {
        return RetryDecision::BudgetExhausted;
    }
    RetryDecision::Retry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_each_attempt() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
            max_attempts: 8,
        };

        assert_eq!(base_delay_for_attempt(&config, 1), Duration::from_secs(1));
        assert_eq!(base_delay_for_attempt(&config, 2), Duration::from_secs(2));
        assert_eq!(base_delay_for_attempt(&config, 3), Duration::from_secs(4));
        assert_eq!(base_delay_for_attempt(&config, 4), Duration::from_secs(8));
    }

    #[test]
    fn base_delay_caps_at_max() {
        let config = BackoffConfig::branch_worker_default();
        assert_eq!(base_delay_for_attempt(&config, 10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_twenty_five_percent() {
        let config = BackoffConfig::branch_worker_default();
        for _ in 0..200 {
            let delay = calculate_delay(&config, 4);
            let base = base_delay_for_attempt(&config, 4);
            let lower = base.mul_f64(0.75);
            let upper = base.mul_f64(1.25);
            assert!(delay >= lower && delay <= upper, "{delay:?} not within [{lower:?}, {upper:?}]");
        }
    }

    #[test]
    fn decide_is_fatal_for_unretryable_errors() {
        let config = BackoffConfig::branch_worker_default();
        assert_eq!(decide(&config, 1, false), RetryDecision::Fatal);
    }

    #[test]
    fn decide_exhausts_budget_at_max_attempts() {
        let config = BackoffConfig::branch_worker_default();
        assert_eq!(decide(&config, 8, true), RetryDecision::BudgetExhausted);
        assert_eq!(decide(&config, 7, true), RetryDecision::Retry);
    }

    proptest::proptest! {
        #[test]
        fn delay_never_exceeds_capped_jitter_bound(attempt in 1u32..20) {
            let config = BackoffConfig::branch_worker_default();
            let delay = calculate_delay(&config, attempt);
            let base = base_delay_for_attempt(&config, attempt);
            proptest::prop_assert!(delay <= base.mul_f64(1.25) + Duration::from_millis(1));
        }
    }
}
