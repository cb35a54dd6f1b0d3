//! Stateless retry logic: attempt gate and backoff interval computation.
//!
//! Attempt numbering is 1-based (the first execution is attempt 1). The
//! interval returned by [`backoff_interval`] is the sleep *before* attempt
//! `attempt + 1`.

use std::time::Duration;

use oxflow_types::process::{BackoffKind, RetryPolicy};

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler -- all logic is in associated functions that take
/// the policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < policy.max_attempts
    }

    /// Backoff to sleep after a failed `attempt` (1-based), capped at
    /// `max_interval_ms` when set.
    ///
    /// - FIXED: `initial_interval`
    /// - LINEAR: `initial_interval * attempt`
    /// - EXPONENTIAL: `initial_interval * coefficient^(attempt - 1)`
    pub fn backoff_interval(policy: &RetryPolicy, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let initial = policy.initial_interval_ms as f64;

        let millis = match policy.backoff {
            BackoffKind::Fixed => initial,
            BackoffKind::Linear => initial * attempt as f64,
            BackoffKind::Exponential => {
                initial * policy.backoff_coefficient.powi(attempt as i32 - 1)
            }
        };

        let capped = match policy.max_interval_ms {
            Some(max) => millis.min(max as f64),
            None => millis,
        };
        // Guard against NaN / negative coefficients in hand-written policies.
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
