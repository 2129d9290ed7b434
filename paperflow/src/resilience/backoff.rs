//! Exponential backoff delays with optional jitter.

use rand::Rng;
use std::time::Duration;

use crate::core::RetryPolicy;

/// Jitter perturbation applied to computed delays: ±20%.
const JITTER_FACTOR: f64 = 0.2;

/// Computes the un-jittered delay before retry number `retry_count`:
/// `min(base * exponent^retry_count, max)`.
#[must_use]
pub fn base_delay(policy: &RetryPolicy, retry_count: u32) -> Duration {
    let exponent = policy.backoff_exponent.powi(retry_count.min(i32::MAX as u32) as i32);
    let millis = (policy.base_delay_ms as f64 * exponent).min(policy.max_delay_ms as f64);
    Duration::from_millis(millis.max(0.0) as u64)
}

/// Computes the delay before retry number `retry_count`, jittered by ±20%
/// when the policy enables it.
#[must_use]
pub fn retry_delay(policy: &RetryPolicy, retry_count: u32) -> Duration {
    let delay = base_delay(policy, retry_count);
    if !policy.jitter_enabled || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(1.0 - JITTER_FACTOR..=1.0 + JITTER_FACTOR);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
