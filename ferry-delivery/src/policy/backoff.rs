//! Exponential backoff with jitter

use std::time::Duration;

use rand::Rng;

/// Delay before the given retry attempt
///
/// `delay = min(base * 2^(attempt - 1), max) * (1 ± jitter)`, where `attempt`
/// is 1-indexed.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter_factor: f64) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let delay = if exponent >= 32 {
        max
    } else {
        base.saturating_mul(1u32 << exponent).min(max)
    };

    if jitter_factor <= 0.0 {
        return delay;
    }

    let range = delay.as_secs_f64() * jitter_factor;
    let jitter: f64 = rand::rng().random_range(-range..=range);
    Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
}
