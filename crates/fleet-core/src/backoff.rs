use rand::Rng;
use std::time::Duration;

/// Exponential delay for the `attempt`-th retry (0-based), capped at `max`.
pub fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis();
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let max_ms = max.as_millis().max(base_ms);
    let multiplier = 1u128 << attempt.min(20);
    let millis = base_ms.saturating_mul(multiplier).min(max_ms);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

/// [`exponential`] plus up to 10% random jitter, so retries from many
/// workers do not line up.
pub fn jittered(base: Duration, max: Duration, attempt: u32) -> Duration {
    let delay = exponential(base, max, attempt);
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
