//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `retry` (1-based). Zero for the first attempt.
///
/// `base` doubles per retry up to `max`, plus up to 10% jitter.
pub fn retry_delay(retry: u32, base: Duration, max: Duration) -> Duration {
    if retry == 0 || base.is_zero() {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let exponential = 2u64.saturating_pow(retry - 1);
    let capped = base_ms.saturating_mul(exponential).min(max.as_millis() as u64);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}
