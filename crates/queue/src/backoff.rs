//! Retry back-off policy.

use std::time::Duration;

use rand::Rng;

pub const MIN_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Next back-off after a failed attempt: double the previous value with a
/// uniform jitter factor in [0.5, 1.5], clamped to [1s, 10min]. A zero
/// previous back-off floors at the minimum.
pub fn next(previous: Duration) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.5);
    let doubled = Duration::from_secs_f64(previous.as_secs_f64() * 2.0 * jitter);
    doubled.clamp(MIN_BACKOFF, MAX_BACKOFF)
}
