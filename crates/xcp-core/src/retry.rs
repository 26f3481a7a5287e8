//! Retry backoff computation.
//!
//! A NACK carrying `retry_after_ms` triggers retransmission of the same
//! message id after `retry_after + jitter`, where jitter is drawn uniformly
//! from `[0, base * 2^attempt)` with the exponent capped. Reusing the
//! message id lets the peer's duplicate window absorb crossed retries.

use std::time::Duration;

/// Exponent cap for the jitter window.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Jitter for the given attempt: uniform in `[0, base * 2^min(attempt, 6))`.
///
/// `random` is raw entropy from the environment so simulations stay
/// deterministic.
#[must_use]
pub fn jitter(base: Duration, attempt: u32, random: u64) -> Duration {
    let window = base.saturating_mul(1 << attempt.min(MAX_BACKOFF_EXPONENT));
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    if window_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(random % window_ms)
}

/// Full delay before a retry: the peer's hint plus jitter.
#[must_use]
pub fn retry_delay(
    retry_after_ms: u64,
    base: Duration,
    attempt: u32,
    random: u64,
) -> Duration {
    Duration::from_millis(retry_after_ms) + jitter(base, attempt, random)
}
