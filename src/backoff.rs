//! Reconnection delay policy.
//!
//! `delay = min(1000 * 2^max(1, attempts) + jitter, 2^31 - 1)` milliseconds,
//! never below one second. The attempt counter is reset by the connection
//! manager once a connection has stayed open for [`SUCCESS_RESET`].

use std::time::Duration;

use rand::Rng;

/// Open time after which a connection counts as stable.
pub const SUCCESS_RESET: Duration = Duration::from_secs(60);

const BASE_DELAY_MS: u64 = 1_000;
const MIN_DELAY_MS: u64 = 1_000;
const MAX_DELAY_MS: u64 = (1 << 31) - 1;
const MAX_JITTER_MS: u64 = 100;
/// Past this exponent the delay is capped anyway.
const MAX_EXPONENT: u32 = 31;

/// Delay before the next reconnection attempt, with random jitter.
#[must_use]
pub fn reconnect_delay(attempts: u32) -> Duration {
    let jitter = rand::rng().random_range(0..MAX_JITTER_MS);
    delay_with_jitter(attempts, jitter)
}

/// Deterministic form of [`reconnect_delay`].
#[must_use]
pub fn delay_with_jitter(attempts: u32, jitter_ms: u64) -> Duration {
    let exponent = attempts.clamp(1, MAX_EXPONENT);
    let raw = BASE_DELAY_MS.saturating_mul(1 << exponent).saturating_add(jitter_ms);
    Duration::from_millis(raw.clamp(MIN_DELAY_MS, MAX_DELAY_MS))
}

#[cfg(test)]
#[path = "backoff_test.rs"]
mod tests;
