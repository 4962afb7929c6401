//! Global probe rate limiting.
//!
//! Two token buckets exist process-wide: one shared by the sweep and every
//! Monitor task (ICMP), one for the SNMP side. Waiters must wrap
//! `until_ready()` in `select!` with their cancel token so shutdown is never
//! blocked on token acquisition.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

/// Direct (not keyed) token bucket shared across tasks.
pub type TokenBucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Build a token bucket from the configured sustained rate and burst
/// allowance. Rates below one token per second are clamped up; governor
/// cannot express them and the config layer rejects them anyway.
pub fn token_bucket(rate_per_sec: f64, burst: u32) -> TokenBucket {
    let rate = NonZeroU32::new(rate_per_sec.round().max(1.0) as u32).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(rate).allow_burst(burst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_honored_then_exhausted() {
        let bucket = token_bucket(1.0, 4);
        for _ in 0..4 {
            assert!(bucket.check().is_ok(), "burst tokens should be available");
        }
        assert!(
            bucket.check().is_err(),
            "fifth immediate probe should be rate limited"
        );
    }

    #[test]
    fn fractional_rate_rounds_sanely() {
        // 0.4/s rounds to the 1/s floor rather than panicking.
        let bucket = token_bucket(0.4, 1);
        assert!(bucket.check().is_ok());
    }
}
