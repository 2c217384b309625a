//! Retry delay computation.
//!
//! Both transports reschedule failed work with the same curve: exponential
//! growth keyed on the attempt number, a hard cap, and jitter that keeps a
//! fleet of widgets from retrying in lockstep. The jittered delay always
//! lands in the upper quarter of the capped value, so a retry is never
//! pathologically eager.

use {rand::Rng, std::time::Duration};

/// Delay before retry `attempt` (zero-based): `base_ms` doubled per
/// attempt, capped at `max_ms`, then jittered into
/// `[0.75 * capped, capped]`.
#[must_use]
pub fn compute_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    compute_backoff_with(attempt, base_ms, max_ms, &mut rand::rng())
}

/// Same computation with a caller-supplied randomness source.
pub fn compute_backoff_with<R: Rng + ?Sized>(
    attempt: u32,
    base_ms: u64,
    max_ms: u64,
    rng: &mut R,
) -> Duration {
    // Exponent clamp keeps the f64 math finite for absurd attempt counts.
    let exponent = attempt.min(1_024) as i32;
    let capped = (base_ms as f64 * 2f64.powi(exponent)).min(max_ms as f64);
    let jitter = rng.random::<f64>() * 0.25 * capped;
    Duration::from_millis((capped * 0.75 + jitter).round() as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn first_attempt_lands_in_jitter_band() {
        for _ in 0..64 {
            let delay = compute_backoff(0, 1_000, 30_000).as_millis() as u64;
            assert!((750..=1_000).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn capped_attempts_land_in_cap_band() {
        for attempt in [5, 10, 63, 200, u32::MAX] {
            let delay = compute_backoff(attempt, 1_000, 30_000).as_millis() as u64;
            assert!(
                (22_500..=30_000).contains(&delay),
                "attempt {attempt} gave {delay}"
            );
        }
    }

    #[test]
    fn deterministic_with_a_seeded_source() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        assert_eq!(
            compute_backoff_with(3, 500, 15_000, &mut a),
            compute_backoff_with(3, 500, 15_000, &mut b),
        );
    }

    #[test]
    fn grows_per_attempt_until_the_cap_under_fixed_jitter() {
        let delay = |attempt| {
            let mut rng = StdRng::seed_from_u64(42);
            compute_backoff_with(attempt, 500, 15_000, &mut rng)
        };
        assert!(delay(1) > delay(0));
        assert!(delay(4) > delay(3));
        assert_eq!(delay(40), delay(41));
    }
}
