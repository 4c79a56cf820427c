//! Reconnect backoff with jitter:
//! `clamp(base * 2^(attempt-1), 0, max) * U(0.9, 1.1)`.

use std::time::Duration;

use rand::Rng;

/// Computes the next reconnect wait for `attempt` (1-indexed), clamped to
/// `[min, max]` after jitter.
#[must_use]
pub fn next_interval(base: Duration, min: Duration, max: Duration, attempt: u32) -> Duration {
    let pre_jitter = base
        .checked_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX))
        .unwrap_or(max)
        .min(max);

    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    let jittered = pre_jitter.mul_f64(jitter);
    jittered.clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_min_and_max_across_many_attempts() {
        let base = Duration::from_millis(200);
        let min = Duration::from_millis(100);
        let max = Duration::from_secs(30);
        for attempt in 1..=20 {
            let interval = next_interval(base, min, max, attempt);
            assert!(interval >= min, "attempt {attempt}: {interval:?} < {min:?}");
            assert!(interval <= max, "attempt {attempt}: {interval:?} > {max:?}");
        }
    }

    #[test]
    fn pre_jitter_mean_doubles_until_cap() {
        let base = Duration::from_millis(100);
        let min = Duration::from_millis(10);
        let max = Duration::from_secs(100);
        // Sample many draws per attempt and check the mean tracks 2^(n-1)*base,
        // since jitter is symmetric around 1.0.
        for attempt in 1..=5u32 {
            let samples: Vec<f64> = (0..200)
                .map(|_| next_interval(base, min, max, attempt).as_secs_f64())
                .collect();
            let mean = samples.iter().sum::<f64>() / samples.len() as f64;
            let expected = base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
            assert!(
                (mean - expected).abs() < expected * 0.15 + 0.01,
                "attempt {attempt}: mean {mean} expected ~{expected}"
            );
        }
    }

    #[test]
    fn never_deterministic() {
        let base = Duration::from_millis(100);
        let min = Duration::from_millis(10);
        let max = Duration::from_secs(100);
        let samples: std::collections::HashSet<Duration> =
            (0..50).map(|_| next_interval(base, min, max, 3)).collect();
        assert!(samples.len() > 1, "jitter should vary across draws");
    }

    proptest::proptest! {
        /// For any base/min/max combination with `min <= max`, the computed
        /// interval never leaves `[min, max]`, no matter how many reconnect
        /// attempts have elapsed: backoff is always bounded.
        #[test]
        fn interval_always_within_min_and_max(
            base_ms in 1u64..5_000,
            min_ms in 0u64..1_000,
            max_extra_ms in 0u64..60_000,
            attempt in 1u32..50,
        ) {
            let base = Duration::from_millis(base_ms);
            let min = Duration::from_millis(min_ms);
            let max = min + Duration::from_millis(max_extra_ms);

            let interval = next_interval(base, min, max, attempt);
            prop_assert!(interval >= min);
            prop_assert!(interval <= max);
        }
    }
}
