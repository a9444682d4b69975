use std::cell::RefCell;
use std::ops::RangeInclusive;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

thread_local! {
    static RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// A cheap, thread-safe source of random numbers.
///
/// The generator is not cryptographically secure. Every thread owns its own small generator that
/// is seeded once from the thread-local entropy source, so concurrent callers never contend on a
/// shared state.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use courier_common::WeakConcurrentRandom;
///
/// let delay = WeakConcurrentRandom.jitter(Duration::from_secs(1), Duration::from_secs(2));
/// assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(2));
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct WeakConcurrentRandom;

impl WeakConcurrentRandom {
    /// Returns the next random `u64`.
    pub fn next_u64(self) -> u64 {
        RNG.with(|rng| rng.borrow_mut().random())
    }

    /// Returns a random number in the half-open range `[0, 1)`.
    pub fn next_f64(self) -> f64 {
        RNG.with(|rng| rng.borrow_mut().random())
    }

    /// Returns a random number within the given inclusive range.
    pub fn next_in_range(self, range: RangeInclusive<u64>) -> u64 {
        if range.is_empty() {
            return *range.start();
        }

        RNG.with(|rng| rng.borrow_mut().random_range(range))
    }

    /// Returns a random duration between `lower` and `upper`, both inclusive.
    ///
    /// If `upper` is smaller than `lower`, `lower` is returned.
    pub fn jitter(self, lower: Duration, upper: Duration) -> Duration {
        if upper <= lower {
            return lower;
        }

        let lower_ms = lower.as_millis() as u64;
        let upper_ms = upper.as_millis() as u64;
        Duration::from_millis(self.next_in_range(lower_ms..=upper_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds() {
        for _ in 0..1000 {
            let value = WeakConcurrentRandom.next_in_range(5..=7);
            assert!((5..=7).contains(&value));
        }
    }

    #[test]
    fn test_empty_range() {
        #[allow(clippy::reversed_empty_ranges)]
        let value = WeakConcurrentRandom.next_in_range(9..=3);
        assert_eq!(value, 9);
    }

    #[test]
    fn test_unit_interval() {
        for _ in 0..1000 {
            let value = WeakConcurrentRandom.next_f64();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn test_jitter_inverted_bounds() {
        let lower = Duration::from_secs(10);
        let jitter = WeakConcurrentRandom.jitter(lower, Duration::from_secs(1));
        assert_eq!(jitter, lower);
    }

    #[test]
    fn test_concurrent_use() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..100).map(|_| WeakConcurrentRandom.next_u64()).count()))
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 100);
        }
    }
}
