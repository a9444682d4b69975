use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Runs an action at most once per interval across all threads.
///
/// The throttle never blocks. Callers that lose the race for the current interval simply skip
/// the action. This is primarily used to rate limit diagnostic logs that may be emitted from hot
/// paths, such as dropped telemetry items.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use courier_common::InterlockedThrottle;
///
/// let throttle = InterlockedThrottle::new(Duration::from_secs(60));
/// assert!(throttle.try_run(|| ()));
/// assert!(!throttle.try_run(|| ()));
/// ```
#[derive(Debug)]
pub struct InterlockedThrottle {
    interval: Duration,
    origin: Instant,
    /// Nanoseconds since `origin` after which the next run is permitted.
    next_run: AtomicU64,
}

impl InterlockedThrottle {
    /// Creates a throttle that permits one run per `interval`.
    ///
    /// The first call to [`try_run`](Self::try_run) always runs.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            origin: Instant::now(),
            next_run: AtomicU64::new(0),
        }
    }

    /// Returns the configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs `f` if the interval has elapsed since the last run.
    ///
    /// Returns `true` if `f` was invoked by this call.
    pub fn try_run<F>(&self, f: F) -> bool
    where
        F: FnOnce(),
    {
        let now = self.origin.elapsed().as_nanos() as u64;
        let next_run = self.next_run.load(Ordering::Acquire);

        if now < next_run {
            return false;
        }

        let interval = self.interval.as_nanos() as u64;
        let updated = self
            .next_run
            .compare_exchange(
                next_run,
                now.saturating_add(interval),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok();

        if updated {
            f();
        }

        updated
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn test_runs_once_per_interval() {
        let throttle = InterlockedThrottle::new(Duration::from_secs(3600));
        let mut runs = 0;

        for _ in 0..10 {
            throttle.try_run(|| runs += 1);
        }

        assert_eq!(runs, 1);
    }

    #[test]
    fn test_zero_interval() {
        let throttle = InterlockedThrottle::new(Duration::ZERO);
        let mut runs = 0;

        for _ in 0..10 {
            throttle.try_run(|| runs += 1);
        }

        assert_eq!(runs, 10);
    }

    #[test]
    fn test_concurrent_callers() {
        let throttle = Arc::new(InterlockedThrottle::new(Duration::from_secs(3600)));
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttle = throttle.clone();
                let runs = runs.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        throttle.try_run(|| {
                            runs.fetch_add(1, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }
}
