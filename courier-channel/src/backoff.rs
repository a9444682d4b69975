use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_common::WeakConcurrentRandom;
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::time::Instant;

use crate::BackoffConfig;

/// Largest exponent used for the exponential backoff.
const MAX_EXPONENT: u32 = 30;

#[derive(Debug, Default)]
struct BackoffState {
    consecutive_errors: u32,
    last_error: Option<Instant>,
    current_delay: Duration,
}

/// Tracks consecutive transmission failures and derives the delay before the next attempt.
///
/// Errors are counted at most once per minimum interval, so a burst of failures from parallel
/// transmissions increases the delay only once. The delay grows exponentially with the number of
/// counted errors up to a maximum, unless the server specifies a `Retry-After`.
#[derive(Debug)]
pub struct BackoffLogicManager {
    slot_delay: Duration,
    max_delay: Duration,
    min_error_interval: Duration,
    state: Mutex<BackoffState>,
    enabled: AtomicBool,
}

impl BackoffLogicManager {
    /// Creates a manager without any recorded errors.
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            slot_delay: config.slot_delay(),
            max_delay: config.max_delay(),
            min_error_interval: config.min_error_interval(),
            state: Mutex::new(BackoffState::default()),
            enabled: AtomicBool::new(false),
        }
    }

    /// Returns the number of counted consecutive errors.
    pub fn consecutive_errors(&self) -> u32 {
        self.state.lock().consecutive_errors
    }

    /// Returns the delay last computed by [`get_backoff_time_interval`](Self::get_backoff_time_interval).
    pub fn current_delay(&self) -> Duration {
        self.state.lock().current_delay
    }

    /// Records a failed transmission.
    ///
    /// Returns `false` if the error was ignored because the previous one was counted less than
    /// the minimum interval ago.
    pub fn report_error(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(last_error) = state.last_error {
            if now.duration_since(last_error) < self.min_error_interval {
                return false;
            }
        }

        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.last_error = Some(now);
        true
    }

    /// Clears all errors after a successful transmission.
    pub fn reset(&self) {
        *self.state.lock() = BackoffState::default();
    }

    /// Computes the delay before the next transmission attempt.
    ///
    /// A valid `Retry-After` value in the future takes precedence, but the delay is never
    /// shorter than one slot. Without it, the first error waits one slot and every further
    /// error roughly doubles the upper bound of a randomized delay. All delays are capped at
    /// the configured maximum.
    pub fn get_backoff_time_interval(&self, retry_after: Option<&str>) -> Duration {
        let mut state = self.state.lock();

        let delay = match retry_after.and_then(|value| parse_retry_after(value, Utc::now())) {
            Some(delay) => delay.max(self.slot_delay),
            None => self.exponential_delay(state.consecutive_errors),
        };

        state.current_delay = delay.min(self.max_delay);
        state.current_delay
    }

    fn exponential_delay(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors <= 1 {
            return self.slot_delay;
        }

        let exponent = consecutive_errors.min(MAX_EXPONENT) as i32;
        let factor = (2f64.powi(exponent) - 1.0) / 2.0;
        let upper = self.slot_delay.mul_f64(factor).min(self.max_delay);

        WeakConcurrentRandom.jitter(self.slot_delay, upper)
    }

    /// Logs that transmissions are being delayed.
    ///
    /// Logs only on the first call after backoff was disabled. Returns `true` if it logged.
    pub fn report_backoff_enabled(&self, status: StatusCode) -> bool {
        let changed = self
            .enabled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if changed {
            courier_log::warn!(
                status = status.as_u16(),
                delay = ?self.current_delay(),
                "transmissions failing, backing off"
            );
        }

        changed
    }

    /// Logs that transmissions succeed again.
    ///
    /// Logs only if backoff was previously reported as enabled. Returns `true` if it logged.
    pub fn report_backoff_disabled(&self) -> bool {
        let changed = self
            .enabled
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if changed {
            courier_log::info!("transmissions succeeding again, backoff disabled");
        }

        changed
    }
}

/// Parses a `Retry-After` header given as delta-seconds or as an HTTP date.
///
/// Returns `None` for dates in the past.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    date.with_timezone(&Utc).signed_duration_since(now).to_std().ok()
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn manager() -> BackoffLogicManager {
        BackoffLogicManager::new(&BackoffConfig::default())
    }

    #[test]
    fn test_parse_retry_after() {
        let now = Utc::now();
        assert_eq!(parse_retry_after(" 120 ", now), Some(Duration::from_secs(120)));

        let date = (now + TimeDelta::seconds(300)).to_rfc2822();
        let delay = parse_retry_after(&date, now).unwrap();
        assert!(delay > Duration::from_secs(298) && delay <= Duration::from_secs(300));

        let past = (now - TimeDelta::seconds(300)).to_rfc2822();
        assert_eq!(parse_retry_after(&past, now), None);
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_throttled() {
        let backoff = manager();

        assert!(backoff.report_error());
        assert!(!backoff.report_error());
        assert_eq!(backoff.consecutive_errors(), 1);

        tokio::time::advance(Duration::from_secs(19)).await;
        assert!(!backoff.report_error());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(backoff.report_error());
        assert_eq!(backoff.consecutive_errors(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_delay_bounds() {
        let backoff = manager();
        assert_eq!(backoff.get_backoff_time_interval(None), Duration::from_secs(10));

        let mut previous_upper = Duration::from_secs(10);
        for errors in 1..=20u32 {
            backoff.report_error();
            assert_eq!(backoff.consecutive_errors(), errors);

            let delay = backoff.get_backoff_time_interval(None);
            assert!(delay >= Duration::from_secs(10), "{errors}: {delay:?}");
            assert!(delay <= Duration::from_secs(3600), "{errors}: {delay:?}");

            let upper = if errors <= 1 {
                Duration::from_secs(10)
            } else {
                Duration::from_secs(10)
                    .mul_f64((2f64.powi(errors as i32) - 1.0) / 2.0)
                    .min(Duration::from_secs(3600))
            };
            assert!(delay <= upper);
            assert!(upper >= previous_upper);
            previous_upper = upper;

            tokio::time::advance(Duration::from_secs(20)).await;
        }

        backoff.reset();
        assert_eq!(backoff.consecutive_errors(), 0);
        assert_eq!(backoff.current_delay(), Duration::ZERO);
    }

    #[test]
    fn test_retry_after_overrides() {
        let backoff = manager();
        for _ in 0..3 {
            backoff.report_error();
        }

        assert_eq!(
            backoff.get_backoff_time_interval(Some("120")),
            Duration::from_secs(120)
        );
        assert_eq!(
            backoff.get_backoff_time_interval(Some("1")),
            Duration::from_secs(10)
        );
        assert_eq!(
            backoff.get_backoff_time_interval(Some("86400")),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_enabled_disabled_reported_once() {
        courier_log::init_test!();
        let backoff = manager();

        assert!(!backoff.report_backoff_disabled());
        assert!(backoff.report_backoff_enabled(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!backoff.report_backoff_enabled(StatusCode::SERVICE_UNAVAILABLE));
        assert!(backoff.report_backoff_disabled());
        assert!(!backoff.report_backoff_disabled());
        assert!(backoff.report_backoff_enabled(StatusCode::TOO_MANY_REQUESTS));
    }
}
