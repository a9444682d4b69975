//! Utilities to deal with wall-clock time.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Returns the next point in time after `now` that lies on an `interval` boundary shifted by
/// `offset`.
///
/// Boundaries are aligned to the UNIX epoch, so with an interval of one minute and an offset of
/// one second, the result is always one second past a full minute. A `now` that falls exactly on
/// a boundary yields the following boundary. A zero interval returns `now`.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use chrono::DateTime;
/// use courier_common::time::next_aligned;
///
/// let now = DateTime::from_timestamp(125, 0).unwrap();
/// let next = next_aligned(now, Duration::from_secs(60), Duration::from_secs(1));
/// assert_eq!(next.timestamp(), 181);
/// ```
pub fn next_aligned(now: DateTime<Utc>, interval: Duration, offset: Duration) -> DateTime<Utc> {
    let interval_ms = interval.as_millis() as i64;
    if interval_ms <= 0 {
        return now;
    }

    let offset_ms = (offset.as_millis() as i64).rem_euclid(interval_ms);
    let shifted = now.timestamp_millis() - offset_ms;
    let next = (shifted.div_euclid(interval_ms) + 1) * interval_ms + offset_ms;

    DateTime::from_timestamp_millis(next).unwrap_or(now)
}

/// Returns the non-negative duration from `start` to `end`.
///
/// If `end` is before `start`, this returns [`Duration::ZERO`].
pub fn duration_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start).to_std().unwrap_or(Duration::ZERO)
}

/// Adds a standard duration to a timestamp, saturating at the maximum representable time.
pub fn add_duration(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| time.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    #[test]
    fn test_next_aligned_without_offset() {
        let next = next_aligned(ts(61_500), Duration::from_secs(60), Duration::ZERO);
        assert_eq!(next, ts(120_000));
    }

    #[test]
    fn test_next_aligned_on_boundary() {
        let next = next_aligned(ts(120_000), Duration::from_secs(60), Duration::ZERO);
        assert_eq!(next, ts(180_000));
    }

    #[test]
    fn test_next_aligned_before_offset() {
        // Half a second past the minute, the offset boundary of this minute is still ahead.
        let next = next_aligned(ts(120_500), Duration::from_secs(60), Duration::from_secs(1));
        assert_eq!(next, ts(121_000));
    }

    #[test]
    fn test_next_aligned_zero_interval() {
        let now = ts(4711);
        assert_eq!(next_aligned(now, Duration::ZERO, Duration::ZERO), now);
    }

    #[test]
    fn test_duration_between_negative() {
        assert_eq!(duration_between(ts(2000), ts(1000)), Duration::ZERO);
        assert_eq!(duration_between(ts(1000), ts(2500)), Duration::from_millis(1500));
    }

    #[test]
    fn test_add_duration() {
        assert_eq!(add_duration(ts(1000), Duration::from_millis(500)), ts(1500));
    }
}
