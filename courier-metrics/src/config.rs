use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::MetricLimits;

/// Configuration of the [`MetricManager`](crate::MetricManager).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Length of the default aggregation period in seconds.
    ///
    /// Defaults to `60`.
    pub cycle_interval_secs: u64,

    /// Offset of the cycle from the aligned interval boundary in milliseconds.
    ///
    /// Cycles run at multiples of `cycle_interval_secs` since the UNIX epoch, shifted by this
    /// offset so that values tracked right at the boundary are not split across periods by clock
    /// drift. Defaults to `1000`.
    pub cycle_offset_ms: u64,

    /// A cycle due within this many milliseconds runs immediately instead of sleeping.
    ///
    /// Defaults to `500`.
    pub cycle_tolerance_ms: u64,

    /// Maximum number of series per metric.
    ///
    /// Defaults to `1000`.
    pub series_count_limit: usize,

    /// Maximum number of distinct values per dimension of a metric.
    ///
    /// Defaults to `100`.
    pub values_per_dimension_limit: usize,
}

impl MetricsConfig {
    /// Returns the length of an aggregation period.
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs.max(1))
    }

    /// Returns the offset of the cycle from the aligned boundary.
    pub fn cycle_offset(&self) -> Duration {
        Duration::from_millis(self.cycle_offset_ms)
    }

    /// Returns the tolerance for running a cycle early.
    pub fn cycle_tolerance(&self) -> Duration {
        Duration::from_millis(self.cycle_tolerance_ms)
    }

    /// Returns the limits applied to every metric.
    pub fn limits(&self) -> MetricLimits {
        MetricLimits {
            series_count_limit: self.series_count_limit,
            values_per_dimension_limit: self.values_per_dimension_limit,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 60,
            cycle_offset_ms: 1000,
            cycle_tolerance_ms: 500,
            series_count_limit: 1000,
            values_per_dimension_limit: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: MetricsConfig = serde_json::from_str("{}").unwrap();
        insta::assert_debug_snapshot!(config, @r###"
        MetricsConfig {
            cycle_interval_secs: 60,
            cycle_offset_ms: 1000,
            cycle_tolerance_ms: 500,
            series_count_limit: 1000,
            values_per_dimension_limit: 100,
        }
        "###);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = MetricsConfig {
            cycle_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.cycle_interval(), Duration::from_secs(1));
    }
}
