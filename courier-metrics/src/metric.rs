use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use courier_common::InterlockedThrottle;
use courier_statsd::metric;
use serde::{Deserialize, Serialize};

use crate::cube::{CubeError, MultidimensionalCube};
use crate::statsd::MetricCounters;
use crate::{AggregationManager, MetricSeries, SeriesConfig, SeriesIdentity, TrackError};

/// Minimum time between two warnings about a metric running into its limits.
const LIMIT_WARNING_INTERVAL: Duration = Duration::from_secs(10);

/// Identifies a metric and names its dimensions.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct MetricIdentifier {
    /// Namespace of the metric.
    pub namespace: String,
    /// Identifier of the metric within its namespace.
    pub metric_id: String,
    /// Names of the dimensions, in the order their values are passed.
    pub dimension_names: Vec<String>,
}

impl MetricIdentifier {
    /// Creates a metric identifier.
    pub fn new<I, S>(namespace: impl Into<String>, metric_id: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            metric_id: metric_id.into(),
            dimension_names: names.into_iter().map(Into::into).collect(),
        }
    }
}

/// Bounds on the number of series in a [`Metric`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MetricLimits {
    /// Maximum number of series.
    pub series_count_limit: usize,
    /// Maximum number of distinct values per dimension.
    pub values_per_dimension_limit: usize,
}

impl Default for MetricLimits {
    fn default() -> Self {
        Self {
            series_count_limit: 1000,
            values_per_dimension_limit: 100,
        }
    }
}

/// All series of one metric, keyed by their dimension values.
pub struct Metric {
    identifier: MetricIdentifier,
    config: SeriesConfig,
    manager: Arc<AggregationManager>,
    series: MultidimensionalCube<MetricSeries>,
    limit_warning: InterlockedThrottle,
}

impl Metric {
    /// Creates an empty metric.
    pub fn new(
        identifier: MetricIdentifier,
        config: SeriesConfig,
        limits: MetricLimits,
        manager: Arc<AggregationManager>,
    ) -> Self {
        let dimension_limits =
            vec![limits.values_per_dimension_limit; identifier.dimension_names.len()];

        Self {
            series: MultidimensionalCube::new(limits.series_count_limit, &dimension_limits),
            identifier,
            config,
            manager,
            limit_warning: InterlockedThrottle::new(LIMIT_WARNING_INTERVAL),
        }
    }

    /// Returns the identifier of this metric.
    pub fn identifier(&self) -> &MetricIdentifier {
        &self.identifier
    }

    /// Returns the number of series created so far.
    pub fn series_count(&self) -> usize {
        self.series.total_points_count()
    }

    /// Returns the distinct values seen for a dimension.
    pub fn dimension_values(&self, dimension: usize) -> Vec<String> {
        self.series.dimension_values(dimension)
    }

    /// Returns all series created so far.
    pub fn all_series(&self) -> Vec<Arc<MetricSeries>> {
        self.series
            .get_all_points()
            .into_iter()
            .map(|(_, series)| series)
            .collect()
    }

    /// Returns the series for the given dimension values.
    ///
    /// If `create` is `false`, only existing series are returned.
    pub fn try_get_series(
        &self,
        values: &[&str],
        create: bool,
    ) -> Result<Arc<MetricSeries>, CubeError> {
        if !create {
            return self.series.try_get_point(values);
        }

        match self
            .series
            .try_get_or_create_point(values, |values| self.create_series(values))
        {
            Ok(result) => Ok(result.point),
            Err(error) => {
                self.warn_limit(&error);
                Err(error)
            }
        }
    }

    /// Tracks a value into the series with the given dimension values, creating it if needed.
    pub fn track_value(&self, value: f64, values: &[&str]) -> Result<(), TrackError> {
        self.try_get_series(values, true)?.track_value(value)
    }

    /// Parses and tracks a value into the series with the given dimension values.
    pub fn track_str(&self, value: &str, values: &[&str]) -> Result<(), TrackError> {
        self.try_get_series(values, true)?.track_str(value)
    }

    fn create_series(&self, values: &[&str]) -> Arc<MetricSeries> {
        let dimensions: BTreeMap<_, _> = self
            .identifier
            .dimension_names
            .iter()
            .cloned()
            .zip(values.iter().map(|v| (*v).to_owned()))
            .collect();

        let identity = SeriesIdentity::new(
            self.identifier.namespace.clone(),
            self.identifier.metric_id.clone(),
            dimensions,
        );

        MetricSeries::new(identity, self.config, self.manager.clone())
    }

    fn warn_limit(&self, error: &CubeError) {
        metric!(counter(MetricCounters::ValuesRejected) += 1, reason = "limit");

        self.limit_warning.try_run(|| {
            courier_log::warn!(
                error = error as &dyn std::error::Error,
                namespace = %self.identifier.namespace,
                metric_id = %self.identifier.metric_id,
                "dropping value for metric",
            );
        });
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("identifier", &self.identifier)
            .field("config", &self.config)
            .field("series", &self.series)
            .finish()
    }
}
