use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::aggregation::AggregatorCollection;
use crate::{ConsumerKind, MetricSeries, SeriesFilter, SeriesIdentity};

/// How values of a series are combined over time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    /// Statistics restart with every aggregation period.
    Measurement,
    /// Statistics accumulate over the lifetime of the series.
    Accumulator,
}

/// The statistics of one series over one aggregation period.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MetricAggregate {
    /// Namespace of the metric.
    pub namespace: String,
    /// Identifier of the metric within its namespace.
    pub metric_id: String,
    /// Dimension names mapped to the values of this series.
    pub dimensions: BTreeMap<String, String>,
    /// Whether the statistics were reset at the start of the period.
    pub kind: AggregationKind,
    /// Start of the aggregation period.
    pub period_start: DateTime<Utc>,
    /// Length of the aggregation period.
    #[serde(with = "duration_millis")]
    pub period_duration: Duration,
    /// Number of tracked values.
    pub count: u64,
    /// Sum of all tracked values.
    pub sum: f64,
    /// Smallest tracked value, `0` if nothing was tracked.
    pub min: f64,
    /// Largest tracked value, `0` if nothing was tracked.
    pub max: f64,
    /// Population standard deviation of the tracked values.
    pub std_dev: f64,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Running count, sum, extremes and sum of squares.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct RunningStats {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    sum_of_squares: f64,
}

impl RunningStats {
    fn insert(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        self.count += 1;
        self.sum += value;
        self.sum_of_squares += value * value;
    }

    fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }

        let count = self.count as f64;
        let mean = self.sum / count;
        let variance = self.sum_of_squares / count - mean * mean;

        // Rounding can push the variance of near-constant values slightly below zero.
        if variance > 0.0 { variance.sqrt() } else { 0.0 }
    }
}

#[derive(Debug)]
struct AggregatorState {
    stats: RunningStats,
    period_start: DateTime<Utc>,
    completed: bool,
    successor: Option<Arc<MetricAggregator>>,
}

/// Result of tracking a value into an aggregator.
pub(crate) enum TrackOutcome {
    /// The value was added to the statistics.
    Tracked,
    /// The consumer's filter rejected the value.
    Filtered,
    /// The aggregation period ended. Tracking must continue on the successor, if there is one.
    Completed(Option<Arc<MetricAggregator>>),
}

/// Result of completing an aggregator at the end of its period.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    pub aggregate: Option<MetricAggregate>,
    pub successor: Option<Arc<MetricAggregator>>,
}

/// Accumulates the values of one series for one consumer during one aggregation period.
pub struct MetricAggregator {
    series: Weak<MetricSeries>,
    identity: Arc<SeriesIdentity>,
    consumer: ConsumerKind,
    persistent: bool,
    filter: Option<Arc<dyn SeriesFilter>>,
    state: Mutex<AggregatorState>,
}

impl MetricAggregator {
    pub(crate) fn new(
        series: Weak<MetricSeries>,
        identity: Arc<SeriesIdentity>,
        consumer: ConsumerKind,
        persistent: bool,
        collection: &AggregatorCollection,
    ) -> Self {
        Self::with_stats(
            series,
            identity,
            consumer,
            persistent,
            collection,
            RunningStats::default(),
        )
    }

    fn with_stats(
        series: Weak<MetricSeries>,
        identity: Arc<SeriesIdentity>,
        consumer: ConsumerKind,
        persistent: bool,
        collection: &AggregatorCollection,
        stats: RunningStats,
    ) -> Self {
        Self {
            series,
            identity,
            consumer,
            persistent,
            filter: collection.filter().cloned(),
            state: Mutex::new(AggregatorState {
                stats,
                period_start: collection.period_start(),
                completed: false,
                successor: None,
            }),
        }
    }

    /// Returns the consumer this aggregator collects values for.
    pub fn consumer(&self) -> ConsumerKind {
        self.consumer
    }

    /// Returns `true` if statistics are carried over into the next period.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Returns `true` once the aggregation period of this aggregator has ended.
    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub(crate) fn series(&self) -> Option<Arc<MetricSeries>> {
        self.series.upgrade()
    }

    pub(crate) fn track(&self, series: &MetricSeries, value: f64) -> TrackOutcome {
        if let Some(ref filter) = self.filter {
            if !filter.accepts_value(series, value) {
                return TrackOutcome::Filtered;
            }
        }

        let mut state = self.state.lock();
        if state.completed {
            return TrackOutcome::Completed(state.successor.clone());
        }

        state.stats.insert(value);
        TrackOutcome::Tracked
    }

    /// Returns the statistics collected so far without resetting them.
    pub fn snapshot(&self, now: DateTime<Utc>) -> MetricAggregate {
        let state = self.state.lock();
        self.aggregate(&state, now)
    }

    /// Discards the statistics collected so far and restarts the period at `period_start`.
    ///
    /// Has no effect on a completed aggregator.
    pub fn reset(&self, period_start: DateTime<Utc>) {
        let mut state = self.state.lock();
        if !state.completed {
            state.stats = RunningStats::default();
            state.period_start = period_start;
        }
    }

    /// Ends the aggregation period at `period_end`.
    ///
    /// Empty measurements produce no aggregate. A persistent aggregator seeds a successor with the
    /// accumulated statistics and registers it in `next`, as long as the series is still alive and
    /// the next consumer's filter wants it.
    pub(crate) fn complete(
        &self,
        period_end: DateTime<Utc>,
        next: Option<&AggregatorCollection>,
    ) -> Completion {
        let mut state = self.state.lock();
        if state.completed {
            return Completion::default();
        }
        state.completed = true;

        let aggregate = if self.persistent || state.stats.count > 0 {
            Some(self.aggregate(&state, period_end))
        } else {
            None
        };

        let successor = match (self.persistent, next, self.series.upgrade()) {
            (true, Some(next), Some(series)) if next.will_consume(&series) => {
                let successor = Arc::new(Self::with_stats(
                    self.series.clone(),
                    self.identity.clone(),
                    self.consumer,
                    true,
                    next,
                    state.stats,
                ));
                next.register(successor.clone());
                Some(successor)
            }
            _ => None,
        };

        state.successor = successor.clone();
        Completion {
            aggregate,
            successor,
        }
    }

    fn aggregate(&self, state: &AggregatorState, period_end: DateTime<Utc>) -> MetricAggregate {
        let stats = &state.stats;

        MetricAggregate {
            namespace: self.identity.namespace.clone(),
            metric_id: self.identity.metric_id.clone(),
            dimensions: self.identity.dimensions.clone(),
            kind: match self.persistent {
                true => AggregationKind::Accumulator,
                false => AggregationKind::Measurement,
            },
            period_start: state.period_start,
            period_duration: courier_common::time::duration_between(
                state.period_start,
                period_end,
            ),
            count: stats.count,
            sum: stats.sum,
            min: stats.min,
            max: stats.max,
            std_dev: stats.std_dev(),
        }
    }
}

impl fmt::Debug for MetricAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricAggregator")
            .field("identity", &self.identity)
            .field("consumer", &self.consumer)
            .field("persistent", &self.persistent)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::default();
        for value in [0.4, 0.8, -0.04] {
            stats.insert(value);
        }

        assert_eq!(stats.count, 3);
        assert!((stats.sum - 1.16).abs() < 1e-9);
        assert_eq!(stats.min, -0.04);
        assert_eq!(stats.max, 0.8);
        assert!((stats.std_dev() - 0.343058).abs() < 1e-6);
    }

    #[test]
    fn test_std_dev_constant_values() {
        let mut stats = RunningStats::default();
        for _ in 0..10 {
            stats.insert(0.1);
        }
        assert_eq!(stats.std_dev(), 0.0);
    }

    #[test]
    fn test_empty_stats() {
        let stats = RunningStats::default();
        assert_eq!(stats.std_dev(), 0.0);
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 0.0);
    }

    #[test]
    fn test_serialize_aggregate() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let aggregate = MetricAggregate {
            namespace: "app".to_owned(),
            metric_id: "latency".to_owned(),
            dimensions: BTreeMap::from([("route".to_owned(), "/home".to_owned())]),
            kind: AggregationKind::Measurement,
            period_start: start,
            period_duration: Duration::from_secs(60),
            count: 2,
            sum: 3.0,
            min: 1.0,
            max: 2.0,
            std_dev: 0.5,
        };

        insta::assert_json_snapshot!(aggregate, @r###"
        {
          "namespace": "app",
          "metric_id": "latency",
          "dimensions": {
            "route": "/home"
          },
          "kind": "measurement",
          "period_start": "2024-01-01T12:00:00Z",
          "period_duration": 60000,
          "count": 2,
          "sum": 3.0,
          "min": 1.0,
          "max": 2.0,
          "std_dev": 0.5
        }
        "###);
    }
}
