use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use courier_statsd::metric;
use serde::{Deserialize, Serialize};

use crate::aggregator::TrackOutcome;
use crate::statsd::MetricCounters;
use crate::{AggregationManager, CubeError, MetricAggregate, MetricAggregator};

/// A party interested in aggregated metric values.
///
/// Each consumer runs its own aggregation periods independently of the others.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerKind {
    /// Regular aggregation that is cycled by the metric manager and always active.
    Default,
    /// Live metrics with short, externally driven periods.
    QuickPulse,
    /// Any other consumer.
    Custom,
}

impl ConsumerKind {
    /// Number of consumer kinds.
    pub const COUNT: usize = 3;

    /// All consumer kinds.
    pub const ALL: [Self; Self::COUNT] = [Self::Default, Self::QuickPulse, Self::Custom];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Default => 0,
            Self::QuickPulse => 1,
            Self::Custom => 2,
        }
    }

    /// Returns the name of the consumer kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::QuickPulse => "quickpulse",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when tracking a value.
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    /// The value is not finite or not allowed by the series configuration.
    #[error("invalid metric value {0}")]
    InvalidValue(f64),
    /// The string does not contain a number.
    #[error("cannot parse metric value {0:?}")]
    Unparsable(String),
    /// The series could not be resolved.
    #[error("cannot resolve series")]
    Series(#[from] CubeError),
}

/// The identity of a metric series.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub struct SeriesIdentity {
    /// Namespace of the metric.
    pub namespace: String,
    /// Identifier of the metric within its namespace.
    pub metric_id: String,
    /// Dimension names mapped to the values of this series.
    pub dimensions: BTreeMap<String, String>,
}

impl SeriesIdentity {
    /// Creates a new series identity.
    pub fn new(
        namespace: impl Into<String>,
        metric_id: impl Into<String>,
        dimensions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            metric_id: metric_id.into(),
            dimensions,
        }
    }
}

/// Aggregation behavior of a series.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(default)]
pub struct SeriesConfig {
    /// Keep accumulating across aggregation periods instead of resetting after each one.
    pub persistent: bool,
    /// Only accept whole numbers between `0` and `u32::MAX`.
    pub restrict_to_uint: bool,
}

impl SeriesConfig {
    fn validate(&self, value: f64) -> Result<(), TrackError> {
        if !value.is_finite() {
            return Err(TrackError::InvalidValue(value));
        }

        if self.restrict_to_uint
            && (value < 0.0 || value > f64::from(u32::MAX) || value.fract() != 0.0)
        {
            return Err(TrackError::InvalidValue(value));
        }

        Ok(())
    }
}

/// A single time series: one metric with a fixed set of dimension values.
///
/// The series holds at most one aggregator per consumer kind. Aggregators are created on demand
/// the first time a value is tracked in an aggregation period, and released again when the
/// period completes. Tracking never blocks on other producers for longer than a short critical
/// section.
pub struct MetricSeries {
    this: Weak<MetricSeries>,
    identity: Arc<SeriesIdentity>,
    config: SeriesConfig,
    manager: Arc<AggregationManager>,
    aggregators: [ArcSwapOption<MetricAggregator>; ConsumerKind::COUNT],
}

impl MetricSeries {
    /// Creates a series that registers its aggregators with `manager`.
    pub fn new(
        identity: SeriesIdentity,
        config: SeriesConfig,
        manager: Arc<AggregationManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            identity: Arc::new(identity),
            config,
            manager,
            aggregators: Default::default(),
        })
    }

    /// Returns the identity of this series.
    pub fn identity(&self) -> &SeriesIdentity {
        &self.identity
    }

    /// Returns the aggregation behavior of this series.
    pub fn config(&self) -> SeriesConfig {
        self.config
    }

    /// Tracks a value for every active consumer.
    ///
    /// Consumers that are inactive or filter out this series are skipped. The value is rejected
    /// only if it is invalid for this series.
    pub fn track_value(&self, value: f64) -> Result<(), TrackError> {
        if let Err(error) = self.config.validate(value) {
            metric!(counter(MetricCounters::ValuesRejected) += 1, reason = "invalid");
            return Err(error);
        }

        for kind in ConsumerKind::ALL {
            self.track_for(kind, value);
        }

        Ok(())
    }

    /// Parses and tracks a value.
    pub fn track_str(&self, value: &str) -> Result<(), TrackError> {
        let parsed = value.trim().parse::<f64>().map_err(|_| {
            metric!(counter(MetricCounters::ValuesRejected) += 1, reason = "unparsable");
            TrackError::Unparsable(value.to_owned())
        })?;

        self.track_value(parsed)
    }

    /// Returns the statistics of the current period for a consumer without resetting them.
    pub fn current_aggregate(
        &self,
        kind: ConsumerKind,
        now: DateTime<Utc>,
    ) -> Option<MetricAggregate> {
        let aggregator = self.aggregators[kind.index()].load_full()?;
        Some(aggregator.snapshot(now))
    }

    /// Discards the statistics of the current period for a consumer.
    pub fn reset_aggregation(&self, kind: ConsumerKind, period_start: DateTime<Utc>) {
        if let Some(aggregator) = self.aggregators[kind.index()].load_full() {
            aggregator.reset(period_start);
        }
    }

    /// Tracks a value for one consumer. Returns `true` if the value was aggregated.
    fn track_for(&self, kind: ConsumerKind, value: f64) -> bool {
        let slot = &self.aggregators[kind.index()];

        loop {
            let current = slot.load_full();

            if let Some(ref aggregator) = current {
                match aggregator.track(self, value) {
                    TrackOutcome::Tracked => return true,
                    TrackOutcome::Filtered => return false,
                    TrackOutcome::Completed(successor) => {
                        // Help the cycle move the slot along, then retry.
                        let _ = slot.compare_and_swap(&current, successor);
                        continue;
                    }
                }
            }

            let Some(collection) = self.manager.collection(kind) else {
                return false;
            };

            if !collection.will_consume(self) {
                return false;
            }

            // A sealed collection means a cycle is in progress and the next one is installed.
            let Some(_registration) = collection.enter() else {
                std::thread::yield_now();
                continue;
            };

            let aggregator = Arc::new(MetricAggregator::new(
                self.this.clone(),
                self.identity.clone(),
                kind,
                self.config.persistent,
                &collection,
            ));

            let previous = slot.compare_and_swap(&current, Some(aggregator.clone()));
            if previous.is_none() {
                collection.register(aggregator);
                metric!(
                    counter(MetricCounters::AggregatorsCreated) += 1,
                    consumer = kind.as_str(),
                );
            }
        }
    }

    /// Moves the slot of `kind` from `current` to `next` unless it changed in the meantime.
    pub(crate) fn replace_aggregator(
        &self,
        kind: ConsumerKind,
        current: &Arc<MetricAggregator>,
        next: Option<Arc<MetricAggregator>>,
    ) {
        let _ = self.aggregators[kind.index()].compare_and_swap(current, next);
    }

    #[cfg(test)]
    pub(crate) fn aggregator(&self, kind: ConsumerKind) -> Option<Arc<MetricAggregator>> {
        self.aggregators[kind.index()].load_full()
    }
}

impl fmt::Debug for MetricSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSeries")
            .field("identity", &self.identity)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn setup(config: SeriesConfig) -> (Arc<AggregationManager>, Arc<MetricSeries>) {
        let manager = Arc::new(AggregationManager::new(Utc::now()));
        let series = MetricSeries::new(
            SeriesIdentity::new("test", "series", BTreeMap::new()),
            config,
            manager.clone(),
        );
        (manager, series)
    }

    #[test]
    fn test_rejects_non_finite() {
        let (_, series) = setup(SeriesConfig::default());
        assert!(matches!(
            series.track_value(f64::NAN),
            Err(TrackError::InvalidValue(_))
        ));
        assert!(matches!(
            series.track_value(f64::INFINITY),
            Err(TrackError::InvalidValue(_))
        ));
        assert!(series.aggregator(ConsumerKind::Default).is_none());
    }

    #[test]
    fn test_restrict_to_uint() {
        let (_, series) = setup(SeriesConfig {
            restrict_to_uint: true,
            ..Default::default()
        });

        series.track_value(42.0).unwrap();
        series.track_value(f64::from(u32::MAX)).unwrap();
        assert!(series.track_value(-1.0).is_err());
        assert!(series.track_value(1.5).is_err());
        assert!(series.track_value(f64::from(u32::MAX) + 1.0).is_err());
    }

    #[test]
    fn test_track_str() {
        let (_, series) = setup(SeriesConfig::default());
        series.track_str(" 12.5 ").unwrap();

        let error = series.track_str("twelve").unwrap_err();
        assert_eq!(error.to_string(), r#"cannot parse metric value "twelve""#);

        let aggregate = series
            .current_aggregate(ConsumerKind::Default, Utc::now())
            .unwrap();
        assert_eq!(aggregate.count, 1);
        assert_eq!(aggregate.sum, 12.5);
    }

    #[test]
    fn test_only_active_consumers() {
        let (manager, series) = setup(SeriesConfig::default());
        series.track_value(1.0).unwrap();

        assert!(series.aggregator(ConsumerKind::Default).is_some());
        assert!(series.aggregator(ConsumerKind::QuickPulse).is_none());

        manager
            .start_aggregators(ConsumerKind::QuickPulse, None, Utc::now())
            .unwrap();
        series.track_value(1.0).unwrap();
        assert!(series.aggregator(ConsumerKind::QuickPulse).is_some());
    }

    #[test]
    fn test_aggregator_released_after_cycle() {
        let (manager, series) = setup(SeriesConfig::default());
        series.track_value(1.0).unwrap();
        let first = series.aggregator(ConsumerKind::Default).unwrap();

        manager
            .cycle_aggregators(ConsumerKind::Default, None, Utc::now())
            .unwrap();
        assert!(first.is_completed());
        assert!(series.aggregator(ConsumerKind::Default).is_none());

        series.track_value(1.0).unwrap();
        let second = series.aggregator(ConsumerKind::Default).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_persistent_successor_installed() {
        let (manager, series) = setup(SeriesConfig {
            persistent: true,
            ..Default::default()
        });
        series.track_value(1.0).unwrap();
        let first = series.aggregator(ConsumerKind::Default).unwrap();

        manager
            .cycle_aggregators(ConsumerKind::Default, None, Utc::now())
            .unwrap();

        let second = series.aggregator(ConsumerKind::Default).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_completed());
    }

    #[test]
    fn test_reset_aggregation() {
        let (_, series) = setup(SeriesConfig::default());
        series.track_value(5.0).unwrap();

        let restart = Utc::now() + Duration::seconds(5);
        series.reset_aggregation(ConsumerKind::Default, restart);

        let aggregate = series
            .current_aggregate(ConsumerKind::Default, restart)
            .unwrap();
        assert_eq!(aggregate.count, 0);
        assert_eq!(aggregate.period_start, restart);
    }

    #[test]
    fn test_value_filter() {
        struct PositiveOnly;

        impl crate::SeriesFilter for PositiveOnly {
            fn will_consume(&self, _series: &MetricSeries) -> bool {
                true
            }

            fn accepts_value(&self, _series: &MetricSeries, value: f64) -> bool {
                value > 0.0
            }
        }

        let (manager, series) = setup(SeriesConfig::default());
        manager
            .start_aggregators(ConsumerKind::Custom, Some(Arc::new(PositiveOnly)), Utc::now())
            .unwrap();

        series.track_value(-1.0).unwrap();
        series.track_value(2.0).unwrap();

        let custom = series
            .current_aggregate(ConsumerKind::Custom, Utc::now())
            .unwrap();
        let default = series
            .current_aggregate(ConsumerKind::Default, Utc::now())
            .unwrap();
        assert_eq!(custom.count, 1);
        assert_eq!(default.count, 2);
    }
}
