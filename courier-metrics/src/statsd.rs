use courier_statsd::{CounterMetric, HistogramMetric, TimerMetric};

/// Counter metrics for Courier Metrics.
pub enum MetricCounters {
    /// Incremented for every aggregator created for a series.
    ///
    /// Tagged by `consumer`.
    AggregatorsCreated,

    /// Incremented for every value that could not be tracked.
    ///
    /// Tagged by `reason`: `invalid`, `unparsable` or `limit`.
    ValuesRejected,
}

impl CounterMetric for MetricCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::AggregatorsCreated => "metrics.aggregators.created",
            Self::ValuesRejected => "metrics.values.rejected",
        }
    }
}

/// Timer metrics for Courier Metrics.
pub enum MetricTimers {
    /// Time spent completing an aggregation period, excluding forwarding of the aggregates.
    ///
    /// Tagged by `consumer`.
    CycleDuration,
}

impl TimerMetric for MetricTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::CycleDuration => "metrics.cycle.duration",
        }
    }
}

/// Histogram metrics for Courier Metrics.
pub enum MetricHistograms {
    /// Number of aggregates produced by one completed aggregation period.
    ///
    /// Tagged by `consumer`.
    AggregatesCompleted,
}

impl HistogramMetric for MetricHistograms {
    fn name(&self) -> &'static str {
        match *self {
            Self::AggregatesCompleted => "metrics.cycle.aggregates",
        }
    }
}
