use crate::MetricSeries;

/// Decides which series and values a consumer observes.
///
/// A filter is attached to a consumer when its aggregation is started or cycled. It is consulted
/// when an aggregator is created for a series and again for every tracked value.
pub trait SeriesFilter: Send + Sync {
    /// Returns `true` if the consumer aggregates values of this series.
    fn will_consume(&self, series: &MetricSeries) -> bool;

    /// Returns `true` if the consumer accepts this individual value.
    fn accepts_value(&self, series: &MetricSeries, value: f64) -> bool {
        let _ = (series, value);
        true
    }
}

impl<F> SeriesFilter for F
where
    F: Fn(&MetricSeries) -> bool + Send + Sync,
{
    fn will_consume(&self, series: &MetricSeries) -> bool {
        self(series)
    }
}
