use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use courier_statsd::metric;
use parking_lot::Mutex;
use serde::Serialize;

use crate::collection::GrowingCollection;
use crate::statsd::{MetricHistograms, MetricTimers};
use crate::{ConsumerKind, MetricAggregate, MetricAggregator, MetricSeries, SeriesFilter};

/// Error returned when changing the aggregation state of a consumer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AggregationError {
    /// The default consumer is active for the whole lifetime of the manager.
    #[error("the default consumer cannot be started or stopped")]
    DefaultConsumerImmutable,
    /// The consumer is already aggregating.
    #[error("aggregation for consumer {0} is already active")]
    AlreadyActive(ConsumerKind),
    /// The consumer is not aggregating.
    #[error("aggregation for consumer {0} is not active")]
    ConsumerInactive(ConsumerKind),
}

/// The aggregates produced by completing one aggregation period of a consumer.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregationPeriodSummary {
    /// Aggregates of persistent series, which carry their state into the next period.
    pub persistent: Vec<MetricAggregate>,
    /// Aggregates of series that were reset.
    pub non_persistent: Vec<MetricAggregate>,
}

impl AggregationPeriodSummary {
    /// Returns the total number of aggregates.
    pub fn len(&self) -> usize {
        self.persistent.len() + self.non_persistent.len()
    }

    /// Returns `true` if the period produced no aggregates.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns all aggregates, persistent ones first.
    pub fn into_aggregates(self) -> Vec<MetricAggregate> {
        let mut aggregates = self.persistent;
        aggregates.extend(self.non_persistent);
        aggregates
    }
}

/// Most significant bit of the gate state, set once the collection no longer accepts aggregators.
const SEALED: usize = 1 << (usize::BITS - 1);

/// Counts registrations in flight and blocks new ones once sealed.
#[derive(Debug, Default)]
struct RegistrationGate {
    state: AtomicUsize,
}

impl RegistrationGate {
    fn enter(&self) -> Option<GateGuard<'_>> {
        let previous = self.state.fetch_add(1, Ordering::AcqRel);
        if previous & SEALED != 0 {
            self.state.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(GateGuard(self))
    }

    /// Rejects all future registrations and waits for the ones in flight.
    fn seal(&self) {
        self.state.fetch_or(SEALED, Ordering::AcqRel);
        while self.state.load(Ordering::Acquire) & !SEALED != 0 {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

/// Proof of an open registration slot. The gate cannot be sealed while a guard is alive.
pub(crate) struct GateGuard<'a>(&'a RegistrationGate);

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0.state.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The aggregators of one consumer for one aggregation period.
pub(crate) struct AggregatorCollection {
    period_start: DateTime<Utc>,
    filter: Option<Arc<dyn SeriesFilter>>,
    aggregators: GrowingCollection<Arc<MetricAggregator>>,
    gate: RegistrationGate,
}

impl AggregatorCollection {
    fn new(period_start: DateTime<Utc>, filter: Option<Arc<dyn SeriesFilter>>) -> Self {
        Self {
            period_start,
            filter,
            aggregators: GrowingCollection::new(),
            gate: RegistrationGate::default(),
        }
    }

    pub fn period_start(&self) -> DateTime<Utc> {
        self.period_start
    }

    pub fn filter(&self) -> Option<&Arc<dyn SeriesFilter>> {
        self.filter.as_ref()
    }

    pub fn will_consume(&self, series: &MetricSeries) -> bool {
        self.filter
            .as_ref()
            .is_none_or(|filter| filter.will_consume(series))
    }

    /// Opens a registration, or returns `None` if the period has already ended.
    pub fn enter(&self) -> Option<GateGuard<'_>> {
        self.gate.enter()
    }

    pub fn register(&self, aggregator: Arc<MetricAggregator>) {
        self.aggregators.add(aggregator);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.aggregators.len()
    }
}

impl fmt::Debug for AggregatorCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorCollection")
            .field("period_start", &self.period_start)
            .field("filtered", &self.filter.is_some())
            .field("aggregators", &self.aggregators)
            .finish()
    }
}

/// Owns the aggregation periods of all consumers.
///
/// Every consumer is either inactive or has one live [`AggregatorCollection`]. Series register new
/// aggregators with the live collection. Cycling swaps in a fresh collection and completes all
/// aggregators of the previous one. Registrations racing with a cycle land in exactly one of the
/// two collections: the previous collection is sealed before it is read, and sealing waits for
/// registrations in flight.
pub struct AggregationManager {
    consumers: [ArcSwapOption<AggregatorCollection>; ConsumerKind::COUNT],
    /// Serializes all state transitions. Producers never take this lock.
    transitions: Mutex<()>,
}

impl AggregationManager {
    /// Creates a manager with an active default consumer whose first period starts at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        let manager = Self {
            consumers: Default::default(),
            transitions: Mutex::new(()),
        };

        manager.consumers[ConsumerKind::Default.index()]
            .store(Some(Arc::new(AggregatorCollection::new(now, None))));

        manager
    }

    /// Returns `true` if the consumer is currently aggregating.
    pub fn is_active(&self, kind: ConsumerKind) -> bool {
        self.consumers[kind.index()].load().is_some()
    }

    pub(crate) fn collection(&self, kind: ConsumerKind) -> Option<Arc<AggregatorCollection>> {
        self.consumers[kind.index()].load_full()
    }

    /// Starts aggregating values for an inactive consumer.
    pub fn start_aggregators(
        &self,
        kind: ConsumerKind,
        filter: Option<Arc<dyn SeriesFilter>>,
        start: DateTime<Utc>,
    ) -> Result<(), AggregationError> {
        if kind == ConsumerKind::Default {
            return Err(AggregationError::DefaultConsumerImmutable);
        }

        let _transition = self.transitions.lock();
        let slot = &self.consumers[kind.index()];
        if slot.load().is_some() {
            return Err(AggregationError::AlreadyActive(kind));
        }

        slot.store(Some(Arc::new(AggregatorCollection::new(start, filter))));
        courier_log::debug!(consumer = %kind, "started aggregation");
        Ok(())
    }

    /// Ends the current aggregation period of a consumer and starts the next one at `now`.
    ///
    /// The filter replaces the consumer's previous filter.
    pub fn cycle_aggregators(
        &self,
        kind: ConsumerKind,
        filter: Option<Arc<dyn SeriesFilter>>,
        now: DateTime<Utc>,
    ) -> Result<AggregationPeriodSummary, AggregationError> {
        let _transition = self.transitions.lock();
        let slot = &self.consumers[kind.index()];
        let Some(previous) = slot.load_full() else {
            return Err(AggregationError::ConsumerInactive(kind));
        };

        let next = Arc::new(AggregatorCollection::new(now, filter));
        slot.store(Some(next.clone()));

        Ok(complete_period(kind, &previous, now, Some(&next)))
    }

    /// Ends the aggregation of a consumer, returning the aggregates of its final period.
    pub fn stop_aggregators(
        &self,
        kind: ConsumerKind,
        now: DateTime<Utc>,
    ) -> Result<AggregationPeriodSummary, AggregationError> {
        if kind == ConsumerKind::Default {
            return Err(AggregationError::DefaultConsumerImmutable);
        }

        let _transition = self.transitions.lock();
        let Some(previous) = self.consumers[kind.index()].swap(None) else {
            return Err(AggregationError::ConsumerInactive(kind));
        };

        courier_log::debug!(consumer = %kind, "stopped aggregation");
        Ok(complete_period(kind, &previous, now, None))
    }
}

impl Default for AggregationManager {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl fmt::Debug for AggregationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in ConsumerKind::ALL {
            map.entry(&kind, &self.collection(kind));
        }
        map.finish()
    }
}

fn complete_period(
    kind: ConsumerKind,
    previous: &AggregatorCollection,
    period_end: DateTime<Utc>,
    next: Option<&Arc<AggregatorCollection>>,
) -> AggregationPeriodSummary {
    metric!(timer(MetricTimers::CycleDuration), consumer = kind.as_str(), {
        previous.gate.seal();

        let mut summary = AggregationPeriodSummary::default();
        for aggregator in &previous.aggregators.snapshot() {
            let completion = aggregator.complete(period_end, next.map(|n| &**n));

            if let Some(series) = aggregator.series() {
                series.replace_aggregator(kind, aggregator, completion.successor);
            }

            match completion.aggregate {
                Some(aggregate) if aggregator.is_persistent() => summary.persistent.push(aggregate),
                Some(aggregate) => summary.non_persistent.push(aggregate),
                None => (),
            }
        }

        metric!(
            histogram(MetricHistograms::AggregatesCompleted) = summary.len() as u64,
            consumer = kind.as_str(),
        );

        summary
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::thread;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{SeriesConfig, SeriesIdentity};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn series(manager: &Arc<AggregationManager>, id: &str, persistent: bool) -> Arc<MetricSeries> {
        MetricSeries::new(
            SeriesIdentity::new("test", id, BTreeMap::new()),
            SeriesConfig {
                persistent,
                ..Default::default()
            },
            manager.clone(),
        )
    }

    #[test]
    fn test_default_consumer_immutable() {
        let manager = AggregationManager::new(start());
        assert!(manager.is_active(ConsumerKind::Default));
        assert_eq!(
            manager.start_aggregators(ConsumerKind::Default, None, start()),
            Err(AggregationError::DefaultConsumerImmutable)
        );
        assert_eq!(
            manager.stop_aggregators(ConsumerKind::Default, start()),
            Err(AggregationError::DefaultConsumerImmutable)
        );
    }

    #[test]
    fn test_start_stop_consumer() {
        let manager = AggregationManager::new(start());
        assert!(!manager.is_active(ConsumerKind::QuickPulse));

        manager
            .start_aggregators(ConsumerKind::QuickPulse, None, start())
            .unwrap();
        assert_eq!(
            manager.start_aggregators(ConsumerKind::QuickPulse, None, start()),
            Err(AggregationError::AlreadyActive(ConsumerKind::QuickPulse))
        );

        manager
            .stop_aggregators(ConsumerKind::QuickPulse, start())
            .unwrap();
        assert_eq!(
            manager.stop_aggregators(ConsumerKind::QuickPulse, start()),
            Err(AggregationError::ConsumerInactive(ConsumerKind::QuickPulse))
        );
        assert_eq!(
            manager
                .cycle_aggregators(ConsumerKind::Custom, None, start())
                .unwrap_err(),
            AggregationError::ConsumerInactive(ConsumerKind::Custom)
        );
    }

    #[test]
    fn test_measurement_scenario() {
        let manager = Arc::new(AggregationManager::new(start()));
        let series = series(&manager, "latency", false);

        for value in [0.4, 0.8, -0.04] {
            series.track_value(value).unwrap();
        }

        let end = start() + Duration::seconds(60);
        let summary = manager
            .cycle_aggregators(ConsumerKind::Default, None, end)
            .unwrap();

        assert!(summary.persistent.is_empty());
        let [aggregate] = summary.non_persistent.as_slice() else {
            panic!("expected exactly one aggregate");
        };

        assert_eq!(aggregate.count, 3);
        assert!((aggregate.sum - 1.16).abs() < 1e-9);
        assert_eq!(aggregate.min, -0.04);
        assert_eq!(aggregate.max, 0.8);
        assert!((aggregate.std_dev - 0.343058).abs() < 1e-6);
        assert_eq!(aggregate.period_start, start());
        assert_eq!(aggregate.period_duration.as_secs(), 60);
    }

    #[test]
    fn test_lossless_cycling() {
        let manager = Arc::new(AggregationManager::new(start()));
        let series = series(&manager, "requests", false);

        for _ in 0..5 {
            series.track_value(1.0).unwrap();
        }
        let first = manager
            .cycle_aggregators(ConsumerKind::Default, None, start() + Duration::seconds(60))
            .unwrap();

        for _ in 0..3 {
            series.track_value(1.0).unwrap();
        }
        let second = manager
            .cycle_aggregators(ConsumerKind::Default, None, start() + Duration::seconds(120))
            .unwrap();

        assert_eq!(first.non_persistent[0].count, 5);
        assert_eq!(second.non_persistent[0].count, 3);
        assert_eq!(
            second.non_persistent[0].period_start,
            start() + Duration::seconds(60)
        );

        // Nothing was tracked in the third period, so the empty measurement is skipped.
        let third = manager
            .cycle_aggregators(ConsumerKind::Default, None, start() + Duration::seconds(180))
            .unwrap();
        assert!(third.is_empty());
    }

    #[test]
    fn test_persistent_accumulates() {
        let manager = Arc::new(AggregationManager::new(start()));
        let series = series(&manager, "total", true);

        series.track_value(2.0).unwrap();
        let first = manager
            .cycle_aggregators(ConsumerKind::Default, None, start() + Duration::seconds(60))
            .unwrap();

        let second = manager
            .cycle_aggregators(ConsumerKind::Default, None, start() + Duration::seconds(120))
            .unwrap();

        series.track_value(3.0).unwrap();
        let third = manager
            .cycle_aggregators(ConsumerKind::Default, None, start() + Duration::seconds(180))
            .unwrap();

        assert!(first.non_persistent.is_empty());
        assert_eq!(first.persistent[0].sum, 2.0);
        assert_eq!(second.persistent[0].count, 1);
        assert_eq!(second.persistent[0].sum, 2.0);
        assert_eq!(third.persistent[0].count, 2);
        assert_eq!(third.persistent[0].sum, 5.0);
        assert_eq!(
            third.persistent[0].period_start,
            start() + Duration::seconds(120)
        );
    }

    #[test]
    fn test_stop_discards_persistent_state() {
        let manager = Arc::new(AggregationManager::new(start()));
        manager
            .start_aggregators(ConsumerKind::Custom, None, start())
            .unwrap();

        let series = series(&manager, "total", true);
        series.track_value(4.0).unwrap();

        let summary = manager
            .stop_aggregators(ConsumerKind::Custom, start() + Duration::seconds(10))
            .unwrap();
        assert_eq!(summary.persistent[0].sum, 4.0);

        manager
            .start_aggregators(ConsumerKind::Custom, None, start() + Duration::seconds(20))
            .unwrap();
        series.track_value(1.0).unwrap();

        let summary = manager
            .stop_aggregators(ConsumerKind::Custom, start() + Duration::seconds(30))
            .unwrap();
        assert_eq!(summary.persistent[0].sum, 1.0);
    }

    #[test]
    fn test_filter_applies_to_consumer() {
        let manager = Arc::new(AggregationManager::new(start()));
        let filter: Arc<dyn SeriesFilter> =
            Arc::new(|series: &MetricSeries| series.identity().metric_id == "included");
        manager
            .start_aggregators(ConsumerKind::QuickPulse, Some(filter), start())
            .unwrap();

        let included = series(&manager, "included", false);
        let excluded = series(&manager, "excluded", false);
        included.track_value(1.0).unwrap();
        excluded.track_value(1.0).unwrap();

        let quick_pulse = manager
            .cycle_aggregators(ConsumerKind::QuickPulse, None, start() + Duration::seconds(1))
            .unwrap();
        let default = manager
            .cycle_aggregators(ConsumerKind::Default, None, start() + Duration::seconds(1))
            .unwrap();

        assert_eq!(quick_pulse.non_persistent.len(), 1);
        assert_eq!(quick_pulse.non_persistent[0].metric_id, "included");
        assert_eq!(default.non_persistent.len(), 2);
    }

    #[test]
    fn test_single_aggregator_under_contention() {
        let manager = Arc::new(AggregationManager::new(start()));
        let series = series(&manager, "contended", false);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let series = series.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        series.track_value(1.0).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let collection = manager.collection(ConsumerKind::Default).unwrap();
        assert_eq!(collection.len(), 1);

        let summary = manager
            .cycle_aggregators(ConsumerKind::Default, None, start() + Duration::seconds(60))
            .unwrap();
        assert_eq!(summary.non_persistent.len(), 1);
        assert_eq!(summary.non_persistent[0].count, 8000);
    }

    #[test]
    fn test_concurrent_cycling_loses_nothing() {
        let manager = Arc::new(AggregationManager::new(start()));
        let series = series(&manager, "racing", false);

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let series = series.clone();
                thread::spawn(move || {
                    for _ in 0..5000 {
                        series.track_value(1.0).unwrap();
                    }
                })
            })
            .collect();

        let mut total = 0;
        let mut tick = 0;
        while producers.iter().any(|p| !p.is_finished()) {
            tick += 1;
            let summary = manager
                .cycle_aggregators(ConsumerKind::Default, None, start() + Duration::seconds(tick))
                .unwrap();
            total += summary.non_persistent.iter().map(|a| a.count).sum::<u64>();
        }

        for producer in producers {
            producer.join().unwrap();
        }

        let summary = manager
            .cycle_aggregators(ConsumerKind::Default, None, start() + Duration::seconds(tick + 1))
            .unwrap();
        total += summary.non_persistent.iter().map(|a| a.count).sum::<u64>();

        assert_eq!(total, 20_000);
    }
}
