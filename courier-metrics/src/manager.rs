use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_common::time::{duration_between, next_aligned};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{
    AggregationManager, ConsumerKind, Metric, MetricAggregate, MetricIdentifier, MetricSeries,
    MetricsConfig, SeriesConfig, SeriesIdentity,
};

/// Receives the aggregates of every completed default aggregation period.
pub trait AggregateSink: Send + Sync {
    /// Takes ownership of a batch of aggregates.
    fn consume(&self, aggregates: Vec<MetricAggregate>);
}

/// Entry point for tracking metrics.
///
/// The manager owns the [`AggregationManager`] shared by all series and runs a background task
/// that cycles the default consumer in regular intervals, forwarding the aggregates to an
/// [`AggregateSink`]. The task is spawned on the current tokio runtime.
pub struct MetricManager {
    config: MetricsConfig,
    aggregation: Arc<AggregationManager>,
    sink: Arc<dyn AggregateSink>,
    metrics: Mutex<HashMap<MetricIdentifier, Arc<Metric>>>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MetricManager {
    /// Creates the manager and starts the background cycle.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(config: MetricsConfig, sink: Arc<dyn AggregateSink>) -> Arc<Self> {
        let aggregation = Arc::new(AggregationManager::new(Utc::now()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_default_cycle(
            config.clone(),
            aggregation.clone(),
            sink.clone(),
            shutdown_rx,
        ));

        Arc::new(Self {
            config,
            aggregation,
            sink,
            metrics: Mutex::new(HashMap::new()),
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Returns the aggregation manager, used to start and cycle non-default consumers.
    pub fn aggregation(&self) -> &Arc<AggregationManager> {
        &self.aggregation
    }

    /// Creates a standalone series.
    pub fn create_series(&self, identity: SeriesIdentity, config: SeriesConfig) -> Arc<MetricSeries> {
        MetricSeries::new(identity, config, self.aggregation.clone())
    }

    /// Returns the metric with this identifier, creating it on first use.
    ///
    /// A metric keeps the configuration it was created with.
    pub fn get_metric(&self, identifier: MetricIdentifier, config: SeriesConfig) -> Arc<Metric> {
        let mut metrics = self.metrics.lock();
        if let Some(metric) = metrics.get(&identifier) {
            return metric.clone();
        }

        let metric = Arc::new(Metric::new(
            identifier.clone(),
            config,
            self.config.limits(),
            self.aggregation.clone(),
        ));

        metrics.insert(identifier, metric.clone());
        metric
    }

    /// Completes the current default aggregation period immediately and forwards the aggregates.
    pub fn flush(&self) {
        cycle_default(&self.aggregation, self.sink.as_ref(), Utc::now());
    }

    /// Stops the background cycle and flushes a final time.
    ///
    /// A cycle in progress runs to completion before the task exits. Calling this more than once
    /// has no effect.
    pub async fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            courier_log::debug!("metric manager already stopped");
            return;
        };

        self.shutdown.send_replace(true);
        if let Err(error) = handle.await {
            courier_log::error!(
                error = &error as &dyn std::error::Error,
                "metric manager cycle task failed",
            );
        }

        self.flush();
        courier_log::info!("metric manager stopped");
    }
}

fn cycle_default(aggregation: &AggregationManager, sink: &dyn AggregateSink, now: DateTime<Utc>) {
    // A cycle that ran early starts the next period in the future. Never end a period before it
    // started.
    let period_end = aggregation
        .collection(ConsumerKind::Default)
        .map_or(now, |collection| now.max(collection.period_start()));

    match aggregation.cycle_aggregators(ConsumerKind::Default, None, period_end) {
        Ok(summary) if summary.is_empty() => (),
        Ok(summary) => sink.consume(summary.into_aggregates()),
        Err(error) => courier_log::error!(
            error = &error as &dyn std::error::Error,
            "failed to cycle default aggregators",
        ),
    }
}

/// Returns how long to sleep before the cycle at `due`, or `None` if it should run right away.
///
/// A cycle that is due within `tolerance` runs immediately.
fn cycle_wait(now: DateTime<Utc>, due: DateTime<Utc>, tolerance: Duration) -> Option<Duration> {
    let wait = duration_between(now, due);
    (wait > tolerance).then_some(wait)
}

async fn run_default_cycle(
    config: MetricsConfig,
    aggregation: Arc<AggregationManager>,
    sink: Arc<dyn AggregateSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = config.cycle_interval();
    let offset = config.cycle_offset();
    let tolerance = config.cycle_tolerance();

    let mut due = next_aligned(Utc::now(), interval, offset);
    courier_log::debug!(%due, "metric manager started");

    loop {
        if let Some(wait) = cycle_wait(Utc::now(), due, tolerance) {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => (),
            }
        }

        if *shutdown.borrow() {
            break;
        }

        cycle_default(&aggregation, sink.as_ref(), due);
        due = next_aligned(due.max(Utc::now()), interval, offset);
    }
}
