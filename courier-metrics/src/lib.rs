//! Concurrent metric aggregation for Courier.
//!
//! Application threads track values into a [`MetricSeries`]. Each series forwards values to one
//! [`MetricAggregator`] per active consumer, created on demand the first time a value arrives in
//! an aggregation period. The [`AggregationManager`] owns the aggregation periods: cycling a
//! consumer completes all of its aggregators and yields one [`MetricAggregate`] per series.
//!
//! The [`MetricManager`] is the entry point. It cycles the default consumer in the background at
//! a fixed, wall-clock aligned interval and hands the aggregates to an [`AggregateSink`].
//!
//! ```
//! use std::sync::Arc;
//!
//! use courier_metrics::{
//!     AggregateSink, MetricAggregate, MetricIdentifier, MetricManager, MetricsConfig, SeriesConfig,
//! };
//!
//! struct PrintSink;
//!
//! impl AggregateSink for PrintSink {
//!     fn consume(&self, aggregates: Vec<MetricAggregate>) {
//!         for aggregate in aggregates {
//!             courier_log::info!(metric = %aggregate.metric_id, count = aggregate.count, "aggregate");
//!         }
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let manager = MetricManager::start(MetricsConfig::default(), Arc::new(PrintSink));
//!
//! let metric = manager.get_metric(
//!     MetricIdentifier::new("app", "latency", ["route"]),
//!     SeriesConfig::default(),
//! );
//! metric.track_value(12.5, &["/home"]).ok();
//!
//! manager.stop().await;
//! # }
//! ```
//!
//! Values are never lost to a concurrent cycle: every value lands in exactly one aggregation
//! period. Persistent series carry their statistics into the next period, all other series start
//! from zero.

#![warn(missing_docs)]

mod aggregation;
mod aggregator;
mod collection;
mod config;
mod cube;
mod filter;
mod manager;
mod metric;
mod series;
mod statsd;

pub use self::aggregation::*;
pub use self::aggregator::{AggregationKind, MetricAggregate, MetricAggregator};
pub use self::collection::*;
pub use self::config::*;
pub use self::cube::*;
pub use self::filter::*;
pub use self::manager::*;
pub use self::metric::*;
pub use self::series::*;
