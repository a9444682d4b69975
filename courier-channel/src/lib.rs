//! Buffered HTTP transmission of telemetry for Courier.
//!
//! Application code hands [`TelemetryItem`]s to a [`TelemetryChannel`]. The channel collects
//! them in a [`TelemetryBuffer`] and an [`InMemoryTransmitter`] sends the buffer contents to the
//! ingestion endpoint, either on a fixed interval or as soon as the buffer fills up.
//!
//! Sending is best effort. Transient failures put the items back into the buffer and delay the
//! next attempt according to the [`BackoffLogicManager`]. Permanently rejected items are dropped.
//! The buffer is bounded, so items are also dropped when the endpoint is unreachable for long
//! enough. Nothing is persisted across restarts.
//!
//! The channel implements [`AggregateSink`](courier_metrics::AggregateSink), so it can receive
//! the aggregates of a [`MetricManager`](courier_metrics::MetricManager) directly:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use courier_channel::{ChannelConfig, TelemetryChannel, TelemetryItem, SeverityLevel};
//! use courier_metrics::{MetricManager, MetricsConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), courier_channel::ChannelError> {
//! let channel = Arc::new(TelemetryChannel::start(&ChannelConfig::default())?);
//! let manager = MetricManager::start(MetricsConfig::default(), channel.clone());
//!
//! channel.send(TelemetryItem::trace("service started", SeverityLevel::Information));
//! channel.flush(Duration::from_secs(10)).await;
//!
//! manager.stop().await;
//! channel.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod backoff;
mod buffer;
mod channel;
mod config;
mod credential;
mod item;
mod redirect;
mod serializer;
mod statsd;
mod transmission;
mod transmitter;

#[cfg(test)]
mod testutils;

pub use reqwest::StatusCode;

pub use self::backoff::*;
pub use self::buffer::*;
pub use self::channel::*;
pub use self::config::*;
pub use self::credential::*;
pub use self::item::*;
pub use self::redirect::*;
pub use self::serializer::*;
pub use self::transmission::*;
pub use self::transmitter::*;
