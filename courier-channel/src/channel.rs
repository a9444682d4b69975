use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_metrics::{AggregateSink, MetricAggregate};
use courier_statsd::metric;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use crate::statsd::ChannelCounters;
use crate::{
    ChannelConfig, CredentialProvider, InMemoryTransmitter, JsonLinesSerializer, Serializer,
    TelemetryBuffer, TelemetryItem,
};

/// An error returned when a [`TelemetryChannel`] cannot be created.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The configured endpoint is not a valid URL.
    #[error("invalid endpoint url")]
    InvalidEndpoint(#[from] url::ParseError),
    /// The HTTP client could not be initialized.
    #[error("failed to create http client")]
    Client(#[from] reqwest::Error),
}

/// Buffers telemetry items and transmits them to the ingestion endpoint in the background.
///
/// Sending never blocks and never fails from the caller's point of view. Items may be lost if the
/// backlog overflows while the endpoint is unreachable.
pub struct TelemetryChannel {
    buffer: Arc<TelemetryBuffer>,
    transmitter: Arc<InMemoryTransmitter>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TelemetryChannel {
    /// Creates a channel sending newline-delimited JSON without authentication.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(config: &ChannelConfig) -> Result<Self, ChannelError> {
        let serializer = Arc::new(JsonLinesSerializer::new(config.encoding));
        Self::with_parts(config, serializer, None)
    }

    /// Creates a channel with a custom serializer and optional credentials.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn with_parts(
        config: &ChannelConfig,
        serializer: Arc<dyn Serializer>,
        credential: Option<Arc<dyn CredentialProvider>>,
    ) -> Result<Self, ChannelError> {
        let endpoint = Url::parse(&config.endpoint)?;

        let buffer = Arc::new(TelemetryBuffer::new(
            config.buffer_capacity,
            config.backlog_size(),
            config.diagnostics_interval(),
        ));

        let transmitter = Arc::new(InMemoryTransmitter::new(
            endpoint,
            config,
            buffer.clone(),
            serializer,
            credential,
        )?);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(transmitter.clone().run(shutdown_rx));

        courier_log::info!(endpoint = %config.endpoint, "telemetry channel started");

        Ok(Self {
            buffer,
            transmitter,
            closed: AtomicBool::new(false),
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Returns the buffer of items waiting for transmission.
    pub fn buffer(&self) -> &TelemetryBuffer {
        &self.buffer
    }

    /// Returns the transmitter sending the buffered items.
    pub fn transmitter(&self) -> &Arc<InMemoryTransmitter> {
        &self.transmitter
    }

    /// Queues an item for transmission.
    ///
    /// Items sent after [`shutdown`](Self::shutdown) are discarded.
    pub fn send(&self, item: TelemetryItem) {
        if self.closed.load(Ordering::Acquire) {
            courier_log::debug!(item = %item.name, "telemetry channel closed, discarding item");
            metric!(counter(ChannelCounters::ItemsDropped) += 1, reason = "shutdown");
            return;
        }

        // Drops are counted and logged by the buffer.
        self.buffer.enqueue(item).ok();
    }

    /// Sends all buffered items now and waits up to `timeout` for the transmission.
    ///
    /// Returns `false` if the timeout elapsed.
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.transmitter.flush(timeout).await
    }

    /// Stops the send loop and makes a final attempt to send all buffered items.
    ///
    /// Calling this more than once has no effect.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            courier_log::debug!("telemetry channel already shut down");
            return;
        }

        self.shutdown.send_replace(true);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                courier_log::error!(
                    error = &error as &dyn std::error::Error,
                    "telemetry send loop failed",
                );
            }
        }

        self.transmitter.dequeue_and_send(true).await;

        let remaining = self.buffer.len();
        if remaining > 0 {
            courier_log::warn!(remaining, "telemetry left unsent at shutdown");
        }
        courier_log::info!("telemetry channel shut down");
    }
}

impl AggregateSink for TelemetryChannel {
    fn consume(&self, aggregates: Vec<MetricAggregate>) {
        for aggregate in aggregates {
            self.send(aggregate.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use chrono::Utc;
    use courier_metrics::AggregationKind;

    use super::*;
    use crate::testutils::{Hits, spawn_server};
    use crate::{HttpEncoding, TelemetryData};

    async fn channel(hits: &Hits, bodies: &Arc<Mutex<Vec<String>>>) -> TelemetryChannel {
        let hits = hits.clone();
        let bodies = bodies.clone();
        let router = Router::new().route(
            "/track",
            post(move |body: String| async move {
                hits.hit();
                bodies.lock().push(body);
                StatusCode::OK
            }),
        );
        let endpoint = spawn_server(router).await.join("track").unwrap();

        let config = ChannelConfig {
            endpoint: endpoint.to_string(),
            encoding: HttpEncoding::Identity,
            ..Default::default()
        };
        TelemetryChannel::start(&config).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_endpoint() {
        let config = ChannelConfig {
            endpoint: "not a url".to_owned(),
            ..Default::default()
        };
        assert!(matches!(
            TelemetryChannel::start(&config),
            Err(ChannelError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_sends_items() {
        let hits = Hits::default();
        let bodies = Arc::default();
        let channel = channel(&hits, &bodies).await;

        channel.send(TelemetryItem::event("one"));
        channel.send(TelemetryItem::event("two"));
        assert!(channel.flush(Duration::from_secs(5)).await);

        assert_eq!(hits.count(), 1);
        assert_eq!(bodies.lock()[0].lines().count(), 2);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        courier_log::init_test!();

        let hits = Hits::default();
        let bodies = Arc::default();
        let channel = channel(&hits, &bodies).await;

        channel.send(TelemetryItem::event("pending"));
        channel.shutdown().await;
        assert_eq!(hits.count(), 1);

        channel.send(TelemetryItem::event("late"));
        assert!(channel.buffer().is_empty());

        channel.shutdown().await;
        assert_eq!(hits.count(), 1);
    }

    #[tokio::test]
    async fn test_aggregates_become_metric_items() {
        let hits = Hits::default();
        let bodies = Arc::<Mutex<Vec<String>>>::default();
        let channel = channel(&hits, &bodies).await;

        channel.consume(vec![MetricAggregate {
            namespace: "app".to_owned(),
            metric_id: "latency".to_owned(),
            dimensions: BTreeMap::from([("route".to_owned(), "/".to_owned())]),
            kind: AggregationKind::Measurement,
            period_start: Utc::now(),
            period_duration: Duration::from_secs(60),
            count: 3,
            sum: 1.16,
            min: -0.04,
            max: 0.8,
            std_dev: 0.343058,
        }]);
        channel.shutdown().await;

        let bodies = bodies.lock();
        let item: TelemetryItem = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(item.name, "Metric");
        assert!(matches!(item.data, TelemetryData::Metric(ref aggregate) if aggregate.count == 3));
    }
}
