//! StatsD client used by Courier to report on its own operation.
//!
//! Courier instruments itself with statsd counters, gauges, histograms and timers: dropped items,
//! buffer sizes, transmission latency and so on. These metrics are about the pipeline and are
//! entirely separate from the telemetry that the pipeline aggregates and transmits.
//!
//! ## Defining Metrics
//!
//! Each crate defines enums implementing one of the metric traits. The traits only provide a type
//! safe metric name, so that a counter cannot be recorded as a timer:
//!
//! ```
//! use courier_statsd::{metric, CounterMetric};
//!
//! enum ChannelCounters {
//!     ItemDropped,
//! }
//!
//! impl CounterMetric for ChannelCounters {
//!     fn name(&self) -> &'static str {
//!         match self {
//!             Self::ItemDropped => "channel.item_dropped",
//!         }
//!     }
//! }
//!
//! metric!(counter(ChannelCounters::ItemDropped) += 1, reason = "backlog");
//! ```
//!
//! ## Initializing the Client
//!
//! Without a client, [`metric!`] is a noop. Call [`init`] to report to a statsd host:
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! courier_statsd::init(courier_statsd::MetricsClientConfig {
//!     prefix: "courier",
//!     host: "localhost:8125",
//!     default_tags: BTreeMap::new(),
//!     sample_rate: 1.0,
//! })
//! .ok();
//! ```

#![warn(missing_docs)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::ops::Deref;
use std::sync::Arc;

use cadence::{BufferedUdpMetricSink, Metric, MetricBuilder, QueuingMetricSink, StatsdClient};
use parking_lot::RwLock;
use rand::Rng;

/// Maximum number of metrics queued for the background sender before they are dropped.
const METRICS_MAX_QUEUE_SIZE: usize = 100_000;

/// Client configuration object to store globally.
#[derive(Debug)]
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,
    /// Default tags to apply to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Global sample rate between `0.0` and `1.0`.
    pub sample_rate: f64,
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &StatsdClient {
        &self.statsd_client
    }
}

impl MetricsClient {
    /// Sends a metric with the default tags defined on this client.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, mut metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        if !self.should_send() {
            return;
        }

        for (key, value) in &self.default_tags {
            metric = metric.with_tag(key, value);
        }

        if self.sample_rate < 1.0 {
            metric = metric.with_sampling_rate(self.sample_rate);
        }

        if let Err(error) = metric.try_send() {
            courier_log::error!(
                error = &error as &dyn std::error::Error,
                maximum_capacity = METRICS_MAX_QUEUE_SIZE,
                "error sending a statsd metric",
            );
        }
    }

    fn should_send(&self) -> bool {
        if self.sample_rate <= 0.0 {
            false
        } else if self.sample_rate >= 1.0 {
            true
        } else {
            rand::rng().random::<f64>() <= self.sample_rate
        }
    }
}

/// Configuration for [`init`].
#[derive(Debug)]
pub struct MetricsClientConfig<'a, A> {
    /// Prefix prepended to all metric names.
    pub prefix: &'a str,
    /// Address of the statsd server.
    pub host: A,
    /// Tags added to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Sample rate between `0.0` (nothing) and `1.0` (everything).
    pub sample_rate: f64,
}

static METRICS_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    static CURRENT_CLIENT: RefCell<Option<Arc<MetricsClient>>> =
        RefCell::new(METRICS_CLIENT.read().clone());
}

/// Internal prelude for the macro.
#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// Sets a new global statsd client.
///
/// Threads pick up the new client the next time they record a metric for the first time. The
/// calling thread switches immediately.
pub fn set_client(client: MetricsClient) {
    let client = Arc::new(client);
    *METRICS_CLIENT.write() = Some(client.clone());
    CURRENT_CLIENT.with(|cell| cell.replace(Some(client)));
}

/// Removes the global client, which turns all further metrics into noops.
pub fn disable() {
    *METRICS_CLIENT.write() = None;
    CURRENT_CLIENT.with(|cell| cell.replace(None));
}

/// Tells the metrics system to report to the statsd server at the configured host.
///
/// Metrics are queued and sent from a background thread over UDP.
pub fn init<A: ToSocketAddrs>(config: MetricsClientConfig<'_, A>) -> io::Result<()> {
    let addr = config.host.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no statsd address resolved")
    })?;

    courier_log::info!("reporting metrics to statsd at {addr}");

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let udp_sink = BufferedUdpMetricSink::from(addr, socket).map_err(io::Error::other)?;
    let queuing_sink = QueuingMetricSink::with_capacity(udp_sink, METRICS_MAX_QUEUE_SIZE);

    set_client(MetricsClient {
        statsd_client: StatsdClient::from_sink(config.prefix, queuing_sink),
        default_tags: config.default_tags,
        sample_rate: config.sample_rate.clamp(0.0, 1.0),
    });

    Ok(())
}

/// Runs the closure with a capturing client on the current thread and returns the captured
/// metrics in statsd line format.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = cadence::SpyMetricSink::new();
    let test_client = MetricsClient {
        statsd_client: StatsdClient::from_sink("", sink),
        default_tags: BTreeMap::new(),
        sample_rate: 1.0,
    };

    CURRENT_CLIENT.with(|cell| {
        let old_client = cell.replace(Some(Arc::new(test_client)));
        f();
        cell.replace(old_client);
    });

    rx.try_iter()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .collect()
}

/// Invokes a callback with the current statsd client.
///
/// If statsd is not configured the callback is not invoked. Prefer the [`metric!`] macro.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    CURRENT_CLIENT.with(|client| match client.borrow().as_deref() {
        Some(client) => f(client),
        None => R::default(),
    })
}

/// A metric for capturing timings in milliseconds.
///
/// ```
/// use courier_statsd::{metric, TimerMetric};
///
/// struct SendDuration;
///
/// impl TimerMetric for SendDuration {
///     fn name(&self) -> &'static str {
///         "transmission.duration"
///     }
/// }
///
/// let rv = metric!(timer(SendDuration), { 42 });
/// assert_eq!(rv, 42);
/// ```
pub trait TimerMetric {
    /// Returns the timer metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing counters.
pub trait CounterMetric {
    /// Returns the counter metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing the statistical distribution of values, such as payload sizes.
pub trait HistogramMetric {
    /// Returns the histogram metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing the current value of something, such as the buffer length.
pub trait GaugeMetric {
    /// Returns the gauge metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// Emits a metric.
///
/// Supported forms, each optionally followed by `tag = value` pairs:
///
/// - `counter(id) += value`
/// - `gauge(id) = value`
/// - `histogram(id) = value`
/// - `timer(id) = duration`
/// - `timer(id), { block }`, which times the block and returns its value
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        match $value {
            value if value != 0 => {
                $crate::with_client(|client| {
                    use $crate::_pred::*;
                    client.send_metric(
                        client.count_with_tags(&$crate::CounterMetric::name(&$id), value)
                            $(.with_tag(stringify!($k), $v))*
                    )
                })
            }
            _ => {}
        }
    };

    (gauge($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.gauge_with_tags(&$crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    (histogram($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.histogram_with_tags(&$crate::HistogramMetric::name(&$id), $value)
                    $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    (timer($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.time_with_tags(
                    &$crate::TimerMetric::name(&$id),
                    $value.as_millis() as u64,
                )
                $(.with_tag(stringify!($k), $v))*
            )
        })
    };

    (timer($id:expr), $($k:ident = $v:expr,)* $block:block) => {{
        let now = std::time::Instant::now();
        let rv = { $block };
        $crate::metric!(timer($id) = now.elapsed() $(, $k = $v)*);
        rv
    }};
}
