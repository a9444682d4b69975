use courier_statsd::{CounterMetric, GaugeMetric, HistogramMetric, TimerMetric};

/// Counter metrics for the telemetry channel.
pub enum ChannelCounters {
    /// Number of telemetry items that were dropped.
    ///
    /// Tagged by `reason`:
    ///  - `backlog`: The buffer was full.
    ///  - `rejected`: The endpoint permanently rejected the items.
    ///  - `too_large`: A single item exceeded the maximum payload size.
    ///  - `serialize`: The items could not be serialized.
    ///  - `shutdown`: The item was sent after the channel was shut down.
    ItemsDropped,

    /// Number of transmissions sent to the endpoint.
    TransmissionSent,

    /// Number of responses received, including synthetic timeouts.
    ///
    /// Tagged by `status`.
    TransmissionStatus,

    /// Number of items put back into the buffer for another attempt.
    ItemsRetried,
}

impl CounterMetric for ChannelCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::ItemsDropped => "channel.items.dropped",
            Self::TransmissionSent => "channel.transmission.sent",
            Self::TransmissionStatus => "channel.transmission.status",
            Self::ItemsRetried => "channel.items.retried",
        }
    }
}

/// Gauge metrics for the telemetry channel.
pub enum ChannelGauges {
    /// Number of items waiting in the buffer.
    BufferSize,
}

impl GaugeMetric for ChannelGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::BufferSize => "channel.buffer.size",
        }
    }
}

/// Histogram metrics for the telemetry channel.
pub enum ChannelHistograms {
    /// Number of items in a transmission.
    TransmissionItems,

    /// Size of a transmission payload in bytes, after compression.
    TransmissionBytes,
}

impl HistogramMetric for ChannelHistograms {
    fn name(&self) -> &'static str {
        match *self {
            Self::TransmissionItems => "channel.transmission.items",
            Self::TransmissionBytes => "channel.transmission.bytes",
        }
    }
}

/// Timer metrics for the telemetry channel.
pub enum ChannelTimers {
    /// Time from sending a transmission until the response body has been read.
    TransmissionDuration,
}

impl TimerMetric for ChannelTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::TransmissionDuration => "channel.transmission.duration",
        }
    }
}
