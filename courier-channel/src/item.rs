use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_metrics::MetricAggregate;
use serde::{Deserialize, Serialize};

/// Severity of a [`TelemetryData::Trace`] message.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityLevel {
    /// Diagnostic output that is usually disabled.
    Verbose,
    /// Regular operational messages.
    #[default]
    Information,
    /// Unexpected but recoverable conditions.
    Warning,
    /// Failed operations.
    Error,
    /// Failures the application cannot recover from.
    Critical,
}

/// The payload of a [`TelemetryItem`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TelemetryData {
    /// A pre-aggregated metric.
    Metric(MetricAggregate),

    /// A log message.
    Trace {
        /// The message text.
        message: String,
        /// Severity of the message.
        #[serde(default)]
        severity: SeverityLevel,
    },

    /// An incoming request handled by the application.
    Request {
        /// Name of the request, typically the route.
        name: String,
        /// Time spent handling the request.
        #[serde(with = "duration_millis")]
        duration: Duration,
        /// Result code, usually an HTTP status.
        response_code: String,
        /// Whether the request was handled successfully.
        success: bool,
    },

    /// A named application event.
    Event {
        /// Name of the event.
        name: String,
    },
}

/// A single unit of telemetry sent through the [`TelemetryChannel`](crate::TelemetryChannel).
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TelemetryItem {
    /// Envelope name of the item, derived from its data type.
    pub name: String,

    /// Time at which the item was created.
    pub time: DateTime<Utc>,

    /// Custom properties attached by the application.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,

    /// The typed payload.
    pub data: TelemetryData,

    /// Number of times the endpoint asked for this item to be sent again in a partial response.
    #[serde(skip)]
    pub(crate) partial_retries: u8,
}

impl TelemetryItem {
    /// Creates an item with the current time and no properties.
    pub fn new(data: TelemetryData) -> Self {
        Self::with_time(data, Utc::now())
    }

    /// Creates an item with an explicit time.
    pub fn with_time(data: TelemetryData, time: DateTime<Utc>) -> Self {
        let name = match data {
            TelemetryData::Metric(_) => "Metric",
            TelemetryData::Trace { .. } => "Message",
            TelemetryData::Request { .. } => "Request",
            TelemetryData::Event { .. } => "Event",
        };

        Self {
            name: name.to_owned(),
            time,
            properties: BTreeMap::new(),
            data,
            partial_retries: 0,
        }
    }

    /// Creates a trace item.
    pub fn trace(message: impl Into<String>, severity: SeverityLevel) -> Self {
        Self::new(TelemetryData::Trace {
            message: message.into(),
            severity,
        })
    }

    /// Creates an event item.
    pub fn event(name: impl Into<String>) -> Self {
        Self::new(TelemetryData::Event { name: name.into() })
    }

    /// Adds a custom property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

impl From<MetricAggregate> for TelemetryItem {
    fn from(aggregate: MetricAggregate) -> Self {
        let time = aggregate.period_start;
        Self::with_time(TelemetryData::Metric(aggregate), time)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_request_serialization() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let item = TelemetryItem::with_time(
            TelemetryData::Request {
                name: "GET /".to_owned(),
                duration: Duration::from_millis(1500),
                response_code: "200".to_owned(),
                success: true,
            },
            time,
        )
        .with_property("host", "a");

        insta::assert_json_snapshot!(item, @r###"
        {
          "name": "Request",
          "time": "2024-03-01T12:00:00Z",
          "properties": {
            "host": "a"
          },
          "data": {
            "type": "request",
            "name": "GET /",
            "duration": 1500,
            "response_code": "200",
            "success": true
          }
        }
        "###);
    }

    #[test]
    fn test_trace_default_severity() {
        let json = r#"{"name":"Message","time":"2024-03-01T12:00:00Z","data":{"type":"trace","message":"hi"}}"#;
        let item: TelemetryItem = serde_json::from_str(json).unwrap();

        assert!(item.properties.is_empty());
        assert_eq!(
            item.data,
            TelemetryData::Trace {
                message: "hi".to_owned(),
                severity: SeverityLevel::Information,
            }
        );
    }

    #[test]
    fn test_event_name() {
        let item = TelemetryItem::event("startup");
        assert_eq!(item.name, "Event");
    }
}
